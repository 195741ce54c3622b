//! Delivery statistics and boundary-read telemetry.
//!
//! Counters are single-writer: each one is bumped by exactly one thread
//! (the sender thread or the delivery thread) and only read at epoch
//! boundaries behind a collective barrier, so relaxed atomics carry them
//! without any locking.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// One direction of traffic, split intra-node vs inter-node.
#[derive(Debug, Default)]
pub struct PairStat {
    pub sends: AtomicU64,
    pub recvs: AtomicU64,
}

/// Transport-level send/receive counters.
///
/// `local` counts intra-node hops, `remote` inter-node hops, matching
/// how aggregating transports account their fan-in.
#[derive(Debug, Default)]
pub struct ChannelStat {
    pub local: PairStat,
    pub remote: PairStat,
}

impl ChannelStat {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn count_send(&self, intra_node: bool) {
        if intra_node {
            self.local.sends.fetch_add(1, Relaxed);
        } else {
            self.remote.sends.fetch_add(1, Relaxed);
        }
    }

    #[inline]
    pub fn count_recv(&self, intra_node: bool) {
        if intra_node {
            self.local.recvs.fetch_add(1, Relaxed);
        } else {
            self.remote.recvs.fetch_add(1, Relaxed);
        }
    }

    /// Plain-value copy of the counters.
    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            local_sends: self.local.sends.load(Relaxed),
            local_recvs: self.local.recvs.load(Relaxed),
            remote_sends: self.remote.sends.load(Relaxed),
            remote_recvs: self.remote.recvs.load(Relaxed),
        }
    }
}

/// Point-in-time copy of a [`ChannelStat`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatSnapshot {
    pub local_sends: u64,
    pub local_recvs: u64,
    pub remote_sends: u64,
    pub remote_recvs: u64,
}

impl StatSnapshot {
    /// Per-epoch deltas relative to an earlier snapshot.
    pub fn delta(&self, earlier: &StatSnapshot) -> StatSnapshot {
        StatSnapshot {
            local_sends: self.local_sends - earlier.local_sends,
            local_recvs: self.local_recvs - earlier.local_recvs,
            remote_sends: self.remote_sends - earlier.remote_sends,
            remote_recvs: self.remote_recvs - earlier.remote_recvs,
        }
    }
}

/// Per-epoch dispatch counters.
///
/// `local_sends` counts fast-path writes that bypassed the transport;
/// `remote_sends` counts transport enqueues. The recv pair counts
/// delivered envelopes, split by whether they originated on this rank
/// (loopback RPC) or a peer. Reset at epoch start; monotonic within an
/// epoch.
#[derive(Debug, Default)]
pub struct EpochCounters {
    pub local_sends: AtomicU64,
    pub remote_sends: AtomicU64,
    pub local_recvs: AtomicU64,
    pub remote_recvs: AtomicU64,
}

impl EpochCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.local_sends.store(0, Relaxed);
        self.remote_sends.store(0, Relaxed);
        self.local_recvs.store(0, Relaxed);
        self.remote_recvs.store(0, Relaxed);
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            local_sends: self.local_sends.load(Relaxed),
            local_recvs: self.local_recvs.load(Relaxed),
            remote_sends: self.remote_sends.load(Relaxed),
            remote_recvs: self.remote_recvs.load(Relaxed),
        }
    }
}

/// Log2-bucket histogram for queue depths and progress intervals.
///
/// Sixty-five buckets: value `v` lands in bucket `ceil(log2(v + 1))`, so
/// bucket 0 holds zeros and bucket 64 holds the top of the u64 range.
/// Only read at epoch boundaries.
#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: [u64; 65],
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: [0; 65],
            count: 0,
            sum: 0,
            min: u64::MAX,
            max: 0,
        }
    }

    fn bucket_of(value: u64) -> usize {
        match value {
            0 => 0,
            v => 64 - (v.leading_zeros() as usize),
        }
    }

    pub fn record(&mut self, value: u64) {
        self.buckets[Self::bucket_of(value)] += 1;
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    /// Upper bound of the bucket holding the p-th percentile sample.
    pub fn percentile(&self, p: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let want = ((p / 100.0) * self.count as f64).ceil() as u64;
        let mut seen = 0u64;
        for (i, &n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= want.max(1) {
                return if i == 0 { 0 } else { 1u64 << i };
            }
        }
        self.max
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
