//! Point-to-point transport.
//!
//! Every rank keeps one batch queue per destination; envelopes coalesce
//! until the queue holds `batch_records` of them, then go out as a
//! single data frame. One delivery thread per rank drains the inbox,
//! hands envelopes to the delivery callback, and acks each data frame
//! back to its sender. The sender tracks in-flight frames and
//! `wait_delivery` blocks until all of them are acknowledged.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::Relaxed};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Error, Result};
use crate::stats::{ChannelStat, Histogram, StatSnapshot};
use crate::transport::{
    payload_envelopes, DeliveryFn, FrameHdr, FrameKind, Transport, FRAME_HDR_LEN,
};
use crate::wire::{Inbox, Wire};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Per-destination coalescing queue. Holds whole envelopes only.
struct BatchQueue {
    buf: Vec<u8>,
    nrecs: u16,
    epoch: u32,
}

/// State shared with the delivery thread.
struct Shared {
    my_rank: u32,
    ranks_per_node: u32,
    env_len: usize,
    inflight: Mutex<u64>,
    inflight_cv: Condvar,
    paused: Mutex<bool>,
    paused_cv: Condvar,
    running: AtomicBool,
    failed: Mutex<Option<String>>,
    stat: ChannelStat,
    iq_depth: Mutex<Histogram>,
    progress_interval: Mutex<Histogram>,
}

impl Shared {
    fn same_node(&self, peer: u32) -> bool {
        peer / self.ranks_per_node == self.my_rank / self.ranks_per_node
    }

    fn fail(&self, msg: String) {
        let mut failed = self.failed.lock().unwrap();
        if failed.is_none() {
            *failed = Some(msg);
        }
        self.inflight_cv.notify_all();
    }

    fn complete_one(&self) {
        let mut n = self.inflight.lock().unwrap();
        *n = n.saturating_sub(1);
        self.inflight_cv.notify_all();
    }

    /// Block until every in-flight frame is acked.
    fn wait_inflight(&self) -> Result<()> {
        let mut n = self.inflight.lock().unwrap();
        loop {
            if let Some(msg) = self.failed.lock().unwrap().clone() {
                return Err(Error::Transport(msg));
            }
            if *n == 0 {
                return Ok(());
            }
            if !self.running.load(Relaxed) {
                return Err(Error::Transport("delivery thread exited".to_string()));
            }
            let (guard, _) = self.inflight_cv.wait_timeout(n, POLL_INTERVAL).unwrap();
            n = guard;
        }
    }
}

/// Point-to-point mesh transport.
pub struct NnTransport {
    wire: Arc<dyn Wire>,
    shared: Arc<Shared>,
    queues: Mutex<Vec<BatchQueue>>,
    next_seq: AtomicU32,
    last_snapshot: Mutex<StatSnapshot>,
    batch_records: usize,
    force_sync: bool,
    delivery: Option<JoinHandle<()>>,
}

impl NnTransport {
    pub fn new(
        wire: Arc<dyn Wire>,
        inbox: Box<dyn Inbox>,
        delivery: DeliveryFn,
        env_len: usize,
        batch_records: usize,
        force_sync: bool,
        ranks_per_node: u32,
    ) -> Result<Self> {
        let world_size = wire.world_size();
        let shared = Arc::new(Shared {
            my_rank: wire.my_rank(),
            ranks_per_node: ranks_per_node.max(1),
            env_len,
            inflight: Mutex::new(0),
            inflight_cv: Condvar::new(),
            paused: Mutex::new(false),
            paused_cv: Condvar::new(),
            running: AtomicBool::new(true),
            failed: Mutex::new(None),
            stat: ChannelStat::new(),
            iq_depth: Mutex::new(Histogram::new()),
            progress_interval: Mutex::new(Histogram::new()),
        });

        let queues = (0..world_size)
            .map(|_| BatchQueue {
                buf: Vec::with_capacity(env_len * batch_records.max(1)),
                nrecs: 0,
                epoch: 0,
            })
            .collect();

        let thread_shared = shared.clone();
        let thread_wire = wire.clone();
        let handle = std::thread::Builder::new()
            .name("shuffle-nn".to_string())
            .spawn(move || delivery_loop(thread_shared, thread_wire, inbox, delivery))
            .map_err(|e| Error::Transport(format!("spawn delivery thread: {}", e)))?;

        Ok(Self {
            wire,
            shared,
            queues: Mutex::new(queues),
            next_seq: AtomicU32::new(1),
            last_snapshot: Mutex::new(StatSnapshot::default()),
            batch_records: batch_records.max(1),
            force_sync,
            delivery: Some(handle),
        })
    }

    /// Seal one queue into a data frame and put it on the wire.
    fn flush_queue(&self, dst: u32, queue: &mut BatchQueue) -> Result<()> {
        if queue.nrecs == 0 {
            return Ok(());
        }
        let hdr = FrameHdr {
            kind: FrameKind::Data,
            hop: 0,
            nrecs: queue.nrecs,
            src: self.shared.my_rank,
            dst,
            via: self.shared.my_rank,
            epoch: queue.epoch,
            seq: self.next_seq.fetch_add(1, Relaxed),
        };
        let mut frame = Vec::with_capacity(FRAME_HDR_LEN + queue.buf.len());
        hdr.encode_into(&mut frame);
        frame.extend_from_slice(&queue.buf);
        queue.buf.clear();
        queue.nrecs = 0;

        {
            let mut n = self.shared.inflight.lock().unwrap();
            *n += 1;
        }
        self.wire.send(dst, frame)?;
        self.shared.stat.count_send(self.shared.same_node(dst));

        if self.force_sync {
            self.shared.wait_inflight()?;
        }
        Ok(())
    }

    /// Incoming-queue depth histogram, for the epoch-boundary dump.
    pub fn iq_depth(&self) -> Histogram {
        self.shared.iq_depth.lock().unwrap().clone()
    }

    /// Delivery-loop progress-interval histogram (milliseconds).
    pub fn progress_interval(&self) -> Histogram {
        self.shared.progress_interval.lock().unwrap().clone()
    }
}

impl Transport for NnTransport {
    fn enqueue(&self, envelope: &[u8], dst: u32, epoch: u32) -> Result<()> {
        if envelope.len() != self.shared.env_len {
            return Err(Error::Protocol(format!(
                "bad envelope len {} (transport says {})",
                envelope.len(),
                self.shared.env_len
            )));
        }
        let mut queues = self.queues.lock().unwrap();
        let queue = queues
            .get_mut(dst as usize)
            .ok_or_else(|| Error::Transport(format!("no such rank {}", dst)))?;

        // Epochs never interleave in a queue; a stale batch means the
        // caller skipped the epoch-end flush, so push it out first.
        if queue.nrecs > 0 && queue.epoch != epoch {
            self.flush_queue(dst, queue)?;
        }
        queue.epoch = epoch;
        queue.buf.extend_from_slice(envelope);
        queue.nrecs += 1;

        if queue.nrecs as usize >= self.batch_records {
            self.flush_queue(dst, queue)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut queues = self.queues.lock().unwrap();
        for dst in 0..queues.len() {
            self.flush_queue(dst as u32, &mut queues[dst])?;
        }
        Ok(())
    }

    fn wait_delivery(&self) -> Result<()> {
        self.shared.wait_inflight()
    }

    fn pre_start(&self) -> Result<()> {
        // Background drain from the previous epoch.
        self.shared.wait_inflight()
    }

    fn epoch_start(&self) -> Result<StatSnapshot> {
        self.shared.wait_inflight()?;
        let now = self.shared.stat.snapshot();
        let mut last = self.last_snapshot.lock().unwrap();
        let delta = now.delta(&last);
        *last = now;
        Ok(delta)
    }

    fn epoch_end(&self) -> Result<()> {
        self.flush()?;
        if !self.force_sync {
            self.shared.wait_inflight()?;
        }
        Ok(())
    }

    fn pause(&self) {
        *self.shared.paused.lock().unwrap() = true;
    }

    fn resume(&self) {
        *self.shared.paused.lock().unwrap() = false;
        self.shared.paused_cv.notify_all();
    }

    fn world_size(&self) -> u32 {
        self.wire.world_size()
    }

    fn my_rank(&self) -> u32 {
        self.shared.my_rank
    }

    fn stat(&self) -> StatSnapshot {
        self.shared.stat.snapshot()
    }

    fn shutdown(&mut self) -> Result<()> {
        let result = self.flush().and_then(|_| self.shared.wait_inflight());
        self.shared.running.store(false, Relaxed);
        self.shared.paused_cv.notify_all();
        if let Some(handle) = self.delivery.take() {
            let _ = handle.join();
        }

        let iq = self.iq_depth();
        if iq.count() > 0 {
            debug!(
                "rank {}: incoming queue depth: {} samples, avg {:.3} (min {}, max {}, p99 {})",
                self.shared.my_rank,
                iq.count(),
                iq.mean(),
                iq.min(),
                iq.max(),
                iq.percentile(99.0)
            );
        }
        let intervals = self.progress_interval();
        if intervals.count() > 0 {
            debug!(
                "rank {}: delivery interval (ms): {} samples, avg {:.3} (min {}, max {})",
                self.shared.my_rank,
                intervals.count(),
                intervals.mean(),
                intervals.min(),
                intervals.max()
            );
        }
        result
    }
}

impl Drop for NnTransport {
    fn drop(&mut self) {
        if self.delivery.is_some() {
            let _ = self.shutdown();
        }
    }
}

fn delivery_loop(
    shared: Arc<Shared>,
    wire: Arc<dyn Wire>,
    inbox: Box<dyn Inbox>,
    delivery: DeliveryFn,
) {
    let mut last_frame_at: Option<Instant> = None;

    while shared.running.load(Relaxed) {
        {
            let mut paused = shared.paused.lock().unwrap();
            while *paused && shared.running.load(Relaxed) {
                let (guard, _) = shared.paused_cv.wait_timeout(paused, POLL_INTERVAL).unwrap();
                paused = guard;
            }
        }

        let frame = match inbox.recv_timeout(POLL_INTERVAL) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(_) => {
                shared.fail("wire disconnected".to_string());
                break;
            }
        };

        let now = Instant::now();
        if let Some(prev) = last_frame_at {
            let ms = now.duration_since(prev).as_millis() as u64;
            shared.progress_interval.lock().unwrap().record(ms);
        }
        last_frame_at = Some(now);

        let hdr = match FrameHdr::decode(&frame) {
            Ok(hdr) => hdr,
            Err(e) => {
                shared.fail(e.to_string());
                break;
            }
        };

        match hdr.kind {
            FrameKind::Ack => shared.complete_one(),
            FrameKind::Data => {
                shared.iq_depth.lock().unwrap().record(inbox.depth() as u64 + 1);
                shared.stat.count_recv(shared.same_node(hdr.src));

                let payload = match payload_envelopes(&frame, shared.env_len, hdr.nrecs) {
                    Ok(payload) => payload,
                    Err(e) => {
                        shared.fail(e.to_string());
                        break;
                    }
                };
                let mut delivered = true;
                for envelope in payload.chunks_exact(shared.env_len) {
                    if let Err(e) = delivery(envelope, hdr.src, hdr.dst, hdr.epoch) {
                        shared.fail(e.to_string());
                        delivered = false;
                        break;
                    }
                }
                if !delivered {
                    break;
                }

                // Loopback frames complete locally; a self-directed ack
                // could wedge this thread against its own full inbox.
                if hdr.src == shared.my_rank {
                    shared.complete_one();
                } else if let Err(e) = wire.send(hdr.src, FrameHdr::ack(&hdr, shared.my_rank)) {
                    shared.fail(e.to_string());
                    break;
                }
            }
        }
    }
    shared.running.store(false, Relaxed);
    shared.inflight_cv.notify_all();
    debug!("rank {}: delivery loop done", shared.my_rank);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ChannelMesh;
    use std::sync::atomic::AtomicU64;

    fn counting_delivery(counter: Arc<AtomicU64>) -> DeliveryFn {
        Arc::new(move |_env, _src, _dst, _epoch| {
            counter.fetch_add(1, Relaxed);
            Ok(())
        })
    }

    #[test]
    fn test_loopback_roundtrip() {
        let mut nodes = ChannelMesh::cluster(1, 16);
        let (wire, inbox) = nodes.remove(0);
        let delivered = Arc::new(AtomicU64::new(0));

        let mut t = NnTransport::new(
            Arc::new(wire),
            Box::new(inbox),
            counting_delivery(delivered.clone()),
            8,
            4,
            false,
            1,
        )
        .unwrap();

        for _ in 0..10 {
            t.enqueue(&[7u8; 8], 0, 0).unwrap();
        }
        t.epoch_end().unwrap();
        assert_eq!(delivered.load(Relaxed), 10);

        let stat = t.stat();
        // 10 records at batch 4 = 3 frames, all intra-node loopback
        assert_eq!(stat.local_sends, 3);
        assert_eq!(stat.local_recvs, 3);
        assert_eq!(stat.remote_sends, 0);

        t.shutdown().unwrap();
    }

    #[test]
    fn test_rejects_misshapen_envelope() {
        let mut nodes = ChannelMesh::cluster(1, 4);
        let (wire, inbox) = nodes.remove(0);
        let delivered = Arc::new(AtomicU64::new(0));
        let mut t = NnTransport::new(
            Arc::new(wire),
            Box::new(inbox),
            counting_delivery(delivered),
            8,
            4,
            false,
            1,
        )
        .unwrap();
        assert!(t.enqueue(&[0u8; 7], 0, 0).is_err());
        t.shutdown().unwrap();
    }

    #[test]
    fn test_telemetry_counts_deliveries() {
        let mut nodes = ChannelMesh::cluster(1, 16);
        let (wire, inbox) = nodes.remove(0);
        let delivered = Arc::new(AtomicU64::new(0));
        let mut t = NnTransport::new(
            Arc::new(wire),
            Box::new(inbox),
            counting_delivery(delivered),
            8,
            1,
            false,
            1,
        )
        .unwrap();

        for _ in 0..5 {
            t.enqueue(&[0u8; 8], 0, 0).unwrap();
        }
        t.epoch_end().unwrap();

        // one iq-depth sample per data frame
        assert_eq!(t.iq_depth().count(), 5);
        assert!(t.iq_depth().max() >= 1);
        t.shutdown().unwrap();
    }

    #[test]
    fn test_epoch_start_publishes_deltas() {
        let mut nodes = ChannelMesh::cluster(1, 16);
        let (wire, inbox) = nodes.remove(0);
        let delivered = Arc::new(AtomicU64::new(0));
        let mut t = NnTransport::new(
            Arc::new(wire),
            Box::new(inbox),
            counting_delivery(delivered),
            8,
            1,
            false,
            1,
        )
        .unwrap();

        t.enqueue(&[1u8; 8], 0, 0).unwrap();
        t.epoch_end().unwrap();
        let delta = t.epoch_start().unwrap();
        assert_eq!(delta.local_sends, 1);

        // No traffic since the snapshot rolled: delta goes back to zero.
        let delta = t.epoch_start().unwrap();
        assert_eq!(delta.local_sends, 0);

        t.shutdown().unwrap();
    }
}
