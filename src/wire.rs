//! One-way frame delivery between ranks.
//!
//! The shuffle core assumes a request-delivery primitive: fire a byte
//! frame at a destination rank, exactly once under no-fault assumptions,
//! FIFO per (src, dst) pair. [`Wire`] is the shared sender half and
//! [`Inbox`] the per-rank receiver half owned by the delivery thread.
//!
//! [`ChannelMesh`] is the in-process implementation: one bounded MPSC
//! inbox per rank, senders cloned to every peer. A full inbox blocks the
//! sender, which is the layer's back-pressure mechanism; nothing is ever
//! dropped or buffered without bound.

use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// Sender half of the delivery primitive. Shared by the dispatch thread
/// and the delivery thread (for acks), so sends take `&self`.
pub trait Wire: Send + Sync {
    fn my_rank(&self) -> u32;
    fn world_size(&self) -> u32;

    /// Deliver `frame` to `dst`'s inbox. Blocks while the destination
    /// inbox is full.
    fn send(&self, dst: u32, frame: Vec<u8>) -> Result<()>;
}

/// Receiver half of the delivery primitive, owned by exactly one thread.
pub trait Inbox: Send {
    /// Wait up to `timeout` for the next frame. `Ok(None)` on timeout.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Frames currently queued in this inbox.
    fn depth(&self) -> usize;
}

/// In-process mesh over bounded `sync_channel` inboxes.
pub struct ChannelMesh;

impl ChannelMesh {
    /// Build an `n`-rank mesh with `capacity` frames per inbox. Returns
    /// one `(wire, inbox)` pair per rank, in rank order. Self-send is
    /// allowed (the loopback RPC path uses it).
    ///
    /// # Panics
    /// Panics if `n` is 0 or `capacity` is 0.
    pub fn cluster(n: usize, capacity: usize) -> Vec<(ChannelWire, ChannelInbox)> {
        assert!(n > 0, "mesh must have at least one rank");
        assert!(capacity > 0, "inbox capacity must be nonzero");

        let mut txs = Vec::with_capacity(n);
        let mut rxs = Vec::with_capacity(n);
        let mut depths = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = std::sync::mpsc::sync_channel::<Vec<u8>>(capacity);
            txs.push(tx);
            rxs.push(rx);
            depths.push(Arc::new(AtomicUsize::new(0)));
        }

        rxs.into_iter()
            .enumerate()
            .map(|(rank, rx)| {
                let wire = ChannelWire {
                    rank: rank as u32,
                    size: n as u32,
                    txs: txs.clone(),
                    depths: depths.clone(),
                };
                let inbox = ChannelInbox {
                    rx,
                    depth: depths[rank].clone(),
                };
                (wire, inbox)
            })
            .collect()
    }
}

/// Sender half of a [`ChannelMesh`] rank.
#[derive(Clone)]
pub struct ChannelWire {
    rank: u32,
    size: u32,
    txs: Vec<SyncSender<Vec<u8>>>,
    depths: Vec<Arc<AtomicUsize>>,
}

impl Wire for ChannelWire {
    fn my_rank(&self) -> u32 {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.size
    }

    fn send(&self, dst: u32, frame: Vec<u8>) -> Result<()> {
        let tx = self
            .txs
            .get(dst as usize)
            .ok_or_else(|| Error::Transport(format!("no such rank {}", dst)))?;
        // Gauge counts queued plus in-flight frames; bumping before the
        // (possibly blocking) send keeps it from ever underflowing on
        // the receiver side.
        self.depths[dst as usize].fetch_add(1, Relaxed);
        tx.send(frame).map_err(|_| {
            self.depths[dst as usize].fetch_sub(1, Relaxed);
            Error::Disconnected
        })?;
        Ok(())
    }
}

/// Receiver half of a [`ChannelMesh`] rank.
pub struct ChannelInbox {
    rx: Receiver<Vec<u8>>,
    depth: Arc<AtomicUsize>,
}

impl Inbox for ChannelInbox {
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.depth.fetch_sub(1, Relaxed);
                Ok(Some(frame))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }

    fn depth(&self) -> usize {
        self.depth.load(Relaxed)
    }
}
