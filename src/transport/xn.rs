//! Multi-hop transport.
//!
//! Frames travel src → source-node representative → destination-node
//! representative → destination, so inter-node traffic flows only
//! between representatives and large jobs keep their connection count
//! at the node level rather than the rank level.
//!
//! A relay acks upstream only after its own forward has been acked, so
//! a drained origin means the whole chain delivered. That is what lets
//! `epoch_end` certify the epoch from the origin side alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::Relaxed};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::stats::{ChannelStat, StatSnapshot};
use crate::transport::{
    payload_envelopes, DeliveryFn, FrameHdr, FrameKind, Transport, FRAME_HDR_LEN,
};
use crate::wire::{Inbox, Wire};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct BatchQueue {
    buf: Vec<u8>,
    nrecs: u16,
    epoch: u32,
}

struct Shared {
    my_rank: u32,
    ranks_per_node: u32,
    env_len: usize,
    inflight: Mutex<u64>,
    inflight_cv: Condvar,
    running: AtomicBool,
    failed: Mutex<Option<String>>,
    stat: ChannelStat,
    next_seq: AtomicU32,
}

impl Shared {
    fn node_of(&self, rank: u32) -> u32 {
        rank / self.ranks_per_node
    }

    fn rep_of(&self, rank: u32) -> u32 {
        rank - rank % self.ranks_per_node
    }

    /// Next hop toward `dst`: same-node traffic goes direct, everything
    /// else climbs to the local representative and crosses between
    /// representatives.
    fn next_hop(&self, dst: u32) -> u32 {
        if self.node_of(dst) == self.node_of(self.my_rank) {
            dst
        } else if self.my_rank == self.rep_of(self.my_rank) {
            self.rep_of(dst)
        } else {
            self.rep_of(self.my_rank)
        }
    }

    fn same_node(&self, peer: u32) -> bool {
        self.node_of(peer) == self.node_of(self.my_rank)
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

/// Multi-hop transport through node representatives.
pub struct XnTransport {
    wire: Arc<dyn Wire>,
    shared: Arc<Shared>,
    queues: Mutex<Vec<BatchQueue>>,
    last_snapshot: Mutex<StatSnapshot>,
    batch_records: usize,
    delivery: Option<JoinHandle<()>>,
}

impl XnTransport {
    pub fn new(
        wire: Arc<dyn Wire>,
        inbox: Box<dyn Inbox>,
        delivery: DeliveryFn,
        env_len: usize,
        batch_records: usize,
        ranks_per_node: u32,
    ) -> Result<Self> {
        let world_size = wire.world_size();
        let shared = Arc::new(Shared {
            my_rank: wire.my_rank(),
            ranks_per_node: ranks_per_node.max(1),
            env_len,
            inflight: Mutex::new(0),
            inflight_cv: Condvar::new(),
            running: AtomicBool::new(true),
            failed: Mutex::new(None),
            stat: ChannelStat::new(),
            next_seq: AtomicU32::new(1),
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
            .name("shuffle-xn".to_string())
            .spawn(move || relay_loop(thread_shared, thread_wire, inbox, delivery))
            .map_err(|e| Error::Transport(format!("spawn delivery thread: {}", e)))?;

        Ok(Self {
            wire,
            shared,
            queues: Mutex::new(queues),
            last_snapshot: Mutex::new(StatSnapshot::default()),
            batch_records: batch_records.max(1),
            delivery: Some(handle),
        })
    }

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
            seq: self.shared.next_seq.fetch_add(1, Relaxed),
        };
        let mut frame = Vec::with_capacity(FRAME_HDR_LEN + queue.buf.len());
        hdr.encode_into(&mut frame);
        frame.extend_from_slice(&queue.buf);
        queue.buf.clear();
        queue.nrecs = 0;

        let next = self.shared.next_hop(dst);
        {
            let mut n = self.shared.inflight.lock().unwrap();
            *n += 1;
        }
        self.wire.send(next, frame)?;
        self.shared.stat.count_send(self.shared.same_node(next));
        Ok(())
    }
}

impl Transport for XnTransport {
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
        self.shared.wait_inflight()
    }

    // The relay loop must keep forwarding other ranks' traffic between
    // epochs, so pause/resume are accepted and ignored.
    fn pause(&self) {}

    fn resume(&self) {}

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
        if let Some(handle) = self.delivery.take() {
            let _ = handle.join();
        }
        result
    }
}

impl Drop for XnTransport {
    fn drop(&mut self) {
        if self.delivery.is_some() {
            let _ = self.shutdown();
        }
    }
}

fn relay_loop(
    shared: Arc<Shared>,
    wire: Arc<dyn Wire>,
    inbox: Box<dyn Inbox>,
    delivery: DeliveryFn,
) {
    // Forwarded frames awaiting a downstream ack: my seq → (upstream
    // rank, upstream seq). Only this thread touches it.
    let mut pending: HashMap<u32, (u32, u32)> = HashMap::new();

    while shared.running.load(Relaxed) {
        let frame = match inbox.recv_timeout(POLL_INTERVAL) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(_) => {
                shared.fail("wire disconnected".to_string());
                break;
            }
        };

        let hdr = match FrameHdr::decode(&frame) {
            Ok(hdr) => hdr,
            Err(e) => {
                shared.fail(e.to_string());
                break;
            }
        };

        match hdr.kind {
            FrameKind::Ack => match pending.remove(&hdr.seq) {
                Some((upstream, upstream_seq)) => {
                    if upstream == shared.my_rank {
                        shared.complete_one();
                        continue;
                    }
                    let ack = FrameHdr {
                        kind: FrameKind::Ack,
                        hop: hdr.hop,
                        nrecs: 0,
                        src: shared.my_rank,
                        dst: upstream,
                        via: shared.my_rank,
                        epoch: hdr.epoch,
                        seq: upstream_seq,
                    };
                    let mut out = Vec::with_capacity(FRAME_HDR_LEN);
                    ack.encode_into(&mut out);
                    if let Err(e) = wire.send(upstream, out) {
                        shared.fail(e.to_string());
                        break;
                    }
                }
                // No pending entry: this acks a frame we originated.
                None => shared.complete_one(),
            },
            FrameKind::Data => {
                shared.stat.count_recv(shared.same_node(hdr.via));

                if hdr.dst == shared.my_rank {
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
                    if hdr.via == shared.my_rank {
                        shared.complete_one();
                    } else if let Err(e) = wire.send(hdr.via, FrameHdr::ack(&hdr, shared.my_rank)) {
                        shared.fail(e.to_string());
                        break;
                    }
                } else {
                    // Relay hop: forward under a fresh seq and hold the
                    // upstream ack until the downstream one lands.
                    let fwd_seq = shared.next_seq.fetch_add(1, Relaxed);
                    let fwd_hdr = FrameHdr {
                        hop: hdr.hop + 1,
                        via: shared.my_rank,
                        seq: fwd_seq,
                        ..hdr
                    };
                    let mut out = Vec::with_capacity(frame.len());
                    fwd_hdr.encode_into(&mut out);
                    out.extend_from_slice(&frame[FRAME_HDR_LEN..]);

                    pending.insert(fwd_seq, (hdr.via, hdr.seq));
                    let next = shared.next_hop(hdr.dst);
                    if let Err(e) = wire.send(next, out) {
                        shared.fail(e.to_string());
                        break;
                    }
                    shared.stat.count_send(shared.same_node(next));
                }
            }
        }
    }
    shared.running.store(false, Relaxed);
    shared.inflight_cv.notify_all();
    debug!("rank {}: relay loop done", shared.my_rank);
}
