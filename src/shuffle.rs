//! The shuffle context: dispatch, epoch control, lifecycle.
//!
//! A [`ShuffleCtx`] is created once per process by [`ShuffleCtx::init`],
//! threaded through every entry point, and destroyed by
//! [`ShuffleCtx::finalize`]. There are no hidden singletons; the context
//! owns its placer and its transport and drops both at finalize.
//!
//! Writes run on the calling simulation thread and stay cheap: encode
//! into a stack buffer, pick the destination, then either write locally
//! or hand the envelope to the transport. Blocking happens only under
//! destination back-pressure and at epoch drains.

use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::config::{ShuffleConfig, TransportKind};
use crate::envelope::{RecordShape, MAX_ENVELOPE};
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::mask::ReceiverMask;
use crate::placement::{bypass_target, Placer};
use crate::stats::{EpochCounters, StatSnapshot};
use crate::store::Store;
use crate::transport::nn::NnTransport;
use crate::transport::xn::XnTransport;
use crate::transport::{DeliveryFn, Transport};
use crate::wire::{Inbox, Wire};

/// Epoch stages. Writes are legal only in `Started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochStage {
    Idle,
    PreStart,
    Started,
    Ending,
    Closed,
}

impl EpochStage {
    fn name(&self) -> &'static str {
        match self {
            EpochStage::Idle => "Idle",
            EpochStage::PreStart => "PreStart",
            EpochStage::Started => "Started",
            EpochStage::Ending => "Ending",
            EpochStage::Closed => "Closed",
        }
    }
}

/// Build the receiver-side delivery handler: verify the envelope shape,
/// decode, account the delivery, and push into the store's foreign
/// path. The transport invokes it from a single thread.
pub fn delivery_handler(
    shape: RecordShape,
    store: Arc<dyn Store>,
    counters: Arc<EpochCounters>,
    my_rank: u32,
) -> DeliveryFn {
    Arc::new(move |envelope, src, _dst, epoch| {
        let (id, data) = shape.decode(envelope)?;
        if src == my_rank {
            counters.local_recvs.fetch_add(1, Relaxed);
        } else {
            counters.remote_recvs.fetch_add(1, Relaxed);
        }
        match store.exotic_write(id, data, epoch) {
            0 => Ok(()),
            rv => Err(Error::Store(rv)),
        }
    })
}

/// Process-wide shuffle layer state. Immutable after init, except for
/// the epoch stage driven by the epoch calls.
pub struct ShuffleCtx {
    shape: RecordShape,
    mask: ReceiverMask,
    placer: Option<Placer>,
    transport: Box<dyn Transport>,
    store: Arc<dyn Store>,
    counters: Arc<EpochCounters>,
    fabric: Arc<dyn Fabric>,
    force_rpc: bool,
    bypass_placement: bool,
    bypass_shuffle: bool,
    finalize_pause_s: u32,
    stage: EpochStage,
    epoch: u32,
    epoch_delta: StatSnapshot,
    finalized: bool,
}

impl ShuffleCtx {
    /// Bring the layer up: validate configuration, build the placer and
    /// receiver mask, start the selected transport over `wire`/`inbox`,
    /// and wire deliveries into `store`.
    pub fn init(
        config: &ShuffleConfig,
        fabric: Arc<dyn Fabric>,
        wire: Arc<dyn Wire>,
        inbox: Box<dyn Inbox>,
        store: Arc<dyn Store>,
    ) -> Result<ShuffleCtx> {
        let shape = config.shape()?;
        config.check_ports()?;

        let world_size = wire.world_size();
        let my_rank = wire.my_rank();
        if world_size != fabric.world_size() || my_rank != fabric.my_rank() {
            return Err(Error::Config(
                "wire and fabric disagree on the world".to_string(),
            ));
        }

        let rank0 = my_rank == 0;
        if rank0 && config.finalize_pause_s > 0 {
            info!("shuffle finalize pause: {} secs", config.finalize_pause_s);
        }
        if rank0 {
            if config.force_rpc {
                info!("shuffle force_rpc is ON (loopback goes through the transport)");
            } else {
                warn!("shuffle force_rpc is OFF (will skip shuffle if addr is local)");
            }
            match config.transport {
                TransportKind::Xn => info!("using the scalable multi-hop shuffler"),
                TransportKind::Nn => {
                    warn!("using the default point-to-point shuffler; may not scale well")
                }
            }
        }

        let mask = ReceiverMask::from_radix(config.recv_radix);
        if rank0 {
            info!(
                "shuffle receiver mask = {:#010x} ({} senders per receiver)",
                mask.mask(),
                mask.receiver_rate()
            );
        }

        let placer = if config.bypass_placement() {
            if rank0 {
                warn!("placement bypassed (32-bit hash modulo)");
            }
            None
        } else {
            let placer = Placer::new(
                config.placement,
                world_size,
                config.virtual_factor,
                config.seed,
            )?;
            if rank0 {
                info!(
                    "placement group size: {} (vir-factor: {}, proto: {})",
                    world_size,
                    config.virtual_factor,
                    config.placement.name()
                );
            }
            Some(placer)
        };

        let counters = Arc::new(EpochCounters::new());
        let handler = delivery_handler(shape, store.clone(), counters.clone(), my_rank);

        let transport: Box<dyn Transport> = match config.transport {
            TransportKind::Nn => Box::new(NnTransport::new(
                wire,
                inbox,
                handler,
                shape.envelope_len(),
                config.batch_records,
                config.force_sync,
                config.ranks_per_node,
            )?),
            TransportKind::Xn => Box::new(XnTransport::new(
                wire,
                inbox,
                handler,
                shape.envelope_len(),
                config.batch_records,
                config.ranks_per_node,
            )?),
        };

        Ok(ShuffleCtx {
            shape,
            mask,
            placer,
            transport,
            store,
            counters,
            fabric,
            force_rpc: config.force_rpc,
            bypass_placement: config.bypass_placement(),
            bypass_shuffle: config.bypass_shuffle(),
            finalize_pause_s: config.finalize_pause_s,
            stage: EpochStage::Idle,
            epoch: 0,
            epoch_delta: StatSnapshot::default(),
            finalized: false,
        })
    }

    /// Route one record: write locally when this rank owns it, enqueue
    /// on the transport otherwise.
    pub fn write(&self, id: &[u8], data: &[u8], epoch: u32) -> Result<()> {
        if self.stage != EpochStage::Started {
            return Err(Error::State {
                expected: "Started",
                actual: self.stage.name(),
            });
        }
        if epoch != self.epoch {
            return Err(Error::State {
                expected: "current epoch",
                actual: "foreign epoch",
            });
        }

        // Validates both lengths and keeps the hot path allocation-free.
        let mut envelope = [0u8; MAX_ENVELOPE];
        let env_len = self.shape.encode(id, data, &mut envelope)?;

        let my_rank = self.transport.my_rank();
        if self.bypass_shuffle {
            return self.write_local(id, data, epoch);
        }

        let world_size = self.transport.world_size();
        let peer = if world_size == 1 {
            my_rank
        } else if self.bypass_placement {
            bypass_target(id, world_size)
        } else {
            // init always builds the placer when placement is on
            self.placer.as_ref().map(|p| p.target(id)).unwrap_or(my_rank)
        };
        let dst = self.mask.fold(peer);

        if dst == my_rank && !self.force_rpc {
            return self.write_local(id, data, epoch);
        }

        self.transport.enqueue(&envelope[..env_len], dst, epoch)?;
        self.counters.remote_sends.fetch_add(1, Relaxed);
        Ok(())
    }

    fn write_local(&self, id: &[u8], data: &[u8], epoch: u32) -> Result<()> {
        match self.store.native_write(id, data, epoch) {
            0 => {
                self.counters.local_sends.fetch_add(1, Relaxed);
                Ok(())
            }
            rv => Err(Error::Store(rv)),
        }
    }

    /// Settle lingering background drains from the previous epoch.
    /// No collective barrier here; callers add one where their paranoia
    /// level demands it.
    pub fn epoch_pre_start(&mut self) -> Result<()> {
        match self.stage {
            EpochStage::Idle | EpochStage::Closed => {
                self.transport.pre_start()?;
                self.stage = EpochStage::PreStart;
                Ok(())
            }
            other => Err(Error::State {
                expected: "Idle or Closed",
                actual: other.name(),
            }),
        }
    }

    /// Open `epoch`: quiesce the transport, publish the previous
    /// epoch's counter deltas, and reset the per-epoch counters.
    pub fn epoch_start(&mut self, epoch: u32) -> Result<()> {
        if self.stage != EpochStage::PreStart {
            return Err(Error::State {
                expected: "PreStart",
                actual: self.stage.name(),
            });
        }
        self.epoch_delta = self.transport.epoch_start()?;
        self.counters.reset();
        self.epoch = epoch;
        self.stage = EpochStage::Started;
        Ok(())
    }

    /// Close `epoch`: flush every queue, then wait until everything
    /// this rank emitted has been delivered. On return, each record
    /// written this epoch has either hit the local store or invoked the
    /// destination's foreign path; the caller's collective barrier
    /// promotes that to a global property.
    pub fn epoch_end(&mut self, epoch: u32) -> Result<()> {
        if self.stage != EpochStage::Started || epoch != self.epoch {
            return Err(Error::State {
                expected: "Started",
                actual: self.stage.name(),
            });
        }
        self.stage = EpochStage::Ending;
        self.transport.epoch_end()?;
        self.stage = EpochStage::Closed;
        Ok(())
    }

    /// Tear the layer down: quiesce and stop the transport, then hold
    /// for the configured pause so slower peers can finish their own
    /// drains before this endpoint disappears.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        let stat = self.transport.stat();
        let result = self.transport.shutdown();
        if self.finalize_pause_s > 0 {
            std::thread::sleep(Duration::from_secs(self.finalize_pause_s as u64));
        }
        if self.transport.my_rank() == 0 {
            let total = stat.local_sends + stat.remote_sends;
            if total > 0 {
                info!(
                    "total sends: {} intra-node + {} inter-node = {} overall",
                    stat.local_sends, stat.remote_sends, total
                );
            }
        }
        self.finalized = true;
        result
    }

    /// Put the transport's delivery machinery to sleep between epochs.
    pub fn pause(&self) {
        self.transport.pause();
    }

    /// Wake the transport's delivery machinery.
    pub fn resume(&self) {
        self.transport.resume();
    }

    pub fn my_rank(&self) -> u32 {
        self.transport.my_rank()
    }

    pub fn world_size(&self) -> u32 {
        self.transport.world_size()
    }

    pub fn stage(&self) -> EpochStage {
        self.stage
    }

    /// True iff every rank receives (`radix == 0`).
    pub fn is_everyone_receiver(&self) -> bool {
        self.mask.everyone()
    }

    /// True iff this rank is a receiver.
    pub fn is_receiver(&self) -> bool {
        self.mask.is_receiver(self.my_rank())
    }

    /// This rank's dense index within the receiver set.
    pub fn receiver_rank(&self) -> u32 {
        self.mask.receiver_rank(self.my_rank())
    }

    /// The receiver mask in force.
    pub fn receiver_mask(&self) -> ReceiverMask {
        self.mask
    }

    /// Per-epoch dispatch counters (reset at `epoch_start`).
    pub fn counters(&self) -> StatSnapshot {
        self.counters.snapshot()
    }

    /// Transport counter deltas published at the last `epoch_start`.
    pub fn epoch_delta(&self) -> StatSnapshot {
        self.epoch_delta
    }

    /// Lifetime transport counters.
    pub fn transport_stat(&self) -> StatSnapshot {
        self.transport.stat()
    }

    /// The collective fabric this layer was brought up on.
    pub fn fabric(&self) -> &dyn Fabric {
        self.fabric.as_ref()
    }
}

impl Drop for ShuffleCtx {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = self.finalize();
        }
    }
}
