//! # pshuffle - epoch-scoped particle shuffle for checkpoint I/O
//!
//! A parallel job of N ranks emits streams of small fixed-width records
//! keyed by a fixed-width id. Before a rank may flush its local
//! log-structured store, every record must reach the rank that owns its
//! id. This crate is the layer in between: for each record it computes
//! the owning rank, then either writes locally (fast path) or forwards
//! the record over an RPC transport, coalescing many tiny records into
//! each RPC. Work proceeds in strict epochs: all ranks collectively
//! open an epoch, stream records, and collectively close it with a
//! global drain.
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use pshuffle::{ChannelMesh, LocalFabric, MemStore, ShuffleConfig, ShuffleCtx};
//!
//! let config = ShuffleConfig::from_env()?;
//! let mut ctx = ShuffleCtx::init(&config, fabric, wire, inbox, store)?;
//!
//! ctx.epoch_pre_start()?;
//! ctx.epoch_start(0)?;
//! ctx.write(&id, &data, 0)?;
//! ctx.fabric().barrier();
//! ctx.epoch_end(0)?;
//! ctx.fabric().barrier();   // epoch 0 is now globally settled
//! ctx.finalize()?;
//! ```
//!
//! ## Architecture
//!
//! - [`placement`]: deterministic id-to-rank mapping (consistent-hash
//!   ring with virtual nodes, plus the inline bypass hash)
//! - [`mask`]: receiver-mask folding of placement results onto the
//!   receiver subset
//! - [`envelope`]: the fixed-size `[id | 0 | data | pad]` wire record
//! - [`transport`]: the transport contract and the two implementers
//!   (point-to-point `nn`, multi-hop `xn`)
//! - [`wire`]: the assumed one-way request-delivery primitive
//! - [`fabric`]: the collective communicator seam
//! - [`uri`]: endpoint bootstrap (interface scan, port probe)
//! - [`shuffle`]: the context, dispatcher, and epoch state machine
//! - [`store`]: the local storage collaborator seam
//! - [`stats`], [`config`], [`error`]: telemetry, knobs, taxonomy

pub mod config;
pub mod envelope;
pub mod error;
pub mod fabric;
pub mod mask;
pub mod placement;
pub mod shuffle;
pub mod stats;
pub mod store;
pub mod transport;
pub mod uri;
pub mod wire;

pub use config::{ShuffleConfig, ShuffleMode, TransportKind};
pub use envelope::{RecordShape, MAX_ENVELOPE};
pub use error::{Error, Result};
pub use fabric::{Fabric, LocalFabric};
pub use mask::ReceiverMask;
pub use placement::{bypass_target, PlacementProtocol, Placer};
pub use shuffle::{EpochStage, ShuffleCtx};
pub use stats::{Histogram, StatSnapshot};
pub use store::{MemStore, Store, StoredRecord};
pub use transport::{nn::NnTransport, xn::XnTransport, Transport};
pub use uri::prepare_uri;
pub use wire::{ChannelMesh, ChannelInbox, ChannelWire, Inbox, Wire};
