//! Transport capability interface and the shared frame codec.
//!
//! The dispatcher sees a [`Transport`]: non-blocking enqueue with
//! internal batching, epoch drain hooks, and counters. Two implementers
//! exist, [`nn::NnTransport`] (point-to-point mesh) and
//! [`xn::XnTransport`] (multi-hop through node representatives), and
//! the core never branches on which one is active.
//!
//! Both speak the same frame format over the wire primitive: a fixed
//! header followed by zero or more whole envelopes. Acks reuse the
//! header with an empty payload.

pub mod nn;
pub mod xn;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::stats::StatSnapshot;

/// Receiver-side delivery callback: `(envelope, src, dst, epoch)`.
///
/// Transports invoke this from exactly one thread; implementations must
/// keep it that way so the core can stay lock-free inside the callback.
pub type DeliveryFn = Arc<dyn Fn(&[u8], u32, u32, u32) -> Result<()> + Send + Sync>;

/// Transport contract.
///
/// `enqueue` owns its buffer copy once it returns; it may batch
/// internally and blocks only under destination back-pressure. Frames
/// for a `(src, dst)` pair within one epoch are delivered in order.
pub trait Transport: Send {
    /// Queue one envelope for `dst`. May flush a coalesced frame.
    fn enqueue(&self, envelope: &[u8], dst: u32, epoch: u32) -> Result<()>;

    /// Push every partially-filled per-destination queue onto the wire.
    fn flush(&self) -> Result<()>;

    /// Block until every frame this rank sent has been acknowledged as
    /// delivered.
    fn wait_delivery(&self) -> Result<()>;

    /// Drain lingering background work from the previous epoch.
    fn pre_start(&self) -> Result<()>;

    /// Quiesce, then publish the counter deltas accumulated since the
    /// previous `epoch_start`.
    fn epoch_start(&self) -> Result<StatSnapshot>;

    /// Flush and drain the closing epoch.
    fn epoch_end(&self) -> Result<()>;

    /// Put the delivery loop to sleep (lets the simulation own the
    /// cores between epochs).
    fn pause(&self);

    /// Wake the delivery loop.
    fn resume(&self);

    fn world_size(&self) -> u32;
    fn my_rank(&self) -> u32;

    /// Lifetime totals.
    fn stat(&self) -> StatSnapshot;

    /// Stop the delivery machinery and release wire resources. Called
    /// once, at finalize, after the last collective drain.
    fn shutdown(&mut self) -> Result<()>;
}

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Batched envelopes.
    Data = 0,
    /// Delivery acknowledgment for one data frame.
    Ack = 1,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Ack),
            other => Err(Error::Protocol(format!("bad frame kind {}", other))),
        }
    }
}

/// Frame header size in bytes.
pub const FRAME_HDR_LEN: usize = 24;

/// Wire frame header.
///
/// Layout (little-endian):
/// ```text
/// Offset  Size  Field
/// 0       1     kind
/// 1       1     hop count
/// 2       2     record count
/// 4       4     origin rank
/// 8       4     final destination rank
/// 12      4     last transmitter rank
/// 16      4     epoch
/// 20      4     sequence number (acks echo it)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHdr {
    pub kind: FrameKind,
    pub hop: u8,
    pub nrecs: u16,
    pub src: u32,
    pub dst: u32,
    pub via: u32,
    pub epoch: u32,
    pub seq: u32,
}

impl FrameHdr {
    /// Append the header to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.kind as u8);
        out.push(self.hop);
        out.extend_from_slice(&self.nrecs.to_le_bytes());
        out.extend_from_slice(&self.src.to_le_bytes());
        out.extend_from_slice(&self.dst.to_le_bytes());
        out.extend_from_slice(&self.via.to_le_bytes());
        out.extend_from_slice(&self.epoch.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
    }

    /// Parse a header off the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HDR_LEN {
            return Err(Error::Protocol(format!("short frame ({} bytes)", buf.len())));
        }
        let kind = FrameKind::try_from(buf[0])?;
        Ok(Self {
            kind,
            hop: buf[1],
            nrecs: u16::from_le_bytes([buf[2], buf[3]]),
            src: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            dst: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            via: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            epoch: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            seq: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }

    /// Build an ack frame for a received data frame.
    pub fn ack(data_hdr: &FrameHdr, acker: u32) -> Vec<u8> {
        let hdr = FrameHdr {
            kind: FrameKind::Ack,
            hop: data_hdr.hop,
            nrecs: 0,
            src: acker,
            dst: data_hdr.via,
            via: acker,
            epoch: data_hdr.epoch,
            seq: data_hdr.seq,
        };
        let mut out = Vec::with_capacity(FRAME_HDR_LEN);
        hdr.encode_into(&mut out);
        out
    }
}

/// Split a data frame payload into its fixed-size envelopes.
pub fn payload_envelopes(frame: &[u8], env_len: usize, nrecs: u16) -> Result<&[u8]> {
    let payload = &frame[FRAME_HDR_LEN..];
    if payload.len() != env_len * nrecs as usize {
        return Err(Error::Protocol(format!(
            "frame payload {} bytes, expected {} x {}",
            payload.len(),
            nrecs,
            env_len
        )));
    }
    Ok(payload)
}
