//! Shuffle layer configuration.
//!
//! A [`ShuffleConfig`] is frozen at init time. It can be built in code
//! (builder style) or read from the `SHUFFLE_*` environment the way the
//! deployment scripts set it up.

use bitflags::bitflags;

use crate::envelope::RecordShape;
use crate::error::{Error, Result};
use crate::placement::PlacementProtocol;

bitflags! {
    /// Operating-mode flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ShuffleMode: u32 {
        /// Route by plain 32-bit hash modulo, constructing no placer.
        const BYPASS_PLACEMENT = 1 << 0;
        /// Write every record locally, never touching the transport.
        const BYPASS_SHUFFLE = 1 << 1;
    }
}

/// Which transport implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Point-to-point mesh; every rank talks to every rank.
    Nn,
    /// Multi-hop; traffic aggregates through node representatives.
    Xn,
}

/// Shuffle layer configuration.
#[derive(Debug, Clone)]
pub struct ShuffleConfig {
    /// Operating-mode flags.
    pub mode: ShuffleMode,
    /// Record id size in bytes.
    /// Default: 8
    pub id_len: usize,
    /// Record payload size in bytes.
    /// Default: 48
    pub data_len: usize,
    /// Reserved trailing envelope bytes.
    /// Default: 0
    pub extra: usize,
    /// Receiver radix r; 2^r senders fold onto one receiver.
    /// Default: 0 (everyone receives)
    pub recv_radix: u32,
    /// Always go through the transport, even for local destinations.
    /// Default: false
    pub force_rpc: bool,
    /// Wait for delivery after every queue flush instead of once at
    /// epoch end.
    /// Default: false
    pub force_sync: bool,
    /// Transport implementation.
    /// Default: Nn
    pub transport: TransportKind,
    /// Placement protocol.
    /// Default: Ring
    pub placement: PlacementProtocol,
    /// Virtual nodes per rank on the placement ring.
    /// Default: 1024
    pub virtual_factor: u32,
    /// Placement hash seed.
    /// Default: 0
    pub seed: u64,
    /// Seconds to sleep before releasing the transport at finalize.
    /// Default: 0
    pub finalize_pause_s: u32,
    /// Records coalesced per outbound RPC frame.
    /// Default: 16
    pub batch_records: usize,
    /// Per-rank inbox capacity in frames; a full inbox blocks senders.
    /// Default: 256
    pub queue_capacity: usize,
    /// Ranks per node, for intra/inter-node accounting and multi-hop
    /// representative selection.
    /// Default: 1
    pub ranks_per_node: u32,
    /// Transport URI scheme.
    /// Default: "tcp"
    pub proto: String,
    /// Dotted-quad prefix selecting the egress interface.
    /// Default: "127.0.0.1"
    pub subnet: String,
    /// Low end of the port probe window.
    /// Default: 50000
    pub min_port: u16,
    /// High end of the port probe window.
    /// Default: 59999
    pub max_port: u16,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            mode: ShuffleMode::empty(),
            id_len: 8,
            data_len: 48,
            extra: 0,
            recv_radix: 0,
            force_rpc: false,
            force_sync: false,
            transport: TransportKind::Nn,
            placement: PlacementProtocol::Ring,
            virtual_factor: 1024,
            seed: 0,
            finalize_pause_s: 0,
            batch_records: 16,
            queue_capacity: 256,
            ranks_per_node: 1,
            proto: "tcp".to_string(),
            subnet: "127.0.0.1".to_string(),
            min_port: 50000,
            max_port: 59999,
        }
    }
}

impl ShuffleConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record shape (id, data, extra sizes).
    pub fn with_shape(mut self, id_len: usize, data_len: usize, extra: usize) -> Self {
        self.id_len = id_len;
        self.data_len = data_len;
        self.extra = extra;
        self
    }

    /// Set the receiver radix.
    pub fn with_recv_radix(mut self, radix: u32) -> Self {
        self.recv_radix = radix;
        self
    }

    /// Force the loopback RPC path even for local destinations.
    pub fn with_force_rpc(mut self, force_rpc: bool) -> Self {
        self.force_rpc = force_rpc;
        self
    }

    /// Wait for delivery on every flush.
    pub fn with_force_sync(mut self, force_sync: bool) -> Self {
        self.force_sync = force_sync;
        self
    }

    /// Select the transport implementation.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Select the placement protocol.
    pub fn with_placement(mut self, placement: PlacementProtocol) -> Self {
        self.placement = placement;
        self
    }

    /// Set the virtual-node factor.
    pub fn with_virtual_factor(mut self, virtual_factor: u32) -> Self {
        self.virtual_factor = virtual_factor;
        self
    }

    /// Set operating-mode flags.
    pub fn with_mode(mut self, mode: ShuffleMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the per-frame record batch size.
    pub fn with_batch_records(mut self, batch_records: usize) -> Self {
        self.batch_records = batch_records;
        self
    }

    /// Set the per-rank inbox capacity.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Set the number of ranks per node.
    pub fn with_ranks_per_node(mut self, ranks_per_node: u32) -> Self {
        self.ranks_per_node = ranks_per_node;
        self
    }

    /// Set the finalize pause in whole seconds.
    pub fn with_finalize_pause(mut self, secs: u32) -> Self {
        self.finalize_pause_s = secs;
        self
    }

    /// Set the port probe window.
    pub fn with_port_range(mut self, min_port: u16, max_port: u16) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }

    /// Set the interface-selection subnet prefix.
    pub fn with_subnet(mut self, subnet: &str) -> Self {
        self.subnet = subnet.to_string();
        self
    }

    /// Set the transport URI scheme.
    pub fn with_proto(mut self, proto: &str) -> Self {
        self.proto = proto.to_string();
        self
    }

    /// Overlay the `SHUFFLE_*` environment onto the defaults.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(proto) = env_str("SHUFFLE_Mercury_proto") {
            cfg.proto = proto;
        }
        if let Some(subnet) = env_str("SHUFFLE_Subnet") {
            cfg.subnet = subnet;
        }
        if let Some(port) = env_int("SHUFFLE_Min_port")? {
            cfg.min_port = port_value("SHUFFLE_Min_port", port)?;
        }
        if let Some(port) = env_int("SHUFFLE_Max_port")? {
            cfg.max_port = port_value("SHUFFLE_Max_port", port)?;
        }
        if let Some(vf) = env_int("SHUFFLE_Virtual_factor")? {
            if vf < 1 {
                return Err(Error::Config(format!("bad SHUFFLE_Virtual_factor {}", vf)));
            }
            cfg.virtual_factor = vf as u32;
        }
        if let Some(name) = env_str("SHUFFLE_Placement_protocol") {
            cfg.placement = PlacementProtocol::parse(&name)?;
        }
        if let Some(radix) = env_int("SHUFFLE_Recv_radix")? {
            cfg.recv_radix = radix.clamp(0, 8) as u32;
        }
        if env_set("SHUFFLE_Force_rpc") {
            cfg.force_rpc = true;
        }
        if env_set("SHUFFLE_Force_sync") {
            cfg.force_sync = true;
        }
        if env_set("SHUFFLE_Use_multihop") {
            cfg.transport = TransportKind::Xn;
        }
        if let Some(pause) = env_int("SHUFFLE_Finalize_pause")? {
            cfg.finalize_pause_s = pause.max(0) as u32;
        }
        Ok(cfg)
    }

    /// Validate the configuration and derive the frozen record shape.
    pub fn shape(&self) -> Result<RecordShape> {
        RecordShape::new(self.id_len, self.data_len, self.extra)
    }

    /// Validate the port probe window.
    pub fn check_ports(&self) -> Result<()> {
        if self.min_port < 1 {
            return Err(Error::Config("bad min port".to_string()));
        }
        if self.max_port < self.min_port {
            return Err(Error::Config("bad min-max port".to_string()));
        }
        Ok(())
    }

    /// True when placement is bypassed for this run.
    #[inline]
    pub fn bypass_placement(&self) -> bool {
        self.mode.contains(ShuffleMode::BYPASS_PLACEMENT)
    }

    /// True when the shuffle itself is bypassed.
    #[inline]
    pub fn bypass_shuffle(&self) -> bool {
        self.mode.contains(ShuffleMode::BYPASS_SHUFFLE)
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// A variable is "set" when present, nonempty, and not literally "0".
fn env_set(name: &str) -> bool {
    matches!(std::env::var(name), Ok(v) if !v.is_empty() && v != "0")
}

fn env_int(name: &str) -> Result<Option<i64>> {
    match env_str(name) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| Error::Config(format!("bad integer in {}: \"{}\"", name, v))),
    }
}

fn port_value(name: &str, raw: i64) -> Result<u16> {
    if !(1..=65535).contains(&raw) {
        return Err(Error::Config(format!("bad port in {}: {}", name, raw)));
    }
    Ok(raw as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ShuffleConfig::default();
        assert_eq!(cfg.transport, TransportKind::Nn);
        assert_eq!(cfg.recv_radix, 0);
        assert!(!cfg.force_rpc);
        assert_eq!(cfg.shape().unwrap().envelope_len(), 57);
        cfg.check_ports().unwrap();
    }

    #[test]
    fn test_builder_chain() {
        let cfg = ShuffleConfig::new()
            .with_shape(16, 32, 2)
            .with_recv_radix(3)
            .with_transport(TransportKind::Xn)
            .with_force_rpc(true)
            .with_port_range(7000, 7000);
        assert_eq!(cfg.id_len, 16);
        assert_eq!(cfg.recv_radix, 3);
        assert_eq!(cfg.transport, TransportKind::Xn);
        assert!(cfg.force_rpc);
        cfg.check_ports().unwrap();
    }

    #[test]
    fn test_bad_port_window() {
        let cfg = ShuffleConfig::new().with_port_range(9000, 8000);
        assert!(cfg.check_ports().is_err());
    }

    #[test]
    fn test_mode_flags() {
        let cfg = ShuffleConfig::new().with_mode(ShuffleMode::BYPASS_PLACEMENT);
        assert!(cfg.bypass_placement());
        assert!(!cfg.bypass_shuffle());
    }
}
