//! Record-id to rank placement.
//!
//! Two distinct paths exist and must not be conflated:
//!
//! - **Bypass placement** ([`bypass_target`]): a 32-bit hash taken modulo
//!   the world size, computed inline with no [`Placer`] at all. Selected
//!   by the bypass mode flag.
//! - **Selectable protocols** ([`Placer`]): a 64-bit hash looked up on a
//!   consistent-hashing ring of `world_size * virtual_factor` points
//!   (or a plain 64-bit modulo for `static_modulo`). The ring protocols
//!   keep routing stable when the world size changes.
//!
//! All placement is a pure function of the inputs. Every rank must route
//! identical ids to the same destination, so ties between equal ring
//! points always resolve to the lower rank number.

use xxhash_rust::xxh32::xxh32;
use xxhash_rust::xxh64::xxh64;

use crate::error::{Error, Result};

/// Route an id by plain 32-bit hash modulo, skipping the placer.
#[inline]
pub fn bypass_target(id: &[u8], world_size: u32) -> u32 {
    xxh32(id, 0) % world_size
}

/// Selectable placement protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementProtocol {
    /// 64-bit hash modulo world size. Cheapest; no ring.
    StaticModulo,
    /// Ring with virtual-node points derived from two 32-bit hash rounds.
    HashLookup3,
    /// Ring with virtual-node points from xor-combined rank/vnode hashes.
    Xor,
    /// Ring with virtual-node points from a single 64-bit hash.
    Ring,
}

impl PlacementProtocol {
    /// Parse a protocol name as configured in the environment.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "static_modulo" => Ok(PlacementProtocol::StaticModulo),
            "hash_lookup3" => Ok(PlacementProtocol::HashLookup3),
            "xor" => Ok(PlacementProtocol::Xor),
            "ring" => Ok(PlacementProtocol::Ring),
            other => Err(Error::Config(format!(
                "unknown placement protocol \"{}\" \
                 (expected static_modulo, hash_lookup3, xor, or ring)",
                other
            ))),
        }
    }

    /// Canonical protocol name.
    pub fn name(&self) -> &'static str {
        match self {
            PlacementProtocol::StaticModulo => "static_modulo",
            PlacementProtocol::HashLookup3 => "hash_lookup3",
            PlacementProtocol::Xor => "xor",
            PlacementProtocol::Ring => "ring",
        }
    }
}

/// Virtual-node point derivation. Each protocol spreads its points
/// differently but all are deterministic in (rank, vnode, seed).
fn vnode_point(protocol: PlacementProtocol, rank: u32, vnode: u32, seed: u64) -> u64 {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&rank.to_le_bytes());
    key[4..].copy_from_slice(&vnode.to_le_bytes());
    match protocol {
        PlacementProtocol::Ring => xxh64(&key, seed),
        PlacementProtocol::HashLookup3 => {
            let hi = xxh32(&key, seed as u32) as u64;
            let lo = xxh32(&key, (seed as u32) ^ 0x9E37_79B9) as u64;
            (hi << 32) | lo
        }
        PlacementProtocol::Xor => {
            xxh64(&rank.to_le_bytes(), seed) ^ xxh64(&vnode.to_le_bytes(), !seed)
        }
        PlacementProtocol::StaticModulo => unreachable!("static_modulo builds no ring"),
    }
}

/// Deterministic id-to-rank mapping. Read-only after construction; no
/// locking is needed for concurrent lookups.
#[derive(Debug)]
pub struct Placer {
    protocol: PlacementProtocol,
    world_size: u32,
    virtual_factor: u32,
    seed: u64,
    /// `(point, rank)` sorted ascending; ties sort lower rank first.
    /// Empty for `static_modulo`.
    ring: Vec<(u64, u32)>,
}

impl Placer {
    /// Build a placer for `world_size` ranks with `virtual_factor`
    /// virtual nodes per rank.
    pub fn new(
        protocol: PlacementProtocol,
        world_size: u32,
        virtual_factor: u32,
        seed: u64,
    ) -> Result<Self> {
        if world_size < 1 {
            return Err(Error::Config("placement world size must be >= 1".to_string()));
        }
        if virtual_factor < 1 {
            return Err(Error::Config("placement virtual factor must be >= 1".to_string()));
        }

        let ring = if protocol == PlacementProtocol::StaticModulo {
            Vec::new()
        } else {
            let mut ring = Vec::with_capacity(world_size as usize * virtual_factor as usize);
            for rank in 0..world_size {
                for vnode in 0..virtual_factor {
                    ring.push((vnode_point(protocol, rank, vnode, seed), rank));
                }
            }
            ring.sort_unstable();
            ring
        };

        Ok(Self {
            protocol,
            world_size,
            virtual_factor,
            seed,
            ring,
        })
    }

    /// The protocol this placer was built with.
    pub fn protocol(&self) -> PlacementProtocol {
        self.protocol
    }

    /// Number of ranks in the placement group.
    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Virtual nodes per rank.
    pub fn virtual_factor(&self) -> u32 {
        self.virtual_factor
    }

    /// Map an id to its owning rank in `[0, world_size)`.
    pub fn target(&self, id: &[u8]) -> u32 {
        let h = xxh64(id, self.seed);
        if self.protocol == PlacementProtocol::StaticModulo {
            return (h % self.world_size as u64) as u32;
        }
        // Successor on the ring, wrapping past the last point. Ties on
        // equal points were sorted lower-rank-first at build time.
        let idx = self.ring.partition_point(|&(point, _)| point < h);
        if idx == self.ring.len() {
            self.ring[0].1
        } else {
            self.ring[idx].1
        }
    }
}
