//! Collective communicator seam.
//!
//! The shuffle layer never talks to the job's communicator library
//! directly; it sees a [`Fabric`]: world size, own rank, a collective
//! barrier, and the node-local split used to stagger port probing.
//! [`LocalFabric`] backs in-process clusters (tests, bench driver); an
//! MPI adapter is available behind the `mpi` cargo feature.

use std::sync::{Arc, Barrier};

/// Collective communicator operations the layer relies on.
pub trait Fabric: Send + Sync {
    fn world_size(&self) -> u32;
    fn my_rank(&self) -> u32;

    /// Block until every rank in the world arrives.
    fn barrier(&self);

    /// Rank within this rank's node.
    fn node_rank(&self) -> u32;

    /// Number of ranks on this rank's node.
    fn node_size(&self) -> u32;
}

/// In-process fabric: one thread per rank, a shared barrier, nodes laid
/// out as contiguous rank blocks of `ranks_per_node`.
pub struct LocalFabric {
    rank: u32,
    size: u32,
    ranks_per_node: u32,
    barrier: Arc<Barrier>,
}

impl LocalFabric {
    /// Build fabrics for an `n`-rank cluster, in rank order.
    ///
    /// # Panics
    /// Panics if `n` or `ranks_per_node` is 0.
    pub fn cluster(n: usize, ranks_per_node: u32) -> Vec<LocalFabric> {
        assert!(n > 0, "cluster must have at least one rank");
        assert!(ranks_per_node > 0, "ranks_per_node must be nonzero");
        let barrier = Arc::new(Barrier::new(n));
        (0..n as u32)
            .map(|rank| LocalFabric {
                rank,
                size: n as u32,
                ranks_per_node,
                barrier: barrier.clone(),
            })
            .collect()
    }
}

impl Fabric for LocalFabric {
    fn world_size(&self) -> u32 {
        self.size
    }

    fn my_rank(&self) -> u32 {
        self.rank
    }

    fn barrier(&self) {
        self.barrier.wait();
    }

    fn node_rank(&self) -> u32 {
        self.rank % self.ranks_per_node
    }

    fn node_size(&self) -> u32 {
        let node_start = self.rank - self.rank % self.ranks_per_node;
        (self.size - node_start).min(self.ranks_per_node)
    }
}

/// MPI-backed fabric. The node split colors ranks by processor name,
/// which is what the job launcher keys node placement on.
#[cfg(feature = "mpi")]
pub mod mpi_fabric {
    use mpi::topology::{Color, SimpleCommunicator};
    use mpi::traits::*;

    use super::Fabric;

    pub struct MpiFabric {
        world: SimpleCommunicator,
        node_rank: u32,
        node_size: u32,
    }

    impl MpiFabric {
        pub fn new(world: SimpleCommunicator) -> Self {
            let name = mpi::environment::processor_name().unwrap_or_default();
            let color = xxhash_rust::xxh32::xxh32(name.as_bytes(), 0) & 0x7FFF_FFFF;
            let (node_rank, node_size) = match world.split_by_color(Color::with_value(color as i32))
            {
                Some(node) => (node.rank() as u32, node.size() as u32),
                None => (0, 1),
            };
            Self {
                world,
                node_rank,
                node_size,
            }
        }
    }

    impl Fabric for MpiFabric {
        fn world_size(&self) -> u32 {
            self.world.size() as u32
        }

        fn my_rank(&self) -> u32 {
            self.world.rank() as u32
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn node_rank(&self) -> u32 {
            self.node_rank
        }

        fn node_size(&self) -> u32 {
            self.node_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn test_cluster_shape() {
        let fabrics = LocalFabric::cluster(4, 2);
        assert_eq!(fabrics.len(), 4);
        for (i, f) in fabrics.iter().enumerate() {
            assert_eq!(f.my_rank(), i as u32);
            assert_eq!(f.world_size(), 4);
        }
        assert_eq!(fabrics[0].node_rank(), 0);
        assert_eq!(fabrics[1].node_rank(), 1);
        assert_eq!(fabrics[2].node_rank(), 0);
        assert_eq!(fabrics[3].node_size(), 2);
    }

    #[test]
    fn test_ragged_last_node() {
        let fabrics = LocalFabric::cluster(5, 2);
        assert_eq!(fabrics[4].node_rank(), 0);
        assert_eq!(fabrics[4].node_size(), 1);
    }

    #[test]
    fn test_barrier_synchronizes() {
        let fabrics = LocalFabric::cluster(3, 1);
        let arrived = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = fabrics
            .into_iter()
            .map(|f| {
                let arrived = arrived.clone();
                thread::spawn(move || {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    f.barrier();
                    // after the barrier every rank must have arrived
                    assert_eq!(arrived.load(Ordering::SeqCst), 3);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
