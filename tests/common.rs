//! Common harness for multi-rank shuffle tests.
//!
//! Ranks run as threads over an in-process mesh and fabric. The body
//! closure receives each rank's context, store, and fabric; results
//! come back in rank order.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use pshuffle::{ChannelMesh, LocalFabric, MemStore, Placer, ShuffleConfig, ShuffleCtx};

/// Run `body` on every rank of an `n`-rank cluster. The harness builds
/// the mesh, fabric, context, and store per rank, and finalizes the
/// context after the body returns. Bodies must end with a barrier after
/// their last `epoch_end` so no rank finalizes under a peer's traffic.
pub fn run_cluster<R, F>(n: usize, ranks_per_node: u32, config: &ShuffleConfig, body: F) -> Vec<R>
where
    R: Send,
    F: Fn(&mut ShuffleCtx, &Arc<MemStore>, &Arc<LocalFabric>) -> R + Send + Sync,
{
    let mesh = ChannelMesh::cluster(n, config.queue_capacity);
    let fabrics = LocalFabric::cluster(n, ranks_per_node);

    thread::scope(|s| {
        let body = &body;
        let handles: Vec<_> = mesh
            .into_iter()
            .zip(fabrics)
            .map(|((wire, inbox), fabric)| {
                s.spawn(move || {
                    let fabric = Arc::new(fabric);
                    let store = Arc::new(MemStore::new());
                    let mut ctx = ShuffleCtx::init(
                        config,
                        fabric.clone(),
                        Arc::new(wire),
                        Box::new(inbox),
                        store.clone(),
                    )
                    .expect("shuffle init");
                    let result = body(&mut ctx, &store, &fabric);
                    ctx.finalize().expect("finalize");
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread"))
            .collect()
    })
}

/// First 8-byte id whose (unmasked) placement under `config` lands on
/// `want`. Every rank computes the same answer, which is the point.
pub fn id_routing_to(config: &ShuffleConfig, world_size: u32, want: u32) -> [u8; 8] {
    let placer = Placer::new(
        config.placement,
        world_size,
        config.virtual_factor,
        config.seed,
    )
    .expect("placer");
    for i in 0..1_000_000u64 {
        let id = i.to_le_bytes();
        if placer.target(&id) == want {
            return id;
        }
    }
    panic!("no id routes to rank {} in a {}-rank world", want, world_size);
}
