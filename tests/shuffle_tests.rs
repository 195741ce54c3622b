//! End-to-end shuffle scenarios over the in-process mesh.
//!
//! Record shape throughout: 8-byte ids, 48-byte payloads, no extra
//! bytes (57-byte envelopes).

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{id_routing_to, run_cluster};
use pshuffle::{
    ChannelMesh, Fabric, LocalFabric, MemStore, ShuffleConfig, ShuffleCtx, TransportKind,
};

#[test]
fn test_single_rank_loopback() {
    let config = ShuffleConfig::default();
    let results = run_cluster(1, 1, &config, |ctx, store, fabric| {
        ctx.epoch_pre_start().unwrap();
        ctx.epoch_start(0).unwrap();

        let id = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let data = [0xAAu8; 48];
        ctx.write(&id, &data, 0).unwrap();

        ctx.epoch_end(0).unwrap();
        fabric.barrier();

        let counters = ctx.counters();
        let stat = ctx.transport_stat();
        (
            store.native_count(0),
            store.foreign_count(0),
            counters.local_sends,
            stat.local_sends + stat.remote_sends,
        )
    });

    let (native, foreign, local_sends, frames) = results[0];
    assert_eq!(native, 1, "native_write called once");
    assert_eq!(foreign, 0, "transport never invoked");
    assert_eq!(local_sends, 1);
    assert_eq!(frames, 0, "no frames on the wire");
}

#[test]
fn test_two_rank_cross() {
    let config = ShuffleConfig::default();
    // each rank writes an id owned by the other
    let to_rank1 = id_routing_to(&config, 2, 1);
    let to_rank0 = id_routing_to(&config, 2, 0);

    let results = run_cluster(2, 1, &config, move |ctx, store, fabric| {
        ctx.epoch_pre_start().unwrap();
        ctx.epoch_start(0).unwrap();
        fabric.barrier();

        let id = if ctx.my_rank() == 0 { to_rank1 } else { to_rank0 };
        let data = [ctx.my_rank() as u8; 48];
        ctx.write(&id, &data, 0).unwrap();

        ctx.epoch_end(0).unwrap();
        fabric.barrier();

        (store.epoch_records(0), ctx.counters())
    });

    for (rank, (records, counters)) in results.iter().enumerate() {
        let peer = 1 - rank;
        assert_eq!(records.len(), 1, "rank {} got one record", rank);
        assert!(records[0].foreign, "record arrived over the transport");
        assert_eq!(
            records[0].data,
            vec![peer as u8; 48],
            "record originated at the other rank"
        );
        assert_eq!(counters.remote_sends, 1);
        assert_eq!(counters.local_sends, 0);
        assert_eq!(counters.remote_recvs, 1);
    }
}

#[test]
fn test_receiver_mask_one_of_four() {
    // r=2: mask 0xFFFFFFFC, only rank 0 receives in a 4-rank world.
    let config = ShuffleConfig::default().with_recv_radix(2);
    let to_rank2 = id_routing_to(&config, 4, 2);

    let results = run_cluster(4, 1, &config, move |ctx, store, fabric| {
        assert_eq!(ctx.is_receiver(), ctx.my_rank() == 0);
        assert!(!ctx.is_everyone_receiver());

        ctx.epoch_pre_start().unwrap();
        ctx.epoch_start(0).unwrap();
        fabric.barrier();

        // placement says rank 2; the mask folds that onto rank 0
        ctx.write(&to_rank2, &[ctx.my_rank() as u8; 48], 0).unwrap();

        ctx.epoch_end(0).unwrap();
        fabric.barrier();
        store.epoch_records(0).len()
    });

    assert_eq!(results, vec![4, 0, 0, 0], "all deliveries fold onto rank 0");
}

#[test]
fn test_force_rpc_loopback() {
    let config = ShuffleConfig::default().with_force_rpc(true);
    let results = run_cluster(1, 1, &config, |ctx, store, fabric| {
        ctx.epoch_pre_start().unwrap();
        ctx.epoch_start(0).unwrap();

        ctx.write(&[9u8; 8], &[0x11u8; 48], 0).unwrap();

        ctx.epoch_end(0).unwrap();
        fabric.barrier();
        (
            store.native_count(0),
            store.foreign_count(0),
            ctx.counters().remote_sends,
        )
    });

    let (native, foreign, remote_sends) = results[0];
    assert_eq!(native, 0, "native_write not called");
    assert_eq!(foreign, 1, "exotic_write called once");
    assert_eq!(remote_sends, 1, "one enqueue with dst=0");
}

#[test]
fn test_epoch_boundary() {
    const RANKS: usize = 3;
    const WRITES: u64 = 100;

    let config = ShuffleConfig::default();
    let results = run_cluster(RANKS, 1, &config, |ctx, store, fabric| {
        let rank = ctx.my_rank() as u64;
        let mut counts = Vec::new();

        for epoch in 0..2u32 {
            ctx.epoch_pre_start().unwrap();
            ctx.epoch_start(epoch).unwrap();
            fabric.barrier();

            for i in 0..WRITES {
                // distinct ids per (rank, epoch, i): whole world coverage
                let id = (rank * 1_000_000 + epoch as u64 * 10_000 + i).to_le_bytes();
                ctx.write(&id, &[epoch as u8; 48], epoch).unwrap();
            }

            ctx.epoch_end(epoch).unwrap();
            fabric.barrier();

            // everything written this epoch has settled before the
            // next one opens; nothing can leak across the boundary
            counts.push(store.epoch_records(epoch).len());
        }
        (counts, store.epoch_records(0).len())
    });

    let mut per_epoch = [0usize; 2];
    for (counts, _) in &results {
        per_epoch[0] += counts[0];
        per_epoch[1] += counts[1];
    }
    assert_eq!(per_epoch[0] as u64, RANKS as u64 * WRITES);
    assert_eq!(per_epoch[1] as u64, RANKS as u64 * WRITES);

    // epoch-0 totals did not change while epoch 1 ran
    for (counts, epoch0_after) in &results {
        assert_eq!(counts[0], *epoch0_after);
    }
}

#[test]
fn test_multihop_all_to_all() {
    const RANKS: usize = 6;
    const WRITES: u64 = 50;

    let config = ShuffleConfig::default()
        .with_transport(TransportKind::Xn)
        .with_ranks_per_node(2);

    let results = run_cluster(RANKS, 2, &config, |ctx, store, fabric| {
        let rank = ctx.my_rank() as u64;
        ctx.epoch_pre_start().unwrap();
        ctx.epoch_start(0).unwrap();
        fabric.barrier();

        for i in 0..WRITES {
            let id = (rank * WRITES + i).to_le_bytes();
            ctx.write(&id, &[rank as u8; 48], 0).unwrap();
        }

        ctx.epoch_end(0).unwrap();
        fabric.barrier();
        store.epoch_records(0).len()
    });

    let total: usize = results.iter().sum();
    assert_eq!(total as u64, RANKS as u64 * WRITES, "multi-hop conserves records");
}

#[test]
fn test_back_pressure_blocks_then_drains() {
    const CAPACITY: usize = 4;

    // one record per frame so inbox slots map 1:1 to writes
    let config = ShuffleConfig::default()
        .with_batch_records(1)
        .with_queue_capacity(CAPACITY);

    let mesh = ChannelMesh::cluster(2, CAPACITY);
    let fabrics = LocalFabric::cluster(2, 1);
    let to_rank1 = id_routing_to(&config, 2, 1);

    let writes_done = Arc::new(AtomicBool::new(false));
    let unblock = Arc::new(AtomicBool::new(false));

    let mut mesh_iter = mesh.into_iter();
    let mut fabric_iter = fabrics.into_iter();
    let (wire0, inbox0) = mesh_iter.next().unwrap();
    let (wire1, inbox1) = mesh_iter.next().unwrap();
    let fabric0 = Arc::new(fabric_iter.next().unwrap());
    let fabric1 = Arc::new(fabric_iter.next().unwrap());

    let writer = {
        let config = config.clone();
        let writes_done = writes_done.clone();
        thread::spawn(move || {
            let store = Arc::new(MemStore::new());
            let mut ctx = ShuffleCtx::init(
                &config,
                fabric0.clone(),
                Arc::new(wire0),
                Box::new(inbox0),
                store,
            )
            .unwrap();
            ctx.epoch_pre_start().unwrap();
            ctx.epoch_start(0).unwrap();
            fabric0.barrier(); // receiver is paused past this point

            // capacity + 1 writes at one destination: the last one must
            // ride out the full inbox without dropping anything
            for _ in 0..CAPACITY + 1 {
                ctx.write(&to_rank1, &[0x42u8; 48], 0).unwrap();
            }
            writes_done.store(true, Ordering::SeqCst);

            ctx.epoch_end(0).unwrap();
            fabric0.barrier();
            ctx.finalize().unwrap();
        })
    };

    let receiver = {
        let config = config.clone();
        let unblock = unblock.clone();
        thread::spawn(move || {
            let store = Arc::new(MemStore::new());
            let mut ctx = ShuffleCtx::init(
                &config,
                fabric1.clone(),
                Arc::new(wire1),
                Box::new(inbox1),
                store.clone(),
            )
            .unwrap();
            ctx.epoch_pre_start().unwrap();
            ctx.epoch_start(0).unwrap();
            ctx.pause();
            // let the delivery loop finish its in-progress poll and
            // actually park before the writer starts flooding
            thread::sleep(Duration::from_millis(100));
            fabric1.barrier();

            while !unblock.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
            ctx.resume();

            ctx.epoch_end(0).unwrap();
            fabric1.barrier();
            let delivered = store.epoch_records(0).len();
            ctx.finalize().unwrap();
            delivered
        })
    };

    // While the receiver sleeps, the writer must be wedged on the
    // (capacity + 1)-th write.
    thread::sleep(Duration::from_millis(300));
    assert!(
        !writes_done.load(Ordering::SeqCst),
        "write past capacity should block until the receiver drains"
    );

    unblock.store(true, Ordering::SeqCst);
    writer.join().unwrap();
    let delivered = receiver.join().unwrap();
    assert_eq!(delivered, CAPACITY + 1, "no record was dropped");
}

#[test]
fn test_envelope_size_limits_at_init() {
    // 8 + 1 + 246 + 0 = 255: accepted
    let ok = ShuffleConfig::default().with_shape(8, 246, 0);
    assert!(ok.shape().is_ok());
    let results = run_cluster(1, 1, &ok, |ctx, _store, _fabric| ctx.world_size());
    assert_eq!(results[0], 1);

    // 8 + 1 + 247 + 0 = 256: rejected at init
    let too_big = ShuffleConfig::default().with_shape(8, 247, 0);
    assert!(too_big.shape().is_err());

    let mut nodes = ChannelMesh::cluster(1, 8);
    let (wire, inbox) = nodes.remove(0);
    let fabric = Arc::new(LocalFabric::cluster(1, 1).remove(0));
    let store = Arc::new(MemStore::new());
    assert!(ShuffleCtx::init(&too_big, fabric, Arc::new(wire), Box::new(inbox), store).is_err());
}

#[test]
fn test_bypass_placement_routes_everything() {
    use pshuffle::{bypass_target, ShuffleMode};

    const RANKS: usize = 4;
    const WRITES: u64 = 200;

    let config = ShuffleConfig::default().with_mode(ShuffleMode::BYPASS_PLACEMENT);
    let results = run_cluster(RANKS, 1, &config, |ctx, store, fabric| {
        let rank = ctx.my_rank() as u64;
        ctx.epoch_pre_start().unwrap();
        ctx.epoch_start(0).unwrap();
        fabric.barrier();

        for i in 0..WRITES {
            let id = (rank * WRITES + i).to_le_bytes();
            ctx.write(&id, &[0u8; 48], 0).unwrap();
        }

        ctx.epoch_end(0).unwrap();
        fabric.barrier();
        store.epoch_records(0)
    });

    let total: usize = results.iter().map(Vec::len).sum();
    assert_eq!(total as u64, RANKS as u64 * WRITES);

    // every record landed on the rank the bypass hash names
    for (rank, records) in results.iter().enumerate() {
        for record in records {
            assert_eq!(bypass_target(&record.id, RANKS as u32), rank as u32);
        }
    }
}
