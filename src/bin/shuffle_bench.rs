//! In-process shuffle bench: N ranks on threads, an epoch loop of
//! writes each, counters printed at the end.

use std::sync::Arc;
use std::thread;

use clap::Parser;

use pshuffle::{
    prepare_uri, ChannelMesh, Fabric, LocalFabric, MemStore, PlacementProtocol, ShuffleConfig,
    ShuffleCtx, TransportKind,
};

#[derive(Parser, Debug)]
#[command(about = "In-process particle shuffle benchmark")]
struct Args {
    /// Number of ranks
    #[arg(short = 'n', long, default_value_t = 4)]
    ranks: usize,

    /// Ranks per simulated node
    #[arg(long, default_value_t = 2)]
    ranks_per_node: u32,

    /// Epochs to run
    #[arg(short, long, default_value_t = 3)]
    epochs: u32,

    /// Records written per rank per epoch
    #[arg(short, long, default_value_t = 10_000)]
    writes: u64,

    /// Use the multi-hop transport
    #[arg(long)]
    multihop: bool,

    /// Receiver radix (2^r senders per receiver)
    #[arg(long, default_value_t = 0)]
    recv_radix: u32,

    /// Placement protocol
    #[arg(long, default_value = "ring")]
    placement: String,

    /// Force the loopback RPC path
    #[arg(long)]
    force_rpc: bool,

    /// Print the URI each rank would register (exercises the port probe)
    #[arg(long)]
    show_uris: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let placement = PlacementProtocol::parse(&args.placement).unwrap_or_else(|e| {
        eprintln!("{}", e);
        std::process::exit(2);
    });

    let config = ShuffleConfig::new()
        .with_placement(placement)
        .with_recv_radix(args.recv_radix)
        .with_force_rpc(args.force_rpc)
        .with_ranks_per_node(args.ranks_per_node)
        .with_transport(if args.multihop {
            TransportKind::Xn
        } else {
            TransportKind::Nn
        });

    let mesh = ChannelMesh::cluster(args.ranks, config.queue_capacity);
    let fabrics = LocalFabric::cluster(args.ranks, args.ranks_per_node);

    let start = std::time::Instant::now();
    let mut handles = Vec::new();
    for ((wire, inbox), fabric) in mesh.into_iter().zip(fabrics) {
        let config = config.clone();
        let args_epochs = args.epochs;
        let args_writes = args.writes;
        let show_uris = args.show_uris;
        handles.push(thread::spawn(move || {
            let fabric = Arc::new(fabric);
            let rank = fabric.my_rank() as u64;

            if show_uris {
                match prepare_uri(&config, rank as u32, fabric.node_rank(), fabric.node_size()) {
                    Ok(uri) => println!("rank {}: {}", rank, uri),
                    Err(e) => eprintln!("rank {}: uri bootstrap failed: {}", rank, e),
                }
            }

            let store = Arc::new(MemStore::new());
            let mut ctx = ShuffleCtx::init(
                &config,
                fabric.clone(),
                Arc::new(wire),
                Box::new(inbox),
                store.clone(),
            )
            .expect("shuffle init");

            for epoch in 0..args_epochs {
                ctx.epoch_pre_start().expect("pre_start");
                ctx.epoch_start(epoch).expect("start");
                fabric.barrier();

                let mut data = [0u8; 48];
                for i in 0..args_writes {
                    let id = (rank * args_writes + i).to_le_bytes();
                    data[..8].copy_from_slice(&i.to_le_bytes());
                    ctx.write(&id, &data, epoch).expect("write");
                }

                ctx.epoch_end(epoch).expect("end");
                fabric.barrier();
            }

            let counters = ctx.counters();
            let stat = ctx.transport_stat();
            ctx.finalize().expect("finalize");
            (rank, store.len(), counters, stat)
        }));
    }

    let mut total_stored = 0usize;
    for handle in handles {
        let (rank, stored, counters, stat) = handle.join().expect("rank thread");
        total_stored += stored;
        println!(
            "rank {}: stored {} (last epoch: {} local + {} rpc writes; \
             lifetime frames: {} intra + {} inter)",
            rank,
            stored,
            counters.local_sends,
            counters.remote_sends,
            stat.local_sends,
            stat.remote_sends
        );
    }

    let expected = args.ranks as u64 * args.epochs as u64 * args.writes;
    println!(
        "total stored: {} (expected {}) in {:.3}s",
        total_stored,
        expected,
        start.elapsed().as_secs_f64()
    );
    assert_eq!(total_stored as u64, expected, "records were lost");
}
