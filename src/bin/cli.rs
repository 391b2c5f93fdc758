use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng as _;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use rs_swarm::discovery::{PeerDiscovery, StaticDiscovery};
use rs_swarm::download::driver;
use rs_swarm::loopback::{Behaviour, LoopbackSwarm};
use rs_swarm::{
    Download, EngineConfig, MemoryStorage, Metainfo, Notification, PeerSource, TorrentMetadata,
};

/// Download a randomly generated torrent from a simulated swarm
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of pieces in the torrent.
    #[arg(long, default_value_t = 64)]
    pieces: u32,

    /// Piece length in bytes.
    #[arg(long, default_value_t = 262144)]
    piece_length: u32,

    /// Honest seeders.
    #[arg(long, default_value_t = 4)]
    seeders: u16,

    /// Peers that serve corrupted data.
    #[arg(long, default_value_t = 1)]
    corrupt: u16,

    /// Peers that refuse connections.
    #[arg(long, default_value_t = 2)]
    refusing: u16,

    /// Peers that never answer a connect.
    #[arg(long, default_value_t = 1)]
    blackhole: u16,

    /// Peers that hang up right after connecting.
    #[arg(long, default_value_t = 1)]
    hangup: u16,

    /// Peers that close cleanly right after connecting.
    #[arg(long, default_value_t = 1)]
    leaving: u16,

    #[arg(long, default_value_t = 50)]
    max_connections: usize,

    #[arg(long, default_value_t = 5)]
    pipeline_depth: usize,

    /// Minimum milliseconds between two scheduling passes.
    #[arg(long, default_value_t = 250)]
    tick_ms: u64,

    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,

    /// Upper bound of the simulated per-message latency.
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 120)]
    deadline_secs: u64,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

fn build_swarm(args: &Args, content: Vec<u8>) -> LoopbackSwarm {
    let mut swarm = LoopbackSwarm::new(content, args.piece_length)
        .with_latency(Duration::ZERO, Duration::from_millis(args.latency_ms));
    let groups = [
        (Behaviour::Seeder, args.seeders),
        (Behaviour::Corrupt, args.corrupt),
        (Behaviour::Refuse, args.refusing),
        (Behaviour::Blackhole, args.blackhole),
        (Behaviour::HangUp, args.hangup),
        (Behaviour::Leave, args.leaving),
    ];

    let mut port = 6881u16;
    for (behaviour, count) in groups {
        for _ in 0..count {
            swarm = swarm.with_peer(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), behaviour);
            port = port.wrapping_add(1);
        }
    }
    swarm
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut content = vec![0u8; args.pieces as usize * args.piece_length as usize];
    rand::rng().fill(&mut content[..]);
    let meta = Metainfo::from_content("loopback", args.piece_length, &content);
    let total = meta.piece_count();

    let config = EngineConfig::default()
        .with_max_connections(args.max_connections)
        .with_pipeline_depth(args.pipeline_depth)
        .with_tick_interval(Duration::from_millis(args.tick_ms))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout_secs));
    let storage = MemoryStorage::new(&meta);
    let download = Download::new(config, meta, storage)?;

    let swarm = build_swarm(&args, content.clone());
    let addresses: Vec<SocketAddr> = swarm.peers().map(|(key, _)| *key).collect();
    println!("Downloading {total} pieces from {} simulated peers", addresses.len());

    let discovery: Vec<Box<dyn PeerDiscovery>> =
        vec![Box::new(StaticDiscovery::new(addresses, PeerSource::Tracker))];
    let (handle, task) = driver::spawn(download, Arc::new(swarm), discovery);
    let mut notifications = handle.subscribe();

    let progress = async {
        let mut verified = 0u32;
        let mut failed = 0u32;
        loop {
            match notifications.recv().await {
                Ok(Notification::PieceVerified(index)) => {
                    verified += 1;
                    println!("[{verified}/{total}] piece {index} verified");
                }
                Ok(Notification::PieceFailed(index)) => {
                    failed += 1;
                    println!("piece {index} failed its hash check, retrying");
                }
                Ok(Notification::Completed) => return (verified, failed),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return (verified, failed),
            }
        }
    };

    let outcome = tokio::time::timeout(Duration::from_secs(args.deadline_secs), progress).await;
    handle.shutdown()?;
    let download = task.await?;

    match outcome {
        Ok((verified, failed)) => {
            println!("Finished: {verified} pieces verified, {failed} hash failures")
        }
        Err(_) => println!("Gave up after {}s", args.deadline_secs),
    }

    let stats = download.swarm_stats();
    println!(
        "Peers: {} known, {} connected, {} failed, {} idle",
        stats.total, stats.connected, stats.failed, stats.idle
    );
    if download.is_complete() && download.storage().contents() == content {
        println!("Content matches");
    } else {
        println!("Download incomplete: {}/{total} pieces", download.bitfield().completed_count());
    }
    Ok(())
}
