use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ledger::SnapshotBlock;
use networking::message::Handshake;
use networking::{FileClient, Net, Peer, SyncConfig, SyncState};
use tokio::sync::watch;
use tracing::{info, warn};

mod simulation;

use simulation::{snapshot_at, LocalChain, SimFiles, SimPeer};

/// Run one ledger sync against simulated peers and print the final status.
#[derive(Parser, Debug)]
struct Args {
    /// YAML file with sync settings; defaults apply to missing keys.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Height the local ledger starts at.
    #[arg(short, long, default_value_t = 0)]
    local_height: u64,

    /// Heights of the simulated peers.
    #[arg(short, long, value_delimiter = ',', default_values_t = [5_000u64, 20_000, 30_000])]
    peers: Vec<u64>,

    /// Probability that a simulated peer ignores a request.
    #[arg(long, default_value_t = 0.0)]
    drop_rate: f64,

    /// Simulated one-way latency in milliseconds.
    #[arg(long, default_value_t = 5)]
    latency: u64,

    /// Give up waiting for the sync after this many seconds.
    #[arg(short, long, default_value_t = 120)]
    timeout: u64,
}

fn load_config(path: &Path) -> Result<SyncConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: SyncConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => SyncConfig::default(),
    };

    let chain = Arc::new(LocalChain::new(args.local_height));
    let net = Net::new(
        config.clone(),
        chain.clone(),
        Arc::new(SimFiles) as Arc<dyn FileClient>,
    )?;

    let applied = chain.clone();
    net.subscribe_snapshot_blocks(move |block| applied.apply(block));

    let (state_tx, mut state_rx) = watch::channel(SyncState::NotSyncing);
    net.subscribe_sync_status(move |state| {
        let _ = state_tx.send(*state);
    });

    for (i, height) in args.peers.iter().copied().enumerate() {
        let id = format!("sim-{i}");
        let writer = Arc::new(SimPeer::new(
            &id,
            height,
            Arc::downgrade(&net),
            Duration::from_millis(args.latency),
            args.drop_rate,
        ));
        let head = snapshot_at(height).hash;
        let peer = Peer::new(id.as_str(), head, height, writer)
            .with_file_address(format!("127.0.0.1:{}", 8484 + i));
        let handshake = Handshake {
            network_id: config.network_id,
            height,
            head,
            genesis: SnapshotBlock::genesis().hash,
        };
        net.handle_peer(peer, &handshake)
            .with_context(|| format!("peer {id} rejected"))?;
    }

    net.start()?;

    if net.syncing() {
        let wait = async {
            loop {
                if state_rx.borrow_and_update().is_terminal() {
                    break;
                }
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(args.timeout), wait).await.is_err() {
            warn!(timeout = args.timeout, "Sync did not finish in time");
        }
    } else {
        info!(height = chain.height(), "Already at the network head");
    }

    let status = net.status();
    info!(state = %status.sync_state, height = chain.height(), "Simulation finished");
    println!("{}", serde_json::to_string_pretty(&status)?);

    net.stop().await;
    Ok(())
}
