use std::path::PathBuf;

use clap::Parser;
use log::{error, info, warn};

use ghostmesh::api::{start_server, AppState};
use ghostmesh::{peer, Node, NodeConfig, Result, PROTOCOL_VERSION};

/// GhostMesh node - proof-of-work ledger, content assets, messaging and contracts
#[derive(Parser)]
#[command(name = "ghostmesh")]
#[command(about = "A decentralized application platform node")]
#[command(version = PROTOCOL_VERSION)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// HTTP port for the peer and operator APIs
    #[arg(short, long, default_value = "5000")]
    port: u16,

    /// UDP port for presence beacons
    #[arg(long, default_value = "5001")]
    udp_port: u16,

    /// Store directory; defaults to a per-node directory derived from the port
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Backbone peer to sync with, e.g. http://10.0.0.5:5000 (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Seed new accounts with 50 coins instead of 0 (development only)
    #[arg(long)]
    dev_seed: bool,

    /// Refund the contract-call fee when a method raises
    #[arg(long)]
    refund_failed_calls: bool,

    /// Disable the periodic sync and UDP discovery tasks
    #[arg(long)]
    offline: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.log_level.clone()),
    )
    .init();

    if let Err(e) = run(cli).await {
        error!("Node failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let bind_addr = format!("0.0.0.0:{}", cli.port);
    let config = NodeConfig {
        http_port: cli.port,
        udp_port: cli.udp_port,
        data_dir: cli
            .data_dir
            .unwrap_or_else(|| NodeConfig::default_data_dir(&bind_addr)),
        bootstrap_peers: cli.peers,
        initial_balance: if cli.dev_seed { 50.0 } else { 0.0 },
        charge_call_fee_on_failure: !cli.refund_failed_calls,
        ..NodeConfig::default()
    };

    info!(
        "Starting GhostMesh node v{} on port {} (store {:?})",
        PROTOCOL_VERSION, config.http_port, config.data_dir
    );

    let (node, gossip_rx) = Node::open(config.clone())?;

    if cli.offline {
        warn!("Offline mode: sync and discovery disabled");
    } else {
        tokio::spawn(node.sync.clone().run_gossip(gossip_rx));
        tokio::spawn(
            node.sync
                .clone()
                .run(config.sync_interval_secs, config.sync_initial_delay_secs),
        );

        let local_ip = peer::local_ip().unwrap_or_else(|| "127.0.0.1".to_string());
        tokio::spawn(peer::run_presence_emitter(
            config.udp_port,
            config.beacon_interval_secs,
            local_ip,
        ));
        tokio::spawn(peer::run_presence_listener(
            node.peers.clone(),
            config.udp_port,
        ));
    }

    start_server(AppState { node }, config.http_port).await
}
