// nelson — peer-discovery and neighbor-management daemon for an IRI node.

mod server;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nelson_core::heart::{Heart, HeartConfig};
use nelson_core::peer_list::PeerSeed;
use nelson_core::store::SledStorage;
use nelson_core::{IriClient, NelsonConfig, Node, PeerList, SelfIdentity};

#[derive(Parser)]
#[command(name = "nelson")]
#[command(about = "Peer discovery and neighbor management for an IRI node", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Start,
    /// Query a running daemon's status HTTP endpoint
    Status {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start => cmd_start().await,
        Commands::Status { host, port } => cmd_status(host, port).await,
    }
}

async fn cmd_start() -> Result<()> {
    let config = NelsonConfig::load().context("failed to load configuration")?;

    let storage: Arc<dyn nelson_core::store::StorageBackend> = if config.temporary {
        Arc::new(SledStorage::temporary().context("failed to open temporary peer store")?)
    } else {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;
        let db_path = data_dir.join("peers.sled");
        Arc::new(SledStorage::open(&db_path.to_string_lossy()).context("failed to open peer store")?)
    };

    let peer_list = Arc::new(PeerList::new(storage, config.master_mode, config.multi_port));
    let seeds: Vec<PeerSeed> = config
        .neighbors
        .iter()
        .map(|n| PeerSeed {
            ip: n.ip.clone(),
            port: n.port,
            tcp_port: n.tcp_port,
            udp_port: n.udp_port,
            is_trusted: true,
        })
        .collect();
    peer_list.load(&seeds).context("failed to load peer list")?;

    let iri_client = IriClient::new(config.iri_rpc_url.clone(), config.request_timeout())
        .context("failed to build IRI client")?;
    iri_client.start().await.context("failed to reach ledger node")?;

    let heart = Arc::new(Heart::new(HeartConfig {
        beat_interval: config.beat_interval(),
        cycle_interval: config.cycle_interval(),
        epoch_interval: config.epoch_interval(),
    }));

    let identity = SelfIdentity {
        hostname: None,
        port: config.port,
        tcp_port: config.tcp_port,
        udp_port: config.udp_port,
        is_trusted: false,
    };
    let node = Node::new(
        peer_list.clone(),
        iri_client.clone(),
        config.gossip_size,
        config.beat_interval(),
        heart.personality(),
        identity,
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .context("failed to bind peer-to-peer listen port")?;
    let inbound_node = node.clone();
    let inbound_peer_list = peer_list.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let peer_id = match inbound_peer_list.add(remote.ip().to_string(), remote.port(), None, None, false, 1.0) {
                        Ok(id) => id,
                        Err(e) => {
                            tracing::warn!("failed to record inbound peer {remote}: {e}");
                            continue;
                        }
                    };
                    let node = inbound_node.clone();
                    tokio::spawn(async move {
                        node.accept_inbound(stream, peer_id).await;
                    });
                }
                Err(e) => tracing::warn!("inbound accept failed: {e}"),
            }
        }
    });

    let (_shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let status_ctx = Arc::new(server::StatusContext {
        peer_list: peer_list.clone(),
        node: node.clone(),
        heart: heart.clone(),
        iri_client: iri_client.clone(),
        config: config.clone(),
        start_time: Instant::now(),
    });

    let status_hostname = config.api_hostname.clone();
    let status_port = config.api_port;
    tokio::spawn(async move {
        if let Err(e) = server::start(status_hostname, status_port, status_ctx).await {
            tracing::error!("status server error: {e}");
        }
    });

    let health_node = node.clone();
    let health_client = iri_client.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IriClient::health_tick_interval());
        loop {
            ticker.tick().await;
            if health_client.health_tick().await {
                tracing::info!("ledger node health recovered, forcing reshuffle");
                health_node.on_health_flip().await;
            }
        }
    });

    tracing::info!(
        "nelson started, status API on {}:{}",
        config.api_hostname,
        config.api_port
    );

    heart.run(node, shutdown_rx).await;
    Ok(())
}

async fn cmd_status(host: String, port: Option<u16>) -> Result<()> {
    let config = NelsonConfig::load().unwrap_or_default();
    let port = port.unwrap_or(config.api_port);
    let url = format!("http://{host}:{port}/");

    let response = reqwest::get(&url)
        .await
        .context("failed to reach the status endpoint — is nelson running?")?;
    let body: serde_json::Value = response.json().await.context("malformed status response")?;

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
