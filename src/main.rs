use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tapestry::{MeshConfig, Node, NodeConfig, NodeId};

#[derive(Parser, Debug)]
#[command(name = "tapestry")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    /// Address other members should dial, when it differs from --bind.
    #[arg(short, long)]
    advertise: Option<SocketAddr>,

    /// Existing member to join through.
    #[arg(short, long, value_name = "ADDR")]
    connect: Option<String>,

    /// Hex identifier for this node; derived from its key when omitted.
    #[arg(long)]
    id: Option<NodeId>,

    #[arg(short, long, default_value = "30")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NodeConfig {
        id: args.id,
        advertise: args.advertise,
        mesh: MeshConfig::default(),
    };
    let node = Node::bind_with_config(&args.bind.to_string(), config).await?;
    info!("Node identity: {}", node.identity());

    if let Some(seed) = &args.connect {
        info!("Joining through {}", seed);
        match node.join(seed).await {
            Ok(()) => info!("Join complete"),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Join failed");
                node.kill().await;
                return Err(e);
            }
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, leaving the mesh");
                break;
            }
            _ = interval.tick() => {
                let snapshot = node.snapshot().await;
                info!(
                    routing_entries = snapshot.routing_entries,
                    backpointers = snapshot.backpointers,
                    location_keys = snapshot.location_keys,
                    stored_blobs = snapshot.stored_blobs,
                    "status snapshot"
                );
            }
        }
    }

    if let Err(e) = node.leave().await {
        warn!(error = %e, "graceful leave failed");
    }
    Ok(())
}
