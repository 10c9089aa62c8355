use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use canopy::config::NodeConfig;
use canopy::node::Node;
use canopy::shell::ProcessSpawner;
use canopy::shutdown::install_shutdown_handler;
use canopy::topology::Topology;

#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(about = "A distributed hierarchical job-execution overlay")]
struct Args {
    /// Rank of this node within the overlay (0 is the root)
    #[arg(long, default_value = "0")]
    rank: u32,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50200")]
    port: u16,

    /// Parent address ("host:port"); required for every rank except 0
    #[arg(long)]
    parent: Option<String>,

    /// Path to a JSON topology file, e.g. {"rank":0,"children":[{"rank":1}]}
    #[arg(long)]
    topology: Option<PathBuf>,

    /// Path to the job shell executable
    #[arg(long, default_value = "canopy-shell")]
    shell: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let topology = match &args.topology {
        Some(path) => Topology::from_json(&std::fs::read_to_string(path)?)?,
        None => Topology::single(args.rank),
    };

    let mut config = NodeConfig::new(args.rank, listen_addr).with_topology(topology);
    config.parent_addr = args.parent;
    config.shell_path = args.shell;

    tracing::info!(
        rank = config.rank,
        listen_addr = %config.listen_addr,
        parent = ?config.parent_addr,
        "starting canopy node"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::start(config, Arc::new(ProcessSpawner), shutdown)?;
    node.serve().await?;

    Ok(())
}
