//! lockstep server binary

use clap::Parser;
use lockstep::common::parse_members;
use lockstep::{Config, Node};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lockstep-server")]
#[command(about = "lockstep coordination service node", version = lockstep::VERSION)]
struct Cli {
    /// Config file (JSON); flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cluster members (comma-separated host:port)
    #[arg(long)]
    members: Option<String>,

    /// 1-based index of this node in the member list
    #[arg(long)]
    server_id: Option<usize>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Binlog directory
    #[arg(long)]
    binlog_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(members) = &cli.members {
        config.members = parse_members(members);
    }
    if let Some(server_id) = cli.server_id {
        config.server_id = server_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(binlog_dir) = cli.binlog_dir {
        config.binlog_dir = binlog_dir;
    }
    config.validate()?;

    let node = Node::open(config)?;
    lockstep::server::serve(node).await?;
    Ok(())
}
