//! main.rs — bench master entry point.
//!
//! Discovers one slave node, pushes the configured handshake, then walks a
//! scripted scenario (duty sweep, chase targets, multi-write) while
//! printing every status uplink. Runs against real hardware or against
//! `fanarray-node` in sim mode on the same machine.

mod master;

use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use master::MasterConfig;

#[derive(Parser, Debug)]
#[command(name = "master-sim", about = "Fan Array Suite bench master")]
struct Args {
    /// Node listener address
    #[arg(long, default_value = "127.0.0.1:47800")]
    node: String,
    /// Config file path
    #[arg(short, long, default_value = "master.toml")]
    config: String,
    /// Emit status reports as JSON lines on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "master_sim=info".into()),
        )
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../master.toml").to_string());
    let cfg: MasterConfig = toml::from_str(&raw).context("invalid master config")?;
    let node_addr: SocketAddr = args.node.parse().context("invalid node address")?;

    info!("🎛 bench master starting against {node_addr}");
    master::run(cfg, node_addr, args.json).await
}
