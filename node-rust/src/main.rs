use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::info;

use fanarray_node::config::{Args, NodeConfig};
use fanarray_node::downlink::run_downlink;
use fanarray_node::fan::SimFan;
use fanarray_node::link_listener::{run_link_listener, ListenerSettings};
use fanarray_node::platform::{HostPlatform, LogIndicator, Platform};
use fanarray_node::processor::CommandProcessor;
use fanarray_node::session::{ConnectionState, Session};
use fanarray_node::uplink::run_uplink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanarray_node=info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = NodeConfig::load(&args)?;

    info!(
        "🌀 Fan array node {} starting ({} fans, fw {})",
        cfg.device.id, cfg.device.fan_count, cfg.device.firmware_version
    );

    // No hardware layer on hosted builds: the bank is simulated
    let drivers = SimFan::bank(cfg.sim.clone(), cfg.device.fan_count);
    let processor = Arc::new(CommandProcessor::new(
        drivers,
        cfg.control.command_mailbox,
        cfg.control.status_mailbox,
        Duration::from_millis(cfg.control.tick_ms),
        Duration::from_millis(cfg.control.read_timeout_ms),
    ));

    let (reboot_tx, mut reboot_rx) = mpsc::channel(1);
    let platform: Arc<dyn Platform> = Arc::new(HostPlatform);
    let session = Arc::new(Session::new(
        processor.clone(),
        Box::new(LogIndicator),
        reboot_tx,
    ));

    let listener_sock = UdpSocket::bind(("0.0.0.0", cfg.network.listener_port))
        .await
        .context("bind listener port")?;
    let mosi_sock = UdpSocket::bind(("0.0.0.0", cfg.network.mosi_port))
        .await
        .context("bind MOSI port")?;
    let miso_sock = UdpSocket::bind(("0.0.0.0", cfg.network.miso_port))
        .await
        .context("bind MISO port")?;

    let recv_wait = Duration::from_millis(cfg.network.recv_wait_ms);
    tokio::spawn(run_link_listener(
        session.clone(),
        platform.clone(),
        listener_sock,
        ListenerSettings {
            passcode: cfg.network.passcode.clone(),
            identity: cfg.identity(),
            network_timeout_max: cfg.network.network_timeout_max,
            recv_wait,
        },
    ));
    tokio::spawn(run_downlink(
        session.clone(),
        processor.clone(),
        mosi_sock,
        recv_wait,
    ));
    tokio::spawn(run_uplink(session.clone(), processor.clone(), miso_sock));
    tokio::spawn(processor.clone().run());

    session.set_status(ConnectionState::NoMaster).await;
    info!(
        "🚀 listening: ctl {} / mosi {} / miso {}",
        cfg.network.listener_port, cfg.network.mosi_port, cfg.network.miso_port
    );

    // Reboot supervisor: the only way a node ever stops
    if let Some(reason) = reboot_rx.recv().await {
        platform.reboot(&reason);
    }
    Ok(())
}
