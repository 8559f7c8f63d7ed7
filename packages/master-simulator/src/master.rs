//! The bench master: discovery, handshake, scripted command drive, status
//! watch. One run is one session against one node.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fanbus_types::{
    command_frame, control_frame, discover_frame, handshake_frame, ping_frame, Command, FanMask,
    HandshakeReply, Identification, NetParams, ProcessorConfig, StatusReport,
};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout};
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    pub link: LinkConfig,
    pub fan_config: ProcessorConfig,
    pub scenario: ScenarioConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    pub passcode: String,
    pub reply_port: u16,
    pub miso_port: u16,
    pub mosi_port: u16,
    pub period_ms: u64,
    pub max_master_timeouts: u32,
    pub ping_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioConfig {
    pub sweep_duties: Vec<f64>,
    pub chase_rpms: Vec<u32>,
    pub step_seconds: u64,
}

impl ScenarioConfig {
    /// Scripted command sequence: duty sweep, chase targets, then one
    /// multi-write spreading the bank.
    fn commands(&self, fans: usize) -> Vec<Command> {
        let mask = FanMask::all(fans);
        let mut cmds: Vec<Command> = self
            .sweep_duties
            .iter()
            .map(|&duty| Command::Write { duty, mask })
            .collect();
        cmds.extend(self.chase_rpms.iter().map(|&target_rpm| Command::Chase {
            target_rpm,
            mask,
        }));
        cmds.push(Command::MultiWrite {
            duties: (1..=fans).map(|i| i as f64 / fans as f64).collect(),
        });
        cmds
    }
}

pub async fn run(cfg: MasterConfig, node_addr: SocketAddr, json: bool) -> Result<()> {
    let reply_sock = UdpSocket::bind(("0.0.0.0", cfg.link.reply_port))
        .await
        .context("bind reply port")?;
    let miso_sock = UdpSocket::bind(("0.0.0.0", cfg.link.miso_port))
        .await
        .context("bind MISO port")?;
    let cmd_sock = UdpSocket::bind(("0.0.0.0", cfg.link.mosi_port))
        .await
        .context("bind MOSI port")?;

    // ── Discovery ────────────────────────────────────────────────────────
    info!("🔍 discovering node at {node_addr}");
    reply_sock
        .send_to(
            discover_frame(&cfg.link.passcode, cfg.link.reply_port).as_bytes(),
            node_addr,
        )
        .await?;
    let mut buf = vec![0u8; 2048];
    let (len, src) = timeout(Duration::from_secs(5), reply_sock.recv_from(&mut buf))
        .await
        .context("no identification reply")??;
    let raw = String::from_utf8_lossy(&buf[..len]).into_owned();
    let (passcode, ident) = Identification::parse_frame(&raw)
        .with_context(|| format!("bad identification reply: {raw}"))?;
    if passcode != cfg.link.passcode {
        bail!("identification reply carries wrong passcode");
    }
    info!(
        "found device {} ({}, fw {}) miso {} mosi {}",
        ident.device_id, ident.mac, ident.version, ident.miso_port, ident.mosi_port
    );
    let node_mosi = SocketAddr::new(src.ip(), ident.mosi_port);

    // ── Handshake ────────────────────────────────────────────────────────
    let net = NetParams {
        miso_port: cfg.link.miso_port,
        mosi_port: cfg.link.mosi_port,
        period_ms: cfg.link.period_ms,
        max_master_timeouts: cfg.link.max_master_timeouts,
    };
    cmd_sock
        .send_to(
            handshake_frame(&net, &cfg.fan_config.to_payload()).as_bytes(),
            node_mosi,
        )
        .await?;
    let (len, _) = timeout(Duration::from_secs(5), cmd_sock.recv_from(&mut buf))
        .await
        .context("no handshake reply")??;
    let raw = String::from_utf8_lossy(&buf[..len]).into_owned();
    match HandshakeReply::parse(&raw).with_context(|| format!("bad handshake reply: {raw}"))? {
        HandshakeReply::Ack => info!("🤝 session established"),
        HandshakeReply::Error(msg) => bail!("handshake rejected by node: {msg}"),
    }

    // ── Drive the scenario, watch the uplink ─────────────────────────────
    let mut commands = cfg.scenario.commands(cfg.fan_config.active_fans).into_iter();
    let mut step = interval(Duration::from_secs(cfg.scenario.step_seconds.max(1)));
    let mut ping = interval(Duration::from_millis(cfg.link.ping_interval_ms.max(100)));
    let mut index: u64 = 0;

    loop {
        tokio::select! {
            _ = step.tick() => {
                match commands.next() {
                    Some(cmd) => {
                        index += 1;
                        if let Some(frame) = command_frame(index, &cmd) {
                            info!("→ {frame}");
                            if let Err(e) = cmd_sock.send_to(frame.as_bytes(), node_mosi).await {
                                warn!("command send failed: {e}");
                            }
                        }
                    }
                    None => {
                        index += 1;
                        let frame = control_frame(index, 'X');
                        info!("scenario complete, disconnecting (→ {frame})");
                        let _ = cmd_sock.send_to(frame.as_bytes(), node_mosi).await;
                        return Ok(());
                    }
                }
            }
            _ = ping.tick() => {
                // keep the node's master-silence counter at bay
                let _ = reply_sock
                    .send_to(ping_frame(&cfg.link.passcode).as_bytes(), node_addr)
                    .await;
            }
            recv = miso_sock.recv_from(&mut buf) => match recv {
                Ok((len, _)) => {
                    let raw = String::from_utf8_lossy(&buf[..len]);
                    print_status(raw.as_ref(), json);
                }
                Err(e) => warn!("status recv error: {e}"),
            }
        }
    }
}

fn print_status(raw: &str, json: bool) {
    match StatusReport::parse_frame(raw) {
        Ok((index, Some(report))) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "index": index,
                        "rpm": report.rpm,
                        "duty": report.duty,
                    })
                );
            } else {
                info!("← #{index} rpm {:?} duty {:?}", report.rpm, report.duty);
            }
        }
        Ok((index, None)) => info!("← #{index} maintain"),
        Err(e) => warn!("unparseable status frame `{raw}`: {e}"),
    }
}
