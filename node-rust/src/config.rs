//! Node-local configuration: identity and link settings from `node.toml`
//! (compiled-in default) with CLI overrides. Session parameters arrive
//! over the handshake instead and are never read from here.

use anyhow::Context;
use clap::Parser;
use fanbus_types::Identification;
use serde::Deserialize;

use crate::fan::SimFanConfig;
use crate::mailbox::MailboxPolicy;

#[derive(Parser, Debug)]
#[command(name = "fanarray-node", about = "Fan array slave node")]
pub struct Args {
    /// Config file path
    #[arg(short, long, default_value = "node.toml")]
    pub config: String,
    #[arg(long)]
    pub listener_port: Option<u16>,
    #[arg(long)]
    pub miso_port: Option<u16>,
    #[arg(long)]
    pub mosi_port: Option<u16>,
    #[arg(long)]
    pub passcode: Option<String>,
    #[arg(long)]
    pub device_id: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub control: ControlConfig,
    pub sim: SimFanConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: u32,
    pub mac: String,
    pub firmware_version: String,
    pub fan_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub passcode: String,
    pub listener_port: u16,
    pub miso_port: u16,
    pub mosi_port: u16,
    pub network_timeout_max: u32,
    pub recv_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    pub tick_ms: u64,
    pub read_timeout_ms: u64,
    pub command_mailbox: MailboxPolicy,
    pub status_mailbox: MailboxPolicy,
}

impl NodeConfig {
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(&args.config)
            .unwrap_or_else(|_| include_str!("../node.toml").to_string());
        let mut cfg: NodeConfig = toml::from_str(&raw).context("invalid node config")?;
        if let Some(p) = args.listener_port {
            cfg.network.listener_port = p;
        }
        if let Some(p) = args.miso_port {
            cfg.network.miso_port = p;
        }
        if let Some(p) = args.mosi_port {
            cfg.network.mosi_port = p;
        }
        if let Some(pc) = &args.passcode {
            cfg.network.passcode = pc.clone();
        }
        if let Some(id) = args.device_id {
            cfg.device.id = id;
        }
        Ok(cfg)
    }

    /// Identity sent in discovery replies.
    pub fn identity(&self) -> Identification {
        Identification {
            mac: self.device.mac.clone(),
            device_id: self.device.id,
            miso_port: self.network.miso_port,
            mosi_port: self.network.mosi_port,
            version: self.device.firmware_version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_default_config_parses() {
        let cfg: NodeConfig = toml::from_str(include_str!("../node.toml")).unwrap();
        assert_eq!(cfg.device.fan_count, 4);
        assert_eq!(cfg.control.command_mailbox, MailboxPolicy::RejectIfFull);
        assert_eq!(cfg.control.status_mailbox, MailboxPolicy::OverwriteLatest);
        let ident = cfg.identity();
        assert_eq!(ident.miso_port, cfg.network.miso_port);
    }
}
