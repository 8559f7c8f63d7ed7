//! Frame grammar for the fan-bus UDP link.
//!
//! Three datagram families share the pipe delimiter:
//!
//! - listener traffic: `SPECIFIER|PASSCODE|...` (`N` discovery, `U`/`R`/`L`
//!   out-of-band, `P` ping) and the `B` identification reply
//! - downlink (MOSI): `INDEX|KEYWORD|PAYLOAD` (`H` handshake, `S` command,
//!   `X`/`Z`/`R`/`I` control)
//! - handshake replies: bare `H` ack or `E|message`
//!
//! Every specifier keeps its historical wire character; in-process each
//! family is a closed enum with exhaustive matching.

use thiserror::Error;

use crate::command::Command;

#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    #[error("empty datagram")]
    Empty,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid integer for {field}: `{value}`")]
    BadInt { field: &'static str, value: String },
    #[error("invalid number for {field}: `{value}`")]
    BadFloat { field: &'static str, value: String },
    #[error("{field} must be strictly positive")]
    NotPositive { field: &'static str },
    #[error("unknown message specifier: `{0}`")]
    UnknownSpec(String),
    #[error("unknown command code: `{0}`")]
    UnknownCommand(String),
    #[error("bad fan selection: `{0}`")]
    BadMask(String),
}

// ── Listener-port datagrams ───────────────────────────────────────────────────

/// Broadcast / out-of-band traffic arriving on the node's listener port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerFrame {
    /// `N|PASSCODE|REPLY_PORT` — Master discovery broadcast; the node
    /// answers to `source_ip:REPLY_PORT` with an identification frame.
    Discover { reply_port: u16 },
    /// `U|PASSCODE` — reboot into the firmware updater.
    Update,
    /// `R|PASSCODE` — controlled shutdown/reboot.
    Shutdown,
    /// `L|PASSCODE` — updater launch marker, meaningless to a running node.
    Launch,
    /// `P|PASSCODE` — Master ping, clears the master-silence counter.
    Ping,
}

impl ListenerFrame {
    /// Split a listener datagram into its passcode and frame. The caller
    /// checks the passcode against local configuration before acting.
    pub fn parse(raw: &str) -> Result<(&str, ListenerFrame), WireError> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        if raw.is_empty() {
            return Err(WireError::Empty);
        }
        let mut parts = raw.split('|');
        let specifier = parts.next().unwrap_or("");
        let passcode = parts.next().ok_or(WireError::MissingField("passcode"))?;
        let frame = match specifier {
            "N" => {
                let port = parts.next().ok_or(WireError::MissingField("reply_port"))?;
                ListenerFrame::Discover {
                    reply_port: parse_port(port, "reply_port")?,
                }
            }
            "U" => ListenerFrame::Update,
            "R" => ListenerFrame::Shutdown,
            "L" => ListenerFrame::Launch,
            "P" => ListenerFrame::Ping,
            other => return Err(WireError::UnknownSpec(other.to_string())),
        };
        Ok((passcode, frame))
    }
}

/// `N|PASSCODE|REPLY_PORT` discovery broadcast (Master side).
pub fn discover_frame(passcode: &str, reply_port: u16) -> String {
    format!("N|{passcode}|{reply_port}")
}

/// `P|PASSCODE` ping (either direction).
pub fn ping_frame(passcode: &str) -> String {
    format!("P|{passcode}")
}

// ── Identification reply ──────────────────────────────────────────────────────

/// Node identity sent in answer to a discovery broadcast:
/// `B|PASSCODE|MAC|DEVICE_ID|MISO_PORT|MOSI_PORT|VERSION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    pub mac: String,
    pub device_id: u32,
    pub miso_port: u16,
    pub mosi_port: u16,
    pub version: String,
}

impl Identification {
    pub fn to_frame(&self, passcode: &str) -> String {
        format!(
            "B|{passcode}|{mac}|{id}|{miso}|{mosi}|{version}",
            mac = self.mac,
            id = self.device_id,
            miso = self.miso_port,
            mosi = self.mosi_port,
            version = self.version,
        )
    }

    /// Master-side parse of the reply; returns `(passcode, identification)`.
    pub fn parse_frame(raw: &str) -> Result<(&str, Identification), WireError> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        let mut parts = raw.split('|');
        match parts.next() {
            Some("B") => {}
            Some(other) => return Err(WireError::UnknownSpec(other.to_string())),
            None => return Err(WireError::Empty),
        }
        let passcode = parts.next().ok_or(WireError::MissingField("passcode"))?;
        let mac = parts.next().ok_or(WireError::MissingField("mac"))?;
        let id_raw = parts.next().ok_or(WireError::MissingField("device_id"))?;
        let device_id = id_raw.parse::<u32>().map_err(|_| WireError::BadInt {
            field: "device_id",
            value: id_raw.to_string(),
        })?;
        let miso_port = parse_port(
            parts.next().ok_or(WireError::MissingField("miso_port"))?,
            "miso_port",
        )?;
        let mosi_port = parse_port(
            parts.next().ok_or(WireError::MissingField("mosi_port"))?,
            "mosi_port",
        )?;
        let version = parts.next().ok_or(WireError::MissingField("version"))?;
        Ok((
            passcode,
            Identification {
                mac: mac.to_string(),
                device_id,
                miso_port,
                mosi_port,
                version: version.to_string(),
            },
        ))
    }
}

// ── Downlink (MOSI) frames ────────────────────────────────────────────────────

/// Network parameters carried by the handshake: the Master's receive ports
/// and the uplink cadence. Every field must be strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetParams {
    pub miso_port: u16,
    pub mosi_port: u16,
    pub period_ms: u64,
    pub max_master_timeouts: u32,
}

impl NetParams {
    fn parse(raw: &str) -> Result<Self, WireError> {
        let mut parts = raw.split(',');
        let miso_port = parse_port(
            parts.next().ok_or(WireError::MissingField("miso_port"))?,
            "miso_port",
        )?;
        let mosi_port = parse_port(
            parts.next().ok_or(WireError::MissingField("mosi_port"))?,
            "mosi_port",
        )?;
        let period_ms = parse_positive(
            parts.next().ok_or(WireError::MissingField("period_ms"))?,
            "period_ms",
        )?;
        let max_master_timeouts = parse_positive(
            parts
                .next()
                .ok_or(WireError::MissingField("max_master_timeouts"))?,
            "max_master_timeouts",
        )? as u32;
        Ok(Self {
            miso_port,
            mosi_port,
            period_ms,
            max_master_timeouts,
        })
    }

    fn encode(&self) -> String {
        format!(
            "{},{},{},{}",
            self.miso_port, self.mosi_port, self.period_ms, self.max_master_timeouts
        )
    }
}

/// One parsed Master→Slave datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkFrame {
    /// `H` — establish a session. The processor-config segment stays a raw
    /// string here; the command processor owns its validation.
    Handshake { net: NetParams, config: String },
    /// `S` — standard command, only honored while connected.
    Command(Command),
    /// `X` — drop to NoMaster.
    Disconnect,
    /// `Z` / `R` — force a reboot.
    Reboot,
    /// `I` — reset the inbound index watermark.
    ResetIndex,
}

/// `INDEX|KEYWORD|PAYLOAD` envelope around a [`DownlinkFrame`].
#[derive(Debug, Clone, PartialEq)]
pub struct MosiFrame {
    pub index: u64,
    pub frame: DownlinkFrame,
}

impl MosiFrame {
    pub fn parse(raw: &str) -> Result<Self, WireError> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        if raw.is_empty() {
            return Err(WireError::Empty);
        }
        let mut parts = raw.splitn(3, '|');
        let index_raw = parts.next().unwrap_or("");
        let index = index_raw.parse::<u64>().map_err(|_| WireError::BadInt {
            field: "index",
            value: index_raw.to_string(),
        })?;
        let keyword = parts.next().ok_or(WireError::MissingField("keyword"))?;
        let payload = parts.next().unwrap_or("");
        let frame = match keyword {
            "H" => {
                let (net_raw, config) = payload
                    .split_once('|')
                    .ok_or(WireError::MissingField("processor_config"))?;
                DownlinkFrame::Handshake {
                    net: NetParams::parse(net_raw)?,
                    config: config.to_string(),
                }
            }
            "S" => DownlinkFrame::Command(Command::parse_body(payload)?),
            "X" => DownlinkFrame::Disconnect,
            "Z" | "R" => DownlinkFrame::Reboot,
            "I" => DownlinkFrame::ResetIndex,
            other => return Err(WireError::UnknownSpec(other.to_string())),
        };
        Ok(Self { index, frame })
    }
}

/// Handshake frame with the reserved index 0 (Master side).
pub fn handshake_frame(net: &NetParams, config_payload: &str) -> String {
    format!("0|H|{}|{}", net.encode(), config_payload)
}

/// Indexed `S` frame for a `D`/`C`/`F` command (Master side).
/// Returns `None` for [`Command::Configure`], which has no `S` form.
pub fn command_frame(index: u64, cmd: &Command) -> Option<String> {
    cmd.format_body().map(|body| format!("{index}|S|{body}"))
}

/// Indexed control frame (`X`, `Z`, `I`).
pub fn control_frame(index: u64, keyword: char) -> String {
    format!("{index}|{keyword}")
}

// ── Handshake replies ─────────────────────────────────────────────────────────

pub const HANDSHAKE_ACK: &str = "H";

pub fn error_frame(message: &str) -> String {
    format!("E|{message}")
}

/// Slave's answer to a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Ack,
    Error(String),
}

impl HandshakeReply {
    pub fn parse(raw: &str) -> Result<Self, WireError> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        match raw.split_once('|') {
            None if raw == HANDSHAKE_ACK => Ok(HandshakeReply::Ack),
            Some(("E", msg)) => Ok(HandshakeReply::Error(msg.to_string())),
            _ => Err(WireError::UnknownSpec(raw.to_string())),
        }
    }
}

// ── Shared field helpers ──────────────────────────────────────────────────────

fn parse_port(raw: &str, field: &'static str) -> Result<u16, WireError> {
    let v = raw.parse::<u16>().map_err(|_| WireError::BadInt {
        field,
        value: raw.to_string(),
    })?;
    if v == 0 {
        return Err(WireError::NotPositive { field });
    }
    Ok(v)
}

fn parse_positive(raw: &str, field: &'static str) -> Result<u64, WireError> {
    let v = raw.parse::<u64>().map_err(|_| WireError::BadInt {
        field,
        value: raw.to_string(),
    })?;
    if v == 0 {
        return Err(WireError::NotPositive { field });
    }
    Ok(v)
}
