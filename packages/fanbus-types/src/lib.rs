//! # fanbus-types
//!
//! Shared wire-protocol types for the fan-array control bus.
//!
//! These types are used by:
//! - `node-rust`: parsing Master datagrams and producing status uplinks on
//!   the Slave node
//! - `master-simulator`: producing Master datagrams and parsing node replies
//!   on the bench
//!
//! ## Wire conventions
//!
//! All traffic is UDP carrying pipe-delimited ASCII fields. Indexed messages
//! (MOSI commands, MISO status) lead with a monotonically increasing message
//! index; index `0` is reserved for the handshake. Fan selections are
//! fixed-width `0`/`1` strings keyed by fan position, leftmost character =
//! fan 0.
//!
//! ## Invariants
//! - Accepted inbound indices are strictly increasing, except the handshake
//!   sentinel `0`
//! - `ProcessorConfig` parsing is all-or-nothing: any invalid field rejects
//!   the whole record
//! - Parsing never panics on attacker-controlled input; every failure is a
//!   typed [`WireError`] / [`ConfigError`]

pub mod command;
pub mod config;
pub mod status;
pub mod wire;

pub use command::{Command, FanMask, MAX_FANS};
pub use config::{ConfigError, FanMode, ProcessorConfig};
pub use status::StatusReport;
pub use wire::{
    command_frame, control_frame, discover_frame, error_frame, handshake_frame, ping_frame,
    DownlinkFrame, HandshakeReply, Identification, ListenerFrame, MosiFrame, NetParams, WireError,
    HANDSHAKE_ACK,
};
