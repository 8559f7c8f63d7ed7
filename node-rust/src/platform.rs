//! Platform seam: reboot and link-health queries, kept out of the core
//! logic so the state machine stays testable without resetting anything.

use std::fmt;

use tracing::{error, info};

use crate::session::ConnectionState;

/// Why the node is giving up on recovering in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootReason {
    /// Link layer down or unsupported while already disconnected
    LinkDown,
    /// Master asked for a reboot into the firmware updater
    UpdateRequested,
    /// Master announced a controlled shutdown
    MasterShutdown,
    /// Explicit reboot command on the downlink
    RebootCommand,
}

impl fmt::Display for RebootReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RebootReason::LinkDown => "link down",
            RebootReason::UpdateRequested => "update requested",
            RebootReason::MasterShutdown => "master shutdown",
            RebootReason::RebootCommand => "reboot command",
        };
        f.write_str(s)
    }
}

pub trait Platform: Send + Sync {
    fn link_up(&self) -> bool;
    fn reboot(&self, reason: &RebootReason);
}

/// Hosted build: a nonzero exit hands control to the process supervisor,
/// the hosted analog of an MCU watchdog reset.
pub struct HostPlatform;

impl Platform for HostPlatform {
    fn link_up(&self) -> bool {
        // Hosted builds cannot lose their loopback link; real boards query
        // the PHY here.
        true
    }

    fn reboot(&self, reason: &RebootReason) {
        error!("rebooting: {reason}");
        std::process::exit(1);
    }
}

// ── Status indicator ──────────────────────────────────────────────────────────

pub trait Indicator: Send + Sync {
    fn show(&self, state: ConnectionState);
}

/// Log-only indicator for hosted builds; boards drive the status LED.
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn show(&self, state: ConnectionState) {
        info!("indicator: {} ({})", pattern_for(state), state);
    }
}

fn pattern_for(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Initializing => "double-blink",
        ConnectionState::NoNetwork => "fast-blink",
        ConnectionState::NoMaster => "slow-blink",
        ConnectionState::Connecting => "pulse",
        ConnectionState::Connected => "solid",
    }
}
