//! Connection-lifecycle state machine and the shared network session.
//!
//! `Session` is the single mutation point for [`ConnectionState`] and the
//! owner of everything the three network tasks share: message-index
//! watermarks, timeout counters, the Master's endpoints, and the
//! handshake-mutable uplink parameters.
//!
//! ## Invariants
//! - A redundant `set_status` is a no-op: no index reset, no indicator
//!   change, no second reboot request
//! - Entering `Initializing`/`NoMaster`/`NoNetwork` resets both index
//!   watermarks to their epochs and demotes the processor to `Off`
//! - Entering `NoNetwork` requests an unconditional reboot; the link layer
//!   itself is assumed unrecoverable in-process

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use fanbus_types::NetParams;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::platform::{Indicator, RebootReason};
use crate::processor::{CommandProcessor, ProcessorStatus};

pub const MOSI_INDEX_EPOCH: u64 = 0;
pub const MISO_INDEX_EPOCH: u64 = 0;
const DEFAULT_PERIOD_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    NoNetwork,
    NoMaster,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Initializing => "INITIALIZING",
            ConnectionState::NoNetwork => "NO_NETWORK",
            ConnectionState::NoMaster => "NO_MASTER",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
        };
        f.write_str(s)
    }
}

/// Master addresses, populated incrementally as discovery and handshake
/// messages arrive.
#[derive(Debug, Clone, Default)]
struct Endpoints {
    master_ip: Option<IpAddr>,
    listener_port: Option<u16>,
    miso_port: Option<u16>,
    mosi_port: Option<u16>,
}

pub struct Session {
    state: RwLock<ConnectionState>,
    endpoints: RwLock<Endpoints>,
    last_mosi_index: AtomicU64,
    miso_index: AtomicU64,
    period_ms: AtomicU64,
    max_master_timeouts: AtomicU32,
    master_timeouts: AtomicU32,
    network_timeouts: AtomicU32,
    processor: Arc<CommandProcessor>,
    indicator: Box<dyn Indicator>,
    reboot_tx: mpsc::Sender<RebootReason>,
}

impl Session {
    pub fn new(
        processor: Arc<CommandProcessor>,
        indicator: Box<dyn Indicator>,
        reboot_tx: mpsc::Sender<RebootReason>,
    ) -> Self {
        Self {
            state: RwLock::new(ConnectionState::Initializing),
            endpoints: RwLock::new(Endpoints::default()),
            last_mosi_index: AtomicU64::new(MOSI_INDEX_EPOCH),
            miso_index: AtomicU64::new(MISO_INDEX_EPOCH),
            period_ms: AtomicU64::new(DEFAULT_PERIOD_MS),
            max_master_timeouts: AtomicU32::new(10),
            master_timeouts: AtomicU32::new(0),
            network_timeouts: AtomicU32::new(0),
            processor,
            indicator,
            reboot_tx,
        }
    }

    pub async fn get_status(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn set_status(&self, next: ConnectionState) {
        self.transition(next, RebootReason::LinkDown).await;
    }

    /// Force `NoNetwork` (and therefore a reboot) for an explicit reason.
    pub async fn escalate(&self, reason: RebootReason) {
        self.transition(ConnectionState::NoNetwork, reason).await;
    }

    async fn transition(&self, next: ConnectionState, reason: RebootReason) {
        {
            let mut cur = self.state.write().await;
            if *cur == next {
                return;
            }
            info!("session: {} -> {}", *cur, next);
            *cur = next;
        }
        // Side effects happen outside the state lock; the write above is
        // the linearization point.
        if matches!(
            next,
            ConnectionState::Initializing | ConnectionState::NoMaster | ConnectionState::NoNetwork
        ) {
            self.reset_indices();
            self.master_timeouts.store(0, Ordering::Release);
            self.network_timeouts.store(0, Ordering::Release);
            self.processor.set_status(ProcessorStatus::Off);
        }
        self.indicator.show(next);
        if next == ConnectionState::NoNetwork {
            warn!("session: link unrecoverable ({reason}), requesting reboot");
            let _ = self.reboot_tx.try_send(reason);
        }
    }

    // ── Message indices ───────────────────────────────────────────────────

    /// Accept an inbound index iff it is strictly newer than the watermark,
    /// or it is the handshake sentinel `0`. Accepting stores the new
    /// watermark.
    pub fn accept_mosi_index(&self, index: u64, is_handshake: bool) -> bool {
        if index == 0 {
            if is_handshake {
                self.last_mosi_index.store(0, Ordering::Release);
                return true;
            }
            return false;
        }
        if index > self.last_mosi_index.load(Ordering::Acquire) {
            self.last_mosi_index.store(index, Ordering::Release);
            return true;
        }
        false
    }

    pub fn last_mosi_index(&self) -> u64 {
        self.last_mosi_index.load(Ordering::Acquire)
    }

    pub fn reset_mosi_index(&self) {
        self.last_mosi_index.store(MOSI_INDEX_EPOCH, Ordering::Release);
    }

    /// Pre-incremented index stamped onto every uplink frame.
    pub fn next_miso_index(&self) -> u64 {
        self.miso_index.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn reset_indices(&self) {
        self.last_mosi_index.store(MOSI_INDEX_EPOCH, Ordering::Release);
        self.miso_index.store(MISO_INDEX_EPOCH, Ordering::Release);
    }

    // ── Endpoints & handshake parameters ──────────────────────────────────

    pub async fn record_master(&self, ip: IpAddr, listener_port: u16) {
        let mut ep = self.endpoints.write().await;
        ep.master_ip = Some(ip);
        ep.listener_port = Some(listener_port);
    }

    pub async fn apply_net_params(&self, ip: IpAddr, net: &NetParams) {
        {
            let mut ep = self.endpoints.write().await;
            ep.master_ip = Some(ip);
            ep.miso_port = Some(net.miso_port);
            ep.mosi_port = Some(net.mosi_port);
        }
        self.period_ms.store(net.period_ms, Ordering::Release);
        self.max_master_timeouts
            .store(net.max_master_timeouts, Ordering::Release);
    }

    pub async fn master_listener_addr(&self) -> Option<SocketAddr> {
        let ep = self.endpoints.read().await;
        Some(SocketAddr::new(ep.master_ip?, ep.listener_port?))
    }

    pub async fn master_miso_addr(&self) -> Option<SocketAddr> {
        let ep = self.endpoints.read().await;
        Some(SocketAddr::new(ep.master_ip?, ep.miso_port?))
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms.load(Ordering::Acquire)
    }

    pub fn max_master_timeouts(&self) -> u32 {
        self.max_master_timeouts.load(Ordering::Acquire)
    }

    // ── Timeout counters (owned here, driven by the listener) ─────────────

    pub fn note_master_silence(&self) -> u32 {
        self.master_timeouts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn clear_master_silence(&self) {
        self.master_timeouts.store(0, Ordering::Release);
    }

    pub fn note_network_timeout(&self) -> u32 {
        self.network_timeouts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn clear_network_timeouts(&self) {
        self.network_timeouts.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fan::{SimFan, SimFanConfig};
    use crate::mailbox::MailboxPolicy;
    use crate::platform::Indicator;
    use fanbus_types::Command;
    use std::time::Duration;

    struct NullIndicator;
    impl Indicator for NullIndicator {
        fn show(&self, _state: ConnectionState) {}
    }

    fn quiet_sim() -> SimFanConfig {
        SimFanConfig {
            noise_rpm: 0.0,
            ..SimFanConfig::default()
        }
    }

    fn test_session() -> (Arc<Session>, Arc<CommandProcessor>, mpsc::Receiver<RebootReason>) {
        let processor = Arc::new(CommandProcessor::new(
            SimFan::bank(quiet_sim(), 4),
            MailboxPolicy::RejectIfFull,
            MailboxPolicy::OverwriteLatest,
            Duration::from_millis(20),
            Duration::from_millis(1),
        ));
        let (tx, rx) = mpsc::channel(1);
        let session = Arc::new(Session::new(processor.clone(), Box::new(NullIndicator), tx));
        (session, processor, rx)
    }

    #[tokio::test]
    async fn redundant_transition_is_a_no_op() {
        let (session, _, mut reboot_rx) = test_session();
        session.set_status(ConnectionState::NoNetwork).await;
        session.set_status(ConnectionState::NoNetwork).await;
        // exactly one reboot request despite two calls
        assert_eq!(reboot_rx.recv().await, Some(RebootReason::LinkDown));
        assert!(reboot_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leaving_connected_resets_indices_and_silences_fans() {
        let (session, processor, _rx) = test_session();
        session.set_status(ConnectionState::Connected).await;
        processor.set_status(ProcessorStatus::Active);

        assert!(session.accept_mosi_index(7, false));
        assert_eq!(session.next_miso_index(), 1);
        processor.submit(Command::parse_body("D:0.5:1111").unwrap());

        session.set_status(ConnectionState::NoMaster).await;
        assert_eq!(session.last_mosi_index(), MOSI_INDEX_EPOCH);
        assert_eq!(session.next_miso_index(), MISO_INDEX_EPOCH + 1);
        assert!(processor.mailboxes_empty());
        assert!(processor.fan_snapshot().iter().all(|s| s.duty == 0.0));
    }

    #[tokio::test]
    async fn index_watermark_is_strictly_increasing_except_handshake_zero() {
        let (session, _, _rx) = test_session();
        assert!(session.accept_mosi_index(7, false));
        assert!(!session.accept_mosi_index(5, false));
        assert!(!session.accept_mosi_index(7, false));
        assert_eq!(session.last_mosi_index(), 7);
        assert!(session.accept_mosi_index(8, false));
        // zero is reserved for the handshake
        assert!(!session.accept_mosi_index(0, false));
        assert!(session.accept_mosi_index(0, true));
        assert_eq!(session.last_mosi_index(), 0);
    }

    #[tokio::test]
    async fn escalate_reports_its_reason() {
        let (session, _, mut reboot_rx) = test_session();
        session.escalate(RebootReason::UpdateRequested).await;
        assert_eq!(reboot_rx.recv().await, Some(RebootReason::UpdateRequested));
    }
}
