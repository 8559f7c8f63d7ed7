//! Uplink (MISO) sender: drains the status mailbox every period and keeps
//! the link warm with a maintain frame when no report is pending. Sending
//! is best-effort; the listener's timeout logic owns recovery.

use std::sync::Arc;
use std::time::Duration;

use fanbus_types::StatusReport;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::processor::CommandProcessor;
use crate::session::{ConnectionState, Session};

pub async fn run_uplink(
    session: Arc<Session>,
    processor: Arc<CommandProcessor>,
    socket: UdpSocket,
) {
    loop {
        // period is handshake-mutable, so re-read it every cycle
        let period = session.period_ms();
        tokio::time::sleep(Duration::from_millis(period)).await;

        if session.get_status().await != ConnectionState::Connected {
            continue;
        }
        let Some(dest) = session.master_miso_addr().await else {
            continue;
        };

        let frame = match processor.take_status() {
            Some(report) => report.to_frame(session.next_miso_index()),
            None => StatusReport::maintain_frame(session.next_miso_index()),
        };
        match socket.send_to(frame.as_bytes(), dest).await {
            Ok(_) => debug!("uplink: → {frame}"),
            Err(e) => warn!("uplink: send to {dest} failed: {e}"),
        }
    }
}
