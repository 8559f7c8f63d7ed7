//! Downlink (MOSI) receiver: indexed Master commands and the handshake.
//!
//! Message application order equals index order; anything stale or
//! duplicated is dropped, never buffered. Classification failures are
//! logged and the loop keeps listening — an embedded control link must
//! never stop receiving.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fanbus_types::{error_frame, DownlinkFrame, MosiFrame, NetParams, HANDSHAKE_ACK};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::platform::RebootReason;
use crate::processor::{CommandProcessor, ProcessorStatus};
use crate::session::{ConnectionState, Session};

pub async fn run_downlink(
    session: Arc<Session>,
    processor: Arc<CommandProcessor>,
    socket: UdpSocket,
    recv_wait: Duration,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, src) = match timeout(recv_wait, socket.recv_from(&mut buf)).await {
            Err(_) => continue, // master silence is the listener's concern
            Ok(Err(e)) => {
                warn!("downlink: recv error: {e}");
                continue;
            }
            Ok(Ok(v)) => v,
        };
        let raw = String::from_utf8_lossy(&buf[..len]);
        let parsed = match MosiFrame::parse(raw.as_ref()) {
            Ok(f) => f,
            Err(e) => {
                warn!("downlink: dropping datagram from {src}: {e}");
                continue;
            }
        };

        let connected = session.get_status().await == ConnectionState::Connected;
        let is_handshake = matches!(parsed.frame, DownlinkFrame::Handshake { .. });
        if is_handshake && connected {
            warn!("downlink: handshake while connected, ignored");
            continue;
        }
        if !session.accept_mosi_index(parsed.index, is_handshake) {
            warn!(
                "downlink: stale index {} (watermark {}), dropped",
                parsed.index,
                session.last_mosi_index()
            );
            continue;
        }

        match parsed.frame {
            DownlinkFrame::Handshake { net, config } => {
                handle_handshake(&session, &processor, &socket, src, net, &config).await;
            }
            DownlinkFrame::Command(cmd) => {
                if !connected {
                    warn!("downlink: command before handshake, dropped");
                    continue;
                }
                if !processor.submit(cmd) {
                    // master resends; a queued setpoint is never overwritten
                    warn!("downlink: command slot occupied, dropped for resend");
                }
            }
            DownlinkFrame::Disconnect => {
                if connected {
                    info!("downlink: master disconnected");
                    session.set_status(ConnectionState::NoMaster).await;
                }
            }
            DownlinkFrame::Reboot => {
                if connected {
                    session.escalate(RebootReason::RebootCommand).await;
                }
            }
            DownlinkFrame::ResetIndex => {
                debug!("downlink: inbound index reset");
                session.reset_mosi_index();
            }
        }
    }
}

/// Handshake exchange. Numeric field validation already happened at parse
/// time; what remains is applying the network parameters and delegating
/// the processor-config segment. A rejected handshake is answered with an
/// error frame and never retried from this side.
async fn handle_handshake(
    session: &Arc<Session>,
    processor: &Arc<CommandProcessor>,
    socket: &UdpSocket,
    src: SocketAddr,
    net: NetParams,
    config: &str,
) {
    session.set_status(ConnectionState::Connecting).await;
    session.apply_net_params(src.ip(), &net).await;
    // demote before reconfiguration so the control loop cannot race it
    processor.set_status(ProcessorStatus::Off);
    match processor.configure(config) {
        Ok(()) => {
            if let Err(e) = socket.send_to(HANDSHAKE_ACK.as_bytes(), src).await {
                warn!("downlink: handshake ack send failed: {e}");
            }
            session.set_status(ConnectionState::Connected).await;
            processor.set_status(ProcessorStatus::Active);
            info!(
                "🤝 session established with {src} (uplink every {}ms, {} master timeouts)",
                net.period_ms, net.max_master_timeouts
            );
        }
        Err(e) => {
            warn!("downlink: handshake rejected: {e}");
            let _ = socket.send_to(error_frame(&e.to_string()).as_bytes(), src).await;
            session.set_status(ConnectionState::NoMaster).await;
        }
    }
}
