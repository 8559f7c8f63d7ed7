//! Listener task: answers discovery broadcasts, takes out-of-band control
//! datagrams, and watches link health through its own receive timeouts.
//!
//! The bounded receive wait doubles as the heartbeat: every elapsed wait
//! bumps a counter specific to the current connection state. While
//! connected, the near-threshold count sends one soft probe before the
//! hard threshold drops the session; while disconnected, the hard
//! threshold with a dead link escalates to `NoNetwork` (reboot).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fanbus_types::{ping_frame, Identification, ListenerFrame};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::platform::{Platform, RebootReason};
use crate::session::{ConnectionState, Session};

pub struct ListenerSettings {
    pub passcode: String,
    pub identity: Identification,
    pub network_timeout_max: u32,
    pub recv_wait: Duration,
}

pub async fn run_link_listener(
    session: Arc<Session>,
    platform: Arc<dyn Platform>,
    socket: UdpSocket,
    settings: ListenerSettings,
) {
    info!(
        "📡 listener up on {}",
        socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into())
    );
    let mut buf = vec![0u8; 2048];
    loop {
        match timeout(settings.recv_wait, socket.recv_from(&mut buf)).await {
            Err(_) => on_silence(&session, &platform, &socket, &settings).await,
            Ok(Err(e)) => {
                // transient; a dead interface surfaces through the silence path
                warn!("listener: recv error: {e}");
                on_silence(&session, &platform, &socket, &settings).await;
            }
            Ok(Ok((len, src))) => {
                let raw = String::from_utf8_lossy(&buf[..len]);
                handle_datagram(&session, &socket, &settings, raw.as_ref(), src).await;
            }
        }
    }
}

async fn on_silence(
    session: &Arc<Session>,
    platform: &Arc<dyn Platform>,
    socket: &UdpSocket,
    settings: &ListenerSettings,
) {
    match session.get_status().await {
        ConnectionState::Connected => {
            let count = session.note_master_silence();
            let max = session.max_master_timeouts();
            if count + 1 == max {
                // one soft probe before giving the master up for dead
                if let Some(addr) = session.master_listener_addr().await {
                    debug!("listener: probing silent master at {addr}");
                    let _ = socket
                        .send_to(ping_frame(&settings.passcode).as_bytes(), addr)
                        .await;
                }
            }
            if count >= max {
                warn!("listener: master silent for {count} waits, dropping session");
                session.set_status(ConnectionState::NoMaster).await;
            }
        }
        ConnectionState::NoNetwork => {}
        _ => {
            let count = session.note_network_timeout();
            if count >= settings.network_timeout_max {
                if platform.link_up() {
                    debug!("listener: no traffic for {count} waits but link is up");
                } else {
                    session.escalate(RebootReason::LinkDown).await;
                }
            }
        }
    }
}

async fn handle_datagram(
    session: &Arc<Session>,
    socket: &UdpSocket,
    settings: &ListenerSettings,
    raw: &str,
    src: SocketAddr,
) {
    let (passcode, frame) = match ListenerFrame::parse(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("listener: dropping datagram from {src}: {e}");
            return;
        }
    };
    if passcode != settings.passcode {
        warn!("listener: bad passcode from {src}, discarded");
        return;
    }

    let connected = session.get_status().await == ConnectionState::Connected;
    if connected {
        // any validly-addressed master traffic counts as a heartbeat
        session.clear_master_silence();
    } else {
        // traffic proves the link itself is alive
        session.clear_network_timeouts();
    }

    match frame {
        ListenerFrame::Discover { reply_port } => {
            session.record_master(src.ip(), reply_port).await;
            if !connected {
                let dest = SocketAddr::new(src.ip(), reply_port);
                info!(
                    "listener: master at {dest}, identifying as device {}",
                    settings.identity.device_id
                );
                let reply = settings.identity.to_frame(&settings.passcode);
                if let Err(e) = socket.send_to(reply.as_bytes(), dest).await {
                    warn!("listener: identification send failed: {e}");
                }
            }
        }
        ListenerFrame::Update => {
            info!("listener: update requested, rebooting into updater");
            session.escalate(RebootReason::UpdateRequested).await;
        }
        ListenerFrame::Shutdown => {
            info!("listener: master shutdown announced");
            session.escalate(RebootReason::MasterShutdown).await;
        }
        ListenerFrame::Launch => debug!("listener: launch marker ignored"),
        ListenerFrame::Ping => debug!("listener: ping from {src}"),
    }
}
