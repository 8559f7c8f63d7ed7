//! End-to-end loopback session: a bench master discovers the node, performs
//! the handshake, drives a command, watches the status uplink, and
//! disconnects. Exercises all four tasks against real UDP sockets.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use fanarray_node::downlink::run_downlink;
use fanarray_node::fan::{SimFan, SimFanConfig};
use fanarray_node::link_listener::{run_link_listener, ListenerSettings};
use fanarray_node::mailbox::MailboxPolicy;
use fanarray_node::platform::{Indicator, Platform, RebootReason};
use fanarray_node::processor::CommandProcessor;
use fanarray_node::session::{ConnectionState, Session};
use fanarray_node::uplink::run_uplink;
use fanbus_types::{
    command_frame, control_frame, discover_frame, handshake_frame, Command, FanMask,
    HandshakeReply, Identification, NetParams, ProcessorConfig, StatusReport,
};

const PASSCODE: &str = "pc";
const CONFIG: &str = r"1 4 5000 1 2 11500 1185 0.1 0.05 5 ABCD [\]^";

struct TestPlatform;
impl Platform for TestPlatform {
    fn link_up(&self) -> bool {
        true
    }
    fn reboot(&self, _reason: &RebootReason) {}
}

struct NullIndicator;
impl Indicator for NullIndicator {
    fn show(&self, _state: ConnectionState) {}
}

struct NodeUnderTest {
    session: Arc<Session>,
    processor: Arc<CommandProcessor>,
    listener_port: u16,
    mosi_port: u16,
    _reboot_rx: mpsc::Receiver<RebootReason>,
}

async fn spawn_node() -> NodeUnderTest {
    let listener_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mosi_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let miso_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listener_port = listener_sock.local_addr().unwrap().port();
    let mosi_port = mosi_sock.local_addr().unwrap().port();
    let miso_port = miso_sock.local_addr().unwrap().port();

    let sim = SimFanConfig {
        max_rpm: 11500.0,
        response: 0.5,
        noise_rpm: 0.0,
        stall_below: 0.04,
    };
    let processor = Arc::new(CommandProcessor::new(
        SimFan::bank(sim, 4),
        MailboxPolicy::RejectIfFull,
        MailboxPolicy::OverwriteLatest,
        Duration::from_millis(5),
        Duration::from_millis(1),
    ));
    let (reboot_tx, reboot_rx) = mpsc::channel(1);
    let session = Arc::new(Session::new(
        processor.clone(),
        Box::new(NullIndicator),
        reboot_tx,
    ));
    let platform: Arc<dyn Platform> = Arc::new(TestPlatform);
    let identity = Identification {
        mac: "02:00:00:00:00:99".into(),
        device_id: 9,
        miso_port,
        mosi_port,
        version: "test".into(),
    };

    tokio::spawn(run_link_listener(
        session.clone(),
        platform,
        listener_sock,
        ListenerSettings {
            passcode: PASSCODE.into(),
            identity,
            network_timeout_max: 10_000,
            recv_wait: Duration::from_millis(50),
        },
    ));
    tokio::spawn(run_downlink(
        session.clone(),
        processor.clone(),
        mosi_sock,
        Duration::from_millis(50),
    ));
    tokio::spawn(run_uplink(session.clone(), processor.clone(), miso_sock));
    tokio::spawn(processor.clone().run());
    session.set_status(ConnectionState::NoMaster).await;

    NodeUnderTest {
        session,
        processor,
        listener_port,
        mosi_port,
        _reboot_rx: reboot_rx,
    }
}

async fn recv_string(socket: &UdpSocket) -> String {
    let mut buf = [0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("receive timed out")
        .expect("receive failed");
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

#[tokio::test]
async fn full_session_over_loopback() {
    let node = spawn_node().await;

    let master_ctl = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let master_miso = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let master_cmd = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let reply_port = master_ctl.local_addr().unwrap().port();
    let miso_port = master_miso.local_addr().unwrap().port();

    // ── Discovery ────────────────────────────────────────────────────────
    master_ctl
        .send_to(
            discover_frame(PASSCODE, reply_port).as_bytes(),
            ("127.0.0.1", node.listener_port),
        )
        .await
        .unwrap();
    let reply = recv_string(&master_ctl).await;
    let (passcode, ident) = Identification::parse_frame(&reply).unwrap();
    assert_eq!(passcode, PASSCODE);
    assert_eq!(ident.mosi_port, node.mosi_port);
    assert_eq!(ident.device_id, 9);

    // ── Handshake ────────────────────────────────────────────────────────
    let net = NetParams {
        miso_port,
        mosi_port: master_cmd.local_addr().unwrap().port(),
        period_ms: 20,
        max_master_timeouts: 200,
    };
    let cfg = ProcessorConfig::parse(CONFIG).unwrap();
    master_cmd
        .send_to(
            handshake_frame(&net, &cfg.to_payload()).as_bytes(),
            ("127.0.0.1", ident.mosi_port),
        )
        .await
        .unwrap();
    let reply = recv_string(&master_cmd).await;
    assert_eq!(HandshakeReply::parse(&reply).unwrap(), HandshakeReply::Ack);
    assert_eq!(node.session.get_status().await, ConnectionState::Connected);

    // ── Command: 50% duty on all four fans ───────────────────────────────
    let cmd = Command::Write {
        duty: 0.5,
        mask: FanMask::all(4),
    };
    master_cmd
        .send_to(
            command_frame(1, &cmd).unwrap().as_bytes(),
            ("127.0.0.1", ident.mosi_port),
        )
        .await
        .unwrap();

    // Status uplink must eventually reflect it (maintain frames are legal
    // in between)
    loop {
        let raw = recv_string(&master_miso).await;
        let (_idx, report) = StatusReport::parse_frame(&raw).unwrap();
        if let Some(report) = report {
            assert_eq!(report.duty.len(), 4);
            assert_eq!(report.rpm.len(), 4);
            if report.duty.iter().all(|d| (d - 0.5).abs() < 1e-6) {
                break;
            }
        }
    }

    // ── Stale index is dropped without acting ────────────────────────────
    let stale = Command::Write {
        duty: 1.0,
        mask: FanMask::all(4),
    };
    master_cmd
        .send_to(
            command_frame(1, &stale).unwrap().as_bytes(),
            ("127.0.0.1", ident.mosi_port),
        )
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(node.session.last_mosi_index(), 1);
    assert!(node
        .processor
        .fan_snapshot()
        .iter()
        .all(|s| (s.duty - 0.5).abs() < 1e-6));

    // ── Disconnect drops the session and silences the bank ───────────────
    master_cmd
        .send_to(
            control_frame(2, 'X').as_bytes(),
            ("127.0.0.1", ident.mosi_port),
        )
        .await
        .unwrap();
    for _ in 0..100 {
        if node.session.get_status().await == ConnectionState::NoMaster {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(node.session.get_status().await, ConnectionState::NoMaster);
    assert!(node.processor.fan_snapshot().iter().all(|s| s.duty == 0.0));
}

#[tokio::test]
async fn rejected_handshake_gets_error_reply_and_no_session() {
    let node = spawn_node().await;
    let master_cmd = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let net = NetParams {
        miso_port: 1,
        mosi_port: master_cmd.local_addr().unwrap().port(),
        period_ms: 20,
        max_master_timeouts: 200,
    };
    // tolerance out of range: processor must reject the whole record
    let bad_config = CONFIG.replace("0.1", "1.5");
    master_cmd
        .send_to(
            handshake_frame(&net, &bad_config).as_bytes(),
            ("127.0.0.1", node.mosi_port),
        )
        .await
        .unwrap();
    let reply = recv_string(&master_cmd).await;
    assert!(matches!(
        HandshakeReply::parse(&reply).unwrap(),
        HandshakeReply::Error(_)
    ));
    assert_eq!(node.session.get_status().await, ConnectionState::NoMaster);
    assert!(node.processor.config().is_none());
}
