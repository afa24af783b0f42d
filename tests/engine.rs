//! End-to-end engine tests against a fake controller on loopback sockets
//! with compressed link timing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use open_station::config::Config;
use open_station::connection::LinkConfig;
use open_station::protocol::TcpMessage;
use open_station::station::{RobotState, Station, StationEvents, StationHandle, StationOptions};

const CONTROL_ESTOP_BIT: u8 = 1 << 7;
const CONTROL_ENABLED_BIT: u8 = 1 << 2;
const TAG_DATETIME: u8 = 0x0F;

/// A controller double: answers every control datagram with a telemetry
/// datagram echoing the sequence, while `responding` is set.
struct FakeController {
    port: u16,
    socket: Option<UdpSocket>,
    responding: Arc<AtomicBool>,
    request_date_once: Arc<AtomicBool>,
    control_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    control_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl FakeController {
    async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            port,
            socket: Some(socket),
            responding: Arc::new(AtomicBool::new(true)),
            request_date_once: Arc::new(AtomicBool::new(false)),
            control_rx,
            control_tx,
        }
    }

    /// Start answering; `ds_addr` is the station's telemetry socket.
    fn run(&mut self, ds_addr: SocketAddr) {
        let socket = self.socket.take().expect("run called twice");
        let responding = self.responding.clone();
        let request_date_once = self.request_date_once.clone();
        let control_tx = self.control_tx.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((len, _)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                if control_tx.send(buf[..len].to_vec()).is_err() {
                    break;
                }
                if !responding.load(Ordering::SeqCst) {
                    continue;
                }

                // Telemetry reply: echo sequence, code running, 12.34 V.
                let request_date = request_date_once.swap(false, Ordering::SeqCst);
                let reply = [
                    buf[0],
                    buf[1],
                    0x01,
                    0x00,
                    0x00,
                    12,
                    87,
                    request_date as u8,
                ];
                let _ = socket.send_to(&reply, ds_addr).await;
            }
        });
    }
}

/// The station binds 0.0.0.0; the fake controller talks to loopback.
fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new("127.0.0.1".parse().unwrap(), port)
}

fn test_link_config(controller_port: u16, stream_port: u16) -> LinkConfig {
    LinkConfig {
        control_port: controller_port,
        telemetry_port: 0,
        stream_port,
        target_override: Some("127.0.0.1".parse().unwrap()),
        send_period: Duration::from_millis(20),
        recv_timeout: Duration::from_millis(20),
        liveness_timeout: Duration::from_millis(200),
        resolve_timeout: Duration::from_millis(10),
        stream_connect_timeout: Duration::from_millis(100),
        stream_read_timeout: Duration::from_millis(2000),
        backoff_initial: Duration::from_millis(20),
        backoff_cap: Duration::from_millis(100),
    }
}

async fn spawn_station(
    controller_port: u16,
    stream_port: u16,
) -> (StationHandle, StationEvents) {
    let config = Config {
        team_number: 100,
        ..Default::default()
    };
    let options = StationOptions {
        link: test_link_config(controller_port, stream_port),
        capture_devices: false,
        persist_config: false,
    };
    Station::spawn_with(config, options).await.unwrap()
}

async fn wait_for_state<F>(
    rx: &mut watch::Receiver<RobotState>,
    wait: Duration,
    what: &str,
    predicate: F,
) -> RobotState
where
    F: Fn(&RobotState) -> bool,
{
    let result = timeout(wait, async {
        loop {
            {
                let state = rx.borrow_and_update();
                if predicate(&state) {
                    return state.clone();
                }
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await;
    match result {
        Ok(state) => state,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Walk the tagged sections of a control datagram for a tag id.
fn has_tag(datagram: &[u8], wanted: u8) -> bool {
    let mut rest = &datagram[6.min(datagram.len())..];
    while rest.len() >= 2 {
        let size = rest[0] as usize;
        if size == 0 || rest.len() < 1 + size {
            return false;
        }
        if rest[1] == wanted {
            return true;
        }
        rest = &rest[1 + size..];
    }
    false
}

#[tokio::test]
async fn cold_start_connects_and_reports_voltage() {
    let mut controller = FakeController::bind().await;
    let (station, mut events) = spawn_station(controller.port, 1).await;
    controller.run(loopback(station.local_recv_addr().port()));

    let state = wait_for_state(&mut events.state, Duration::from_secs(2), "link up", |s| {
        s.connected
    })
    .await;
    assert!(state.code_running);
    assert!((state.voltage - 12.34).abs() < 0.01);

    station.shutdown().await;
}

#[tokio::test]
async fn peer_loss_marks_disconnected_and_send_loop_survives() {
    let mut controller = FakeController::bind().await;
    let (station, mut events) = spawn_station(controller.port, 1).await;
    controller.run(loopback(station.local_recv_addr().port()));

    wait_for_state(&mut events.state, Duration::from_secs(2), "link up", |s| {
        s.connected
    })
    .await;

    // Peer goes silent; the snapshot flips within the liveness window.
    controller.responding.store(false, Ordering::SeqCst);
    wait_for_state(&mut events.state, Duration::from_secs(2), "link down", |s| {
        !s.connected
    })
    .await;

    // The send loop kept emitting the whole time.
    while controller.control_rx.try_recv().is_ok() {}
    let mut seen = 0;
    while timeout(Duration::from_millis(200), controller.control_rx.recv())
        .await
        .ok()
        .flatten()
        .is_some()
    {
        seen += 1;
        if seen >= 3 {
            break;
        }
    }
    assert!(seen >= 3, "send loop stalled while disconnected");

    // Peer returns; the link recovers promptly.
    controller.responding.store(true, Ordering::SeqCst);
    wait_for_state(&mut events.state, Duration::from_secs(2), "recovery", |s| {
        s.connected
    })
    .await;

    station.shutdown().await;
}

#[tokio::test]
async fn estop_reaches_the_wire_and_latches() {
    let mut controller = FakeController::bind().await;
    let (station, mut events) = spawn_station(controller.port, 1).await;
    controller.run(loopback(station.local_recv_addr().port()));

    wait_for_state(&mut events.state, Duration::from_secs(2), "link up", |s| {
        s.connected
    })
    .await;
    station.enable().await;
    wait_for_state(&mut events.state, Duration::from_secs(2), "enable", |s| {
        s.enabled
    })
    .await;

    station.estop().await;
    wait_for_state(&mut events.state, Duration::from_secs(2), "estop", |s| {
        s.estopped && !s.enabled
    })
    .await;

    // Drain stale datagrams, then every subsequent one must carry the
    // estop bit with enabled clear.
    while controller.control_rx.try_recv().is_ok() {}
    for _ in 0..5 {
        let datagram = timeout(Duration::from_millis(200), controller.control_rx.recv())
            .await
            .ok()
            .flatten()
            .expect("send loop stopped");
        let control = datagram[3];
        assert_ne!(control & CONTROL_ESTOP_BIT, 0, "estop bit missing");
        assert_eq!(control & CONTROL_ENABLED_BIT, 0, "enabled during estop");
    }

    // Enable cannot override the latch.
    station.enable().await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!events.state.borrow().enabled);

    station.shutdown().await;
}

#[tokio::test]
async fn request_date_triggers_one_dated_datagram() {
    let mut controller = FakeController::bind().await;
    let (station, mut events) = spawn_station(controller.port, 1).await;
    controller.run(loopback(station.local_recv_addr().port()));

    wait_for_state(&mut events.state, Duration::from_secs(2), "link up", |s| {
        s.connected
    })
    .await;

    // Let the first-round-trip date tag pass, then settle.
    tokio::time::sleep(Duration::from_millis(200)).await;
    while controller.control_rx.try_recv().is_ok() {}

    controller.request_date_once.store(true, Ordering::SeqCst);

    let mut dated = 0;
    for _ in 0..15 {
        let Some(datagram) =
            timeout(Duration::from_millis(200), controller.control_rx.recv())
                .await
                .ok()
                .flatten()
        else {
            break;
        };
        if has_tag(&datagram, TAG_DATETIME) {
            dated += 1;
        }
    }
    assert_eq!(dated, 1, "expected exactly one dated datagram");

    station.shutdown().await;
}

#[tokio::test]
async fn stream_stdout_survives_partial_reads() {
    let mut controller = FakeController::bind().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stream_port = listener.local_addr().unwrap().port();

    let (station, mut events) = spawn_station(controller.port, stream_port).await;
    controller.run(loopback(station.local_recv_addr().port()));

    let (mut tcp, _) = timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("stream channel never connected")
        .unwrap();

    // One stdout frame fed a byte at a time, with a trailing byte that
    // belongs to the next frame.
    for byte in [0x00u8, 0x06, 0x0C, b'h', b'i', b'!', b'\n', 0x00] {
        tcp.write_all(&[byte]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let line = timeout(Duration::from_secs(2), events.stdout.recv())
        .await
        .expect("no stdout message")
        .unwrap();
    assert_eq!(line, "hi!\n");

    // The trailing byte stayed buffered; complete the second frame.
    tcp.write_all(&[0x04, 0x00, b'm', b's', b'g']).await.unwrap();
    let message = timeout(Duration::from_secs(2), events.messages.recv())
        .await
        .expect("no stream message")
        .unwrap();
    assert_eq!(message, TcpMessage::Message("msg".to_string()));

    station.shutdown().await;
}

#[tokio::test]
async fn practice_sequence_drives_modes_over_the_wire() {
    let mut controller = FakeController::bind().await;
    let (station, mut events) = spawn_station(controller.port, 1).await;
    controller.run(loopback(station.local_recv_addr().port()));

    wait_for_state(&mut events.state, Duration::from_secs(2), "link up", |s| {
        s.connected
    })
    .await;

    station
        .send(open_station::station::Command::SetPracticeTiming(
            open_station::config::PracticeTiming {
                countdown_secs: 1,
                auto_secs: 1,
                delay_secs: 1,
                teleop_secs: 1,
            },
        ))
        .await;
    station
        .send(open_station::station::Command::StartPractice)
        .await;

    use open_station::practice::PracticePhase;
    wait_for_state(
        &mut events.state,
        Duration::from_secs(3),
        "autonomous phase",
        |s| s.practice_phase == PracticePhase::Autonomous && s.enabled,
    )
    .await;
    wait_for_state(
        &mut events.state,
        Duration::from_secs(3),
        "teleop phase",
        |s| s.practice_phase == PracticePhase::Teleop && s.enabled,
    )
    .await;
    let done = wait_for_state(
        &mut events.state,
        Duration::from_secs(3),
        "done phase",
        |s| s.practice_phase == PracticePhase::Done,
    )
    .await;
    assert!(!done.enabled);

    station.shutdown().await;
}
