//! The live link: fixed-rate send loop, telemetry receive loop, and the
//! framed stream channel, each a long-lived tokio task.
//!
//! The send loop schedules ticks from the ideal wall clock, so a late tick
//! never slows the long-term 50 Hz rate. The receive loop alone gates
//! liveness; datagram sockets stay up across disconnects and the loop keeps
//! transmitting so control resumes the instant the peer returns.

use chrono::Utc;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::resolve::{backoff_delay, resolve};
use super::{ConnectionError, InboundReport, LinkConfig, LinkEvent, LinkState};
use crate::protocol::{parse_status_packet, stream, ControlPacket, FrameReader};
use crate::station::state::{lock_shared, SharedHandle};

/// EWMA weight for trip-time samples.
const TRIP_TIME_ALPHA: f64 = 0.2;

/// Outstanding send timestamps kept for trip-time matching.
const PENDING_LIMIT: usize = 1024;

type PendingSends = Arc<Mutex<HashMap<u16, Instant>>>;

#[derive(Debug, Clone)]
enum Retarget {
    Set { team: u16, use_usb: bool },
}

/// Handle to the connection tasks.
pub struct LinkHandle {
    retarget_tx: mpsc::Sender<Retarget>,
    stream_out_tx: mpsc::Sender<Vec<u8>>,
    local_recv_addr: SocketAddr,
}

impl LinkHandle {
    /// Bind the sockets and start the send, receive, and stream tasks.
    ///
    /// Bind failures here are fatal: the engine refuses to start without
    /// its datagram channels.
    pub async fn spawn(
        shared: SharedHandle,
        event_tx: mpsc::Sender<LinkEvent>,
        config: LinkConfig,
        team: u16,
        use_usb: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ConnectionError> {
        let recv_socket = UdpSocket::bind(("0.0.0.0", config.telemetry_port))
            .await
            .map_err(|e| ConnectionError::Bind(format!("telemetry port: {e}")))?;
        let send_socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| ConnectionError::Bind(format!("control socket: {e}")))?;
        let local_recv_addr = recv_socket
            .local_addr()
            .map_err(|e| ConnectionError::Bind(e.to_string()))?;
        info!("Telemetry socket bound on {local_recv_addr}");

        let initial_target = match config.target_override {
            Some(addr) => addr,
            None => {
                let _ = event_tx.send(LinkEvent::State(LinkState::Resolving)).await;
                resolve(team, use_usb, config.resolve_timeout).await
            }
        };
        let (target_tx, target_rx) = watch::channel(initial_target);

        let (retarget_tx, retarget_rx) = mpsc::channel(8);
        let (stream_out_tx, stream_out_rx) = mpsc::channel(64);
        let pending: PendingSends = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(resolver_task(
            retarget_rx,
            target_tx,
            event_tx.clone(),
            config.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(send_task(
            send_socket,
            shared.clone(),
            target_rx.clone(),
            pending.clone(),
            config.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(recv_task(
            recv_socket,
            shared,
            event_tx.clone(),
            pending,
            config.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(stream_task(
            target_rx,
            stream_out_rx,
            event_tx,
            config,
            shutdown,
        ));

        Ok(Self {
            retarget_tx,
            stream_out_tx,
            local_recv_addr,
        })
    }

    /// Re-resolve after a team-number or USB-mode change.
    pub fn retarget(&self, team: u16, use_usb: bool) {
        if self
            .retarget_tx
            .try_send(Retarget::Set { team, use_usb })
            .is_err()
        {
            warn!("Resolver not accepting retarget requests");
        }
    }

    /// Queue a frame for the stream channel. Dropped (with a log) when the
    /// stream is down and the queue fills; stream traffic is advisory.
    pub fn send_stream_frame(&self, frame: Vec<u8>) {
        if self.stream_out_tx.try_send(frame).is_err() {
            debug!("Stream outbound queue full, dropping frame");
        }
    }

    /// Local address of the telemetry socket (useful with an ephemeral port).
    pub fn local_recv_addr(&self) -> SocketAddr {
        self.local_recv_addr
    }
}

/// Re-resolves the target on demand; the resolved address feeds the send
/// and stream tasks through a watch channel.
async fn resolver_task(
    mut retarget_rx: mpsc::Receiver<Retarget>,
    target_tx: watch::Sender<IpAddr>,
    event_tx: mpsc::Sender<LinkEvent>,
    config: LinkConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            request = retarget_rx.recv() => {
                let Some(Retarget::Set { team, use_usb }) = request else {
                    break;
                };
                let _ = event_tx.send(LinkEvent::State(LinkState::Resolving)).await;
                let addr = match config.target_override {
                    Some(addr) => addr,
                    None => resolve(team, use_usb, config.resolve_timeout).await,
                };
                info!("Control target is now {addr}");
                let _ = target_tx.send(addr);
            }
        }
    }
}

/// The 50 Hz control emitter.
async fn send_task(
    socket: UdpSocket,
    shared: SharedHandle,
    target_rx: watch::Receiver<IpAddr>,
    pending: PendingSends,
    config: LinkConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Send loop running at {:?} period", config.send_period);
    let mut sequence: u16 = 0;
    let mut next_tick = Instant::now() + config.send_period;

    loop {
        tokio::select! {
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    // One final datagram with the robot disabled.
                    let mut snapshot = lock_shared(&shared).take_send_snapshot();
                    snapshot.control.enabled = false;
                    let packet = ControlPacket {
                        sequence,
                        control: snapshot.control,
                        request: snapshot.request,
                        alliance: snapshot.alliance,
                        joysticks: Vec::new(),
                        countdown: None,
                        timestamp: None,
                        timezone: None,
                    };
                    let target = SocketAddr::new(*target_rx.borrow(), config.control_port);
                    let _ = socket.send_to(&packet.encode(), target).await;
                    info!("Send loop stopped after final disable datagram");
                    break;
                }
            }
            _ = sleep_until(next_tick) => {
                // Schedule from the ideal clock; if we fell behind, skip the
                // missed grid points instead of compounding the delay.
                next_tick += config.send_period;
                let now = Instant::now();
                while next_tick < now {
                    next_tick += config.send_period;
                }

                let snapshot = lock_shared(&shared).take_send_snapshot();
                let packet = ControlPacket {
                    sequence,
                    control: snapshot.control,
                    request: snapshot.request,
                    alliance: snapshot.alliance,
                    joysticks: snapshot.joysticks,
                    countdown: snapshot.countdown,
                    timestamp: snapshot.send_date.then(Utc::now),
                    timezone: snapshot.send_date.then(|| "UTC".to_string()),
                };

                let target = SocketAddr::new(*target_rx.borrow(), config.control_port);
                match socket.send_to(&packet.encode(), target).await {
                    Ok(_) => record_send(&pending, sequence, now),
                    Err(e) => debug!("Control send to {target} failed: {e}"),
                }
                sequence = sequence.wrapping_add(1);
            }
        }
    }
}

fn record_send(pending: &PendingSends, sequence: u16, at: Instant) {
    let mut table = pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    // A silent peer never matches entries; keep the table bounded.
    if table.len() >= PENDING_LIMIT {
        table.clear();
    }
    table.insert(sequence, at);
}

/// Telemetry receiver: parses inbound datagrams, derives trip time and loss,
/// and drives the liveness state machine.
async fn recv_task(
    socket: UdpSocket,
    shared: SharedHandle,
    event_tx: mpsc::Sender<LinkEvent>,
    pending: PendingSends,
    config: LinkConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 2048];
    let mut state = LinkState::Resolving;
    let mut last_received: Option<Instant> = None;
    let mut last_sequence: Option<u16> = None;
    let mut trip_time_ms: f64 = 0.0;
    let mut lost_packets: u32 = 0;
    let mut first_round_trip_done = false;

    loop {
        tokio::select! {
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = timeout(config.recv_timeout, socket.recv_from(&mut buf)) => {
                match received {
                    Ok(Ok((len, _peer))) => {
                        let packet = match parse_status_packet(&buf[..len]) {
                            Ok(packet) => packet,
                            Err(e) => {
                                debug!("Dropping malformed telemetry datagram: {e}");
                                continue;
                            }
                        };
                        let now = Instant::now();
                        last_received = Some(now);

                        // Trip time from the matching outbound timestamp.
                        let sent_at = {
                            let mut table = pending
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                            table.remove(&packet.sequence)
                        };
                        if let Some(sent_at) = sent_at {
                            let sample = now.duration_since(sent_at).as_secs_f64() * 1000.0;
                            trip_time_ms = if trip_time_ms == 0.0 {
                                sample
                            } else {
                                TRIP_TIME_ALPHA * sample + (1.0 - TRIP_TIME_ALPHA) * trip_time_ms
                            };
                            if !first_round_trip_done {
                                first_round_trip_done = true;
                                lock_shared(&shared).send_date = true;
                            }
                        }

                        // Sequence gaps count as lost datagrams.
                        if let Some(last) = last_sequence {
                            let gap = packet.sequence.wrapping_sub(last.wrapping_add(1));
                            if gap != 0 && gap < 0x8000 {
                                lost_packets += gap as u32;
                            }
                        }
                        last_sequence = Some(packet.sequence);

                        if packet.request_date {
                            lock_shared(&shared).send_date = true;
                        }

                        let next_state = if packet.status.code_initializing {
                            LinkState::Connected
                        } else {
                            LinkState::CodeRunning
                        };
                        if next_state != state {
                            if !state.is_connected() {
                                info!("Controller link up");
                            }
                            state = next_state;
                            let _ = event_tx.try_send(LinkEvent::State(state));
                        }

                        let report = InboundReport {
                            packet,
                            trip_time_ms,
                            lost_packets,
                        };
                        if event_tx.try_send(LinkEvent::Inbound(report)).is_err() {
                            debug!("Coordinator busy, dropping telemetry report");
                        }
                    }
                    Ok(Err(e)) => warn!("Telemetry receive error: {e}"),
                    Err(_) => {} // receive timeout; liveness checked below
                }

                let silent_for = last_received.map(|at| at.elapsed());
                let expired = match silent_for {
                    Some(silence) => silence >= config.liveness_timeout,
                    None => false,
                };
                if expired && state != LinkState::Disconnected {
                    warn!(
                        "No telemetry for {:?}, marking link down",
                        config.liveness_timeout
                    );
                    state = LinkState::Disconnected;
                    last_sequence = None;
                    let _ = event_tx.try_send(LinkEvent::State(state));
                }
            }
        }
    }
}

/// Stream channel: connects once a target exists, reads frames, reconnects
/// with backoff on its own without touching the datagram state.
async fn stream_task(
    target_rx: watch::Receiver<IpAddr>,
    mut stream_out_rx: mpsc::Receiver<Vec<u8>>,
    event_tx: mpsc::Sender<LinkEvent>,
    config: LinkConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let target = SocketAddr::new(*target_rx.borrow(), config.stream_port);
        match timeout(config.stream_connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(tcp)) => {
                info!("Stream channel connected to {target}");
                attempt = 0;
                let _ = event_tx.send(LinkEvent::StreamConnected).await;
                let finished = run_stream(
                    tcp,
                    &mut stream_out_rx,
                    &event_tx,
                    &config,
                    &mut shutdown,
                )
                .await;
                if finished {
                    break;
                }
                info!("Stream channel lost, reconnecting");
            }
            Ok(Err(e)) => debug!("Stream connect to {target} failed: {e}"),
            Err(_) => debug!("Stream connect to {target} timed out"),
        }

        let delay = backoff_delay(attempt, config.backoff_initial, config.backoff_cap);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = sleep(delay) => {}
        }
    }
}

/// Drive one connected stream until it drops. Returns true on shutdown.
async fn run_stream(
    mut tcp: TcpStream,
    stream_out_rx: &mut mpsc::Receiver<Vec<u8>>,
    event_tx: &mpsc::Sender<LinkEvent>,
    config: &LinkConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut reader = FrameReader::new();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
            Some(frame) = stream_out_rx.recv() => {
                if let Err(e) = tcp.write_all(&frame).await {
                    warn!("Stream write failed: {e}");
                    return false;
                }
            }
            read = timeout(config.stream_read_timeout, tcp.read(&mut buf)) => {
                match read {
                    Ok(Ok(0)) => {
                        info!("Stream closed by controller");
                        return false;
                    }
                    Ok(Ok(n)) => {
                        reader.feed(&buf[..n]);
                        while let Some((tag, payload)) = reader.next_frame() {
                            match stream::parse_stream_message(tag, &payload) {
                                Some(message) => {
                                    if event_tx.try_send(LinkEvent::Stream(message)).is_err() {
                                        debug!("Coordinator busy, dropping stream message");
                                    }
                                }
                                None => debug!("Ignoring stream frame with tag 0x{tag:02x}"),
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("Stream read failed: {e}");
                        return false;
                    }
                    Err(_) => {
                        warn!("Stream idle past {:?}, reconnecting", config.stream_read_timeout);
                        return false;
                    }
                }
            }
        }
    }
}
