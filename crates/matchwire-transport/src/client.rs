//! Client-side connector: one cooperative event loop per peer.
//!
//! [`ClientTransport::connect`] establishes the stream, runs the CONNECT
//! handshake, and spawns the event loop. From then on the loop owns the
//! socket and multiplexes four concerns:
//!
//! - commands from the handle (send / set active room / close),
//! - inbound frames (PONGs feed the latency tracker, everything else is
//!   forwarded to the inbound channel),
//! - the 5 s heartbeat ticker (6 consecutive unanswered pings declare
//!   the connection lost),
//! - reconnection (up to 5 attempts, backoff 2 s × attempt, rehydrating
//!   the peer id and re-joining the active room).
//!
//! While the stream is down, sends land in the bounded outbound queue;
//! the queue's overflow policy protects critical frames.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use matchwire_protocol::{
    now_ms, Codec, Envelope, JsonCodec, Message, PeerId, RoomId,
};

use crate::{
    HeartbeatConfig, LatencyTracker, OutboundQueue, QueuePush,
    ReconnectPolicy, TransportError,
};

type ClientWs = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Observable connection state of a client transport.
///
/// ```text
/// Connecting → Connected → (Reconnecting → Connected)* → Disconnected | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// The reconnect loop exhausted its attempts, or backpressure
    /// aborted the connection. Terminal.
    Failed,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for a client transport.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the hub, e.g. `ws://127.0.0.1:8080`.
    pub url: String,
    /// Deadline for connection establishment and handshake. Default 10 s.
    pub connect_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectPolicy,
    /// Outbound queue capacity. Default 256.
    pub outbound_capacity: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
            outbound_capacity: crate::queue::DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum Command {
    Send(Envelope),
    SetActiveRoom(Option<RoomId>),
    Close,
}

/// Handle to a running client transport. Cheap to clone.
#[derive(Clone)]
pub struct ClientTransport {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    peer_rx: watch::Receiver<PeerId>,
    latency_rx: watch::Receiver<Option<f64>>,
}

impl ClientTransport {
    /// Connects to the hub, performs the CONNECT handshake, and spawns
    /// the event loop. Returns the handle plus the inbound envelope
    /// stream.
    ///
    /// `offered_peer_id` lets a restarting client present the id it was
    /// assigned earlier; pass `PeerId::default()` on a fresh start.
    pub async fn connect(
        config: ClientConfig,
        offered_peer_id: PeerId,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Envelope>), TransportError>
    {
        let (ws, peer_id) = establish(&config, &offered_peer_id).await?;
        tracing::info!(%peer_id, url = %config.url, "connected to hub");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let (peer_tx, peer_rx) = watch::channel(peer_id.clone());
        let (latency_tx, latency_rx) = watch::channel(None);

        let event_loop = EventLoop {
            queue: OutboundQueue::new(config.outbound_capacity),
            config,
            codec: JsonCodec,
            peer_id,
            active_room: None,
            outstanding_pings: 0,
            latency: LatencyTracker::new(),
            cmd_rx,
            inbound_tx,
            state_tx,
            peer_tx,
            latency_tx,
        };
        tokio::spawn(event_loop.run(ws));

        Ok((
            Self {
                cmd_tx,
                state_rx,
                peer_rx,
                latency_rx,
            },
            inbound_rx,
        ))
    }

    /// Queues an envelope for transmission. Queuing succeeds even while
    /// the stream is down; the overflow policy applies when the bounded
    /// queue fills.
    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.cmd_tx
            .send(Command::Send(envelope))
            .map_err(|_| TransportError::Closed)
    }

    /// Tells the transport which room to re-join after a reconnect
    /// (`None` clears it).
    pub fn set_active_room(&self, room: Option<RoomId>) {
        let _ = self.cmd_tx.send(Command::SetActiveRoom(room));
    }

    /// Closes the connection and stops the event loop.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch channel for state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The hub-assigned peer id (stable across reconnects).
    pub fn peer_id(&self) -> PeerId {
        self.peer_rx.borrow().clone()
    }

    /// Smoothed round-trip latency, or `None` before the first pong.
    pub fn latency_ms(&self) -> Option<f64> {
        *self.latency_rx.borrow()
    }

    /// Watch channel that updates on every pong.
    pub fn subscribe_latency(&self) -> watch::Receiver<Option<f64>> {
        self.latency_rx.clone()
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Dials the hub and runs the CONNECT handshake. Returns the open
/// stream and the hub-assigned peer id.
async fn establish(
    config: &ClientConfig,
    offered: &PeerId,
) -> Result<(ClientWs, PeerId), TransportError> {
    let codec = JsonCodec;

    let (mut ws, _) = tokio::time::timeout(
        config.connect_timeout,
        connect_async(config.url.as_str()),
    )
    .await
    .map_err(|_| TransportError::ConnectTimeout)?
    .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

    let hello = Envelope::new(
        Message::Connect {
            peer_id: offered.clone(),
            status: None,
        },
        offered.clone(),
    );
    send_envelope(&mut ws, &codec, &hello).await?;

    let reply =
        tokio::time::timeout(config.connect_timeout, next_envelope(&mut ws, &codec))
            .await
            .map_err(|_| TransportError::ConnectTimeout)??;

    match reply.message {
        Message::Connect { peer_id, status }
            if status.as_deref() == Some("connected") =>
        {
            Ok((ws, peer_id))
        }
        other => Err(TransportError::HandshakeFailed(format!(
            "expected CONNECT ack, got {}",
            other.tag()
        ))),
    }
}

async fn send_envelope(
    ws: &mut ClientWs,
    codec: &JsonCodec,
    envelope: &Envelope,
) -> Result<(), TransportError> {
    let bytes = codec
        .encode(envelope)
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|e| {
        TransportError::SendFailed(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            e,
        ))
    })?;
    ws.send(WsMessage::Text(text.into())).await.map_err(|e| {
        TransportError::SendFailed(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            e,
        ))
    })
}

/// Reads frames until one decodes as an envelope, skipping ws-level
/// control frames.
async fn next_envelope(
    ws: &mut ClientWs,
    codec: &JsonCodec,
) -> Result<Envelope, TransportError> {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                return codec.decode(text.as_bytes()).map_err(|e| {
                    TransportError::HandshakeFailed(e.to_string())
                });
            }
            Some(Ok(WsMessage::Binary(data))) => {
                return codec.decode(&data).map_err(|e| {
                    TransportError::HandshakeFailed(e.to_string())
                });
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(TransportError::Closed);
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(TransportError::ReceiveFailed(
                    std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    ),
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Why `drive` returned.
enum Driven {
    /// Close requested, or the inbound consumer went away.
    Closed,
    /// Stream lost — attempt reconnection.
    Lost,
    /// Backpressure abort — terminal.
    Aborted,
}

/// Outcome of the reconnect loop.
enum Reconnect {
    Restored(ClientWs),
    GaveUp,
    Closed,
}

/// Outcome of draining commands while the stream is down.
enum Absorb {
    Continue,
    Close,
    Abort,
}

struct EventLoop {
    config: ClientConfig,
    codec: JsonCodec,
    peer_id: PeerId,
    active_room: Option<RoomId>,
    queue: OutboundQueue,
    outstanding_pings: u32,
    latency: LatencyTracker,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    state_tx: watch::Sender<ConnectionState>,
    peer_tx: watch::Sender<PeerId>,
    latency_tx: watch::Sender<Option<f64>>,
}

impl EventLoop {
    async fn run(mut self, ws: ClientWs) {
        let mut ws = Some(ws);
        loop {
            let stream = match ws.take() {
                Some(s) => s,
                None => match self.reconnect().await {
                    Reconnect::Restored(s) => s,
                    Reconnect::GaveUp => {
                        tracing::warn!(peer_id = %self.peer_id, "reconnect exhausted");
                        let _ = self.state_tx.send(ConnectionState::Failed);
                        return;
                    }
                    Reconnect::Closed => {
                        let _ =
                            self.state_tx.send(ConnectionState::Disconnected);
                        return;
                    }
                },
            };

            match self.drive(stream).await {
                Driven::Closed => {
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    return;
                }
                Driven::Lost => {
                    tracing::info!(peer_id = %self.peer_id, "connection lost");
                    let _ = self.state_tx.send(ConnectionState::Reconnecting);
                    // ws stays None → next iteration reconnects.
                }
                Driven::Aborted => {
                    let _ = self.state_tx.send(ConnectionState::Failed);
                    return;
                }
            }
        }
    }

    /// Multiplexes commands, inbound frames, and the heartbeat over one
    /// live stream. Returns when the stream is lost or the loop should
    /// stop.
    async fn drive(&mut self, mut ws: ClientWs) -> Driven {
        // Frames queued while the stream was down go out first.
        match self.flush(&mut ws).await {
            Ok(()) => {}
            Err(_) => return Driven::Lost,
        }

        let mut heartbeat =
            tokio::time::interval(self.config.heartbeat.interval);
        heartbeat
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; consume
        // it so the heartbeat cadence starts one interval from now.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        None | Some(Command::Close) => {
                            let _ = ws.close(None).await;
                            return Driven::Closed;
                        }
                        Some(Command::SetActiveRoom(room)) => {
                            self.active_room = room;
                        }
                        Some(Command::Send(envelope)) => {
                            match self.queue.push(envelope) {
                                QueuePush::Queued | QueuePush::Displaced { .. } => {}
                                QueuePush::Rejected => {
                                    tracing::warn!("outbound queue rejected frame");
                                }
                                QueuePush::CriticalOverflow => {
                                    tracing::error!("outbound queue full of critical frames, aborting");
                                    let _ = ws.close(None).await;
                                    return Driven::Aborted;
                                }
                            }
                            if self.flush(&mut ws).await.is_err() {
                                return Driven::Lost;
                            }
                        }
                    }
                }

                frame = ws.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            if !self.handle_inbound(text.as_bytes()) {
                                return Driven::Closed;
                            }
                        }
                        Some(Ok(WsMessage::Binary(data))) => {
                            if !self.handle_inbound(&data) {
                                return Driven::Closed;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return Driven::Lost;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "receive error");
                            return Driven::Lost;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if self.outstanding_pings >= self.config.heartbeat.max_missed {
                        tracing::warn!(
                            missed = self.outstanding_pings,
                            "heartbeat missed too many pongs"
                        );
                        return Driven::Lost;
                    }
                    let ping = Envelope::new(
                        Message::Ping { timestamp: now_ms() },
                        self.peer_id.clone(),
                    );
                    self.outstanding_pings += 1;
                    if send_envelope(&mut ws, &self.codec, &ping).await.is_err() {
                        return Driven::Lost;
                    }
                }
            }
        }
    }

    /// Decodes one inbound frame. PONGs feed the latency tracker and
    /// are swallowed; every other envelope is forwarded. Returns `false`
    /// when the inbound consumer is gone.
    fn handle_inbound(&mut self, data: &[u8]) -> bool {
        let envelope = match self.codec.decode(data) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(error = %e, "dropping undecodable frame");
                return true;
            }
        };

        if let Message::Pong { timestamp } = envelope.message {
            let sample = now_ms().saturating_sub(timestamp) as f64;
            self.latency.record(sample);
            self.outstanding_pings = 0;
            let _ = self.latency_tx.send(self.latency.latency_ms());
            return true;
        }

        self.inbound_tx.send(envelope).is_ok()
    }

    /// Writes out everything in the queue. On failure the unsent frame
    /// is put back at the head.
    async fn flush(&mut self, ws: &mut ClientWs) -> Result<(), TransportError> {
        while let Some(envelope) = self.queue.pop() {
            if let Err(e) = send_envelope(ws, &self.codec, &envelope).await {
                self.queue.push_front(envelope);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Runs the reconnect schedule. Between attempts, queued sends are
    /// absorbed so the outbound queue (not the command channel) applies
    /// backpressure while the stream is down.
    async fn reconnect(&mut self) -> Reconnect {
        for attempt in 1..=self.config.reconnect.max_attempts {
            match self.absorb_commands() {
                Absorb::Continue => {}
                Absorb::Close => return Reconnect::Closed,
                Absorb::Abort => return Reconnect::GaveUp,
            }

            let delay = self
                .config
                .reconnect
                .delay(attempt)
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;

            tracing::info!(attempt, peer_id = %self.peer_id, "reconnecting");
            match establish(&self.config, &self.peer_id).await {
                Ok((ws, assigned)) => {
                    self.peer_id = assigned.clone();
                    let _ = self.peer_tx.send(assigned);
                    self.outstanding_pings = 0;

                    // Re-enter the room that was active before the drop,
                    // ahead of anything already queued.
                    if let Some(room_id) = self.active_room.clone() {
                        let rejoin = Envelope::new(
                            Message::JoinRoom {
                                room_id,
                                peer_id: self.peer_id.clone(),
                                spectate: false,
                            },
                            self.peer_id.clone(),
                        );
                        self.queue.push_front(rejoin);
                    }

                    let _ = self.state_tx.send(ConnectionState::Connected);
                    tracing::info!(peer_id = %self.peer_id, "reconnected");
                    return Reconnect::Restored(ws);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
        Reconnect::GaveUp
    }

    /// Drains pending commands without blocking, so the bounded queue
    /// (not the command channel) applies backpressure while down.
    fn absorb_commands(&mut self) -> Absorb {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(Command::Close) => return Absorb::Close,
                Ok(Command::SetActiveRoom(room)) => self.active_room = room,
                Ok(Command::Send(envelope)) => {
                    if self.queue.push(envelope)
                        == QueuePush::CriticalOverflow
                    {
                        // Terminal even while down: the queue is full
                        // of frames that must not be dropped, and
                        // there is no stream to drain them into.
                        return Absorb::Abort;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    return Absorb::Continue
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Absorb::Close
                }
            }
        }
    }
}
