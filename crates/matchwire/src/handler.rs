//! Per-connection handler: handshake, dispatch loop, writer task, and
//! teardown.
//!
//! Each accepted connection gets its own Tokio task running
//! [`handle_connection`]. The flow is:
//!
//!   1. Receive CONNECT → register (or resume) the peer session, reply
//!      with the authoritative peer id.
//!   2. Spawn the writer task: every frame for this peer funnels
//!      through one bounded outbound queue with the critical-frame
//!      overflow policy.
//!   3. Loop: receive frames under the idle deadline, police parse
//!      errors and unknown tags, dispatch by message type.
//!   4. Tear down: a clean DISCONNECT frees everything immediately; a
//!      dropped connection starts the grace window instead (the room
//!      holds the seat, the session stays resumable).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use matchwire_matchmaker::MatchmakerError;
use matchwire_protocol::{
    now_ms, Codec, Envelope, ErrorCode, JsonCodec, MatchMode, Message,
    ParseErrorWindow, PeerId, ProtocolError, UnknownTypeThrottle,
};
use matchwire_room::{LeaveReason, RoomError, RoomRole};
use matchwire_session::PeerRole;
use matchwire_transport::{
    Connection, OutboundQueue, QueuePush, WebSocketConnection,
};

use crate::server::HubState;
use crate::HubError;

/// Deadline for the CONNECT handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle receive deadline. Clients heartbeat every 5 s; six missed
/// pings plus slack lands here, so a silent connection is declared
/// lost within the 30–35 s window.
const IDLE_TIMEOUT: Duration = Duration::from_secs(35);

enum Flow {
    Continue,
    CleanClose,
}

/// Handles a single connection from accept to teardown.
pub(crate) async fn handle_connection(
    conn: WebSocketConnection,
    hub: Arc<HubState>,
) -> Result<(), HubError> {
    let conn = Arc::new(conn);
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    let peer_id = perform_handshake(&conn, &hub).await?;
    tracing::info!(%conn_id, %peer_id, "peer connected");

    // One writer per peer: everything outbound goes through its
    // bounded queue.
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(Arc::clone(&conn), rx, hub.codec));
    hub.senders.lock().await.insert(peer_id.clone(), tx.clone());

    let mut parse_errors = ParseErrorWindow::default();
    let mut unknown_throttle = UnknownTypeThrottle::default();
    let mut clean = false;

    loop {
        let data =
            match tokio::time::timeout(IDLE_TIMEOUT, conn.recv()).await {
                Ok(Ok(Some(data))) => data,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    tracing::debug!(%peer_id, error = %e, "recv error");
                    break;
                }
                Err(_) => {
                    tracing::info!(%peer_id, "connection idle, declaring lost");
                    break;
                }
            };

        let envelope = match hub.codec.decode(&data) {
            Ok(envelope) => envelope,
            Err(ProtocolError::UnknownType(tag)) => {
                // Forward-compatibility event, not abuse: drop the
                // frame, warn at most once a minute.
                if unknown_throttle.should_warn() {
                    tracing::warn!(%peer_id, %tag, "UNKNOWN_TYPE frame dropped");
                }
                continue;
            }
            Err(e) => {
                tracing::debug!(%peer_id, error = %e, "undecodable frame");
                if parse_errors.record() {
                    // Straight to the socket: the connection is about
                    // to close and the verdict must beat it out.
                    let _ = send_direct(
                        &conn,
                        &hub.codec,
                        Message::Error {
                            code: ErrorCode::ProtocolError,
                            message: "too many malformed frames".into(),
                            details: None,
                        },
                        None,
                    )
                    .await;
                    break;
                }
                continue;
            }
        };

        hub.peers.lock().await.touch(&peer_id);

        match dispatch(&hub, &peer_id, &tx, envelope).await {
            Flow::Continue => {}
            Flow::CleanClose => {
                clean = true;
                break;
            }
        }
    }

    // -- Teardown -----------------------------------------------------

    hub.senders.lock().await.remove(&peer_id);
    hub.matchmaker.lock().await.cancel(&peer_id);

    if clean {
        let _ = hub
            .rooms
            .lock()
            .await
            .leave_room(&peer_id, LeaveReason::Left)
            .await;
        let _ = hub.peers.lock().await.clear_room(&peer_id);
        hub.peers.lock().await.remove(&peer_id);
        tracing::info!(%peer_id, "peer disconnected cleanly");
    } else {
        // The room holds the seat and the session stays resumable for
        // the grace window; the abandon timer and the sweeper take it
        // from here if the peer never returns.
        let _ = hub
            .rooms
            .lock()
            .await
            .leave_room(&peer_id, LeaveReason::ConnectionLost)
            .await;
        let _ = hub.peers.lock().await.disconnect(&peer_id);
        tracing::info!(%peer_id, "peer connection lost, grace window open");
    }

    let _ = conn.close().await;
    Ok(())
}

/// Receives CONNECT, registers (or resumes) the session, and replies
/// with the authoritative peer id.
async fn perform_handshake(
    conn: &Arc<WebSocketConnection>,
    hub: &Arc<HubState>,
) -> Result<PeerId, HubError> {
    let data = match tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.recv())
        .await
    {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            return Err(ProtocolError::InvalidMessage(
                "connection closed before handshake".into(),
            )
            .into());
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(ProtocolError::InvalidMessage(
                "handshake timed out".into(),
            )
            .into());
        }
    };

    let envelope = hub.codec.decode(&data)?;
    let message_id = envelope.message_id.clone();

    let offered = match envelope.message {
        Message::Connect { peer_id, .. } => peer_id,
        other => {
            let _ = send_direct(
                conn,
                &hub.codec,
                Message::Error {
                    code: ErrorCode::ProtocolError,
                    message: "first frame must be CONNECT".into(),
                    details: None,
                },
                message_id,
            )
            .await;
            return Err(ProtocolError::InvalidMessage(format!(
                "expected CONNECT, got {}",
                other.tag()
            ))
            .into());
        }
    };

    let (peer_id, outcome) = match hub.peers.lock().await.connect(offered)
    {
        Ok(result) => result,
        Err(e) => {
            let _ = send_direct(
                conn,
                &hub.codec,
                Message::Error {
                    code: ErrorCode::ProtocolError,
                    message: e.to_string(),
                    details: None,
                },
                message_id,
            )
            .await;
            return Err(e.into());
        }
    };
    tracing::debug!(%peer_id, ?outcome, "handshake complete");

    send_direct(
        conn,
        &hub.codec,
        Message::Connect {
            peer_id: peer_id.clone(),
            status: Some("connected".into()),
        },
        message_id,
    )
    .await?;

    Ok(peer_id)
}

/// Dispatches one inbound envelope.
async fn dispatch(
    hub: &Arc<HubState>,
    peer_id: &PeerId,
    tx: &mpsc::UnboundedSender<Envelope>,
    envelope: Envelope,
) -> Flow {
    let message_id = envelope.message_id.clone();

    match envelope.message {
        // -- Heartbeat --------------------------------------------------
        Message::Ping { timestamp } => {
            // The one-way gap between the peer's stamp and our receipt
            // is the only latency signal the protocol carries
            // server-side (clock-skew bound; the smoothed RTT lives on
            // the client).
            let observed = now_ms().saturating_sub(timestamp) as f64;
            hub.peers.lock().await.record_latency(peer_id, observed);
            reply(tx, Message::Pong { timestamp }, message_id);
        }

        // -- Connection lifecycle ----------------------------------------
        Message::Disconnect { .. } => return Flow::CleanClose,

        Message::Connect { .. } => {
            tracing::debug!(%peer_id, "duplicate CONNECT ignored");
        }

        // -- Rooms --------------------------------------------------------
        Message::CreateRoom { .. } => {
            create_and_host(hub, peer_id, tx, message_id).await;
        }

        Message::JoinRoom {
            room_id, spectate, ..
        } => {
            let result = {
                let mut rooms = hub.rooms.lock().await;
                if spectate {
                    rooms
                        .spectate_room(
                            peer_id.clone(),
                            room_id.clone(),
                            tx.clone(),
                        )
                        .await
                } else {
                    rooms
                        .join_room(
                            peer_id.clone(),
                            room_id.clone(),
                            tx.clone(),
                        )
                        .await
                }
            };

            match result {
                Ok(info) => {
                    let role = match info.role {
                        RoomRole::Host => PeerRole::Host,
                        RoomRole::Guest => PeerRole::Guest,
                        RoomRole::Spectator => PeerRole::Spectator,
                    };
                    // A rejoining peer kept its placement through the
                    // grace window; re-assignment is a no-op then.
                    let _ = hub.peers.lock().await.assign_room(
                        peer_id,
                        room_id.clone(),
                        role,
                    );
                    reply(
                        tx,
                        Message::RoomJoined {
                            room_id,
                            opponent_id: info.opponent_id,
                            peer_count: info.peer_count,
                        },
                        message_id,
                    );
                }
                Err(RoomError::NotFound(room_id)) => {
                    reply(tx, Message::RoomNotFound { room_id }, message_id);
                }
                Err(RoomError::RoomFull(room_id)) => {
                    reply(tx, Message::RoomFull { room_id }, message_id);
                }
                Err(e) => {
                    send_error(tx, room_error_code(&e), &e.to_string(), message_id);
                }
            }
        }

        Message::LeaveRoom { .. } => {
            let _ = hub
                .rooms
                .lock()
                .await
                .leave_room(peer_id, LeaveReason::Left)
                .await;
            let _ = hub.peers.lock().await.clear_room(peer_id);
        }

        // -- Gameplay -----------------------------------------------------
        Message::Move { token, .. } => {
            let result =
                hub.rooms.lock().await.route_move(peer_id, token).await;
            if let Err(e) = result {
                send_error(tx, room_error_code(&e), &e.to_string(), message_id);
            }
        }

        Message::StateSync {
            state: snapshot,
            delta,
            terminal,
            ..
        } => {
            let result = {
                let rooms = hub.rooms.lock().await;
                if let Some(snapshot) = snapshot {
                    rooms.route_snapshot(peer_id, snapshot, terminal).await
                } else if let Some(delta) = delta {
                    rooms.route_delta(peer_id, delta, terminal).await
                } else {
                    Ok(())
                }
            };
            if let Err(e) = result {
                send_error(tx, room_error_code(&e), &e.to_string(), message_id);
            }
        }

        Message::Chat { message, .. } => {
            if let Err(e) =
                hub.rooms.lock().await.route_chat(peer_id, message).await
            {
                tracing::debug!(%peer_id, error = %e, "chat dropped");
            }
        }

        // -- Matchmaking ----------------------------------------------------
        Message::FindMatch { mode } => match mode {
            MatchMode::Invite | MatchMode::Custom => {
                // These modes route through the room registry directly:
                // a private room the peer hands out by id.
                create_and_host(hub, peer_id, tx, message_id).await;
            }
            MatchMode::Random | MatchMode::Ranked => {
                let result = hub
                    .matchmaker
                    .lock()
                    .await
                    .enqueue(peer_id.clone(), mode);
                match result {
                    // Re-queuing is an idempotent ack.
                    Ok(())
                    | Err(MatchmakerError::AlreadyQueued(_)) => {
                        reply(tx, Message::MatchQueued { mode }, message_id);
                    }
                    Err(e) => {
                        send_error(
                            tx,
                            ErrorCode::ProtocolError,
                            &e.to_string(),
                            message_id,
                        );
                    }
                }
            }
        },

        Message::CancelMatch => {
            hub.matchmaker.lock().await.cancel(peer_id);
        }

        other => {
            tracing::debug!(%peer_id, tag = other.tag(), "ignoring frame");
        }
    }

    Flow::Continue
}

/// CREATE_ROOM (and the INVITE/CUSTOM matchmaking path): a fresh room
/// with this peer in the host slot.
async fn create_and_host(
    hub: &Arc<HubState>,
    peer_id: &PeerId,
    tx: &mpsc::UnboundedSender<Envelope>,
    message_id: Option<String>,
) {
    let result = {
        let mut rooms = hub.rooms.lock().await;
        let room_id = rooms.create_room();
        rooms
            .join_room(peer_id.clone(), room_id.clone(), tx.clone())
            .await
            .map(|_| room_id)
    };

    match result {
        Ok(room_id) => {
            let _ = hub.peers.lock().await.assign_room(
                peer_id,
                room_id.clone(),
                PeerRole::Host,
            );
            reply(tx, Message::RoomCreated { room_id }, message_id);
        }
        Err(e) => {
            send_error(tx, room_error_code(&e), &e.to_string(), message_id);
        }
    }
}

/// The writer task: drains the peer's channel through the bounded
/// outbound queue, enforcing the backpressure policy, and writes to
/// the socket.
async fn write_loop(
    conn: Arc<WebSocketConnection>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    codec: JsonCodec,
) {
    let mut queue = OutboundQueue::default();

    'outer: while let Some(envelope) = rx.recv().await {
        if !absorb(&mut queue, envelope) {
            backpressure_abort(&conn, &codec).await;
            return;
        }
        // Take whatever else is already waiting so the queue (not the
        // channel) is where ordering and dropping decisions happen.
        while let Ok(more) = rx.try_recv() {
            if !absorb(&mut queue, more) {
                backpressure_abort(&conn, &codec).await;
                return;
            }
        }

        while let Some(out) = queue.pop() {
            let bytes = match codec.encode(&out) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "outbound frame dropped");
                    continue;
                }
            };
            if conn.send(&bytes).await.is_err() {
                break 'outer;
            }
        }
    }
}

/// Pushes into the queue; `false` means critical overflow (abort).
fn absorb(queue: &mut OutboundQueue, envelope: Envelope) -> bool {
    match queue.push(envelope) {
        QueuePush::Queued => true,
        QueuePush::Displaced { dropped_tag } => {
            tracing::debug!(dropped_tag, "outbound queue displaced a frame");
            true
        }
        QueuePush::Rejected => {
            tracing::debug!("outbound queue rejected a non-critical frame");
            true
        }
        QueuePush::CriticalOverflow => false,
    }
}

async fn backpressure_abort(
    conn: &Arc<WebSocketConnection>,
    codec: &JsonCodec,
) {
    tracing::warn!("outbound queue full of critical frames, aborting");
    let _ = send_direct(
        conn,
        codec,
        Message::Error {
            code: ErrorCode::BackpressureAbort,
            message: "outbound queue overflow".into(),
            details: None,
        },
        None,
    )
    .await;
    let _ = conn.close().await;
}

/// Queues a hub-originated frame on the peer's writer.
fn reply(
    tx: &mpsc::UnboundedSender<Envelope>,
    message: Message,
    message_id: Option<String>,
) {
    let mut envelope = Envelope::new(message, PeerId::hub());
    envelope.message_id = message_id;
    let _ = tx.send(envelope);
}

fn send_error(
    tx: &mpsc::UnboundedSender<Envelope>,
    code: ErrorCode,
    message: &str,
    message_id: Option<String>,
) {
    reply(
        tx,
        Message::Error {
            code,
            message: message.to_string(),
            details: None,
        },
        message_id,
    );
}

/// Writes one frame straight to the socket (handshake path, before the
/// writer exists, and the backpressure abort).
async fn send_direct(
    conn: &Arc<WebSocketConnection>,
    codec: &JsonCodec,
    message: Message,
    message_id: Option<String>,
) -> Result<(), HubError> {
    let mut envelope = Envelope::new(message, PeerId::hub());
    envelope.message_id = message_id;
    let bytes = codec.encode(&envelope)?;
    conn.send(&bytes).await?;
    Ok(())
}

/// Maps room-layer failures onto wire error codes.
fn room_error_code(e: &RoomError) -> ErrorCode {
    match e {
        RoomError::NotFound(_)
        | RoomError::NotInRoom(_)
        | RoomError::Unavailable(_) => ErrorCode::RoomNotFound,
        RoomError::RoomFull(_) | RoomError::SpectatorsDisabled(_) => {
            ErrorCode::RoomFull
        }
        RoomError::NotYourTurn(_) => ErrorCode::NotYourTurn,
        RoomError::InvalidMove(_) | RoomError::NotAPlayer(_) => {
            ErrorCode::InvalidMove
        }
        RoomError::GameNotStarted | RoomError::GameFinished => {
            ErrorCode::GameNotStarted
        }
        RoomError::StaleSnapshot { .. } => ErrorCode::StaleSnapshot,
        RoomError::AlreadyInRoom(..) => ErrorCode::ProtocolError,
    }
}
