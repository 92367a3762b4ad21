//! Integration tests for the WebSocket transport and the client
//! connector: handshake, send/receive, heartbeat, and reconnection
//! against a stub hub speaking the real wire protocol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use matchwire_protocol::{
    Codec, Envelope, JsonCodec, Message, PeerId,
};
use matchwire_transport::{
    ClientConfig, ClientTransport, Connection, ConnectionState,
    HeartbeatConfig, ReconnectPolicy, Transport, WebSocketTransport,
};

static NEXT_STUB_ID: AtomicU64 = AtomicU64::new(1);

/// Stub hub behavior knobs.
#[derive(Clone)]
struct StubOptions {
    /// Close this many connections right after their handshake (used to
    /// exercise the reconnect loop).
    drop_first_n: Arc<AtomicU64>,
}

impl StubOptions {
    fn new(drop_first_n: u64) -> Self {
        Self {
            drop_first_n: Arc::new(AtomicU64::new(drop_first_n)),
        }
    }
}

/// Starts a stub hub on a random port. It answers the CONNECT
/// handshake, echoes CHAT frames, and responds to PING with PONG.
async fn start_stub(options: StubOptions) -> String {
    let mut transport = WebSocketTransport::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = transport.local_addr().expect("local addr").to_string();

    tokio::spawn(async move {
        loop {
            let Ok(conn) = transport.accept().await else {
                break;
            };
            let options = options.clone();
            tokio::spawn(async move {
                handle_stub_connection(conn, options).await;
            });
        }
    });

    addr
}

async fn handle_stub_connection(
    conn: impl Connection,
    options: StubOptions,
) {
    let codec = JsonCodec;

    // Handshake.
    let Ok(Some(data)) = conn.recv().await else {
        return;
    };
    let Ok(hello) = codec.decode(&data) else {
        return;
    };
    let offered = match hello.message {
        Message::Connect { peer_id, .. } => peer_id,
        _ => return,
    };
    let assigned = if offered.is_unassigned() {
        PeerId(format!(
            "peer-stub-{}",
            NEXT_STUB_ID.fetch_add(1, Ordering::Relaxed)
        ))
    } else {
        offered
    };
    let ack = Envelope::new(
        Message::Connect {
            peer_id: assigned,
            status: Some("connected".into()),
        },
        PeerId::from("hub"),
    );
    let bytes = codec.encode(&ack).expect("encode ack");
    if conn.send(&bytes).await.is_err() {
        return;
    }

    // Optionally kill the connection straight after the handshake.
    if options
        .drop_first_n
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            n.checked_sub(1)
        })
        .is_ok()
    {
        let _ = conn.close().await;
        return;
    }

    // Serve: pong pings, echo chat.
    while let Ok(Some(data)) = conn.recv().await {
        let Ok(envelope) = codec.decode(&data) else {
            continue;
        };
        let reply = match envelope.message {
            Message::Ping { timestamp } => Envelope::new(
                Message::Pong { timestamp },
                PeerId::from("hub"),
            ),
            Message::Chat { .. } => envelope,
            Message::Disconnect { .. } => break,
            _ => continue,
        };
        let Ok(bytes) = codec.encode(&reply) else {
            continue;
        };
        if conn.send(&bytes).await.is_err() {
            break;
        }
    }
}

fn fast_config(addr: &str) -> ClientConfig {
    let mut config = ClientConfig::new(format!("ws://{addr}"));
    config.connect_timeout = Duration::from_secs(5);
    config.heartbeat = HeartbeatConfig {
        interval: Duration::from_millis(50),
        max_missed: 6,
    };
    config.reconnect = ReconnectPolicy {
        max_attempts: 5,
        backoff_step: Duration::from_millis(20),
    };
    config
}

/// Waits until the transport reports the wanted state, with a timeout.
async fn wait_for_state(
    transport: &ClientTransport,
    wanted: ConnectionState,
) {
    let mut rx = transport.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow() == wanted {
                return;
            }
            rx.changed().await.expect("state channel open");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {wanted:?}"));
}

#[tokio::test]
async fn test_connect_handshake_assigns_peer_id() {
    let addr = start_stub(StubOptions::new(0)).await;

    let (transport, _inbound) =
        ClientTransport::connect(fast_config(&addr), PeerId::default())
            .await
            .expect("connect");

    assert_eq!(transport.state(), ConnectionState::Connected);
    assert!(!transport.peer_id().is_unassigned());
}

#[tokio::test]
async fn test_offered_peer_id_is_kept() {
    let addr = start_stub(StubOptions::new(0)).await;

    let (transport, _inbound) = ClientTransport::connect(
        fast_config(&addr),
        PeerId::from("peer-stable"),
    )
    .await
    .expect("connect");

    assert_eq!(transport.peer_id(), PeerId::from("peer-stable"));
}

#[tokio::test]
async fn test_send_and_receive_round_trip() {
    let addr = start_stub(StubOptions::new(0)).await;

    let (transport, mut inbound) =
        ClientTransport::connect(fast_config(&addr), PeerId::default())
            .await
            .expect("connect");

    let chat = Envelope::new(
        Message::Chat {
            room_id: "r-1".into(),
            message: "hello".into(),
        },
        transport.peer_id(),
    );
    transport.send(chat).expect("send");

    let echoed = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("echo in time")
        .expect("inbound open");
    assert!(
        matches!(echoed.message, Message::Chat { ref message, .. } if message == "hello")
    );
}

#[tokio::test]
async fn test_heartbeat_feeds_latency_tracker() {
    let addr = start_stub(StubOptions::new(0)).await;

    let (transport, _inbound) =
        ClientTransport::connect(fast_config(&addr), PeerId::default())
            .await
            .expect("connect");

    // A few 50 ms heartbeat cycles must produce at least one pong.
    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.latency_ms().is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("latency estimate in time");

    let latency = transport.latency_ms().expect("some latency");
    assert!(latency >= 0.0);
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    // The stub closes connection #1 right after its handshake; the
    // client must notice the loss and come back on its own. Connection
    // #2 is served normally.
    let addr = start_stub(StubOptions::new(1)).await;

    let (transport, mut inbound) = ClientTransport::connect(
        fast_config(&addr),
        PeerId::from("peer-stable"),
    )
    .await
    .expect("connect");

    // Keep chatting until an echo proves a live stream again. Frames
    // sent into the dying first connection may be lost; retrying rides
    // out the reconnect window.
    let chat = Envelope::new(
        Message::Chat {
            room_id: "r-1".into(),
            message: "back".into(),
        },
        transport.peer_id(),
    );
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            transport.send(chat.clone()).expect("send");
            match tokio::time::timeout(
                Duration::from_millis(200),
                inbound.recv(),
            )
            .await
            {
                Ok(Some(env))
                    if matches!(env.message, Message::Chat { .. }) =>
                {
                    return;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("reconnected and echoed in time");

    // The peer id survived the reconnect.
    assert_eq!(transport.peer_id(), PeerId::from("peer-stable"));
    wait_for_state(&transport, ConnectionState::Connected).await;
}
