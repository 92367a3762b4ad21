//! Transport layer for Matchwire.
//!
//! The hub side is the [`Transport`]/[`Connection`] trait pair plus the
//! WebSocket implementation — an accept loop produces connections, each
//! of which is a full-duplex ordered byte stream.
//!
//! The peer side is [`ClientTransport`]: a connector that owns a single
//! cooperative event loop and layers the protocol's liveness machinery
//! on top of the raw stream — CONNECT handshake, 5 s heartbeat with RTT
//! smoothing, the bounded outbound queue with its
//! drop-oldest-non-critical overflow policy, and the 5-attempt reconnect
//! loop with linear backoff.

#![allow(async_fn_in_trait)]

mod client;
mod error;
mod latency;
mod queue;
mod websocket;

pub use client::{ClientConfig, ClientTransport, ConnectionState};
pub use error::TransportError;
pub use latency::{HeartbeatConfig, LatencyTracker, ReconnectPolicy};
pub use queue::{OutboundQueue, QueuePush, DEFAULT_OUTBOUND_CAPACITY};
pub use websocket::{WebSocketConnection, WebSocketTransport};

use std::fmt;

/// Opaque identifier for a server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;
}

/// A single connection that can send and receive frames.
pub trait Connection: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync;

    /// Sends one frame to the remote peer.
    async fn send(&self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receives the next frame. `Ok(None)` when the connection is
    /// cleanly closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;

    fn id(&self) -> ConnectionId;
}
