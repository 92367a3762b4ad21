//! # Matchwire
//!
//! The realtime coordination hub of a two-player turn-based match-3
//! battle game. The hub owns all authoritative session state: it pairs
//! players, routes move and state-sync traffic between them, answers
//! heartbeats, holds seats through transient disconnects, and sweeps
//! abandoned rooms. Game rules never enter this process — move tokens
//! and grid snapshots are opaque cargo.
//!
//! ## Layers
//!
//! ```text
//! matchwire (this crate: accept loop, per-peer handler, housekeeping)
//!   ├── matchwire-room        rooms + registry + sweeper
//!   ├── matchwire-matchmaker  FIFO pairing queue
//!   ├── matchwire-session     peer identity and presence
//!   ├── matchwire-transport   WebSocket accept path
//!   └── matchwire-protocol    the wire envelope
//! ```

mod config;
mod error;
mod handler;
mod server;

pub use config::{ConfigError, HubConfig};
pub use error::HubError;
pub use server::{Hub, HubBuilder};

/// Initializes process-wide tracing from `RUST_LOG`, defaulting to
/// `info`. Call once, from the binary only.
pub fn init_logging() {
    use tracing_subscriber::{
        fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}
