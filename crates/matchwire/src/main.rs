//! The Matchwire hub executable.
//!
//! Reads configuration from the environment, binds the configured TCP
//! port, and serves until terminated.
//!
//! Exit codes: 0 normal, 1 bind failure, 2 configuration error.

use matchwire::{init_logging, Hub, HubConfig};

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let config = match HubConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 2;
        }
    };

    init_logging();
    tracing::info!(
        port = config.port,
        idle_room_ttl_s = config.idle_room_ttl.as_secs(),
        matchmake_interval_ms = config.matchmake_interval.as_millis() as u64,
        room_sweep_interval_ms =
            config.room_sweep_interval.as_millis() as u64,
        "starting matchwire hub"
    );

    let hub = match Hub::bind(config).await {
        Ok(hub) => hub,
        Err(e) => {
            tracing::error!(error = %e, "bind failed");
            return 1;
        }
    };

    match hub.run().await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "hub terminated with error");
            1
        }
    }
}
