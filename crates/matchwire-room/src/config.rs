//! Room configuration.

use std::time::Duration;

/// Configuration applied to every room a registry creates.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// How long a room holds a disconnected player's slot before
    /// terminating the match as abandoned. Default 30 s.
    pub reconnect_grace: Duration,

    /// How long a room may sit with no players and no spectators
    /// before the sweeper removes it. Default 60 s.
    pub empty_ttl: Duration,

    /// Maximum age of a room regardless of occupancy. Default 1 h.
    pub idle_ttl: Duration,

    /// Whether spectators may join.
    pub allow_spectators: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: Duration::from_secs(30),
            empty_ttl: Duration::from_secs(60),
            idle_ttl: Duration::from_secs(3600),
            allow_spectators: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RoomConfig::default();
        assert_eq!(config.reconnect_grace.as_secs(), 30);
        assert_eq!(config.empty_ttl.as_secs(), 60);
        assert_eq!(config.idle_ttl.as_secs(), 3600);
        assert!(config.allow_spectators);
    }
}
