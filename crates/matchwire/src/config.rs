//! Hub configuration, read from the environment.

use std::time::Duration;

/// A configuration variable failed to parse.
#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {name}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}

/// Hub settings. Every knob has an environment variable and a default;
/// an unset variable takes the default, a malformed one is a
/// [`ConfigError`] (the binary exits 2).
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// `PORT` — TCP port to bind. Default 8080.
    pub port: u16,
    /// `IDLE_ROOM_TTL_SECONDS` — maximum room age. Default 3600.
    pub idle_room_ttl: Duration,
    /// `MATCHMAKE_INTERVAL_MS` — pairing-queue drain cadence.
    /// Default 2000.
    pub matchmake_interval: Duration,
    /// `ROOM_SWEEP_INTERVAL_MS` — registry sweeper cadence.
    /// Default 30000.
    pub room_sweep_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            idle_room_ttl: Duration::from_secs(3600),
            matchmake_interval: Duration::from_millis(2000),
            room_sweep_interval: Duration::from_millis(30_000),
        }
    }
}

impl HubConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: read_env("PORT", 8080)?,
            idle_room_ttl: Duration::from_secs(read_env(
                "IDLE_ROOM_TTL_SECONDS",
                3600,
            )?),
            matchmake_interval: Duration::from_millis(read_env(
                "MATCHMAKE_INTERVAL_MS",
                2000,
            )?),
            room_sweep_interval: Duration::from_millis(read_env(
                "ROOM_SWEEP_INTERVAL_MS",
                30_000,
            )?),
        })
    }
}

fn read_env<T: std::str::FromStr>(
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError {
            name,
            value,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.idle_room_ttl.as_secs(), 3600);
        assert_eq!(config.matchmake_interval.as_millis(), 2000);
        assert_eq!(config.room_sweep_interval.as_millis(), 30_000);
    }

    // Environment-variable behavior is covered via `read_env` directly;
    // mutating the process environment in parallel tests is racy.

    #[test]
    fn test_read_env_parses_and_rejects() {
        std::env::set_var("MATCHWIRE_TEST_PORT_OK", "9001");
        assert_eq!(
            read_env::<u16>("MATCHWIRE_TEST_PORT_OK", 1).unwrap(),
            9001
        );

        std::env::set_var("MATCHWIRE_TEST_PORT_BAD", "not-a-port");
        let err = read_env::<u16>("MATCHWIRE_TEST_PORT_BAD", 1).unwrap_err();
        assert_eq!(err.name, "MATCHWIRE_TEST_PORT_BAD");
        assert_eq!(err.value, "not-a-port");

        assert_eq!(
            read_env::<u16>("MATCHWIRE_TEST_PORT_UNSET", 7)
                .unwrap(),
            7
        );
    }
}
