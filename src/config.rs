//! Runtime tunables, optionally loaded from a JSON file. Every field has a default, so an empty
//! document (or no file at all) gives the stock behavior.

use std::{fs, io, num::NonZeroU32, path::Path, time::Duration};

use pathlink_arq::ArqConfig;
use serde::Deserialize;
use thiserror::Error;

/// The default port the device listens on for direct connections.
pub const DEFAULT_DIRECT_PORT: u16 = 60006;

/// The default port sessions are opened to on the device's side.
pub const DEFAULT_TARGET_PORT: u16 = 8080;

/// The default local address the proxy front-end listens on.
pub const DEFAULT_PROXY_LISTEN: &str = "127.0.0.1:8081";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] io::Error),

    #[error("malformed config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Lower bound of the jittered delay before a stream tunnel reconnects.
    #[serde(with = "millis")]
    pub reconnect_min: Duration,

    /// Upper bound of the jittered delay before a stream tunnel reconnects.
    #[serde(with = "millis")]
    pub reconnect_max: Duration,

    /// How long a stream tunnel may stay connecting before the attempt counts as failed.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,

    /// Time between punch datagrams.
    #[serde(with = "millis")]
    pub punch_interval: Duration,

    /// Punch datagrams sent before giving up, the first one included.
    pub max_punch_attempts: NonZeroU32,

    /// Period of the UDP heartbeats, both to the peer and to the probe server.
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,

    /// Period of the heartbeat frames on ready stream tunnels.
    #[serde(with = "millis")]
    pub stream_heartbeat_interval: Duration,

    /// Period of the reliable stream's clock ticks.
    #[serde(with = "millis")]
    pub arq_tick_interval: Duration,

    pub arq: ArqConfig,
}

impl TunnelConfig {
    pub fn new() -> Self {
        Self {
            reconnect_min: Duration::from_secs(3),
            reconnect_max: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            punch_interval: Duration::from_secs(1),
            max_punch_attempts: NonZeroU32::MIN.saturating_add(9),
            heartbeat_interval: Duration::from_secs(10),
            stream_heartbeat_interval: Duration::from_secs(30),
            arq_tick_interval: Duration::from_millis(40),
            arq: ArqConfig::new(),
        }
    }

    /// Reads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read(path)?;
        let config: Self = serde_json::from_slice(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect_min > self.reconnect_max {
            return Err(ConfigError::Invalid("reconnect_min is greater than reconnect_max"));
        }

        let intervals = [
            self.connect_timeout,
            self.punch_interval,
            self.heartbeat_interval,
            self.stream_heartbeat_interval,
            self.arq_tick_interval,
        ];

        if intervals.iter().any(Duration::is_zero) {
            return Err(ConfigError::Invalid("timeouts and intervals must be greater than zero"));
        }

        Ok(())
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self::new()
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
