//! Runtime configuration parsed from environment variables.
//!
//! Every knob has a typed default so an empty environment yields a working
//! manager pointed at a local development origin.

use std::time::Duration;

use crate::endpoint::PageOrigin;
use crate::error::RealtimeError;

pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:8000";
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

// =============================================================================
// BACKOFF
// =============================================================================

/// Exponential reconnection policy shared by every connection of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Attempts allowed before the connection is reported lost.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

// =============================================================================
// CONNECTION OPTIONS
// =============================================================================

/// Per-connection behavior, supplied to `Registry::connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Schedule reconnection after an abnormal closure.
    pub auto_reconnect: bool,
    /// Send keep-alive pings while open.
    pub heartbeat: bool,
    pub heartbeat_interval: Duration,
    /// Subprotocols offered during the handshake.
    pub protocols: Vec<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            heartbeat: true,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            protocols: Vec::new(),
        }
    }
}

impl ConnectionOptions {
    #[must_use]
    pub fn with_protocols(mut self, protocols: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = false;
        self
    }

    #[must_use]
    pub fn without_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }
}

// =============================================================================
// REALTIME CONFIG
// =============================================================================

/// Registry-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Origin of the hosting application; selects host and transport scheme.
    pub origin: PageOrigin,
    pub backoff: BackoffConfig,
    /// Defaults applied to connections opened without explicit options.
    pub connection: ConnectionOptions,
}

impl RealtimeConfig {
    /// Build config with default policies for the given origin.
    #[must_use]
    pub fn new(origin: PageOrigin) -> Self {
        Self { origin, backoff: BackoffConfig::default(), connection: ConnectionOptions::default() }
    }

    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `REALTIME_ORIGIN`: default `http://127.0.0.1:8000`
    /// - `REALTIME_RECONNECT_BASE_MS`: default 1000
    /// - `REALTIME_MAX_RECONNECT_ATTEMPTS`: default 5
    /// - `REALTIME_HEARTBEAT_INTERVAL_MS`: default 30000
    /// - `REALTIME_AUTO_RECONNECT`: default true
    /// - `REALTIME_HEARTBEAT`: default true
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidOrigin`] when `REALTIME_ORIGIN` is not
    /// an `http://` or `https://` origin.
    pub fn from_env() -> Result<Self, RealtimeError> {
        let origin = std::env::var("REALTIME_ORIGIN").unwrap_or_else(|_| DEFAULT_ORIGIN.to_owned());
        let origin = PageOrigin::parse(&origin)?;

        let backoff = BackoffConfig {
            base_delay: Duration::from_millis(env_parse("REALTIME_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS)),
            max_attempts: env_parse("REALTIME_MAX_RECONNECT_ATTEMPTS", DEFAULT_MAX_RECONNECT_ATTEMPTS),
        };
        let connection = ConnectionOptions {
            auto_reconnect: env_parse("REALTIME_AUTO_RECONNECT", true),
            heartbeat: env_parse("REALTIME_HEARTBEAT", true),
            heartbeat_interval: Duration::from_millis(env_parse(
                "REALTIME_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )),
            protocols: Vec::new(),
        };

        Ok(Self { origin, backoff, connection })
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
