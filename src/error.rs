//! Error types crossing the public API.
//!
//! ERROR HANDLING
//! ==============
//! Nothing in the connection manager is fatal to the host application.
//! Transport failures are reported to error subscribers as
//! [`ConnectionError`] and degrade the named connection to `Failed` or
//! `Closed`; the only hard errors are construction-time ones in
//! [`RealtimeError`].

use crate::transport::TransportError;

/// Registry construction and configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// `Registry::init` was called outside a tokio runtime.
    #[error("no tokio runtime available; the registry must be initialized inside one")]
    NoRuntime,
    /// The configured origin is not an `http://` or `https://` origin.
    #[error("invalid origin: {0}")]
    InvalidOrigin(String),
}

/// Failure surfaced to a connection's error subscribers.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The transport could not be established.
    #[error("handshake with {endpoint} failed: {source}")]
    Handshake {
        endpoint: String,
        #[source]
        source: TransportError,
    },
    /// The established transport reported an error.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Handshake failures feed the reconnection policy directly; transport
    /// errors are always followed by a closure event that does.
    #[must_use]
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake { .. })
    }
}
