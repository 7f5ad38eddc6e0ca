//! Transport seam between a `Connection` and the network.
//!
//! DESIGN
//! ======
//! A [`Connector`] performs one handshake and hands back a [`Link`]: an
//! outbound channel of [`Outgoing`] frames and an inbound channel of
//! [`TransportEvent`]s. Each reconnection asks the connector for a brand-new
//! link; links are never reused. A link whose outbound receiver has gone away
//! is "open but not writable", which is what surfaces as a send failure.
//!
//! The production connector lives in [`ws`]; tests script handshakes through
//! `test_helpers::MockConnector`.

pub mod ws;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use ws::WsConnector;

/// Close code for a requested, orderly shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close frame carried no status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Frame written to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    /// Non-terminal error report; a `Closed` event always follows.
    Error(String),
    Closed { code: u16, reason: String },
}

/// One established duplex channel.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outgoing>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("invalid handshake request: {0}")]
    InvalidRequest(String),
    #[error("handshake rejected: {0}")]
    Rejected(String),
}

/// Opens transport links.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Perform the handshake against `url`, offering `protocols`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the channel cannot be established.
    async fn open(&self, url: &str, protocols: &[String]) -> Result<Link, TransportError>;
}

// =============================================================================
// TEST HELPERS
// =============================================================================
