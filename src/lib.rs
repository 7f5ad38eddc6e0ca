//! Realtime connection manager.
//!
//! A [`Registry`] owns named [`Connection`]s to WebSocket endpoints on the
//! application's origin. Connections queue outbound messages while down,
//! keep themselves alive with heartbeat pings, and are reconnected with
//! exponential backoff after abnormal closures. Inbound frames fan out to
//! global and per-connection subscribers, and host environment signals
//! (visibility, connectivity, teardown) pause, resume, or close the whole set.
//!
//! ```no_run
//! # async fn demo() -> Result<(), realtime::RealtimeError> {
//! use realtime::{EditorChannel, RealtimeConfig, Registry};
//!
//! let registry = Registry::websocket(RealtimeConfig::from_env()?)?;
//! let editor = EditorChannel::new(registry.clone());
//! editor.on_processing_update(|update| {
//!     println!("{:.0}% {}", update.progress, update.status);
//!     Ok(())
//! });
//! editor.connect("42");
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod channels;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod environment;
pub mod error;
pub mod handler;
pub mod notify;
pub mod registry;
pub mod transport;

pub use channels::{BatchChannel, EditorChannel};
pub use config::{BackoffConfig, ConnectionOptions, RealtimeConfig};
pub use connection::{CloseEvent, Connection, OpenEvent, Status};
pub use endpoint::PageOrigin;
pub use environment::EnvironmentSignal;
pub use error::{ConnectionError, RealtimeError};
pub use frames::{BatchUpdate, Envelope, Payload, ProcessingUpdate};
pub use handler::{Handler, HandlerError, HandlerRef, HandlerResult, handler};
pub use notify::{LogNotifier, Notifier};
pub use registry::{Registry, Routed};
pub use transport::{Connector, TransportError, WsConnector};
