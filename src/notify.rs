//! Terminal-failure reporting.

use tracing::error;

/// Receives the one report made when a connection exhausts its reconnection
/// attempts. Hosts plug in whatever user-facing notification they have.
pub trait Notifier: Send + Sync + 'static {
    fn connection_lost(&self, name: &str, attempts: u32);
}

/// Reports lost connections through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn connection_lost(&self, name: &str, attempts: u32) {
        error!(connection = %name, attempts, "connection lost; automatic reconnection abandoned");
    }
}
