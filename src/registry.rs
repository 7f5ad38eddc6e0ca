//! Named-connection multiplexer.
//!
//! DESIGN
//! ======
//! The registry is an explicitly constructed, cloneable handle. It owns every
//! connection it opens: it wires their lifecycle hooks, applies the backoff
//! policy after abnormal closures, fans inbound messages out to global and
//! per-connection subscribers, and translates environment signals into
//! pause/resume/close across the whole set.
//!
//! LOCKING
//! =======
//! The registry lock guards the connection map, handler map, and environment
//! levels. It is never held while calling into a connection: every fan-out
//! works over a snapshot taken under the lock, so a callback that disconnects
//! or opens connections mid-iteration cannot deadlock or skip entries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use frames::Payload;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionOptions, RealtimeConfig};
use crate::connection::{CloseEvent, Connection, OpenEvent, Status};
use crate::environment::{Directive, Environment, EnvironmentSignal};
use crate::error::{ConnectionError, RealtimeError};
use crate::handler::{HandlerRef, Subscribers, handler};
use crate::notify::{LogNotifier, Notifier};
use crate::transport::{Connector, WsConnector};

/// An inbound message as seen by global subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    /// Name of the connection it arrived on.
    pub connection: String,
    pub payload: Payload,
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RealtimeConfig,
    connector: Arc<dyn Connector>,
    notifier: Arc<dyn Notifier>,
    runtime: Handle,
    state: Mutex<RegistryState>,
    global: Subscribers<Routed>,
}

#[derive(Default)]
struct RegistryState {
    connections: BTreeMap<String, Connection>,
    handlers: HashMap<String, Arc<Subscribers<Payload>>>,
    environment: Environment,
    listener: Option<AbortHandle>,
}

// =============================================================================
// LIFECYCLE
// =============================================================================

impl Registry {
    /// Create a registry bound to the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::NoRuntime`] when called outside a runtime.
    pub fn init(
        config: RealtimeConfig,
        connector: Arc<dyn Connector>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, RealtimeError> {
        let runtime = Handle::try_current().map_err(|_| RealtimeError::NoRuntime)?;
        info!(origin = %config.origin, "realtime registry initialized");
        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                connector,
                notifier,
                runtime,
                state: Mutex::new(RegistryState::default()),
                global: Subscribers::new("global"),
            }),
        })
    }

    /// Registry over real WebSockets that reports lost connections to the log.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::NoRuntime`] when called outside a runtime.
    pub fn websocket(config: RealtimeConfig) -> Result<Self, RealtimeError> {
        Self::init(config, Arc::new(WsConnector), Arc::new(LogNotifier))
    }

    /// Stop listening for environment signals and close every connection.
    pub fn shutdown(&self) {
        if let Some(listener) = self.lock().listener.take() {
            listener.abort();
        }
        self.close_all();
        info!("realtime registry shut down");
    }

    #[must_use]
    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// Default options for [`Registry::connect`].
    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        self.inner.config.connection.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }
}

// =============================================================================
// CONNECTIONS
// =============================================================================

impl Registry {
    /// Open `name` against `path` on the configured origin.
    ///
    /// Opening a name that is already registered returns the existing
    /// connection untouched.
    pub fn connect(&self, name: &str, path: &str, options: ConnectionOptions) -> Connection {
        let conn = {
            let mut state = self.lock();
            if let Some(existing) = state.connections.get(name) {
                warn!(connection = %name, "connection already exists; returning existing");
                return existing.clone();
            }
            let endpoint = self.inner.config.origin.resolve(path);
            let conn = Connection::new(
                name,
                &endpoint,
                options,
                self.inner.connector.clone(),
                self.inner.runtime.clone(),
                state.environment.paused(),
            );
            state.connections.insert(name.to_owned(), conn.clone());
            conn
        };

        self.wire(&conn);
        conn.start();
        debug!(connection = %name, endpoint = %conn.endpoint(), "connection registered");
        conn
    }

    fn wire(&self, conn: &Connection) {
        conn.on_open(handler(|event: &OpenEvent| {
            info!(connection = %event.name, endpoint = %event.endpoint, "realtime connection established");
            Ok(())
        }));

        let registry = self.downgrade();
        let weak = conn.downgrade();
        conn.on_close(handler(move |event: &CloseEvent| {
            if event.is_normal() {
                return Ok(());
            }
            if let (Some(registry), Some(conn)) = (upgrade(&registry), weak.upgrade()) {
                registry.attempt_reconnect(&conn);
            }
            Ok(())
        }));

        let registry = self.downgrade();
        let weak = conn.downgrade();
        conn.on_error(handler(move |error: &ConnectionError| {
            if !error.is_handshake() {
                return Ok(());
            }
            if let (Some(registry), Some(conn)) = (upgrade(&registry), weak.upgrade()) {
                registry.attempt_reconnect(&conn);
            }
            Ok(())
        }));

        let registry = self.downgrade();
        let weak = conn.downgrade();
        conn.on_message(handler(move |payload: &Payload| {
            if let (Some(registry), Some(conn)) = (upgrade(&registry), weak.upgrade()) {
                registry.route(&conn, payload);
            }
            Ok(())
        }));
    }

    /// Apply the backoff policy after an abnormal closure or failed
    /// handshake: schedule exactly one retry, or report the connection lost
    /// once the attempt ceiling is reached.
    fn attempt_reconnect(&self, conn: &Connection) {
        let name = conn.name();
        if !conn.options().auto_reconnect {
            debug!(connection = %name, "automatic reconnection disabled");
            return;
        }
        let registered = self.lock().connections.get(name).is_some_and(|c| c.same(conn));
        if !registered {
            return;
        }
        if conn.is_paused() {
            debug!(connection = %name, "paused; reconnection deferred until resume");
            return;
        }

        let attempts = conn.reconnect_attempts();
        match self.inner.config.backoff.delay_for(attempts) {
            Some(delay) => {
                let attempt = conn.schedule_reconnect(delay);
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                info!(connection = %name, attempt, delay_ms, "reconnection scheduled");
            }
            None => {
                error!(connection = %name, attempts, "max reconnection attempts reached");
                self.inner.notifier.connection_lost(name, attempts);
            }
        }
    }

    #[must_use]
    pub fn connection(&self, name: &str) -> Option<Connection> {
        self.lock().connections.get(name).cloned()
    }

    /// Status of `name`, or `None` if no such connection is registered.
    #[must_use]
    pub fn connection_status(&self, name: &str) -> Option<Status> {
        self.connection(name).map(|conn| conn.status())
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn connection_names(&self) -> Vec<String> {
        self.lock().connections.keys().cloned().collect()
    }

    /// Close and forget `name` along with its message handlers. Unknown names
    /// are ignored.
    pub fn disconnect(&self, name: &str) {
        let removed = {
            let mut state = self.lock();
            state.handlers.remove(name);
            state.connections.remove(name)
        };
        if let Some(conn) = removed {
            conn.dispose();
            info!(connection = %name, "connection removed");
        }
    }

    /// Close every connection and drop all per-connection handlers.
    pub fn close_all(&self) {
        let connections = {
            let mut state = self.lock();
            state.handlers.clear();
            std::mem::take(&mut state.connections)
        };
        let count = connections.len();
        for conn in connections.into_values() {
            conn.dispose();
        }
        if count > 0 {
            info!(count, "closed all connections");
        }
    }

    pub fn pause_all(&self) {
        for conn in self.snapshot() {
            conn.pause();
        }
    }

    pub fn resume_all(&self) {
        for conn in self.snapshot() {
            conn.resume();
        }
    }

    fn snapshot(&self) -> Vec<Connection> {
        self.lock().connections.values().cloned().collect()
    }
}

// =============================================================================
// MESSAGING
// =============================================================================

impl Registry {
    /// Send through `name`. Returns `false` when the name is unknown or the
    /// message was queued rather than transmitted.
    pub fn send(&self, name: &str, data: impl Into<Payload>) -> bool {
        let Some(conn) = self.connection(name) else {
            warn!(connection = %name, "connection not found");
            return false;
        };
        conn.send(data)
    }

    /// Send `data` to every connection not named in `exclude`. Returns how
    /// many transmitted immediately.
    pub fn broadcast(&self, data: impl Into<Payload>, exclude: &[&str]) -> usize {
        let payload = data.into();
        let targets: Vec<Connection> = {
            let state = self.lock();
            state
                .connections
                .iter()
                .filter(|(name, _)| !exclude.contains(&name.as_str()))
                .map(|(_, conn)| conn.clone())
                .collect()
        };
        let sent = targets.iter().filter(|conn| conn.send(payload.clone())).count();
        debug!(targets = targets.len(), sent, "broadcast");
        sent
    }

    pub fn add_message_handler(&self, name: &str, handler: HandlerRef<Payload>) {
        let subscribers = {
            let mut state = self.lock();
            state
                .handlers
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Subscribers::new("message")))
                .clone()
        };
        subscribers.add(handler);
    }

    /// Returns whether the handler was registered for `name`.
    pub fn remove_message_handler(&self, name: &str, handler: &HandlerRef<Payload>) -> bool {
        let subscribers = self.lock().handlers.get(name).cloned();
        subscribers.is_some_and(|subs| subs.remove(handler))
    }

    pub fn add_global_handler(&self, handler: HandlerRef<Routed>) {
        self.inner.global.add(handler);
    }

    pub fn remove_global_handler(&self, handler: &HandlerRef<Routed>) -> bool {
        self.inner.global.remove(handler)
    }

    /// Global handlers first, then the ones registered for this name. Stops
    /// mid-way if a handler disconnects the connection.
    fn route(&self, conn: &Connection, payload: &Payload) {
        let name = conn.name();
        let live = || !conn.is_disposed();
        if !self.inner.global.is_empty() {
            let routed = Routed { connection: name.to_owned(), payload: payload.clone() };
            self.inner.global.dispatch_while(name, &routed, live);
        }
        if !live() {
            return;
        }
        let subscribers = self.lock().handlers.get(name).cloned();
        if let Some(subscribers) = subscribers {
            subscribers.dispatch_while(name, payload, live);
        }
    }
}

// =============================================================================
// ENVIRONMENT
// =============================================================================

impl Registry {
    /// Apply one environment signal synchronously.
    pub fn handle_signal(&self, signal: EnvironmentSignal) {
        let directive = self.lock().environment.apply(signal);
        info!(%signal, ?directive, "environment changed");
        match directive {
            Directive::PauseAll => self.pause_all(),
            Directive::ResumeAll => self.resume_all(),
            Directive::CloseAll => self.close_all(),
        }
    }

    /// Whether the host environment currently holds connections idle.
    #[must_use]
    pub fn environment_paused(&self) -> bool {
        self.lock().environment.paused()
    }

    /// Consume signals from `signals` on a background task until the sender
    /// side closes or the registry shuts down. Replaces any earlier listener.
    pub fn watch(&self, mut signals: mpsc::Receiver<EnvironmentSignal>) {
        let registry = self.downgrade();
        let task = self.inner.runtime.spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(registry) = upgrade(&registry) else { break };
                registry.handle_signal(signal);
            }
            debug!("environment listener stopped");
        });
        if let Some(previous) = self.lock().listener.replace(task.abort_handle()) {
            previous.abort();
        }
    }
}

fn upgrade(weak: &Weak<RegistryInner>) -> Option<Registry> {
    weak.upgrade().map(|inner| Registry { inner })
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod registry_test;
