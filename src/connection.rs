//! One named duplex channel: lifecycle, outbound queueing, and keep-alive.
//!
//! LIFECYCLE
//! =========
//! ```text
//!   Connecting ──handshake ok──▶ Open ──close / drop──▶ Closed
//!        │                                               │
//!        └──handshake failed──▶ Failed                   │
//!                                  │                     │
//!                                  └──── connect() ◀─────┘  (fresh transport)
//! ```
//! Every attempt runs in its own driver task tagged with an epoch. Closing,
//! disposing, or starting a new attempt bumps the epoch, so events from a
//! superseded transport are dropped instead of corrupting the current one.
//!
//! DESIGN
//! ======
//! - State lives behind one mutex; subscriber callbacks always run with the
//!   lock released, so a callback may call back into the connection.
//! - Transitions into `Open` drain the pending queue inside the same critical
//!   section, so queued messages always hit the wire before anything sent
//!   afterwards.
//! - Heartbeat and reconnection timers are owned tokio tasks whose abort
//!   handles live in the state. The heartbeat handle is `Some` exactly while
//!   the connection is open, unpaused, and configured for keep-alive.
//! - Driver and timer tasks hold the connection weakly. Dropping the last
//!   handle aborts them and closes the transport.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use frames::{Envelope, Payload};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::ConnectionOptions;
use crate::error::{ConnectionError, RealtimeError};
use crate::handler::{HandlerRef, Subscribers};
use crate::transport::{ABNORMAL_CLOSURE, Connector, Link, NORMAL_CLOSURE, Outgoing, TransportError, TransportEvent};

// =============================================================================
// TYPES
// =============================================================================

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Handshake in flight.
    Connecting,
    /// Usable; sends go straight to the transport.
    Open,
    /// No longer usable; sends are queued.
    Closed,
    /// The last handshake failed.
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Failed => "failed",
        })
    }
}

/// Delivered to open subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenEvent {
    pub name: String,
    pub endpoint: String,
}

/// Delivered to close subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl CloseEvent {
    /// Normal closure (1000) never triggers reconnection.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

/// Cloneable handle to a connection. All clones share one state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Non-owning handle, used by callbacks and timers that must not keep a
/// disposed connection alive.
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

struct Inner {
    id: Uuid,
    name: String,
    endpoint: String,
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    runtime: Handle,
    state: Mutex<State>,
    open_subscribers: Subscribers<OpenEvent>,
    close_subscribers: Subscribers<CloseEvent>,
    error_subscribers: Subscribers<ConnectionError>,
    message_subscribers: Subscribers<Payload>,
}

struct State {
    status: Status,
    pending: VecDeque<Payload>,
    reconnect_attempts: u32,
    paused: bool,
    disposed: bool,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<Outgoing>>,
    driver: Option<AbortHandle>,
    heartbeat: Option<AbortHandle>,
    reconnect_timer: Option<AbortHandle>,
}

impl State {
    fn transmit(&self, payload: &Payload) -> bool {
        self.outbound
            .as_ref()
            .is_some_and(|tx| tx.send(Outgoing::Text(payload.encode())).is_ok())
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

// Last handle gone: stop the tasks. Dropping `outbound` closes the socket.
impl Drop for State {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.stop_heartbeat();
        self.cancel_reconnect_timer();
    }
}

// =============================================================================
// CONSTRUCTION
// =============================================================================

impl Connection {
    /// Open a standalone connection on the current tokio runtime.
    ///
    /// Connections opened this way have no registry behind them, so nothing
    /// schedules reconnection after an abnormal closure; call
    /// [`Connection::reconnect`] or [`Connection::resume`] to retry.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::NoRuntime`] outside a tokio runtime.
    pub fn open(
        name: &str,
        endpoint: &str,
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, RealtimeError> {
        let runtime = Handle::try_current().map_err(|_| RealtimeError::NoRuntime)?;
        let conn = Self::new(name, endpoint, options, connector, runtime, false);
        conn.start();
        Ok(conn)
    }

    /// Build an idle connection in `Connecting`; nothing runs until
    /// [`Connection::start`], which lets the owner wire subscribers first.
    pub(crate) fn new(
        name: &str,
        endpoint: &str,
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
        runtime: Handle,
        paused: bool,
    ) -> Self {
        let state = State {
            status: Status::Connecting,
            pending: VecDeque::new(),
            reconnect_attempts: 0,
            paused,
            disposed: false,
            epoch: 0,
            outbound: None,
            driver: None,
            heartbeat: None,
            reconnect_timer: None,
        };
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                name: name.to_owned(),
                endpoint: endpoint.to_owned(),
                options,
                connector,
                runtime,
                state: Mutex::new(state),
                open_subscribers: Subscribers::new("open"),
                close_subscribers: Subscribers::new("close"),
                error_subscribers: Subscribers::new("error"),
                message_subscribers: Subscribers::new("message"),
            }),
        }
    }

    pub(crate) fn start(&self) {
        self.connect();
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection { inner: Arc::downgrade(&self.inner) }
    }

    /// Whether both handles refer to the same connection instance.
    #[must_use]
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WeakConnection {
    #[must_use]
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

// =============================================================================
// INTROSPECTION
// =============================================================================

impl Connection {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.lock().status
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == Status::Open
    }

    /// Messages waiting for the next successful open.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Set once the owning registry has torn the connection down.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    #[must_use]
    pub fn heartbeat_active(&self) -> bool {
        self.lock().heartbeat.is_some()
    }

    #[must_use]
    pub fn reconnect_scheduled(&self) -> bool {
        self.lock().reconnect_timer.is_some()
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

impl Connection {
    pub fn on_open(&self, handler: HandlerRef<OpenEvent>) {
        self.inner.open_subscribers.add(handler);
    }

    pub fn on_close(&self, handler: HandlerRef<CloseEvent>) {
        self.inner.close_subscribers.add(handler);
    }

    pub fn on_error(&self, handler: HandlerRef<ConnectionError>) {
        self.inner.error_subscribers.add(handler);
    }

    pub fn on_message(&self, handler: HandlerRef<Payload>) {
        self.inner.message_subscribers.add(handler);
    }

    /// Unregister a message subscriber; no-op if it was never registered.
    pub fn off_message(&self, handler: &HandlerRef<Payload>) -> bool {
        self.inner.message_subscribers.remove(handler)
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

impl Connection {
    /// Send `data`, or queue it until the next open.
    ///
    /// Returns `true` only when the frame was handed to an open transport.
    /// A transmit failure on an open connection is logged and the message is
    /// dropped, not re-queued.
    pub fn send(&self, data: impl Into<Payload>) -> bool {
        let payload = data.into();
        let mut state = self.lock();
        if state.status != Status::Open {
            state.pending.push_back(payload);
            debug!(connection = %self.inner.name, queued = state.pending.len(), "message queued until open");
            return false;
        }
        if state.transmit(&payload) {
            true
        } else {
            warn!(connection = %self.inner.name, "send failed on open connection; message dropped");
            false
        }
    }

    /// Start a fresh handshake unless one is in flight or the connection is
    /// already open.
    pub fn connect(&self) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        match state.status {
            Status::Open => return,
            Status::Connecting if state.driver.is_some() => return,
            _ => {}
        }
        state.cancel_reconnect_timer();
        self.begin_attempt(&mut state);
    }

    /// Request closure with `code`. Never schedules reconnection itself; the
    /// owning registry decides that from the delivered close event.
    pub fn close(&self, code: u16, reason: &str) {
        let was_live = {
            let mut state = self.lock();
            state.cancel_reconnect_timer();
            state.stop_heartbeat();
            let was_live = matches!(state.status, Status::Connecting | Status::Open)
                && (state.driver.is_some() || state.outbound.is_some());
            if let Some(tx) = state.outbound.take() {
                let _ = tx.send(Outgoing::Close { code, reason: reason.to_owned() });
            }
            if let Some(driver) = state.driver.take() {
                driver.abort();
            }
            state.epoch += 1;
            state.status = Status::Closed;
            was_live
        };

        if was_live {
            info!(connection = %self.inner.name, code, reason, "connection closed locally");
            self.inner
                .close_subscribers
                .dispatch_while(&self.inner.name, &CloseEvent { code, reason: reason.to_owned() }, || !self.is_disposed());
        }
    }

    /// Close normally and immediately start over on a fresh transport.
    pub fn reconnect(&self) {
        self.close(NORMAL_CLOSURE, "reconnect");
        self.connect();
    }

    /// Suspend keep-alive (and deferred reconnection) without closing.
    pub fn pause(&self) {
        let mut state = self.lock();
        if !state.paused {
            debug!(connection = %self.inner.name, "connection paused");
        }
        state.paused = true;
        state.stop_heartbeat();
    }

    /// Undo [`Connection::pause`]. An open connection restarts its heartbeat;
    /// a closed or failed one reconnects immediately, skipping backoff.
    pub fn resume(&self) {
        let reconnect = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.paused = false;
            match state.status {
                Status::Open => {
                    self.sync_heartbeat(&mut state);
                    false
                }
                Status::Closed | Status::Failed => true,
                Status::Connecting => false,
            }
        };
        if reconnect {
            info!(connection = %self.inner.name, "resuming closed connection");
            self.connect();
        }
    }

    /// Close and detach everything. No callback fires after this returns.
    pub(crate) fn dispose(&self) {
        self.close(NORMAL_CLOSURE, "disposed");
        {
            let mut state = self.lock();
            state.disposed = true;
            state.cancel_reconnect_timer();
            state.stop_heartbeat();
            state.pending.clear();
        }
        self.inner.open_subscribers.clear();
        self.inner.close_subscribers.clear();
        self.inner.error_subscribers.clear();
        self.inner.message_subscribers.clear();
    }

    /// Count one reconnection attempt and arm the timer that will run it.
    /// Replaces any timer already armed. Returns the attempt number.
    pub(crate) fn schedule_reconnect(&self, delay: Duration) -> u32 {
        let mut state = self.lock();
        state.reconnect_attempts = state.reconnect_attempts.saturating_add(1);
        state.cancel_reconnect_timer();

        let weak = self.downgrade();
        let timer = self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(conn) = weak.upgrade() {
                conn.fire_reconnect_timer();
            }
        });
        state.reconnect_timer = Some(timer.abort_handle());
        state.reconnect_attempts
    }

    fn fire_reconnect_timer(&self) {
        let attempt = {
            let mut state = self.lock();
            state.reconnect_timer = None;
            if state.disposed || state.paused || !matches!(state.status, Status::Closed | Status::Failed) {
                debug!(connection = %self.inner.name, status = %state.status, "stale reconnection timer skipped");
                return;
            }
            state.reconnect_attempts
        };
        info!(connection = %self.inner.name, attempt, "attempting reconnection");
        self.connect();
    }
}

// =============================================================================
// DRIVER
// =============================================================================

impl Connection {
    fn begin_attempt(&self, state: &mut State) {
        state.epoch += 1;
        state.status = Status::Connecting;
        state.outbound = None;
        state.stop_heartbeat();
        if let Some(old) = state.driver.take() {
            old.abort();
        }

        let epoch = state.epoch;
        let driver = self.inner.runtime.spawn(drive(
            self.downgrade(),
            epoch,
            self.inner.connector.clone(),
            self.inner.endpoint.clone(),
            self.inner.options.protocols.clone(),
        ));
        state.driver = Some(driver.abort_handle());
        debug!(connection = %self.inner.name, endpoint = %self.inner.endpoint, epoch, "connecting");
    }

    fn is_current(&self, state: &State, epoch: u64) -> bool {
        state.epoch == epoch && !state.disposed
    }

    fn handshake_failed(&self, epoch: u64, source: TransportError) {
        {
            let mut state = self.lock();
            if !self.is_current(&state, epoch) {
                return;
            }
            state.status = Status::Failed;
            state.outbound = None;
            state.driver = None;
        }
        warn!(connection = %self.inner.name, endpoint = %self.inner.endpoint, error = %source, "handshake failed");
        let error = ConnectionError::Handshake { endpoint: self.inner.endpoint.clone(), source };
        self.inner
            .error_subscribers
            .dispatch_while(&self.inner.name, &error, || !self.is_disposed());
    }

    fn opened(&self, epoch: u64, outbound: mpsc::UnboundedSender<Outgoing>) -> bool {
        {
            let mut state = self.lock();
            if !self.is_current(&state, epoch) {
                let _ = outbound.send(Outgoing::Close { code: NORMAL_CLOSURE, reason: "superseded".into() });
                return false;
            }
            state.status = Status::Open;
            state.reconnect_attempts = 0;
            state.outbound = Some(outbound);

            let mut flushed = 0_usize;
            while let Some(payload) = state.pending.pop_front() {
                if !state.transmit(&payload) {
                    state.pending.push_front(payload);
                    warn!(connection = %self.inner.name, remaining = state.pending.len(), "queue drain interrupted by send failure");
                    break;
                }
                flushed += 1;
            }
            if flushed > 0 {
                debug!(connection = %self.inner.name, flushed, "flushed queued messages");
            }

            self.sync_heartbeat(&mut state);
        }

        info!(connection = %self.inner.name, endpoint = %self.inner.endpoint, "connection open");
        let event = OpenEvent { name: self.inner.name.clone(), endpoint: self.inner.endpoint.clone() };
        self.inner
            .open_subscribers
            .dispatch_while(&self.inner.name, &event, || !self.is_disposed());
        true
    }

    fn received(&self, epoch: u64, text: &str) -> bool {
        match frames::decode(text) {
            Envelope::Pong { timestamp } => {
                trace!(connection = %self.inner.name, ?timestamp, "pong");
                self.is_current(&self.lock(), epoch)
            }
            Envelope::Ping { timestamp } => {
                {
                    let state = self.lock();
                    if !self.is_current(&state, epoch) {
                        return false;
                    }
                    let pong = frames::encode(&Envelope::pong(timestamp));
                    if let Some(tx) = &state.outbound {
                        let _ = tx.send(Outgoing::Text(pong));
                    }
                }
                self.inner
                    .message_subscribers
                    .dispatch_while(&self.inner.name, &Payload::from_wire(text), || !self.is_disposed());
                true
            }
            Envelope::Message(payload) => {
                if !self.is_current(&self.lock(), epoch) {
                    return false;
                }
                self.inner
                    .message_subscribers
                    .dispatch_while(&self.inner.name, &payload, || !self.is_disposed());
                true
            }
        }
    }

    fn transport_error(&self, epoch: u64, message: String) {
        if !self.is_current(&self.lock(), epoch) {
            return;
        }
        warn!(connection = %self.inner.name, error = %message, "transport error");
        self.inner
            .error_subscribers
            .dispatch_while(&self.inner.name, &ConnectionError::Transport(message), || !self.is_disposed());
    }

    fn closed(&self, epoch: u64, code: u16, reason: String) {
        {
            let mut state = self.lock();
            if !self.is_current(&state, epoch) {
                return;
            }
            state.status = Status::Closed;
            state.outbound = None;
            state.driver = None;
            state.stop_heartbeat();
        }
        if code == NORMAL_CLOSURE {
            info!(connection = %self.inner.name, code, reason = %reason, "connection closed");
        } else {
            warn!(connection = %self.inner.name, code, reason = %reason, "connection closed abnormally");
        }
        self.inner
            .close_subscribers
            .dispatch_while(&self.inner.name, &CloseEvent { code, reason }, || !self.is_disposed());
    }
}

/// Run one transport attempt. Holds the connection weakly between events, so
/// dropping every handle tears the transport down.
async fn drive(
    weak: WeakConnection,
    epoch: u64,
    connector: Arc<dyn Connector>,
    endpoint: String,
    protocols: Vec<String>,
) {
    let opened = connector.open(&endpoint, &protocols).await;
    let Some(conn) = weak.upgrade() else { return };
    let Link { outbound, mut inbound } = match opened {
        Ok(link) => link,
        Err(source) => {
            conn.handshake_failed(epoch, source);
            return;
        }
    };
    if !conn.opened(epoch, outbound) {
        return;
    }
    drop(conn);

    while let Some(event) = inbound.recv().await {
        let Some(conn) = weak.upgrade() else { return };
        match event {
            TransportEvent::Text(text) => {
                if !conn.received(epoch, &text) {
                    return;
                }
            }
            TransportEvent::Error(message) => conn.transport_error(epoch, message),
            TransportEvent::Closed { code, reason } => {
                conn.closed(epoch, code, reason);
                return;
            }
        }
    }
    if let Some(conn) = weak.upgrade() {
        conn.closed(epoch, ABNORMAL_CLOSURE, String::new());
    }
}

// =============================================================================
// HEARTBEAT
// =============================================================================

impl Connection {
    /// Reconcile the heartbeat task with the current state.
    fn sync_heartbeat(&self, state: &mut State) {
        let wanted = state.status == Status::Open && !state.paused && !state.disposed && self.inner.options.heartbeat;
        if !wanted {
            state.stop_heartbeat();
            return;
        }
        if state.heartbeat.is_some() {
            return;
        }

        let period = self.inner.options.heartbeat_interval;
        let epoch = state.epoch;
        let weak = self.downgrade();
        let task = self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(conn) = weak.upgrade() else { return };
                if !conn.send_ping(epoch) {
                    return;
                }
            }
        });
        state.heartbeat = Some(task.abort_handle());
    }

    fn send_ping(&self, epoch: u64) -> bool {
        let state = self.lock();
        if !self.is_current(&state, epoch) || state.status != Status::Open || state.paused {
            return false;
        }
        let ping = frames::encode(&Envelope::ping());
        let sent = state.outbound.as_ref().is_some_and(|tx| tx.send(Outgoing::Text(ping)).is_ok());
        if sent {
            trace!(connection = %self.inner.name, "ping");
        } else {
            warn!(connection = %self.inner.name, "heartbeat ping could not be sent");
        }
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("endpoint", &self.inner.endpoint)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod connection_test;
