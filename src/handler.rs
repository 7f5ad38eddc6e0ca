//! Subscriber lists with per-callback fault isolation.
//!
//! DESIGN
//! ======
//! A subscriber is any [`Handler`]: an object with a single `invoke` method,
//! implemented for plain closures. Lists are ordered by registration and
//! dispatch walks a snapshot, so a handler may add or remove subscribers (or
//! tear the whole connection down) without skipping or repeating entries.
//! `dispatch_while` re-checks a liveness predicate before every subscriber,
//! so once the owner is torn down mid-dispatch the remaining subscribers in
//! the snapshot are skipped.
//!
//! ERROR HANDLING
//! ==============
//! Each invocation runs inside its own failure boundary: an `Err` return is
//! logged, a panic is caught and logged, and delivery continues with the next
//! subscriber either way.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, warn};

/// Error a subscriber may return. Logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

/// A subscriber to events of type `E`.
pub trait Handler<E: ?Sized>: Send + Sync {
    /// React to one event.
    ///
    /// # Errors
    ///
    /// Any error is logged by the dispatcher and otherwise ignored.
    fn invoke(&self, event: &E) -> HandlerResult;
}

impl<E: ?Sized, F> Handler<E> for F
where
    F: Fn(&E) -> HandlerResult + Send + Sync,
{
    fn invoke(&self, event: &E) -> HandlerResult {
        self(event)
    }
}

/// Shared handle to a subscriber; identity is the allocation.
pub type HandlerRef<E> = Arc<dyn Handler<E>>;

/// Wrap a closure as a shareable subscriber.
pub fn handler<E, F>(f: F) -> HandlerRef<E>
where
    E: ?Sized + 'static,
    F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Ordered, fault-isolated subscriber list.
pub struct Subscribers<E: ?Sized> {
    label: &'static str,
    list: Mutex<Vec<HandlerRef<E>>>,
}

impl<E: ?Sized> Subscribers<E> {
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self { label, list: Mutex::new(Vec::new()) }
    }

    pub fn add(&self, handler: HandlerRef<E>) {
        self.lock().push(handler);
    }

    /// Remove the first registration of `handler`. Returns whether anything
    /// was removed; removing an unknown handler is a no-op.
    pub fn remove(&self, handler: &HandlerRef<E>) -> bool {
        let mut list = self.lock();
        let Some(index) = list.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        list.remove(index);
        true
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Invoke every subscriber in registration order. Returns how many
    /// completed without error.
    pub fn dispatch(&self, scope: &str, event: &E) -> usize {
        self.dispatch_while(scope, event, || true)
    }

    /// Like [`dispatch`](Self::dispatch), but stops as soon as `live` turns
    /// false. Checked before each subscriber.
    pub fn dispatch_while(&self, scope: &str, event: &E, live: impl Fn() -> bool) -> usize {
        let snapshot = self.lock().clone();
        let mut delivered = 0;
        for handler in snapshot {
            if !live() {
                debug!(scope, subscriber = self.label, "dispatch stopped; owner gone");
                break;
            }
            match catch_unwind(AssertUnwindSafe(|| handler.invoke(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(scope, subscriber = self.label, error = %e, "subscriber returned an error");
                }
                Err(panic) => {
                    error!(scope, subscriber = self.label, panic = panic_message(&*panic), "subscriber panicked");
                }
            }
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<HandlerRef<E>>> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
#[path = "handler_test.rs"]
mod handler_test;
