//! Typed convenience wrappers for the application's two realtime channels.
//!
//! Each channel is a fixed connection name on a [`Registry`]: `editor` for
//! per-photo processing progress and `batch` for batch job progress. Typed
//! subscriptions filter on the frame's `type` and decode the rest.

use frames::{BatchUpdate, Payload, ProcessingUpdate, TYPE_BATCH_UPDATE, TYPE_PROCESSING_UPDATE};
use serde::de::DeserializeOwned;

use crate::connection::Connection;
use crate::handler::{HandlerRef, HandlerResult, handler};
use crate::registry::Registry;

pub const EDITOR_CONNECTION: &str = "editor";
pub const BATCH_CONNECTION: &str = "batch";

/// Realtime channel of the photo editor.
#[derive(Clone)]
pub struct EditorChannel {
    registry: Registry,
}

impl EditorChannel {
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Open `/ws/editor/{photo_id}/` under the `editor` name.
    pub fn connect(&self, photo_id: &str) -> Connection {
        let options = self.registry.connection_options();
        self.registry
            .connect(EDITOR_CONNECTION, &format!("/ws/editor/{photo_id}/"), options)
    }

    /// Subscribe to `processing_update` frames. Keep the returned handle to
    /// unsubscribe through [`Registry::remove_message_handler`].
    pub fn on_processing_update<F>(&self, callback: F) -> HandlerRef<Payload>
    where
        F: Fn(&ProcessingUpdate) -> HandlerResult + Send + Sync + 'static,
    {
        subscribe(&self.registry, EDITOR_CONNECTION, TYPE_PROCESSING_UPDATE, callback)
    }

    pub fn send(&self, data: impl Into<Payload>) -> bool {
        self.registry.send(EDITOR_CONNECTION, data)
    }

    pub fn send_processing_update(&self, update: &ProcessingUpdate) -> bool {
        self.send(update)
    }

    pub fn disconnect(&self) {
        self.registry.disconnect(EDITOR_CONNECTION);
    }
}

/// Realtime channel of batch jobs. Receive-only.
#[derive(Clone)]
pub struct BatchChannel {
    registry: Registry,
}

impl BatchChannel {
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Open `/ws/batch/{job_id}/` under the `batch` name.
    pub fn connect(&self, job_id: &str) -> Connection {
        let options = self.registry.connection_options();
        self.registry
            .connect(BATCH_CONNECTION, &format!("/ws/batch/{job_id}/"), options)
    }

    pub fn on_batch_update<F>(&self, callback: F) -> HandlerRef<Payload>
    where
        F: Fn(&BatchUpdate) -> HandlerResult + Send + Sync + 'static,
    {
        subscribe(&self.registry, BATCH_CONNECTION, TYPE_BATCH_UPDATE, callback)
    }

    pub fn disconnect(&self) {
        self.registry.disconnect(BATCH_CONNECTION);
    }
}

fn subscribe<T, F>(registry: &Registry, name: &str, kind: &'static str, callback: F) -> HandlerRef<Payload>
where
    T: DeserializeOwned + 'static,
    F: Fn(&T) -> HandlerResult + Send + Sync + 'static,
{
    let subscriber = handler(move |payload: &Payload| {
        if payload.message_type() != Some(kind) {
            return Ok(());
        }
        let message = payload.parse::<T>()?;
        callback(&message)
    });
    registry.add_message_handler(name, subscriber.clone());
    subscriber
}
