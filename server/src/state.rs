//! Shared relay state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the live rooms: every editor photo and every batch job is a room
//! keyed by kind and id, and each room maps connected client ids to the
//! sender feeding that client's socket. Rooms are created on first join and
//! dropped when the last client parts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use frames::{BatchUpdate, Payload, ProcessingUpdate};
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

/// Outbound text frames for one connected client.
pub type ClientTx = mpsc::Sender<String>;

// =============================================================================
// ROOMS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    Editor,
    Batch,
}

/// Identifies one broadcast group, e.g. `editor_42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub kind: RoomKind,
    pub id: String,
}

impl RoomKey {
    #[must_use]
    pub fn editor(photo_id: impl Into<String>) -> Self {
        Self { kind: RoomKind::Editor, id: photo_id.into() }
    }

    #[must_use]
    pub fn batch(job_id: impl Into<String>) -> Self {
        Self { kind: RoomKind::Batch, id: job_id.into() }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RoomKind::Editor => "editor",
            RoomKind::Batch => "batch",
        };
        write!(f, "{kind}_{}", self.id)
    }
}

/// Room ids are word characters only (Unicode letters and digits, `_`).
#[must_use]
pub fn valid_room_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_alphanumeric() || c == '_')
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state. Clone is required by Axum; the room map is
/// `Arc`-wrapped.
#[derive(Clone, Default)]
pub struct AppState {
    pub rooms: Arc<RwLock<HashMap<RoomKey, HashMap<Uuid, ClientTx>>>>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, room: &RoomKey, client_id: Uuid, tx: ClientTx) {
        let mut rooms = self.rooms.write().await;
        let clients = rooms.entry(room.clone()).or_default();
        clients.insert(client_id, tx);
        debug!(%room, %client_id, clients = clients.len(), "room join");
    }

    pub async fn part(&self, room: &RoomKey, client_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        let Some(clients) = rooms.get_mut(room) else {
            return;
        };
        clients.remove(&client_id);
        if clients.is_empty() {
            rooms.remove(room);
        }
        debug!(%room, %client_id, "room part");
    }

    /// Number of clients currently in `room`.
    pub async fn room_size(&self, room: &RoomKey) -> usize {
        self.rooms.read().await.get(room).map_or(0, HashMap::len)
    }

    /// Queue `text` to every client in `room` except `exclude`. Returns how
    /// many clients accepted it.
    pub async fn broadcast(&self, room: &RoomKey, text: &str, exclude: Option<Uuid>) -> usize {
        let rooms = self.rooms.read().await;
        let Some(clients) = rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for (client_id, tx) in clients {
            if exclude == Some(*client_id) {
                continue;
            }
            // Best-effort: a client whose channel is full misses this frame.
            if tx.try_send(text.to_owned()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn publish_processing_update(&self, photo_id: &str, update: &ProcessingUpdate) -> usize {
        let text = Payload::from(update).encode();
        self.broadcast(&RoomKey::editor(photo_id), &text, None).await
    }

    /// Push batch progress to everyone watching `job_id`.
    pub async fn publish_batch_update(&self, job_id: &str, update: &BatchUpdate) -> usize {
        let text = Payload::from(update).encode();
        self.broadcast(&RoomKey::batch(job_id), &text, None).await
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod state_test;
