//! WebSocket handlers for the editor and batch rooms.
//!
//! DESIGN
//! ======
//! On upgrade the client joins its room and enters a `select!` loop:
//! - Incoming client frames → decode + dispatch; replies go to the sender only
//! - Room broadcasts → forward to client
//!
//! Editor sockets re-broadcast `processing_update` frames to the whole room
//! (sender included). Batch sockets are receive-only apart from keep-alive.
//! A `ping` is always answered with a `pong` echoing its timestamp.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → join room
//! 2. Client sends frames → process → replies to sender, broadcasts to room
//! 3. Close → part room

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use frames::{Envelope, Payload, ProcessingUpdate, TYPE_PROCESSING_UPDATE};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::{AppState, RoomKey, RoomKind, valid_room_id};

const CLIENT_BUFFER: usize = 256;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn editor_ws(
    State(state): State<AppState>,
    Path(photo_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, state, RoomKey::editor(photo_id))
}

pub async fn batch_ws(State(state): State<AppState>, Path(job_id): Path<String>, ws: WebSocketUpgrade) -> Response {
    upgrade(ws, state, RoomKey::batch(job_id))
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, room: RoomKey) -> Response {
    if !valid_room_id(&room.id) {
        return (StatusCode::BAD_REQUEST, "invalid room id").into_response();
    }
    ws.on_upgrade(move |socket| run_ws(socket, state, room))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, room: RoomKey) {
    let client_id = Uuid::new_v4();
    let (client_tx, mut client_rx) = mpsc::channel::<String>(CLIENT_BUFFER);
    state.join(&room, client_id, client_tx).await;
    info!(%client_id, %room, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &room, client_id, text.as_str()).await;
                        if send_all(&mut socket, replies).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(text) = client_rx.recv() => {
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.part(&room, client_id).await;
    info!(%client_id, %room, "ws: client disconnected");
}

async fn send_all(socket: &mut WebSocket, frames: Vec<String>) -> Result<(), axum::Error> {
    for text in frames {
        socket.send(Message::Text(text.into())).await?;
    }
    Ok(())
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Handle one inbound text frame and return the frames owed to the sender.
async fn process_inbound_text(state: &AppState, room: &RoomKey, client_id: Uuid, text: &str) -> Vec<String> {
    match frames::decode(text) {
        Envelope::Ping { timestamp } => vec![frames::encode(&Envelope::pong(timestamp))],
        Envelope::Pong { .. } => Vec::new(),
        Envelope::Message(payload) => handle_message(state, room, client_id, &payload).await,
    }
}

async fn handle_message(state: &AppState, room: &RoomKey, client_id: Uuid, payload: &Payload) -> Vec<String> {
    match (room.kind, payload.message_type()) {
        (RoomKind::Editor, Some(TYPE_PROCESSING_UPDATE)) => match payload.parse::<ProcessingUpdate>() {
            Ok(update) => {
                let delivered = state.publish_processing_update(&room.id, &update).await;
                debug!(%client_id, %room, progress = update.progress, delivered, "ws: processing update relayed");
                Vec::new()
            }
            Err(e) => {
                warn!(%client_id, %room, error = %e, "ws: malformed processing update");
                vec![error_frame(&format!("invalid processing_update: {e}"))]
            }
        },
        (_, kind) => {
            debug!(%client_id, %room, kind = kind.unwrap_or("<untyped>"), "ws: ignored frame");
            Vec::new()
        }
    }
}

fn error_frame(message: &str) -> String {
    let mut fields = Map::new();
    fields.insert("message".to_owned(), Value::String(message.to_owned()));
    Payload::typed("error", fields).encode()
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod ws_test;
