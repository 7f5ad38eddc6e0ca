//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! The relay exposes the two realtime socket endpoints the photo editor
//! client connects to, one HTTP hook for pushing batch progress into a batch
//! room, and a health check.

pub mod ws;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use frames::BatchUpdate;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::{AppState, valid_room_id};

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/editor/{photo_id}/", get(ws::editor_ws))
        .route("/ws/batch/{job_id}/", get(ws::batch_ws))
        .route("/api/batch/{job_id}/progress", post(publish_batch_progress))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Published {
    delivered: usize,
}

async fn publish_batch_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(update): Json<BatchUpdate>,
) -> Result<Json<Published>, StatusCode> {
    if !valid_room_id(&job_id) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let delivered = state.publish_batch_update(&job_id, &update).await;
    tracing::info!(%job_id, completed = update.completed, total = update.total, delivered, "batch progress published");
    Ok(Json(Published { delivered }))
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
