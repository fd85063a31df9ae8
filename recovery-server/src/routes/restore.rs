use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use recovery_core::engine::restore::RestoreReport;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/state", get(restore_state))
        .route("/cancel", post(cancel_restore))
        .route("/{id}", post(restore_full))
        .route("/{id}/chain", post(restore_chain))
}

#[derive(Deserialize)]
pub struct RestoreQuery {
    #[serde(default)]
    pub safe_mode: bool,
}

async fn restore_full(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RestoreQuery>,
) -> Result<Json<RestoreReport>, AppError> {
    state
        .events
        .publish("restore:started", &json!({ "backup_id": id, "safe_mode": query.safe_mode }));
    let result = state.service.restore_full(&id, query.safe_mode).await;
    finish(&state, &id, result)
}

async fn restore_chain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RestoreReport>, AppError> {
    state
        .events
        .publish("restore:started", &json!({ "backup_id": id, "chain": true }));
    let result = state.service.restore_chain(&id).await;
    finish(&state, &id, result)
}

fn finish(
    state: &AppState,
    backup_id: &str,
    result: recovery_core::Result<RestoreReport>,
) -> Result<Json<RestoreReport>, AppError> {
    match result {
        Ok(report) => {
            state.events.publish("restore:finished", &report);
            Ok(Json(report))
        }
        Err(e) => {
            state.events.publish(
                "restore:failed",
                &json!({ "backup_id": backup_id, "error": e.to_string() }),
            );
            Err(e.into())
        }
    }
}

async fn cancel_restore(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cancelled = state.service.cancel_restore();
    if cancelled {
        tracing::info!("Restore cancellation requested");
    }
    Json(json!({ "cancelled": cancelled }))
}

async fn restore_state(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "state": state.service.restore_state() }))
}
