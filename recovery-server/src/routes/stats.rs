use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use recovery_core::models::{LedgerStats, StorageStats};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/storage", get(storage_stats))
        .route("/ledger", get(ledger_stats))
}

async fn storage_stats(State(state): State<Arc<AppState>>) -> Result<Json<StorageStats>, AppError> {
    Ok(Json(state.service.storage_stats().await?))
}

async fn ledger_stats(State(state): State<Arc<AppState>>) -> Result<Json<LedgerStats>, AppError> {
    Ok(Json(state.service.ledger_stats().await?))
}
