use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use recovery_core::engine::emergency::RecoveryReport;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/emergency", post(emergency_recovery))
}

async fn emergency_recovery(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RecoveryReport>, AppError> {
    tracing::warn!("Emergency recovery requested");
    let report = state.service.emergency_recovery().await?;
    state.events.publish("recovery:finished", &report);
    Ok(Json(report))
}
