pub mod backups;
pub mod live;
pub mod recovery;
pub mod restore;
pub mod retention;
pub mod stats;

use crate::error::AppError;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/backups", backups::router(state.clone()))
        .nest("/api/restore", restore::router(state.clone()))
        .nest("/api/recovery", recovery::router(state.clone()))
        .nest("/api/retention", retention::router(state.clone()))
        .nest("/api/stats", stats::router(state.clone()))
        .nest("/api/live", live::router(state.clone()))
        .route("/health", get(health))
        .route("/ws", get(crate::ws::events::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "restore_state": state.service.restore_state(),
        "lock_held": state.service.locks().current(),
    }))
}

/// An empty body means "use the defaults".
pub(crate) fn json_or_default<T>(body: &Bytes) -> Result<T, AppError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("Invalid body: {e}")))
}


#[cfg(test)]
mod tests {
    use super::test_support::TestApp;
    use axum::http::{Method, StatusCode};

    #[tokio::test]
    async fn test_health_reports_idle() {
        let app = TestApp::new().await;
        let (status, body) = app.call(Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["restore_state"], "IDLE");
        assert!(body["lock_held"].is_null());
    }

    #[test]
    fn test_blank_body_falls_back_to_default() {
        let parsed: recovery_core::RetentionPolicy =
            super::json_or_default(&axum::body::Bytes::from_static(b"  ")).unwrap();
        assert_eq!(parsed, recovery_core::RetentionPolicy::default());
        let err = super::json_or_default::<recovery_core::RetentionPolicy>(
            &axum::body::Bytes::from_static(b"{"),
        );
        assert!(err.is_err());
    }
}
