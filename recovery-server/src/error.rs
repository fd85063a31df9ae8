use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use recovery_core::{ErrorKind, RecoveryError};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Locked(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<RecoveryError> for AppError {
    fn from(e: RecoveryError) -> Self {
        let msg = e.to_string();
        match e.kind() {
            ErrorKind::NotFound => AppError::NotFound(msg),
            ErrorKind::LockContention => AppError::Locked(msg),
            ErrorKind::DependentsActive | ErrorKind::Cancelled => AppError::Conflict(msg),
            ErrorKind::ChainBroken | ErrorKind::ChecksumMismatch | ErrorKind::InvalidState => {
                AppError::Unprocessable(msg)
            }
            ErrorKind::LedgerUnavailable | ErrorKind::Storage | ErrorKind::Timeout => {
                AppError::ServiceUnavailable(msg)
            }
            ErrorKind::Internal => AppError::Internal(e.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Locked(m) => (StatusCode::LOCKED, m.clone()),
            AppError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            AppError::ServiceUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}
