use crate::error::AppError;
use crate::routes::json_or_default;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use recovery_core::engine::retention::CleanupReport;
use recovery_core::RetentionPolicy;
use serde::Deserialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/cleanup", post(cleanup))
}

/// Overrides for the configured policy; absent fields keep the configured value.
#[derive(Deserialize, Default)]
pub struct CleanupBody {
    pub max_age_days: Option<i64>,
    pub max_count_per_type: Option<usize>,
    pub purge_primary: Option<bool>,
}

impl CleanupBody {
    fn apply(self, mut policy: RetentionPolicy) -> RetentionPolicy {
        if self.max_age_days.is_some() {
            policy.max_age_days = self.max_age_days;
        }
        if self.max_count_per_type.is_some() {
            policy.max_count_per_type = self.max_count_per_type;
        }
        if let Some(purge) = self.purge_primary {
            policy.purge_primary = purge;
        }
        policy
    }
}

async fn cleanup(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<CleanupReport>, AppError> {
    let body: CleanupBody = json_or_default(&body)?;
    let policy = body.apply(state.config.core.retention_policy());
    let report = state.service.cleanup_old_backups(&policy).await;
    state.events.publish("retention:cleanup", &report);
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::TestApp;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    #[test]
    fn test_body_overrides_only_given_fields() {
        let configured = RetentionPolicy {
            max_age_days: Some(30),
            max_count_per_type: None,
            purge_primary: false,
        };
        let body = CleanupBody {
            max_count_per_type: Some(2),
            ..Default::default()
        };
        let policy = body.apply(configured);
        assert_eq!(policy.max_age_days, Some(30));
        assert_eq!(policy.max_count_per_type, Some(2));
        assert!(!policy.purge_primary);
    }

    #[tokio::test]
    async fn test_cleanup_by_count_keeps_newest() {
        let app = TestApp::new().await;
        let first = app.full_backup().await;
        let second = app.full_backup().await;
        let third = app.full_backup().await;

        let (status, body) = app
            .call(
                Method::POST,
                "/api/retention/cleanup",
                Some(json!({"max_count_per_type": 1})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let mut deleted: Vec<String> = body["deleted_ids"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        deleted.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(deleted, expected);

        let (_, body) = app
            .call(Method::GET, &format!("/api/backups/{third}"), None)
            .await;
        assert_eq!(body["record"]["status"], "ACTIVE");
    }
}
