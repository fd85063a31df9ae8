use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use recovery_core::models::Dataset;
use recovery_core::LiveData;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(summary).put(replace))
}

#[derive(Serialize)]
pub struct LiveSummary {
    pub checksum: String,
    pub documents: usize,
    pub collections: BTreeMap<String, usize>,
}

impl From<&Dataset> for LiveSummary {
    fn from(ds: &Dataset) -> Self {
        Self {
            checksum: ds.checksum(),
            documents: ds.document_count(),
            collections: ds
                .collections
                .iter()
                .map(|(name, docs)| (name.clone(), docs.len()))
                .collect(),
        }
    }
}

async fn summary(State(state): State<Arc<AppState>>) -> Result<Json<LiveSummary>, AppError> {
    let snapshot = state.live.snapshot().await?;
    Ok(Json(LiveSummary::from(&snapshot)))
}

/// Business-side write of the whole dataset. Refused while a restore owns it.
async fn replace(
    State(state): State<Arc<AppState>>,
    Json(dataset): Json<Dataset>,
) -> Result<Json<LiveSummary>, AppError> {
    if let Some(held) = state.service.locks().current() {
        return Err(AppError::Locked(format!(
            "Live data is busy: {held} operation in progress"
        )));
    }
    let summary = LiveSummary::from(&dataset);
    state.live.replace(dataset).await;
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::TestApp;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_replace_then_read_back() {
        let app = TestApp::new().await;
        let (status, body) = app.call(Method::GET, "/api/live", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["documents"], 15);

        let (status, body) = app
            .call(
                Method::PUT,
                "/api/live",
                Some(json!({"orders": {"o-1": {"qty": 1}}})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["documents"], 1);
        assert_eq!(body["collections"]["orders"], 1);

        let (_, body) = app.call(Method::GET, "/api/live", None).await;
        assert_eq!(body["documents"], 1);
    }
}
