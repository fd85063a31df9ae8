use crate::error::AppError;
use crate::routes::json_or_default;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use recovery_core::engine::backup::CreatedBackup;
use recovery_core::engine::list::ListResult;
use recovery_core::engine::reconcile::VerifyReport;
use recovery_core::engine::retention::DeleteAck;
use recovery_core::models::{BackupRecord, BackupStatus, BackupType, RecordFilter};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups))
        .route("/full", post(create_full))
        .route("/{id}", get(get_backup).delete(delete_backup))
        .route("/{id}/incremental", post(create_incremental))
        .route("/{id}/verify", get(verify_backup))
}

#[derive(Deserialize, Default)]
pub struct TriggerBody {
    #[serde(default)]
    pub triggered_by: Option<String>,
}

impl TriggerBody {
    fn actor(&self) -> &str {
        self.triggered_by.as_deref().unwrap_or("api")
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<BackupStatus>,
    #[serde(rename = "type")]
    pub backup_type: Option<BackupType>,
    pub triggered_by: Option<String>,
    pub parent_backup_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub purge: bool,
}

async fn create_full(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<BackupRecord>), AppError> {
    let body: TriggerBody = json_or_default(&body)?;
    let record = state.service.create_full_backup(body.actor()).await?;
    state.events.publish("backup:created", &record);
    Ok((StatusCode::CREATED, Json(record)))
}

async fn create_incremental(
    State(state): State<Arc<AppState>>,
    Path(parent_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreatedBackup>), AppError> {
    let body: TriggerBody = json_or_default(&body)?;
    let created = state
        .service
        .create_incremental_backup(&parent_id, body.actor())
        .await?;
    state.events.publish("backup:created", &created.record);
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<ListResult> {
    let filter = RecordFilter {
        status: query.status,
        backup_type: query.backup_type,
        triggered_by: query.triggered_by,
        parent_backup_id: query.parent_backup_id,
        ..Default::default()
    };
    Json(state.service.list_backups(&filter, query.limit).await)
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let (record, source) = state.service.get_backup(&id).await?;
    Ok(Json(json!({ "record": record, "source": source })))
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<DeleteAck>, AppError> {
    let ack = state.service.delete_backup_with(&id, query.purge).await?;
    if !ack.already_deleted {
        state.events.publish("backup:deleted", &ack);
    }
    Ok(Json(ack))
}

async fn verify_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<VerifyReport> {
    Json(state.service.verify_backup(&id).await)
}
