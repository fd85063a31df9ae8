//! SQLite-backed primary metadata store.

use super::PrimaryMetadataStore;
use crate::models::record::format_timestamp;
use crate::models::{
    BackupRecord, BackupStatus, BackupType, PrimaryStats, RecordFilter,
};
use crate::utils::{RecoveryError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, Connection, Row};
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_records (
  backup_id TEXT PRIMARY KEY,
  backup_type TEXT NOT NULL CHECK(backup_type IN ('FULL','INCREMENTAL')),
  status TEXT NOT NULL CHECK(status IN ('ACTIVE','DELETED','FAILED','LEDGER_PENDING')),
  created_at TEXT NOT NULL,
  triggered_by TEXT NOT NULL,
  cid TEXT NOT NULL,
  checksum TEXT NOT NULL,
  size_bytes INTEGER NOT NULL DEFAULT 0,
  parent_backup_id TEXT,
  ledger_tx_id TEXT,
  CHECK ((backup_type = 'FULL' AND parent_backup_id IS NULL)
      OR (backup_type = 'INCREMENTAL' AND parent_backup_id IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_backup_records_created_at ON backup_records(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_backup_records_parent ON backup_records(parent_backup_id);
CREATE INDEX IF NOT EXISTS idx_backup_records_status ON backup_records(status);
"#;

fn create_pool(db_path: &Path) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA busy_timeout = 5000;",
        )
    });
    let pool = Pool::builder().max_size(4).build(manager)?;
    Ok(pool)
}

fn migrate(conn: &Connection) -> Result<()> {
    tracing::info!("[DB] Starting metadata store migration...");
    conn.execute_batch(SCHEMA)?;

    let has_column = |table: &str, column: &str| -> Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(columns.iter().any(|c| c == column))
    };

    if !has_column("backup_records", "mirror_attempts")? {
        conn.execute_batch(
            "ALTER TABLE backup_records ADD COLUMN mirror_attempts INTEGER NOT NULL DEFAULT 0",
        )?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn row_to_record(row: &Row) -> rusqlite::Result<BackupRecord> {
    let backup_type: String = row.get("backup_type")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let size_bytes: i64 = row.get("size_bytes")?;
    Ok(BackupRecord {
        backup_id: row.get("backup_id")?,
        backup_type: backup_type.parse().map_err(|e| conversion_error(1, e))?,
        status: status.parse().map_err(|e| conversion_error(2, e))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| conversion_error(3, e))?
            .with_timezone(&Utc),
        triggered_by: row.get("triggered_by")?,
        cid: row.get("cid")?,
        checksum: row.get("checksum")?,
        size_bytes: size_bytes.max(0) as u64,
        parent_backup_id: row.get("parent_backup_id")?,
        ledger_tx_id: row.get("ledger_tx_id")?,
    })
}

fn find_by_id(conn: &Connection, backup_id: &str) -> Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_records WHERE backup_id = ?")?;
    let mut rows = stmt.query_map(params![backup_id], row_to_record)?;
    Ok(rows.next().transpose()?)
}

fn find_matching(
    conn: &Connection,
    filter: &RecordFilter,
    limit: Option<usize>,
) -> Result<Vec<BackupRecord>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        clauses.push("status = ?");
        values.push(Box::new(status.as_str()));
    }
    if let Some(backup_type) = filter.backup_type {
        clauses.push("backup_type = ?");
        values.push(Box::new(backup_type.as_str()));
    }
    if let Some(ref triggered_by) = filter.triggered_by {
        clauses.push("triggered_by = ?");
        values.push(Box::new(triggered_by.clone()));
    }
    if let Some(ref parent) = filter.parent_backup_id {
        clauses.push("parent_backup_id = ?");
        values.push(Box::new(parent.clone()));
    }
    if let Some(ref cid) = filter.cid {
        clauses.push("cid = ?");
        values.push(Box::new(cid.clone()));
    }
    if let Some(ref before) = filter.created_before {
        clauses.push("created_at < ?");
        values.push(Box::new(format_timestamp(before)));
    }

    let mut sql = String::from("SELECT * FROM backup_records");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, backup_id ASC");
    if let Some(limit) = limit {
        sql.push_str(" LIMIT ?");
        values.push(Box::new(limit as i64));
    }

    let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), row_to_record)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: DbPool,
}

impl SqliteMetadataStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = create_pool(db_path)?;
        migrate(&*pool.get()?)?;
        Ok(Self { pool })
    }

    /// Run a closure on a pooled connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| RecoveryError::Primary(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl PrimaryMetadataStore for SqliteMetadataStore {
    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn insert(&self, record: &BackupRecord) -> Result<()> {
        record.validate()?;
        let r = record.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "INSERT INTO backup_records (backup_id, backup_type, status, created_at, triggered_by, cid, checksum, size_bytes, parent_backup_id, ledger_tx_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(backup_id) DO NOTHING",
                params![
                    r.backup_id,
                    r.backup_type.as_str(),
                    r.status.as_str(),
                    format_timestamp(&r.created_at),
                    r.triggered_by,
                    r.cid,
                    r.checksum,
                    r.size_bytes as i64,
                    r.parent_backup_id,
                    r.ledger_tx_id,
                ],
            )?;
            if changed == 0 {
                // A retried insert may find its own earlier attempt already committed
                match find_by_id(conn, &r.backup_id)? {
                    Some(existing) if existing.same_identity(&r) => {}
                    _ => {
                        return Err(RecoveryError::InvalidRecord {
                            backup_id: r.backup_id.clone(),
                            reason: "backup_id already recorded with different content".into(),
                        })
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        let id = backup_id.to_string();
        self.with_conn(move |conn| find_by_id(conn, &id)).await
    }

    async fn query(
        &self,
        filter: &RecordFilter,
        limit: Option<usize>,
    ) -> Result<Vec<BackupRecord>> {
        let filter = filter.clone();
        self.with_conn(move |conn| find_matching(conn, &filter, limit))
            .await
    }

    async fn update_status(&self, backup_id: &str, status: BackupStatus) -> Result<()> {
        let id = backup_id.to_string();
        self.with_conn(move |conn| {
            let changes = conn.execute(
                "UPDATE backup_records SET status = ? WHERE backup_id = ?",
                params![status.as_str(), id],
            )?;
            if changes == 0 {
                return Err(RecoveryError::not_found(id));
            }
            Ok(())
        })
        .await
    }

    async fn mark_mirrored(&self, backup_id: &str, ledger_tx_id: &str) -> Result<bool> {
        let id = backup_id.to_string();
        let tx = ledger_tx_id.to_string();
        self.with_conn(move |conn| {
            let changes = conn.execute(
                "UPDATE backup_records SET status = 'ACTIVE', ledger_tx_id = ? WHERE backup_id = ? AND status = 'LEDGER_PENDING'",
                params![tx, id],
            )?;
            Ok(changes > 0)
        })
        .await
    }

    async fn record_mirror_attempt(&self, backup_id: &str) -> Result<u32> {
        let id = backup_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE backup_records SET mirror_attempts = mirror_attempts + 1 WHERE backup_id = ?",
                params![id],
            )?;
            let attempts: i64 = conn
                .query_row(
                    "SELECT mirror_attempts FROM backup_records WHERE backup_id = ?",
                    params![id],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => RecoveryError::not_found(id.clone()),
                    other => other.into(),
                })?;
            Ok(attempts.max(0) as u32)
        })
        .await
    }

    async fn purge(&self, backup_id: &str) -> Result<bool> {
        let id = backup_id.to_string();
        self.with_conn(move |conn| {
            let changes =
                conn.execute("DELETE FROM backup_records WHERE backup_id = ?", params![id])?;
            Ok(changes > 0)
        })
        .await
    }

    async fn stats(&self) -> Result<PrimaryStats> {
        self.with_conn(|conn| {
            let mut stats = PrimaryStats::default();
            let mut stmt = conn.prepare(
                "SELECT backup_type, status, COUNT(*), COALESCE(SUM(size_bytes), 0) FROM backup_records GROUP BY backup_type, status",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            for row in rows {
                let (backup_type, status, count, bytes) = row?;
                let count = count.max(0) as u64;
                stats.total += count;
                stats.total_bytes += bytes.max(0) as u64;
                *stats.by_status.entry(status).or_default() += count;
                *stats.by_type.entry(backup_type).or_default() += count;
            }
            Ok(stats)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ErrorKind;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(id: &str, parent: Option<&str>, age_minutes: i64) -> BackupRecord {
        BackupRecord {
            backup_id: id.to_string(),
            backup_type: if parent.is_some() {
                BackupType::Incremental
            } else {
                BackupType::Full
            },
            status: BackupStatus::LedgerPending,
            created_at: Utc::now() - Duration::minutes(age_minutes),
            triggered_by: "admin-1".into(),
            cid: format!("sha256-{id}"),
            checksum: format!("sum-{id}"),
            size_bytes: 100,
            parent_backup_id: parent.map(str::to_string),
            ledger_tx_id: None,
        }
    }

    fn open_store(dir: &TempDir) -> SqliteMetadataStore {
        SqliteMetadataStore::open(dir.path().join("meta.db")).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip_exactly() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let rec = record("f1", None, 5);
        store.insert(&rec).await.unwrap();

        assert_eq!(store.get("f1").await.unwrap(), Some(rec));
        assert_eq!(store.get("nope").await.unwrap(), None);
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_insert_is_idempotent_for_same_identity() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let rec = record("f1", None, 5);
        store.insert(&rec).await.unwrap();
        store.insert(&rec).await.unwrap();

        let mut other = rec.clone();
        other.cid = "sha256-other".into();
        let err = store.insert(&other).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(store.get("f1").await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn test_query_filters_and_orders_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.insert(&record("f1", None, 30)).await.unwrap();
        store.insert(&record("i1", Some("f1"), 20)).await.unwrap();
        store.insert(&record("i2", Some("i1"), 10)).await.unwrap();

        let all = store.query(&RecordFilter::default(), None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.backup_id.as_str()).collect();
        assert_eq!(ids, vec!["i2", "i1", "f1"]);

        let children = store
            .query(&RecordFilter::children_of("f1"), None)
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].backup_id, "i1");

        let limited = store.query(&RecordFilter::default(), Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);

        let fulls = store
            .query(
                &RecordFilter {
                    backup_type: Some(BackupType::Full),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(fulls.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_mirrored_only_flips_pending() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.insert(&record("f1", None, 1)).await.unwrap();

        assert!(store.mark_mirrored("f1", "tx-1").await.unwrap());
        assert!(!store.mark_mirrored("f1", "tx-2").await.unwrap());
        let rec = store.get("f1").await.unwrap().unwrap();
        assert_eq!(rec.status, BackupStatus::Active);
        assert_eq!(rec.ledger_tx_id.as_deref(), Some("tx-1"));
    }

    #[tokio::test]
    async fn test_mirror_attempts_and_status_updates() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.insert(&record("f1", None, 1)).await.unwrap();

        assert_eq!(store.record_mirror_attempt("f1").await.unwrap(), 1);
        assert_eq!(store.record_mirror_attempt("f1").await.unwrap(), 2);
        store
            .update_status("f1", BackupStatus::Failed)
            .await
            .unwrap();

        let err = store
            .update_status("ghost", BackupStatus::Deleted)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_status.get("FAILED"), Some(&1));
        assert!(store.purge("f1").await.unwrap());
        assert!(!store.purge("f1").await.unwrap());
    }

    #[tokio::test]
    async fn test_schema_rejects_parentless_incremental() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut bad = record("i1", Some("f1"), 1);
        bad.parent_backup_id = None;
        assert!(store.insert(&bad).await.is_err());
    }
}
