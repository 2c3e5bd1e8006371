//! Build record and log repository.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{BuildId, BuildRecord, LogEntry};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// Result of `create_record`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A record with this id was already stored; it is returned unchanged.
    Existing(BuildRecord),
}

/// Rows removed by `purge_expired`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeStats {
    pub builds: u64,
    pub log_lines: u64,
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Store a new record unless one with the same id exists.
    async fn create_record(&self, record: &BuildRecord) -> DbResult<CreateOutcome>;

    async fn get_record(&self, id: BuildId) -> DbResult<BuildRecord>;

    /// Overwrite the record and restart its retention window.
    async fn put_record(&self, record: &BuildRecord) -> DbResult<()>;

    async fn append_log(&self, entry: &LogEntry) -> DbResult<()>;

    /// Log lines in the order they were appended.
    async fn get_logs(&self, id: BuildId) -> DbResult<Vec<LogEntry>>;

    /// Newest records first.
    async fn list_recent(&self, limit: u32) -> DbResult<Vec<BuildRecord>>;

    /// Records still queued that were created before `cutoff`, oldest first.
    async fn list_queued_before(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<BuildRecord>>;

    /// Delete expired records and log lines.
    async fn purge_expired(&self) -> DbResult<PurgeStats>;
}

/// A build row from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct BuildRow {
    id: uuid::Uuid,
    repository_url: String,
    branch: Option<String>,
    commit_hash: Option<String>,
    submitter_id: String,
    submitted_at: DateTime<Utc>,
    phase: String,
    status_message: String,
    artifact_reference: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    dispatched_at: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRow> for BuildRecord {
    type Error = DbError;

    fn try_from(row: BuildRow) -> DbResult<Self> {
        let phase = row
            .phase
            .parse()
            .map_err(|_| DbError::InvalidData(format!("build {} has phase '{}'", row.id, row.phase)))?;
        Ok(BuildRecord {
            id: BuildId::from_uuid(row.id),
            repository_url: row.repository_url,
            branch: row.branch,
            commit_hash: row.commit_hash,
            submitter_id: row.submitter_id,
            submitted_at: row.submitted_at,
            phase,
            status_message: row.status_message,
            artifact_reference: row.artifact_reference,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            dispatched_at: row.dispatched_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct LogRow {
    build_id: uuid::Uuid,
    line: String,
    emitted_at: DateTime<Utc>,
}

const BUILD_COLUMNS: &str = "id, repository_url, branch, commit_hash, submitter_id, submitted_at, \
     phase, status_message, artifact_reference, created_at, updated_at, started_at, \
     completed_at, duration_ms, dispatched_at";

/// PostgreSQL implementation of BuildStore.
pub struct PgBuildStore {
    pool: PgPool,
    retention: Duration,
}

impl PgBuildStore {
    pub fn new(pool: PgPool, retention: Duration) -> Self {
        Self { pool, retention }
    }

    fn retention_secs(&self) -> f64 {
        self.retention.as_secs_f64()
    }
}

#[async_trait]
impl BuildStore for PgBuildStore {
    async fn create_record(&self, record: &BuildRecord) -> DbResult<CreateOutcome> {
        let inserted: Option<uuid::Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO builds (
                id, repository_url, branch, commit_hash, submitter_id, submitted_at,
                phase, status_message, artifact_reference, created_at, updated_at,
                started_at, completed_at, duration_ms, dispatched_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    NOW() + make_interval(secs => $16))
            ON CONFLICT (id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.repository_url)
        .bind(&record.branch)
        .bind(&record.commit_hash)
        .bind(&record.submitter_id)
        .bind(record.submitted_at)
        .bind(record.phase.as_str())
        .bind(&record.status_message)
        .bind(&record.artifact_reference)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.duration_ms)
        .bind(record.dispatched_at)
        .bind(self.retention_secs())
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(_) => Ok(CreateOutcome::Created),
            None => {
                let existing = self.get_record(record.id).await?;
                Ok(CreateOutcome::Existing(existing))
            }
        }
    }

    async fn get_record(&self, id: BuildId) -> DbResult<BuildRecord> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {} FROM builds WHERE id = $1 AND expires_at > NOW()",
            BUILD_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        row.try_into()
    }

    async fn put_record(&self, record: &BuildRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO builds (
                id, repository_url, branch, commit_hash, submitter_id, submitted_at,
                phase, status_message, artifact_reference, created_at, updated_at,
                started_at, completed_at, duration_ms, dispatched_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    NOW() + make_interval(secs => $16))
            ON CONFLICT (id) DO UPDATE SET
                phase = EXCLUDED.phase,
                status_message = EXCLUDED.status_message,
                artifact_reference = EXCLUDED.artifact_reference,
                updated_at = EXCLUDED.updated_at,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                duration_ms = EXCLUDED.duration_ms,
                dispatched_at = EXCLUDED.dispatched_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.repository_url)
        .bind(&record.branch)
        .bind(&record.commit_hash)
        .bind(&record.submitter_id)
        .bind(record.submitted_at)
        .bind(record.phase.as_str())
        .bind(&record.status_message)
        .bind(&record.artifact_reference)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.duration_ms)
        .bind(record.dispatched_at)
        .bind(self.retention_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_log(&self, entry: &LogEntry) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO build_logs (build_id, line, emitted_at, expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            "#,
        )
        .bind(entry.build_id.as_uuid())
        .bind(&entry.line)
        .bind(entry.emitted_at)
        .bind(self.retention_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_logs(&self, id: BuildId) -> DbResult<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT build_id, line, emitted_at FROM build_logs
            WHERE build_id = $1 AND expires_at > NOW()
            ORDER BY id ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| LogEntry::new(BuildId::from_uuid(r.build_id), r.line, r.emitted_at))
            .collect())
    }

    async fn list_recent(&self, limit: u32) -> DbResult<Vec<BuildRecord>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {} FROM builds WHERE expires_at > NOW() ORDER BY created_at DESC LIMIT $1",
            BUILD_COLUMNS
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BuildRecord::try_from).collect()
    }

    async fn list_queued_before(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<BuildRecord>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {} FROM builds \
             WHERE phase = 'queued' AND created_at < $1 AND expires_at > NOW() \
             ORDER BY created_at ASC",
            BUILD_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BuildRecord::try_from).collect()
    }

    async fn purge_expired(&self) -> DbResult<PurgeStats> {
        let builds = sqlx::query("DELETE FROM builds WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        let log_lines = sqlx::query("DELETE FROM build_logs WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(PurgeStats { builds, log_lines })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::{BuildRequest, Phase, ProgressEvent};

    async fn store() -> PgBuildStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = crate::create_pool(&url, 2).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        PgBuildStore::new(pool, Duration::from_secs(3600))
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn test_record_round_trip() {
        let store = store().await;
        let req = BuildRequest::new("https://example.com/repo", "user-1").with_branch("main");
        let mut record = BuildRecord::queued(&req);

        assert_eq!(store.create_record(&record).await.unwrap(), CreateOutcome::Created);
        assert!(matches!(
            store.create_record(&record).await.unwrap(),
            CreateOutcome::Existing(_)
        ));

        record.apply(&ProgressEvent::status(record.id, Phase::Running, "build started"));
        store.put_record(&record).await.unwrap();

        let loaded = store.get_record(record.id).await.unwrap();
        assert_eq!(loaded.phase, Phase::Running);
        assert_eq!(loaded.branch.as_deref(), Some("main"));
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn test_logs_keep_append_order() {
        let store = store().await;
        let id = BuildId::new();
        for line in ["Build started", "Cloning repository...", "npm install"] {
            store
                .append_log(&LogEntry::new(id, line, Utc::now()))
                .await
                .unwrap();
        }
        let lines: Vec<String> = store
            .get_logs(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.line)
            .collect();
        assert_eq!(lines, ["Build started", "Cloning repository...", "npm install"]);
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn test_unknown_build_is_not_found() {
        let store = store().await;
        assert!(matches!(
            store.get_record(BuildId::new()).await,
            Err(DbError::NotFound(_))
        ));
    }
}
