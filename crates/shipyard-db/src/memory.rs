//! In-process build store for tests and single-process deployments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::{BuildId, BuildRecord, LogEntry, Phase};
use tokio::sync::RwLock;

use crate::{BuildStore, CreateOutcome, DbError, DbResult, PurgeStats};

struct StoredRecord {
    record: BuildRecord,
    expires_at: DateTime<Utc>,
}

struct StoredLine {
    entry: LogEntry,
    expires_at: DateTime<Utc>,
}

/// BuildStore kept in memory with the same retention rules as the
/// database-backed store.
pub struct MemoryBuildStore {
    records: RwLock<HashMap<BuildId, StoredRecord>>,
    logs: RwLock<HashMap<BuildId, Vec<StoredLine>>>,
    retention: chrono::Duration,
}

impl MemoryBuildStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            logs: RwLock::new(HashMap::new()),
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
        }
    }

    fn expiry(&self) -> DateTime<Utc> {
        Utc::now()
            .checked_add_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for MemoryBuildStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 3600))
    }
}

#[async_trait]
impl BuildStore for MemoryBuildStore {
    async fn create_record(&self, record: &BuildRecord) -> DbResult<CreateOutcome> {
        let mut records = self.records.write().await;
        let now = Utc::now();
        if let Some(existing) = records.get(&record.id) {
            if existing.expires_at > now {
                return Ok(CreateOutcome::Existing(existing.record.clone()));
            }
        }
        records.insert(
            record.id,
            StoredRecord {
                record: record.clone(),
                expires_at: self.expiry(),
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn get_record(&self, id: BuildId) -> DbResult<BuildRecord> {
        let records = self.records.read().await;
        records
            .get(&id)
            .filter(|s| s.expires_at > Utc::now())
            .map(|s| s.record.clone())
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn put_record(&self, record: &BuildRecord) -> DbResult<()> {
        self.records.write().await.insert(
            record.id,
            StoredRecord {
                record: record.clone(),
                expires_at: self.expiry(),
            },
        );
        Ok(())
    }

    async fn append_log(&self, entry: &LogEntry) -> DbResult<()> {
        self.logs
            .write()
            .await
            .entry(entry.build_id)
            .or_default()
            .push(StoredLine {
                entry: entry.clone(),
                expires_at: self.expiry(),
            });
        Ok(())
    }

    async fn get_logs(&self, id: BuildId) -> DbResult<Vec<LogEntry>> {
        let now = Utc::now();
        let logs = self.logs.read().await;
        Ok(logs
            .get(&id)
            .map(|lines| {
                lines
                    .iter()
                    .filter(|l| l.expires_at > now)
                    .map(|l| l.entry.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_recent(&self, limit: u32) -> DbResult<Vec<BuildRecord>> {
        let now = Utc::now();
        let records = self.records.read().await;
        let mut live: Vec<BuildRecord> = records
            .values()
            .filter(|s| s.expires_at > now)
            .map(|s| s.record.clone())
            .collect();
        live.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        live.truncate(limit as usize);
        Ok(live)
    }

    async fn list_queued_before(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<BuildRecord>> {
        let now = Utc::now();
        let records = self.records.read().await;
        let mut queued: Vec<BuildRecord> = records
            .values()
            .filter(|s| s.expires_at > now)
            .filter(|s| s.record.phase == Phase::Queued && s.record.created_at < cutoff)
            .map(|s| s.record.clone())
            .collect();
        queued.sort_by_key(|r| r.created_at);
        Ok(queued)
    }

    async fn purge_expired(&self) -> DbResult<PurgeStats> {
        let now = Utc::now();
        let mut stats = PurgeStats::default();

        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, s| s.expires_at > now);
        stats.builds = (before - records.len()) as u64;
        drop(records);

        let mut logs = self.logs.write().await;
        for lines in logs.values_mut() {
            let before = lines.len();
            lines.retain(|l| l.expires_at > now);
            stats.log_lines += (before - lines.len()) as u64;
        }
        logs.retain(|_, lines| !lines.is_empty());
        Ok(stats)
    }
}
