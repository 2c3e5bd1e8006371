//! The canonical owner of build state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shipyard_bus::{MessageBus, Topic, publish_json};
use shipyard_core::{
    BuildId, BuildRecord, BuildRequest, LogEntry, MergeOutcome, Phase, ProgressEvent, redact_url,
};
use shipyard_db::{BuildStore, CreateOutcome};
use tracing::{debug, error, info, warn};

use crate::{KeyedLocks, OrchestratorError, OrchestratorResult};

/// Accepts submissions, dispatches jobs and reconciles progress events into
/// the single record per build.
pub struct BuildOrchestrator {
    store: Arc<dyn BuildStore>,
    bus: Arc<dyn MessageBus>,
    locks: KeyedLocks,
}

impl BuildOrchestrator {
    pub fn new(store: Arc<dyn BuildStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            store,
            bus,
            locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BuildStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub(crate) fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    /// Create the queued record for a submission and dispatch it to the
    /// builders.
    ///
    /// A redelivered request for a build that was already dispatched is a
    /// no-op. If an earlier delivery persisted the record but failed to
    /// dispatch, this one dispatches it.
    pub async fn on_build_request(&self, request: BuildRequest) -> OrchestratorResult<()> {
        request.validate()?;
        let _guard = self.locks.lock(request.id).await;

        let record = BuildRecord::queued(&request);
        let mut record = match self.store.create_record(&record).await? {
            CreateOutcome::Created => {
                info!(
                    build_id = %request.id,
                    repository = %redact_url(&request.repository_url),
                    submitter = %request.submitter_id,
                    "Build queued"
                );
                let status = ProgressEvent::status(request.id, Phase::Queued, &record.status_message);
                publish_json(
                    self.bus.as_ref(),
                    Topic::BuildStatus,
                    &request.id.partition_key(),
                    &status,
                )
                .await?;
                record
            }
            CreateOutcome::Existing(existing) => {
                if existing.dispatched_at.is_some() || existing.phase != Phase::Queued {
                    info!(build_id = %request.id, phase = %existing.phase, "Duplicate build request ignored");
                    return Ok(());
                }
                warn!(build_id = %request.id, "Build was persisted but never dispatched, dispatching now");
                existing
            }
        };

        if let Err(e) = publish_json(
            self.bus.as_ref(),
            Topic::BuildJobs,
            &request.id.partition_key(),
            &request,
        )
        .await
        {
            error!(
                build_id = %request.id,
                error = %e,
                "Failed to dispatch build job, build remains queued"
            );
            return Err(e.into());
        }

        record.dispatched_at = Some(Utc::now());
        self.store.put_record(&record).await?;
        info!(build_id = %request.id, "Build dispatched");
        Ok(())
    }

    /// Fold one progress event into the canonical record. Duplicates, late
    /// arrivals and events for terminal builds leave the record unchanged.
    pub async fn on_progress_event(&self, event: ProgressEvent) -> OrchestratorResult<MergeOutcome> {
        if let ProgressEvent::LogAppended { build_id, line, at } = &event {
            self.store
                .append_log(&LogEntry::new(*build_id, line.clone(), *at))
                .await?;
            return Ok(MergeOutcome::Applied);
        }

        let id = event.build_id();
        let _guard = self.locks.lock(id).await;

        let mut record = match self.store.get_record(id).await {
            Ok(record) => record,
            Err(shipyard_db::DbError::NotFound(_)) => {
                warn!(build_id = %id, event = event.kind(), "Progress event for unknown build");
                return Err(OrchestratorError::NotFound(format!("build {}", id)));
            }
            Err(e) => return Err(e.into()),
        };

        let previous = record.phase;
        let outcome = record.apply(&event);
        match outcome {
            MergeOutcome::Applied => {
                self.store.put_record(&record).await?;
                if previous != record.phase {
                    info!(
                        build_id = %id,
                        from = %previous,
                        to = %record.phase,
                        message = %record.status_message,
                        "Build phase changed"
                    );
                } else {
                    debug!(build_id = %id, event = event.kind(), "Build record updated");
                }
            }
            MergeOutcome::Ignored(reason) => {
                info!(
                    build_id = %id,
                    event = event.kind(),
                    phase = %record.phase,
                    reason = %reason,
                    "Progress event ignored"
                );
            }
        }
        Ok(outcome)
    }

    pub async fn get_build(&self, id: BuildId) -> OrchestratorResult<BuildRecord> {
        Ok(self.store.get_record(id).await?)
    }

    /// Log lines of a known build, in emission order.
    pub async fn get_logs(&self, id: BuildId) -> OrchestratorResult<Vec<LogEntry>> {
        self.store.get_record(id).await?;
        Ok(self.store.get_logs(id).await?)
    }

    /// Most recently created builds, newest first.
    pub async fn list_builds(&self, limit: u32) -> OrchestratorResult<Vec<BuildRecord>> {
        Ok(self.store.list_recent(limit.clamp(1, 500)).await?)
    }

    /// Builds that have been queued for longer than `max_age`.
    pub async fn stalled(&self, max_age: Duration) -> OrchestratorResult<Vec<BuildRecord>> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|_| OrchestratorError::InvalidInput("max_age out of range".to_string()))?;
        let cutoff = Utc::now() - max_age;
        Ok(self.store.list_queued_before(cutoff).await?)
    }
}
