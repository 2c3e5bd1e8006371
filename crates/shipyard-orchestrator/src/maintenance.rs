//! Periodic background tasks: stall detection and retention.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shipyard_core::BuildRecord;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{BuildOrchestrator, OrchestratorResult};

/// Reports builds stuck in `Queued`, e.g. because dispatch failed after the
/// record was persisted.
pub struct StallMonitor {
    orchestrator: Arc<BuildOrchestrator>,
    max_queued_age: Duration,
    interval: Duration,
}

impl StallMonitor {
    pub fn new(orchestrator: Arc<BuildOrchestrator>, max_queued_age: Duration, interval: Duration) -> Self {
        Self {
            orchestrator,
            max_queued_age,
            interval,
        }
    }

    /// Run one check, logging every stalled build.
    pub async fn check(&self) -> OrchestratorResult<Vec<BuildRecord>> {
        let stalled = self.orchestrator.stalled(self.max_queued_age).await?;
        let now = Utc::now();
        for record in &stalled {
            error!(
                build_id = %record.id,
                queued_secs = (now - record.created_at).num_seconds(),
                dispatched = record.dispatched_at.is_some(),
                "Build stalled in queue"
            );
        }
        Ok(stalled)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.check().await {
                        warn!(error = %e, "Stall check failed");
                    }
                }
            }
        }
    }
}

/// Deletes expired records, logs and bus messages and drops idle per-build
/// locks.
pub struct RetentionSweeper {
    orchestrator: Arc<BuildOrchestrator>,
    interval: Duration,
    message_retention: Duration,
}

impl RetentionSweeper {
    pub fn new(
        orchestrator: Arc<BuildOrchestrator>,
        interval: Duration,
        message_retention: Duration,
    ) -> Self {
        Self {
            orchestrator,
            interval,
            message_retention,
        }
    }

    pub async fn sweep(&self) -> OrchestratorResult<()> {
        let stats = self.orchestrator.store().purge_expired().await?;
        let messages = self.orchestrator.bus().purge(self.message_retention).await?;
        let locks = self.orchestrator.locks().prune();
        if stats.builds > 0 || stats.log_lines > 0 || messages > 0 {
            info!(
                builds = stats.builds,
                log_lines = stats.log_lines,
                messages,
                locks,
                "Purged expired build data"
            );
        }
        Ok(())
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }
    }
}
