//! Job consumer driving the builder.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use shipyard_bus::{
    BackoffPolicy, BusResult, Delivery, HandlerError, MessageBus, MessageHandler, Topic, subscribe,
};
use shipyard_core::BuildRequest;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::executor::elapsed_ms;
use crate::{BuildLookup, Builder, JobLedger};

pub const CONSUMER_GROUP: &str = "builder";

/// Handles `build-jobs` deliveries one at a time.
///
/// Redelivered jobs are skipped when this worker already started them or
/// when the build is already terminal.
pub struct BuildWorker {
    worker_id: String,
    builder: Arc<Builder>,
    ledger: JobLedger,
    lookup: Option<Arc<dyn BuildLookup>>,
    shutdown: CancellationToken,
}

impl BuildWorker {
    pub fn new(worker_id: impl Into<String>, builder: Arc<Builder>, shutdown: CancellationToken) -> Self {
        Self {
            worker_id: worker_id.into(),
            builder,
            ledger: JobLedger::default(),
            lookup: None,
            shutdown,
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn BuildLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    async fn already_finished(&self, job: &BuildRequest) -> bool {
        let Some(lookup) = &self.lookup else {
            return false;
        };
        match lookup.phase(job.id).await {
            Ok(Some(phase)) if phase.is_terminal() => {
                warn!(worker_id = %self.worker_id, build_id = %job.id, phase = %phase, "Skipping job for finished build");
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(worker_id = %self.worker_id, build_id = %job.id, error = %e, "Build lookup failed, executing anyway");
                false
            }
        }
    }
}

#[async_trait]
impl MessageHandler for BuildWorker {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let job: BuildRequest = delivery.decode()?;
        job.validate()
            .map_err(|e| HandlerError::Rejected(e.to_string()))?;

        if !self.ledger.begin(job.id) {
            warn!(worker_id = %self.worker_id, build_id = %job.id, "Duplicate job delivery skipped");
            return Ok(());
        }
        if self.already_finished(&job).await {
            return Ok(());
        }

        info!(worker_id = %self.worker_id, build_id = %job.id, "Executing build job");
        let build_id = job.id;
        let started = Instant::now();
        let builder = self.builder.clone();
        let cancel = self.shutdown.child_token();
        let execution = tokio::spawn(async move { builder.execute(&job, &cancel).await });

        match execution.await {
            Ok(Ok(outcome)) => {
                info!(
                    worker_id = %self.worker_id,
                    build_id = %build_id,
                    outcome = outcome.as_str(),
                    "Build job finished"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(HandlerError::Infrastructure(e.to_string())),
            Err(join_error) => {
                error!(worker_id = %self.worker_id, build_id = %build_id, error = %join_error, "Build execution panicked");
                self.builder
                    .report_failure(build_id, "internal builder error", elapsed_ms(started))
                    .await
                    .map_err(|e| HandlerError::Infrastructure(e.to_string()))
            }
        }
    }
}

/// Consume `build-jobs` as a member of the builder group until `shutdown`.
pub async fn run_worker(
    worker: BuildWorker,
    bus: Arc<dyn MessageBus>,
    policy: BackoffPolicy,
    shutdown: CancellationToken,
) -> BusResult<()> {
    info!(worker_id = %worker.worker_id, "Builder worker starting");
    subscribe(
        bus.as_ref(),
        CONSUMER_GROUP,
        &[Topic::BuildJobs],
        &policy,
        &worker,
        shutdown,
    )
    .await
}
