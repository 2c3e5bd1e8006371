//! Execution of a single build job.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use shipyard_bus::MessageBus;
use shipyard_config::BuilderSettings;
use shipyard_core::{ArtifactRef, ArtifactStore, BuildId, BuildRequest, Outcome, Phase, redact_url};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    BuildPlan, BuilderResult, CommandRunner, MarkerDetector, ProgressReporter, ProjectDetector,
    Step, StepCommand, StepFailure,
};

const SUCCESS_MESSAGE: &str = "Build completed successfully";

/// Runs one job from clone to upload and reports every stage as events.
pub struct Builder {
    work_dir: PathBuf,
    runner: CommandRunner,
    bus: Arc<dyn MessageBus>,
    artifacts: Arc<dyn ArtifactStore>,
    detector: Arc<dyn ProjectDetector>,
}

impl Builder {
    pub fn new(
        settings: &BuilderSettings,
        bus: Arc<dyn MessageBus>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            work_dir: settings.work_dir.clone(),
            runner: CommandRunner::new(settings.step_timeout()),
            bus,
            artifacts,
            detector: Arc::new(MarkerDetector),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn ProjectDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Execute `job`.
    ///
    /// A failing step ends the build as `Failed`, which is still `Ok` here.
    /// `Err` means progress could not be reported at all.
    pub async fn execute(
        &self,
        job: &BuildRequest,
        cancel: &CancellationToken,
    ) -> BuilderResult<Outcome> {
        let started = Instant::now();
        let reporter = ProgressReporter::new(self.bus.clone(), job.id);
        info!(
            build_id = %job.id,
            repository = %redact_url(&job.repository_url),
            "Processing build job"
        );

        reporter.status(Phase::Running, "build started").await?;
        reporter.log("Build started").await;
        reporter
            .log(format!("Repository: {}", redact_url(&job.repository_url)))
            .await;
        if let Some(branch) = job.requested_branch() {
            reporter.log(format!("Branch: {}", branch)).await;
        }

        match self.run_steps(job, &reporter, cancel).await {
            Ok(artifact) => {
                let duration_ms = elapsed_ms(started);
                reporter.log("Build completed successfully!").await;
                reporter
                    .completed(
                        Outcome::Succeeded,
                        Some(artifact.location.clone()),
                        duration_ms,
                        SUCCESS_MESSAGE,
                    )
                    .await?;
                reporter.status(Phase::Succeeded, SUCCESS_MESSAGE).await?;
                info!(
                    build_id = %job.id,
                    artifact = %artifact.location,
                    duration_ms,
                    "Build succeeded"
                );
                Ok(Outcome::Succeeded)
            }
            Err(failure) => {
                self.report_failure(job.id, &failure.to_string(), elapsed_ms(started))
                    .await?;
                Ok(Outcome::Failed)
            }
        }
    }

    /// Publish the failure path for a build: a log line, the failed
    /// completion and the failed status, all carrying `reason`.
    pub async fn report_failure(
        &self,
        build_id: BuildId,
        reason: &str,
        duration_ms: i64,
    ) -> BuilderResult<()> {
        warn!(build_id = %build_id, reason, "Build failed");
        let reporter = ProgressReporter::new(self.bus.clone(), build_id);
        reporter.log(format!("Build failed: {}", reason)).await;
        reporter
            .completed(Outcome::Failed, None, duration_ms, reason)
            .await?;
        reporter.status(Phase::Failed, reason).await?;
        Ok(())
    }

    async fn run_steps(
        &self,
        job: &BuildRequest,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ArtifactRef, StepFailure> {
        // Removed on every exit path, including unwinding.
        let scratch = self.scratch_dir(job.id).await?;
        let checkout = scratch.path().join("src");

        reporter.log("Cloning repository...").await;
        let clone = StepCommand::new(Step::Clone, "git", scratch.path())
            .args(["clone", "--", job.repository_url.as_str(), "src"])
            .env("GIT_TERMINAL_PROMPT", "0")
            .display_as(format!("git clone {}", redact_url(&job.repository_url)));
        self.runner.run(&clone, reporter, cancel).await?;
        reporter.log("Repository cloned successfully").await;

        if let Some(branch) = job.requested_branch() {
            reporter.log(format!("Checking out branch: {}", branch)).await;
            let checkout_branch =
                StepCommand::new(Step::Checkout, "git", &checkout).args(["checkout", branch]);
            self.runner.run(&checkout_branch, reporter, cancel).await?;
        }
        if let Some(commit) = job.requested_commit() {
            reporter.log(format!("Checking out commit: {}", commit)).await;
            let checkout_commit =
                StepCommand::new(Step::Checkout, "git", &checkout).args(["checkout", commit]);
            self.runner.run(&checkout_commit, reporter, cancel).await?;
        }

        let plan = BuildPlan::choose(&checkout, self.detector.as_ref())?;
        reporter.log(plan.describe()).await;
        for command in plan.commands(&checkout) {
            reporter.log(format!("Running {}...", command.display)).await;
            self.runner.run(&command, reporter, cancel).await?;
        }

        reporter.log("Creating artifact...").await;
        let file_name = format!("{}.tar.gz", job.id);
        let archive = scratch.path().join(&file_name);
        let package = StepCommand::new(Step::Package, "tar", scratch.path()).args([
            "-czf".to_string(),
            archive.to_string_lossy().into_owned(),
            "-C".to_string(),
            checkout.to_string_lossy().into_owned(),
            ".".to_string(),
        ]);
        self.runner.run(&package, reporter, cancel).await?;
        let data = tokio::fs::read(&archive).await.map_err(|e| {
            StepFailure::new(Step::Package, format!("reading archive: {}", e))
        })?;

        reporter.log("Uploading artifact to storage...").await;
        let stored = self
            .artifacts
            .put(job.id, &file_name, Bytes::from(data))
            .await
            .map_err(|e| StepFailure::new(Step::Upload, e.to_string()))?;
        reporter.log("Artifact uploaded successfully").await;
        Ok(stored)
    }

    async fn scratch_dir(&self, build_id: BuildId) -> Result<TempDir, StepFailure> {
        tokio::fs::create_dir_all(&self.work_dir).await.map_err(|e| {
            StepFailure::new(
                Step::Workspace,
                format!("creating {}: {}", self.work_dir.display(), e),
            )
        })?;
        tempfile::Builder::new()
            .prefix(&format!("{}-", build_id))
            .tempdir_in(&self.work_dir)
            .map_err(|e| StepFailure::new(Step::Workspace, e.to_string()))
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
