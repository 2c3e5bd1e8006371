//! Orchestrator, builder and notifier wired together over the in-memory bus.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use shipyard_builder::{
    BuildWorker, Builder, ProjectDetector, ProjectKind, StoreBuildLookup, run_worker,
};
use shipyard_bus::{BackoffPolicy, InMemoryBus, MessageBus, Topic, publish_json};
use shipyard_core::{BuildId, BuildRecord, BuildRequest, Phase};
use shipyard_db::MemoryBuildStore;
use shipyard_notify::NotificationHub;
use shipyard_orchestrator::BuildOrchestrator;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Pipeline {
    bus: Arc<dyn MessageBus>,
    orchestrator: Arc<BuildOrchestrator>,
    hub: Arc<NotificationHub>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    _fixture: BuilderFixture,
}

impl Pipeline {
    fn start() -> Self {
        Self::start_with(|builder| builder)
    }

    fn start_with(configure: impl FnOnce(Builder) -> Builder) -> Self {
        let memory_bus = Arc::new(InMemoryBus::with_topics(4, &Topic::ALL));
        let bus: Arc<dyn MessageBus> = memory_bus.clone();
        let store = Arc::new(MemoryBuildStore::default());
        let orchestrator = Arc::new(BuildOrchestrator::new(store.clone(), bus.clone()));
        let hub = Arc::new(NotificationHub::new(256));
        let fixture = builder_fixture_with(memory_bus, configure);
        let shutdown = CancellationToken::new();
        let policy = BackoffPolicy::default();

        let worker = BuildWorker::new("builder-1", fixture.builder.clone(), shutdown.clone())
            .with_lookup(Arc::new(StoreBuildLookup::new(store)));

        let tasks = vec![
            tokio::spawn({
                let (o, b, p, s) = (orchestrator.clone(), bus.clone(), policy.clone(), shutdown.clone());
                async move {
                    shipyard_orchestrator::run_consumer(o, b, p, s).await.unwrap();
                }
            }),
            tokio::spawn({
                let (b, p, s) = (bus.clone(), policy.clone(), shutdown.clone());
                async move {
                    run_worker(worker, b, p, s).await.unwrap();
                }
            }),
            tokio::spawn({
                let (h, b, p, s) = (hub.clone(), bus.clone(), policy, shutdown.clone());
                async move {
                    shipyard_notify::run_consumer(h, b, p, s).await.unwrap();
                }
            }),
        ];

        Self {
            bus,
            orchestrator,
            hub,
            shutdown,
            tasks,
            _fixture: fixture,
        }
    }

    async fn submit(&self, request: &BuildRequest) {
        publish_json(
            self.bus.as_ref(),
            Topic::BuildRequests,
            &request.id.partition_key(),
            request,
        )
        .await
        .unwrap();
    }

    async fn wait_terminal(&self, id: BuildId) -> BuildRecord {
        let orchestrator = &self.orchestrator;
        let finished = eventually(|| async move {
            orchestrator
                .get_build(id)
                .await
                .map(|r| r.phase.is_terminal() && r.completed_at.is_some())
                .unwrap_or(false)
        })
        .await;
        assert!(finished, "build {} did not finish", id);
        self.orchestrator.get_build(id).await.unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_submission_to_success() {
    if !has_tools() {
        return;
    }
    let repo = repo_with(&[("build.sh", "echo installing\necho building\n")]);
    let pipeline = Pipeline::start();
    let request = BuildRequest::new(url_of(&repo), "user-1");
    let mut watcher = pipeline.hub.subscribe("watcher", Some(request.id));

    pipeline.submit(&request).await;
    let record = pipeline.wait_terminal(request.id).await;

    assert_eq!(record.phase, Phase::Succeeded);
    assert!(record.artifact_reference.as_deref().is_some_and(|r| !r.is_empty()));
    assert!(record.started_at.is_some());
    assert!(record.duration_ms.is_some());
    assert_eq!(record.invariant_violation(), None);

    // The log topic is consumed independently of the completion topic.
    let orchestrator = &pipeline.orchestrator;
    let logged = eventually(|| async move {
        orchestrator
            .get_logs(request.id)
            .await
            .map(|logs| logs.iter().any(|l| l.line == "Artifact uploaded successfully"))
            .unwrap_or(false)
    })
    .await;
    assert!(logged);
    let lines: Vec<String> = orchestrator
        .get_logs(request.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.line)
        .collect();
    assert!(lines.contains(&"installing".to_string()));
    assert!(lines.contains(&"building".to_string()));

    let mut saw_completion = false;
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_secs(5), watcher.recv()).await
    {
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["buildId"], request.id.to_string());
        if json["type"] == "completion" {
            assert_eq!(json["status"], "succeeded");
            saw_completion = true;
            break;
        }
    }
    assert!(saw_completion);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_unclonable_repository_fails() {
    let pipeline = Pipeline::start();
    let missing = tempfile::tempdir().unwrap();
    let request = BuildRequest::new(
        format!("file://{}/nonexistent", missing.path().display()),
        "user-1",
    );

    pipeline.submit(&request).await;
    let record = pipeline.wait_terminal(request.id).await;

    assert_eq!(record.phase, Phase::Failed);
    assert!(record.status_message.contains("clone"));
    assert!(record.artifact_reference.is_none());

    pipeline.stop().await;
}

#[tokio::test]
async fn test_duplicate_job_dispatch_produces_one_outcome() {
    if !has_tools() {
        return;
    }
    let repo = repo_with(&[("build.sh", "echo once\n")]);
    let pipeline = Pipeline::start();
    let request = BuildRequest::new(url_of(&repo), "user-1");

    pipeline.submit(&request).await;
    let first = pipeline.wait_terminal(request.id).await;

    // Simulate at-least-once redelivery of the dispatched job.
    publish_json(
        pipeline.bus.as_ref(),
        Topic::BuildJobs,
        &request.id.partition_key(),
        &request,
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let after = pipeline.orchestrator.get_build(request.id).await.unwrap();
    assert_eq!(after.phase, first.phase);
    assert_eq!(after.artifact_reference, first.artifact_reference);
    assert_eq!(after.completed_at, first.completed_at);

    pipeline.stop().await;
}

struct PanickingDetector;

impl ProjectDetector for PanickingDetector {
    fn detect(&self, _dir: &Path) -> Option<ProjectKind> {
        panic!("detector blew up");
    }
}

#[tokio::test]
async fn test_builder_panic_fails_only_that_build() {
    if !has_tools() {
        return;
    }
    let repo = repo_with(&[("go.mod", "module example.com/widget\n")]);
    let pipeline =
        Pipeline::start_with(|builder| builder.with_detector(Arc::new(PanickingDetector)));
    let request = BuildRequest::new(url_of(&repo), "user-1");

    pipeline.submit(&request).await;
    let record = pipeline.wait_terminal(request.id).await;

    assert_eq!(record.phase, Phase::Failed);
    assert_eq!(record.status_message, "internal builder error");
    assert!(record.artifact_reference.is_none());
    assert_eq!(record.invariant_violation(), None);

    // The worker survives and keeps taking jobs.
    let scripted = repo_with(&[("build.sh", "echo fine\n")]);
    let next = BuildRequest::new(url_of(&scripted), "user-1");
    pipeline.submit(&next).await;
    let record = pipeline.wait_terminal(next.id).await;
    assert_eq!(record.phase, Phase::Succeeded);

    pipeline.stop().await;
}
