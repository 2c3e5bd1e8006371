#![allow(dead_code)]

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use shipyard_builder::{Builder, LocalArtifactStore};
use shipyard_bus::{InMemoryBus, MessageBus, Topic};
use shipyard_config::BuilderSettings;
use shipyard_core::ProgressEvent;
use tempfile::TempDir;

/// Whether git, tar and a POSIX shell are available.
pub fn has_tools() -> bool {
    let runs = |tool: &str| Command::new(tool).arg("--version").output().is_ok();
    runs("git") && runs("tar") && Path::new("/bin/sh").exists()
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args([
            "-c",
            "user.email=ci@example.com",
            "-c",
            "user.name=CI",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A local repository with one commit holding `files`.
pub fn repo_with(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "-q"]);
    commit(dir.path(), files, "initial");
    dir
}

pub fn commit(dir: &Path, files: &[(&str, &str)], message: &str) {
    for (name, contents) in files {
        std::fs::write(dir.join(name), contents).unwrap();
    }
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", message]);
}

/// Commit `files` on a new branch, leaving the original branch checked out.
pub fn branch_with(dir: &Path, branch: &str, files: &[(&str, &str)]) {
    git(dir, &["checkout", "-q", "-b", branch]);
    commit(dir, files, branch);
    git(dir, &["checkout", "-q", "-"]);
}

pub fn url_of(dir: &TempDir) -> String {
    format!("file://{}", dir.path().display())
}

pub struct BuilderFixture {
    pub bus: Arc<InMemoryBus>,
    pub builder: Arc<Builder>,
    pub work_dir: TempDir,
    pub artifacts: TempDir,
}

pub fn builder_fixture(bus: Arc<InMemoryBus>) -> BuilderFixture {
    builder_fixture_with(bus, |builder| builder)
}

/// Like [`builder_fixture`], letting the caller adjust the builder.
pub fn builder_fixture_with(
    bus: Arc<InMemoryBus>,
    configure: impl FnOnce(Builder) -> Builder,
) -> BuilderFixture {
    let work_dir = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    let settings = BuilderSettings {
        work_dir: work_dir.path().to_path_buf(),
        step_timeout_secs: 120,
        ..BuilderSettings::default()
    };
    let dyn_bus: Arc<dyn MessageBus> = bus.clone();
    let builder = Builder::new(
        &settings,
        dyn_bus,
        Arc::new(LocalArtifactStore::new(artifacts.path())),
    );
    BuilderFixture {
        bus,
        builder: Arc::new(configure(builder)),
        work_dir,
        artifacts,
    }
}

pub fn events(bus: &InMemoryBus, topic: Topic) -> Vec<ProgressEvent> {
    bus.retained(topic)
        .iter()
        .filter_map(|d| d.decode().ok())
        .collect()
}

pub fn log_lines(bus: &InMemoryBus) -> Vec<String> {
    events(bus, Topic::BuildLogs)
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::LogAppended { line, .. } => Some(line),
            _ => None,
        })
        .collect()
}

pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..600 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
