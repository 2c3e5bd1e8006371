//! Node.js toolchain builds, with `npm` replaced by a recording script.
//!
//! Kept in its own test binary because it changes `PATH` for the process.

#![cfg(unix)]

mod common;

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use common::*;
use shipyard_bus::{InMemoryBus, Topic};
use shipyard_core::{BuildRequest, Outcome, ProgressEvent};
use tokio_util::sync::CancellationToken;

const FAKE_NPM: &str = r#"#!/bin/sh
case "$1" in
  install)
    echo "added 0 packages"
    mkdir -p node_modules
    ;;
  run)
    echo "> build $2"
    mkdir -p dist
    echo "console.log('hi')" > dist/index.js
    ;;
  *)
    exit 2
    ;;
esac
"#;

/// Put a fake `npm` first on `PATH` for the rest of this process.
fn install_fake_npm() -> tempfile::TempDir {
    let bin = tempfile::tempdir().unwrap();
    let npm = bin.path().join("npm");
    std::fs::write(&npm, FAKE_NPM).unwrap();
    std::fs::set_permissions(&npm, std::fs::Permissions::from_mode(0o755)).unwrap();

    let path = std::env::var("PATH").unwrap_or_default();
    // Only test in this binary, so no other thread reads the environment.
    unsafe {
        std::env::set_var("PATH", format!("{}:{}", bin.path().display(), path));
    }
    bin
}

#[tokio::test]
async fn test_npm_project_installs_builds_and_uploads() {
    if !has_tools() {
        return;
    }
    let _bin = install_fake_npm();
    let repo = repo_with(&[
        (
            "package.json",
            r#"{"name":"widget","version":"1.0.0","scripts":{"build":"node build.js"}}"#,
        ),
        ("package-lock.json", r#"{"name":"widget","lockfileVersion":3}"#),
    ]);
    let fx = builder_fixture(Arc::new(InMemoryBus::new(2)));
    let job = BuildRequest::new(url_of(&repo), "user-1");

    let outcome = fx
        .builder
        .execute(&job, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Succeeded);

    let lines = log_lines(&fx.bus);
    let position = |wanted: &str| {
        lines
            .iter()
            .position(|l| l == wanted)
            .unwrap_or_else(|| panic!("missing log line {:?} in {:?}", wanted, lines))
    };
    let detected = position("Detected Node.js project, using package manager: npm");
    let install = position("Running npm install...");
    let installed = position("added 0 packages");
    let build = position("Running npm run build...");
    let built = position("> build build");
    assert!(detected < install && install < installed);
    assert!(installed < build && build < built);

    let completion = events(&fx.bus, Topic::BuildCompletions)
        .into_iter()
        .find_map(|e| match e {
            ProgressEvent::Completed {
                artifact_reference, ..
            } => artifact_reference,
            _ => None,
        })
        .unwrap();
    let artifact = std::fs::metadata(&completion).unwrap();
    assert!(artifact.len() > 0);
}
