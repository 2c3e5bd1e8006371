//! Build worker for the Shipyard pipeline.
//!
//! A worker consumes dispatched jobs from `build-jobs` one at a time and
//! reports everything it does as progress events. It never writes build
//! state itself.
//!
//! Execution of one job:
//! - clone the repository into a scratch directory
//! - pick a build strategy (custom script or detected toolchain)
//! - run it with bounded, cancellable subprocesses streaming their output
//! - package the checkout and upload the archive to the artifact store

pub mod artifact;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod reporter;
pub mod runner;
pub mod strategy;
pub mod worker;

pub use artifact::{HttpArtifactStore, LocalArtifactStore};
pub use error::{BuilderError, BuilderResult, Step, StepFailure};
pub use executor::Builder;
pub use ledger::{BuildLookup, HttpBuildLookup, JobLedger, StoreBuildLookup};
pub use reporter::ProgressReporter;
pub use runner::{CommandRunner, StepCommand};
pub use strategy::{BuildPlan, MarkerDetector, PackageManager, ProjectDetector, ProjectKind};
pub use worker::{BuildWorker, CONSUMER_GROUP, run_worker};
