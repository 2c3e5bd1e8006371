//! Build orchestrator for Shipyard.
//!
//! The orchestrator is the only writer of build state. It ingests
//! submissions, creates the canonical record, dispatches jobs to builders and
//! folds every progress event back into the record.

pub mod error;
pub mod handler;
pub mod locks;
pub mod maintenance;
pub mod orchestrator;

pub use error::{OrchestratorError, OrchestratorResult};
pub use handler::{CONSUMER_GROUP, OrchestratorHandler, SUBSCRIBED_TOPICS, run_consumer};
pub use locks::KeyedLocks;
pub use maintenance::{RetentionSweeper, StallMonitor};
pub use orchestrator::BuildOrchestrator;
