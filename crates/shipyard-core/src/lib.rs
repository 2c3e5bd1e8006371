//! Core domain types for the Shipyard build pipeline.
//!
//! This crate contains:
//! - Build identifiers and submission requests
//! - The canonical build record and its phase state machine
//! - Progress events exchanged over the message bus
//! - The artifact store boundary

pub mod artifact;
pub mod build;
pub mod error;
pub mod event;
pub mod id;
pub mod record;

pub use build::{BuildRequest, redact_url};
pub use error::{Error, Result};
pub use event::{LogEntry, Outcome, ProgressEvent};
pub use id::BuildId;
pub use artifact::{ArtifactRef, ArtifactStore};
pub use record::{BuildRecord, IgnoreReason, MergeOutcome, Phase};
