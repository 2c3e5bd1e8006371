//! Progress events exchanged between components.
//!
//! These are the only cross-component contracts: the builder emits them, the
//! orchestrator folds them into the canonical record and the notifier pushes
//! them to live observers. No component shares memory with another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BuildId, Phase};

/// Terminal outcome of a build execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    /// The terminal phase this outcome leads to.
    pub fn phase(self) -> Phase {
        match self {
            Outcome::Succeeded => Phase::Succeeded,
            Outcome::Failed => Phase::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
        }
    }
}

/// An immutable message describing a status change, a log line, or a terminal
/// outcome of one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StatusChanged {
        build_id: BuildId,
        phase: Phase,
        message: String,
        at: DateTime<Utc>,
    },
    LogAppended {
        build_id: BuildId,
        line: String,
        at: DateTime<Utc>,
    },
    Completed {
        build_id: BuildId,
        outcome: Outcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact_reference: Option<String>,
        /// Elapsed execution time in milliseconds.
        duration_ms: i64,
        /// Human-readable summary, e.g. which step failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        at: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn status(build_id: BuildId, phase: Phase, message: impl Into<String>) -> Self {
        ProgressEvent::StatusChanged {
            build_id,
            phase,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn log(build_id: BuildId, line: impl Into<String>) -> Self {
        ProgressEvent::LogAppended {
            build_id,
            line: line.into(),
            at: Utc::now(),
        }
    }

    pub fn completed(
        build_id: BuildId,
        outcome: Outcome,
        artifact_reference: Option<String>,
        duration_ms: i64,
    ) -> Self {
        ProgressEvent::Completed {
            build_id,
            outcome,
            artifact_reference,
            duration_ms,
            message: None,
            at: Utc::now(),
        }
    }

    /// Attach a summary to a completion. Other variants are returned as is.
    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        if let ProgressEvent::Completed { message, .. } = &mut self {
            *message = Some(text.into());
        }
        self
    }

    pub fn build_id(&self) -> BuildId {
        match self {
            ProgressEvent::StatusChanged { build_id, .. }
            | ProgressEvent::LogAppended { build_id, .. }
            | ProgressEvent::Completed { build_id, .. } => *build_id,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            ProgressEvent::StatusChanged { at, .. }
            | ProgressEvent::LogAppended { at, .. }
            | ProgressEvent::Completed { at, .. } => *at,
        }
    }

    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::StatusChanged { .. } => "status_changed",
            ProgressEvent::LogAppended { .. } => "log_appended",
            ProgressEvent::Completed { .. } => "completed",
        }
    }
}

/// One line of build output, appended to the per-build log list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub build_id: BuildId,
    pub line: String,
    pub emitted_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(build_id: BuildId, line: impl Into<String>, emitted_at: DateTime<Utc>) -> Self {
        Self {
            build_id,
            line: line.into(),
            emitted_at,
        }
    }
}
