//! Wire frames pushed to WebSocket observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{BuildId, Outcome, Phase, ProgressEvent};

/// One pushed notification, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    #[serde(rename_all = "camelCase")]
    Status {
        build_id: BuildId,
        status: Phase,
        message: String,
        time: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Log {
        build_id: BuildId,
        log: String,
        time: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Completion {
        build_id: BuildId,
        status: Outcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact_url: Option<String>,
        /// Milliseconds.
        duration: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        time: DateTime<Utc>,
    },
}

impl Frame {
    pub fn build_id(&self) -> BuildId {
        match self {
            Frame::Status { build_id, .. }
            | Frame::Log { build_id, .. }
            | Frame::Completion { build_id, .. } => *build_id,
        }
    }
}

impl From<&ProgressEvent> for Frame {
    fn from(event: &ProgressEvent) -> Self {
        match event {
            ProgressEvent::StatusChanged {
                build_id,
                phase,
                message,
                at,
            } => Frame::Status {
                build_id: *build_id,
                status: *phase,
                message: message.clone(),
                time: *at,
            },
            ProgressEvent::LogAppended { build_id, line, at } => Frame::Log {
                build_id: *build_id,
                log: line.clone(),
                time: *at,
            },
            ProgressEvent::Completed {
                build_id,
                outcome,
                artifact_reference,
                duration_ms,
                message,
                at,
            } => Frame::Completion {
                build_id: *build_id,
                status: *outcome,
                artifact_url: artifact_reference.clone(),
                duration: *duration_ms,
                message: message.clone(),
                time: *at,
            },
        }
    }
}
