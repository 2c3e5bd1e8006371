//! The canonical build record and its phase state machine.
//!
//! There is exactly one record per build, addressed by its [`BuildId`] and
//! written only by the orchestrator. Every progress event is folded in through
//! [`BuildRecord::apply`], which only ever moves the phase forward:
//!
//! ```text
//! Queued -> Running -> { Succeeded | Failed }
//! ```

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{BuildId, BuildRequest, Outcome, ProgressEvent};

/// Position of a build in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Phase::Queued => 0,
            Phase::Running => 1,
            Phase::Succeeded | Phase::Failed => 2,
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: Phase) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::Running => "running",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "queued" => Ok(Phase::Queued),
            "running" => Ok(Phase::Running),
            "succeeded" => Ok(Phase::Succeeded),
            "failed" => Ok(Phase::Failed),
            other => Err(crate::Error::InvalidInput(format!("unknown phase: {}", other))),
        }
    }
}

/// Why an event left the record untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum IgnoreReason {
    #[display("event belongs to another build")]
    OtherBuild,
    #[display("log lines do not change the record")]
    NotAStateChange,
    #[display("build is already terminal")]
    AlreadyTerminal,
    #[display("phase does not move the build forward")]
    StalePhase,
    #[display("success is only recorded from a completion event")]
    AwaitingCompletion,
    #[display("completion already recorded")]
    DuplicateCompletion,
    #[display("completion conflicts with the terminal phase")]
    ConflictingOutcome,
    #[display("successful completion without an artifact reference")]
    MissingArtifact,
}

/// Result of folding one event into a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    Ignored(IgnoreReason),
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied)
    }
}

/// Canonical, mutable state of one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: BuildId,
    pub repository_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    pub submitter_id: String,
    pub submitted_at: DateTime<Utc>,
    pub phase: Phase,
    pub status_message: String,
    /// Set only once the build succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Elapsed execution time in milliseconds.
    pub duration_ms: Option<i64>,
    /// When the job was handed to the worker topic.
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl BuildRecord {
    /// Create the initial `Queued` record for a freshly ingested request.
    pub fn queued(request: &BuildRequest) -> Self {
        let now = Utc::now();
        Self {
            id: request.id,
            repository_url: request.repository_url.clone(),
            branch: request.branch.clone(),
            commit_hash: request.commit_hash.clone(),
            submitter_id: request.submitter_id.clone(),
            submitted_at: request.submitted_at,
            phase: Phase::Queued,
            status_message: "Build queued for processing".to_string(),
            artifact_reference: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            dispatched_at: None,
        }
    }

    /// Reconstruct the request this record was created from.
    pub fn request(&self) -> BuildRequest {
        BuildRequest {
            id: self.id,
            repository_url: self.repository_url.clone(),
            branch: self.branch.clone(),
            commit_hash: self.commit_hash.clone(),
            submitter_id: self.submitter_id.clone(),
            submitted_at: self.submitted_at,
        }
    }

    /// Fold one progress event into the record.
    ///
    /// Idempotent and monotonic: duplicates, late arrivals and events for a
    /// terminal build leave the record unchanged and report why.
    pub fn apply(&mut self, event: &ProgressEvent) -> MergeOutcome {
        if event.build_id() != self.id {
            return MergeOutcome::Ignored(IgnoreReason::OtherBuild);
        }

        match event {
            ProgressEvent::StatusChanged {
                phase, message, at, ..
            } => self.apply_status(*phase, message, *at),
            ProgressEvent::LogAppended { .. } => {
                MergeOutcome::Ignored(IgnoreReason::NotAStateChange)
            }
            ProgressEvent::Completed {
                outcome,
                artifact_reference,
                duration_ms,
                message,
                at,
                ..
            } => self.apply_completion(
                *outcome,
                artifact_reference.as_deref(),
                *duration_ms,
                message.as_deref(),
                *at,
            ),
        }
    }

    fn apply_status(&mut self, phase: Phase, message: &str, at: DateTime<Utc>) -> MergeOutcome {
        if self.phase.is_terminal() {
            return MergeOutcome::Ignored(IgnoreReason::AlreadyTerminal);
        }
        if !self.phase.can_transition_to(phase) {
            return MergeOutcome::Ignored(IgnoreReason::StalePhase);
        }

        match phase {
            // Only a completion carries the artifact reference.
            Phase::Succeeded => MergeOutcome::Ignored(IgnoreReason::AwaitingCompletion),
            Phase::Running | Phase::Failed => {
                self.started_at.get_or_insert(at);
                self.phase = phase;
                self.status_message = message.to_string();
                self.touch(at);
                MergeOutcome::Applied
            }
            Phase::Queued => MergeOutcome::Ignored(IgnoreReason::StalePhase),
        }
    }

    fn apply_completion(
        &mut self,
        outcome: Outcome,
        artifact_reference: Option<&str>,
        duration_ms: i64,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> MergeOutcome {
        if self.completed_at.is_some() {
            return MergeOutcome::Ignored(IgnoreReason::DuplicateCompletion);
        }
        let target = outcome.phase();
        if self.phase.is_terminal() && self.phase != target {
            return MergeOutcome::Ignored(IgnoreReason::ConflictingOutcome);
        }
        let artifact_reference = artifact_reference.filter(|r| !r.trim().is_empty());
        if outcome == Outcome::Succeeded && artifact_reference.is_none() {
            return MergeOutcome::Ignored(IgnoreReason::MissingArtifact);
        }

        let duration_ms = duration_ms.max(0);
        // A completion can overtake the Running status on another topic; the
        // build still passed through Running. An out-of-range duration falls
        // back to the completion time.
        let started = TimeDelta::try_milliseconds(duration_ms)
            .and_then(|elapsed| at.checked_sub_signed(elapsed))
            .unwrap_or(at);
        self.started_at.get_or_insert(started);

        let already_failed = self.phase == Phase::Failed;
        self.phase = target;
        self.completed_at = Some(at);
        self.duration_ms = Some(duration_ms);
        match outcome {
            Outcome::Succeeded => {
                self.artifact_reference = artifact_reference.map(str::to_string);
                self.status_message = message
                    .unwrap_or("Build completed successfully")
                    .to_string();
            }
            Outcome::Failed => {
                self.artifact_reference = None;
                if let Some(message) = message {
                    self.status_message = message.to_string();
                } else if !already_failed {
                    self.status_message = "Build failed".to_string();
                }
            }
        }
        self.touch(at);
        MergeOutcome::Applied
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }

    /// Describe the first violated record invariant, if any.
    pub fn invariant_violation(&self) -> Option<&'static str> {
        let has_artifact = self
            .artifact_reference
            .as_deref()
            .is_some_and(|r| !r.is_empty());
        if has_artifact != (self.phase == Phase::Succeeded) {
            return Some("artifact_reference must be set exactly when the build succeeded");
        }
        if self.phase != Phase::Queued && self.started_at.is_none() {
            return Some("started_at must be set once the build leaves Queued");
        }
        if self.completed_at.is_some() && !self.phase.is_terminal() {
            return Some("completed_at is only set on terminal builds");
        }
        None
    }
}
