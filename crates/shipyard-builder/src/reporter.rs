//! Publishes the progress of one build.

use std::sync::Arc;

use shipyard_bus::{BusResult, MessageBus, Topic, publish_json};
use shipyard_core::{BuildId, Outcome, Phase, ProgressEvent};
use tracing::warn;

/// Emits progress events for a single build, keyed by its id.
///
/// Status and completion events must reach the bus, so their errors are
/// returned. Log lines are best effort.
#[derive(Clone)]
pub struct ProgressReporter {
    bus: Arc<dyn MessageBus>,
    build_id: BuildId,
    key: String,
}

impl ProgressReporter {
    pub fn new(bus: Arc<dyn MessageBus>, build_id: BuildId) -> Self {
        Self {
            bus,
            build_id,
            key: build_id.partition_key(),
        }
    }

    pub fn build_id(&self) -> BuildId {
        self.build_id
    }

    pub async fn status(&self, phase: Phase, message: &str) -> BusResult<()> {
        let event = ProgressEvent::status(self.build_id, phase, message);
        publish_json(self.bus.as_ref(), Topic::BuildStatus, &self.key, &event).await
    }

    pub async fn log(&self, line: impl Into<String>) {
        let line = line.into();
        if line.trim().is_empty() {
            return;
        }
        let event = ProgressEvent::log(self.build_id, line);
        if let Err(e) = publish_json(self.bus.as_ref(), Topic::BuildLogs, &self.key, &event).await {
            warn!(build_id = %self.build_id, error = %e, "Failed to publish log line");
        }
    }

    pub async fn completed(
        &self,
        outcome: Outcome,
        artifact_reference: Option<String>,
        duration_ms: i64,
        message: &str,
    ) -> BusResult<()> {
        let event = ProgressEvent::completed(self.build_id, outcome, artifact_reference, duration_ms)
            .with_message(message);
        publish_json(self.bus.as_ref(), Topic::BuildCompletions, &self.key, &event).await
    }
}
