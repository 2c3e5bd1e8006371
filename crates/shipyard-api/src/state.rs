//! Application state.

use std::sync::Arc;
use std::time::Duration;

use shipyard_bus::MessageBus;
use shipyard_notify::NotificationHub;
use shipyard_orchestrator::BuildOrchestrator;

/// State behind the orchestrator's query and submission routes.
#[derive(Clone)]
pub struct OrchestratorState {
    pub orchestrator: Arc<BuildOrchestrator>,
    /// Submissions are published here rather than handled in-process.
    pub bus: Arc<dyn MessageBus>,
    /// Queued builds older than this are reported as stalled.
    pub max_queued_age: Duration,
}

impl OrchestratorState {
    pub fn new(
        orchestrator: Arc<BuildOrchestrator>,
        bus: Arc<dyn MessageBus>,
        max_queued_age: Duration,
    ) -> Self {
        Self {
            orchestrator,
            bus,
            max_queued_age,
        }
    }
}

/// State behind the live notification feed.
#[derive(Clone)]
pub struct NotifierState {
    pub hub: Arc<NotificationHub>,
}

impl NotifierState {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self { hub }
    }
}
