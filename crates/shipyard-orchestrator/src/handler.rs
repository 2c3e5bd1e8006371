//! Bus consumer feeding the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use shipyard_bus::{
    BackoffPolicy, BusResult, Delivery, HandlerError, MessageBus, MessageHandler, Topic, subscribe,
};
use shipyard_core::{BuildRequest, ProgressEvent};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{BuildOrchestrator, OrchestratorError};

pub const CONSUMER_GROUP: &str = "orchestrator";

pub const SUBSCRIBED_TOPICS: [Topic; 4] = [
    Topic::BuildRequests,
    Topic::BuildStatus,
    Topic::BuildLogs,
    Topic::BuildCompletions,
];

/// Routes deliveries to the orchestrator by topic.
pub struct OrchestratorHandler {
    orchestrator: Arc<BuildOrchestrator>,
}

impl OrchestratorHandler {
    pub fn new(orchestrator: Arc<BuildOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

fn classify(err: OrchestratorError) -> HandlerError {
    if err.is_infrastructure() {
        HandlerError::Infrastructure(err.to_string())
    } else {
        HandlerError::Rejected(err.to_string())
    }
}

#[async_trait]
impl MessageHandler for OrchestratorHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        match delivery.topic {
            Topic::BuildRequests => {
                let request: BuildRequest = delivery.decode()?;
                if request.id.partition_key() != delivery.key {
                    warn!(
                        build_id = %request.id,
                        key = %delivery.key,
                        "Build request keyed by something other than its id"
                    );
                }
                self.orchestrator
                    .on_build_request(request)
                    .await
                    .map_err(classify)
            }
            Topic::BuildStatus | Topic::BuildLogs | Topic::BuildCompletions => {
                let event: ProgressEvent = delivery.decode()?;
                self.orchestrator
                    .on_progress_event(event)
                    .await
                    .map(|_| ())
                    .map_err(classify)
            }
            Topic::BuildJobs => Err(HandlerError::Rejected(
                "orchestrator does not consume build-jobs".to_string(),
            )),
        }
    }
}

/// Create the topics and consume them until `shutdown` fires.
pub async fn run_consumer(
    orchestrator: Arc<BuildOrchestrator>,
    bus: Arc<dyn MessageBus>,
    policy: BackoffPolicy,
    shutdown: CancellationToken,
) -> BusResult<()> {
    bus.ensure_topics(&Topic::ALL).await?;
    info!("Orchestrator consumer starting");
    let handler = OrchestratorHandler::new(orchestrator);
    subscribe(
        bus.as_ref(),
        CONSUMER_GROUP,
        &SUBSCRIBED_TOPICS,
        &policy,
        &handler,
        shutdown,
    )
    .await
}
