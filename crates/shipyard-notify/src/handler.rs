//! Bus consumer feeding the notification hub.

use std::sync::Arc;

use async_trait::async_trait;
use shipyard_bus::{
    BackoffPolicy, BusResult, Delivery, HandlerError, MessageBus, MessageHandler, Topic, subscribe,
};
use shipyard_core::ProgressEvent;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::NotificationHub;

pub const CONSUMER_GROUP: &str = "notifier";

pub const SUBSCRIBED_TOPICS: [Topic; 3] = Topic::PROGRESS;

pub struct NotifyHandler {
    hub: Arc<NotificationHub>,
}

impl NotifyHandler {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl MessageHandler for NotifyHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let event: ProgressEvent = delivery.decode()?;
        self.hub.on_progress_event(&event);
        Ok(())
    }
}

/// Consume progress topics until `shutdown` fires. Waits for the topics to
/// be created by the orchestrator.
pub async fn run_consumer(
    hub: Arc<NotificationHub>,
    bus: Arc<dyn MessageBus>,
    policy: BackoffPolicy,
    shutdown: CancellationToken,
) -> BusResult<()> {
    info!("Notification consumer starting");
    let handler = NotifyHandler::new(hub);
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
