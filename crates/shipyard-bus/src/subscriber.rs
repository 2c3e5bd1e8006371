//! Receive loop driving a message handler.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::topic::describe;
use crate::{BackoffPolicy, BusError, BusResult, Delivery, HandlerError, MessageBus, Subscription, Topic};

/// Processes one delivery at a time. Must tolerate duplicates and any
/// cross-topic arrival order.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// Join a consumer group, retrying while the topics do not exist yet.
///
/// Only `TopicNotFound` is retried; any other failure is returned at once.
/// Returns `Ok(None)` if `shutdown` fires while waiting.
pub async fn attach_with_backoff(
    bus: &dyn MessageBus,
    group: &str,
    topics: &[Topic],
    policy: &BackoffPolicy,
    shutdown: &CancellationToken,
) -> BusResult<Option<Box<dyn Subscription>>> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match bus.attach(group, topics).await {
            Ok(subscription) => return Ok(Some(subscription)),
            Err(BusError::TopicNotFound(topic)) if attempt < attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    group,
                    topic = %topic,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Topic not available yet, retrying"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(BusError::TopicNotFound(_)) => break,
            Err(e) => return Err(e),
        }
    }
    Err(BusError::AttachExhausted {
        topics: describe(topics),
        attempts,
    })
}

/// Attach to `topics` as a member of `group` and feed every delivery to
/// `handler` until `shutdown` is cancelled or the bus closes.
///
/// Messages are acknowledged after the handler returns. Malformed payloads
/// and rejected messages are logged and acknowledged; an infrastructure
/// failure stops the loop with an error and leaves the message unacknowledged.
pub async fn subscribe(
    bus: &dyn MessageBus,
    group: &str,
    topics: &[Topic],
    policy: &BackoffPolicy,
    handler: &dyn MessageHandler,
    shutdown: CancellationToken,
) -> BusResult<()> {
    let Some(mut subscription) = attach_with_backoff(bus, group, topics, policy, &shutdown).await?
    else {
        return Ok(());
    };

    info!(group, topics = %describe(topics), "Subscribed");

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = subscription.next() => match next? {
                Some(delivery) => delivery,
                None => break,
            },
        };

        debug!(
            group,
            topic = %delivery.topic,
            key = %delivery.key,
            partition = delivery.partition,
            offset = delivery.offset,
            "Delivering message"
        );

        match handler.handle(&delivery).await {
            Ok(()) => {}
            Err(HandlerError::Decode(e)) => {
                warn!(group, topic = %delivery.topic, key = %delivery.key, error = %e, "Dropping malformed message");
            }
            Err(HandlerError::Rejected(reason)) => {
                error!(group, topic = %delivery.topic, key = %delivery.key, reason = %reason, "Handler rejected message");
            }
            Err(HandlerError::Infrastructure(reason)) => {
                error!(group, topic = %delivery.topic, key = %delivery.key, reason = %reason, "Handler failed, stopping consumer");
                return Err(BusError::Handler(reason));
            }
        }

        subscription.ack(&delivery).await?;
    }

    info!(group, "Consumer stopped");
    Ok(())
}
