//! Registry of live observers and best-effort fan-out.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use shipyard_core::{BuildId, ProgressEvent};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::Frame;

struct Subscriber {
    generation: u64,
    filter: Option<BuildId>,
    tx: mpsc::Sender<String>,
}

impl Subscriber {
    fn wants(&self, build_id: BuildId) -> bool {
        self.filter.is_none_or(|f| f == build_id)
    }
}

/// Receiving side of one registration. Frames arrive already JSON-encoded.
#[derive(Debug)]
pub struct Subscription {
    client_id: String,
    generation: u64,
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Next frame, or `None` once the hub dropped this registration.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Pushes every progress event to the subscribers whose filter matches.
///
/// There is no buffering for absent clients and no replay. A subscriber
/// whose channel is full misses the frame; one whose channel is closed is
/// dropped from the registry.
pub struct NotificationHub {
    subscribers: DashMap<String, Subscriber>,
    capacity: usize,
    generations: AtomicU64,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            capacity: capacity.max(1),
            generations: AtomicU64::new(0),
        }
    }

    /// Register `client_id`, replacing any existing registration under the
    /// same id. `filter` limits delivery to one build.
    pub fn subscribe(&self, client_id: impl Into<String>, filter: Option<BuildId>) -> Subscription {
        let client_id = client_id.into();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.capacity);
        let previous = self.subscribers.insert(
            client_id.clone(),
            Subscriber {
                generation,
                filter,
                tx,
            },
        );
        if previous.is_some() {
            info!(client_id = %client_id, "Client re-subscribed, replacing previous connection");
        } else {
            info!(client_id = %client_id, build_id = ?filter.map(|f| f.to_string()), "Client subscribed");
        }
        Subscription {
            client_id,
            generation,
            rx,
        }
    }

    pub fn unsubscribe(&self, client_id: &str) {
        if self.subscribers.remove(client_id).is_some() {
            info!(client_id, "Client unsubscribed");
        }
    }

    /// Drop the registration backing `subscription` unless a newer
    /// connection has since taken over its client id.
    pub fn release(&self, subscription: &Subscription) {
        let removed = self
            .subscribers
            .remove_if(&subscription.client_id, |_, s| {
                s.generation == subscription.generation
            });
        if removed.is_some() {
            info!(client_id = %subscription.client_id, "Client disconnected");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Push `event` to every matching subscriber. Returns how many received it.
    pub fn on_progress_event(&self, event: &ProgressEvent) -> usize {
        let frame = Frame::from(event);
        let payload = match serde_json::to_string(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(build_id = %event.build_id(), error = %e, "Failed to encode notification");
                return 0;
            }
        };

        let build_id = event.build_id();
        let mut delivered = 0;
        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.wants(build_id) {
                continue;
            }
            match subscriber.tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(client_id = %entry.key(), build_id = %build_id, "Subscriber is lagging, dropping notification");
                }
                Err(TrySendError::Closed(_)) => {
                    closed.push((entry.key().clone(), subscriber.generation));
                }
            }
        }

        for (client_id, generation) in closed {
            if self
                .subscribers
                .remove_if(&client_id, |_, s| s.generation == generation)
                .is_some()
            {
                info!(client_id = %client_id, "Dropping closed subscriber");
            }
        }

        debug!(build_id = %build_id, event = event.kind(), delivered, "Notification fanned out");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::Phase;

    fn status(id: BuildId) -> ProgressEvent {
        ProgressEvent::status(id, Phase::Running, "build started")
    }

    #[tokio::test]
    async fn test_filter_limits_delivery() {
        let hub = NotificationHub::new(8);
        let a = BuildId::new();
        let b = BuildId::new();
        let mut all = hub.subscribe("all", None);
        let mut only_a = hub.subscribe("only-a", Some(a));

        assert_eq!(hub.on_progress_event(&status(a)), 2);
        assert_eq!(hub.on_progress_event(&status(b)), 1);

        let first: serde_json::Value = serde_json::from_str(&only_a.recv().await.unwrap()).unwrap();
        assert_eq!(first["buildId"], a.to_string());
        assert!(only_a.rx.try_recv().is_err());

        all.recv().await.unwrap();
        let second: serde_json::Value = serde_json::from_str(&all.recv().await.unwrap()).unwrap();
        assert_eq!(second["buildId"], b.to_string());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = NotificationHub::new(8);
        let mut sub = hub.subscribe("c1", None);
        hub.unsubscribe("c1");
        assert_eq!(hub.on_progress_event(&status(BuildId::new())), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous_connection() {
        let hub = NotificationHub::new(8);
        let old = hub.subscribe("c1", None);
        let mut new = hub.subscribe("c1", None);
        assert_eq!(hub.subscriber_count(), 1);

        // The old connection closing must not unregister the new one.
        hub.release(&old);
        assert_eq!(hub.subscriber_count(), 1);

        hub.on_progress_event(&status(BuildId::new()));
        assert!(new.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_dropped() {
        let hub = NotificationHub::new(8);
        let sub = hub.subscribe("gone", None);
        drop(sub);
        assert_eq!(hub.on_progress_event(&status(BuildId::new())), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_full_channel_drops_frames() {
        let hub = NotificationHub::new(1);
        let mut sub = hub.subscribe("slow", None);
        let id = BuildId::new();
        assert_eq!(hub.on_progress_event(&ProgressEvent::log(id, "one")), 1);
        assert_eq!(hub.on_progress_event(&ProgressEvent::log(id, "two")), 0);
        assert_eq!(hub.subscriber_count(), 1);

        let frame: serde_json::Value = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(frame["log"], "one");
    }
}
