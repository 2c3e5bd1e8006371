//! The bus abstraction shared by every backend.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::{BusResult, Topic};

/// One message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Topic,
    pub key: String,
    pub payload: Bytes,
    pub partition: u32,
    pub offset: u64,
    pub published_at: DateTime<Utc>,
}

impl Delivery {
    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// A partitioned, key-ordered, at-least-once broker with consumer groups.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Create the topics if they do not exist yet.
    async fn ensure_topics(&self, topics: &[Topic]) -> BusResult<()>;

    /// Publish a message. Returns once the broker has accepted it.
    async fn publish(&self, topic: Topic, key: &str, payload: Bytes) -> BusResult<()>;

    /// Join a consumer group on the given topics. Fails with
    /// `BusError::TopicNotFound` if any topic does not exist.
    async fn attach(&self, group: &str, topics: &[Topic]) -> BusResult<Box<dyn Subscription>>;

    /// Delete messages every consumer group has committed, and any message
    /// published more than `max_age` ago. Returns how many were removed.
    async fn purge(&self, max_age: Duration) -> BusResult<u64>;
}

/// A consumer group membership.
///
/// At most one message per partition is in flight for a group at a time.
/// Dropping a subscription without acknowledging leaves its in-flight message
/// to be redelivered to another member.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message. `None` once the bus has shut down.
    async fn next(&mut self) -> BusResult<Option<Delivery>>;

    /// Commit a delivery so it is not handed out again.
    async fn ack(&mut self, delivery: &Delivery) -> BusResult<()>;
}

/// Serialize `value` as JSON and publish it.
pub async fn publish_json<T: Serialize + ?Sized>(
    bus: &dyn MessageBus,
    topic: Topic,
    key: &str,
    value: &T,
) -> BusResult<()> {
    let payload = serde_json::to_vec(value)?;
    bus.publish(topic, key, Bytes::from(payload)).await
}

/// Stable partition for a key. Identical in every process.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    hash % partitions.max(1)
}
