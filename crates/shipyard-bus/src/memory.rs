//! In-process partitioned broker.
//!
//! Keeps the delivery semantics of the shared backend: per-key ordering
//! within a topic, consumer groups with committed offsets, at most one
//! in-flight message per partition per group, and redelivery of messages a
//! departed member never acknowledged.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::{BusError, BusResult, Delivery, MessageBus, Subscription, Topic, partition_for};

/// Cloneable handle to an in-memory broker.
#[derive(Clone)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    partitions: u32,
}

#[derive(Default)]
struct State {
    topics: HashMap<Topic, TopicLog>,
    next_member: u64,
    closed: bool,
}

struct TopicLog {
    partitions: Vec<PartitionLog>,
    groups: HashMap<String, GroupCursor>,
}

#[derive(Default)]
struct PartitionLog {
    /// Offset of the first retained message.
    base: u64,
    messages: VecDeque<Stored>,
}

struct Stored {
    key: String,
    payload: Bytes,
    published_at: DateTime<Utc>,
}

struct GroupCursor {
    committed: Vec<u64>,
    /// (member, offset) currently being processed, per partition.
    in_flight: Vec<Option<(u64, u64)>>,
}

impl PartitionLog {
    fn get(&self, offset: u64) -> Option<&Stored> {
        let index = offset.checked_sub(self.base)?;
        self.messages.get(usize::try_from(index).ok()?)
    }

    fn end(&self) -> u64 {
        self.base + self.messages.len() as u64
    }
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| PartitionLog::default()).collect(),
            groups: HashMap::new(),
        }
    }

    /// Drop messages every group has committed.
    fn compact(&mut self, partition: usize) {
        let Some(low) = self.groups.values().map(|g| g.committed[partition]).min() else {
            return;
        };
        let log = &mut self.partitions[partition];
        while log.base < low && log.messages.pop_front().is_some() {
            log.base += 1;
        }
    }

    /// Drop messages published before `cutoff`, consumed or not.
    fn expire(&mut self, cutoff: DateTime<Utc>) -> u64 {
        let mut removed = 0;
        for log in &mut self.partitions {
            while log.messages.front().is_some_and(|m| m.published_at < cutoff) {
                log.messages.pop_front();
                log.base += 1;
                removed += 1;
            }
        }
        removed
    }
}

impl InMemoryBus {
    /// A broker with no topics. Topics appear through `ensure_topics` or the
    /// first publish to them.
    pub fn new(partitions: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                partitions: partitions.max(1),
            }),
        }
    }

    pub fn with_topics(partitions: u32, topics: &[Topic]) -> Self {
        let bus = Self::new(partitions);
        {
            let mut state = bus.shared.lock();
            for topic in topics {
                state
                    .topics
                    .entry(*topic)
                    .or_insert_with(|| TopicLog::new(bus.shared.partitions));
            }
        }
        bus
    }

    /// Stop all subscriptions. Pending `next` calls return `None`.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Messages currently retained on a topic, in partition order.
    pub fn retained(&self, topic: Topic) -> Vec<Delivery> {
        let state = self.shared.lock();
        let Some(log) = state.topics.get(&topic) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (partition, plog) in log.partitions.iter().enumerate() {
            for (i, stored) in plog.messages.iter().enumerate() {
                out.push(to_delivery(topic, partition, plog.base + i as u64, stored));
            }
        }
        out
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_delivery(topic: Topic, partition: usize, offset: u64, stored: &Stored) -> Delivery {
    Delivery {
        topic,
        key: stored.key.clone(),
        payload: stored.payload.clone(),
        partition: partition as u32,
        offset,
        published_at: stored.published_at,
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn ensure_topics(&self, topics: &[Topic]) -> BusResult<()> {
        {
            let mut state = self.shared.lock();
            for topic in topics {
                state
                    .topics
                    .entry(*topic)
                    .or_insert_with(|| TopicLog::new(self.shared.partitions));
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn publish(&self, topic: Topic, key: &str, payload: Bytes) -> BusResult<()> {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(BusError::Closed);
            }
            let log = state
                .topics
                .entry(topic)
                .or_insert_with(|| TopicLog::new(self.shared.partitions));
            let partition = partition_for(key, log.partitions.len() as u32) as usize;
            log.partitions[partition].messages.push_back(Stored {
                key: key.to_string(),
                payload,
                published_at: Utc::now(),
            });
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn attach(&self, group: &str, topics: &[Topic]) -> BusResult<Box<dyn Subscription>> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(BusError::Closed);
        }
        if let Some(missing) = topics.iter().find(|t| !state.topics.contains_key(*t)) {
            return Err(BusError::TopicNotFound(missing.as_str().to_string()));
        }

        for topic in topics {
            if let Some(log) = state.topics.get_mut(topic) {
                let bases: Vec<u64> = log.partitions.iter().map(|p| p.base).collect();
                log.groups
                    .entry(group.to_string())
                    .or_insert_with(|| GroupCursor {
                        in_flight: vec![None; bases.len()],
                        committed: bases,
                    });
            }
        }

        state.next_member += 1;
        Ok(Box::new(InMemorySubscription {
            shared: Arc::clone(&self.shared),
            group: group.to_string(),
            topics: topics.to_vec(),
            member: state.next_member,
            cursor: 0,
        }))
    }

    /// Committed messages are already compacted on ack, so only the age
    /// limit applies here.
    async fn purge(&self, max_age: Duration) -> BusResult<u64> {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut state = self.shared.lock();
        Ok(state.topics.values_mut().map(|log| log.expire(cutoff)).sum())
    }
}

struct InMemorySubscription {
    shared: Arc<Shared>,
    group: String,
    topics: Vec<Topic>,
    member: u64,
    /// Rotates the scan start so no partition starves the others.
    cursor: usize,
}

impl InMemorySubscription {
    fn claim(&mut self, state: &mut State) -> Option<Delivery> {
        let mut slots = Vec::new();
        for topic in &self.topics {
            if let Some(log) = state.topics.get(topic) {
                slots.extend((0..log.partitions.len()).map(|p| (*topic, p)));
            }
        }
        if slots.is_empty() {
            return None;
        }

        let start = self.cursor % slots.len();
        for i in 0..slots.len() {
            let (topic, partition) = slots[(start + i) % slots.len()];
            let Some(TopicLog { partitions, groups }) = state.topics.get_mut(&topic) else {
                continue;
            };
            let Some(cursor) = groups.get_mut(&self.group) else {
                continue;
            };
            if cursor.in_flight[partition].is_some() {
                continue;
            }
            let plog = &partitions[partition];
            let offset = cursor.committed[partition].max(plog.base);
            if offset >= plog.end() {
                continue;
            }
            if let Some(stored) = plog.get(offset) {
                cursor.in_flight[partition] = Some((self.member, offset));
                self.cursor = start + i + 1;
                return Some(to_delivery(topic, partition, offset, stored));
            }
        }
        None
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> BusResult<Option<Delivery>> {
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = shared.lock();
                if state.closed {
                    return Ok(None);
                }
                if let Some(delivery) = self.claim(&mut state) {
                    return Ok(Some(delivery));
                }
            }
            notified.await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> BusResult<()> {
        {
            let mut state = self.shared.lock();
            let partition = delivery.partition as usize;
            if let Some(log) = state.topics.get_mut(&delivery.topic) {
                if let Some(cursor) = log.groups.get_mut(&self.group) {
                    if cursor.in_flight[partition] == Some((self.member, delivery.offset)) {
                        cursor.in_flight[partition] = None;
                        cursor.committed[partition] = delivery.offset + 1;
                    }
                }
                log.compact(partition);
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            for topic in &self.topics {
                if let Some(cursor) = state
                    .topics
                    .get_mut(topic)
                    .and_then(|log| log.groups.get_mut(&self.group))
                {
                    for slot in cursor.in_flight.iter_mut() {
                        if matches!(slot, Some((member, _)) if *member == self.member) {
                            *slot = None;
                        }
                    }
                }
            }
        }
        self.shared.notify.notify_waiters();
    }
}
