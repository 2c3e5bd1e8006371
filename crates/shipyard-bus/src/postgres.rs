//! PostgreSQL-backed broker for multi-process deployments.
//!
//! Topics, partitions, messages and group offsets live in the `bus_*`
//! tables. A member leases a partition for its group with
//! `FOR UPDATE SKIP LOCKED`, so a partition is consumed by one member at a
//! time and the lease passes to another member when it is not renewed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shipyard_config::BusSettings;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{BusError, BusResult, Delivery, MessageBus, Subscription, Topic, partition_for};

/// Message bus over a shared PostgreSQL database.
#[derive(Clone)]
pub struct PgBus {
    pool: PgPool,
    partitions: u32,
    poll_interval: Duration,
    lease: Duration,
    known: Arc<DashMap<Topic, u32>>,
}

#[derive(sqlx::FromRow)]
struct LeasedPartition {
    topic: String,
    partition: i32,
    committed: i64,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    seq: i64,
    key: String,
    payload: Vec<u8>,
    published_at: DateTime<Utc>,
}

impl PgBus {
    pub fn new(pool: PgPool, settings: &BusSettings) -> Self {
        Self {
            pool,
            partitions: settings.partitions.max(1),
            poll_interval: settings.poll_interval(),
            lease: settings.lease(),
            known: Arc::new(DashMap::new()),
        }
    }

    /// Partition count of a topic, or `None` if it does not exist.
    async fn partitions_of(&self, topic: Topic) -> BusResult<Option<u32>> {
        if let Some(count) = self.known.get(&topic) {
            return Ok(Some(*count));
        }
        let count: Option<i32> =
            sqlx::query_scalar("SELECT partitions FROM bus_topics WHERE name = $1")
                .bind(topic.as_str())
                .fetch_optional(&self.pool)
                .await?;
        let count = count.map(|c| c.max(1) as u32);
        if let Some(c) = count {
            self.known.insert(topic, c);
        }
        Ok(count)
    }
}

#[async_trait]
impl MessageBus for PgBus {
    async fn ensure_topics(&self, topics: &[Topic]) -> BusResult<()> {
        for topic in topics {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO bus_topics (name, partitions, created_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (name) DO NOTHING
                "#,
            )
            .bind(topic.as_str())
            .bind(self.partitions as i32)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO bus_partitions (topic, partition, next_seq)
                SELECT t.name, p, 0
                FROM bus_topics t, generate_series(0, t.partitions - 1) AS p
                WHERE t.name = $1
                ON CONFLICT (topic, partition) DO NOTHING
                "#,
            )
            .bind(topic.as_str())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
        }
        Ok(())
    }

    async fn publish(&self, topic: Topic, key: &str, payload: Bytes) -> BusResult<()> {
        let partitions = match self.partitions_of(topic).await? {
            Some(count) => count,
            None => {
                self.ensure_topics(&[topic]).await?;
                self.partitions_of(topic)
                    .await?
                    .ok_or_else(|| BusError::TopicNotFound(topic.as_str().to_string()))?
            }
        };
        let partition = partition_for(key, partitions) as i32;

        // The row lock on the partition serializes writers, so sequence
        // numbers are dense and become visible in order.
        let mut tx = self.pool.begin().await?;
        let seq: i64 = sqlx::query_scalar(
            r#"
            UPDATE bus_partitions SET next_seq = next_seq + 1
            WHERE topic = $1 AND partition = $2
            RETURNING next_seq - 1
            "#,
        )
        .bind(topic.as_str())
        .bind(partition)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO bus_messages (topic, partition, seq, key, payload, published_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(topic.as_str())
        .bind(partition)
        .bind(seq)
        .bind(key)
        .bind(payload.as_ref())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(topic = %topic, key, partition, seq, "Published message");
        Ok(())
    }

    async fn attach(&self, group: &str, topics: &[Topic]) -> BusResult<Box<dyn Subscription>> {
        for topic in topics {
            if self.partitions_of(*topic).await?.is_none() {
                return Err(BusError::TopicNotFound(topic.as_str().to_string()));
            }
            sqlx::query(
                r#"
                INSERT INTO bus_offsets (group_name, topic, partition, committed)
                SELECT $1, topic, partition, 0 FROM bus_partitions WHERE topic = $2
                ON CONFLICT (group_name, topic, partition) DO NOTHING
                "#,
            )
            .bind(group)
            .bind(topic.as_str())
            .execute(&self.pool)
            .await?;
        }

        Ok(Box::new(PgSubscription {
            pool: self.pool.clone(),
            group: group.to_string(),
            topics: topics.iter().map(|t| t.as_str().to_string()).collect(),
            member: format!("{}-{}", group, uuid::Uuid::new_v4()),
            poll_interval: self.poll_interval,
            lease: self.lease,
            renewal: None,
        }))
    }

    async fn purge(&self, max_age: Duration) -> BusResult<u64> {
        // MIN over no offsets is NULL, so partitions without any group keep
        // their messages until they age out.
        let deleted = sqlx::query(
            r#"
            DELETE FROM bus_messages m
            WHERE m.published_at < NOW() - make_interval(secs => $1)
               OR m.seq < (
                   SELECT MIN(o.committed) FROM bus_offsets o
                   WHERE o.topic = m.topic AND o.partition = m.partition
               )
            "#,
        )
        .bind(max_age.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if deleted > 0 {
            debug!(deleted, "Purged bus messages");
        }
        Ok(deleted)
    }
}

struct PgSubscription {
    pool: PgPool,
    group: String,
    topics: Vec<String>,
    member: String,
    poll_interval: Duration,
    lease: Duration,
    /// Keeps the lease of the in-flight partition alive until it is acked.
    renewal: Option<CancellationToken>,
}

impl PgSubscription {
    async fn try_claim(&mut self) -> BusResult<Option<Delivery>> {
        let leased = sqlx::query_as::<_, LeasedPartition>(
            r#"
            UPDATE bus_offsets o
            SET leased_by = $3, lease_expires = NOW() + make_interval(secs => $4)
            WHERE (o.group_name, o.topic, o.partition) = (
                SELECT c.group_name, c.topic, c.partition
                FROM bus_offsets c
                WHERE c.group_name = $1
                  AND c.topic = ANY($2)
                  AND (c.leased_by IS NULL OR c.leased_by = $3 OR c.lease_expires < NOW())
                  AND EXISTS (
                      SELECT 1 FROM bus_messages m
                      WHERE m.topic = c.topic AND m.partition = c.partition AND m.seq >= c.committed
                  )
                ORDER BY c.lease_expires ASC NULLS FIRST
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING o.topic, o.partition, o.committed
            "#,
        )
        .bind(&self.group)
        .bind(&self.topics)
        .bind(&self.member)
        .bind(self.lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(leased) = leased else {
            return Ok(None);
        };

        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT seq, key, payload, published_at FROM bus_messages
            WHERE topic = $1 AND partition = $2 AND seq >= $3
            ORDER BY seq ASC
            LIMIT 1
            "#,
        )
        .bind(&leased.topic)
        .bind(leased.partition)
        .bind(leased.committed)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        self.start_renewal(&leased);
        Ok(Some(Delivery {
            topic: leased.topic.parse()?,
            key: row.key,
            payload: Bytes::from(row.payload),
            partition: leased.partition as u32,
            offset: row.seq as u64,
            published_at: row.published_at,
        }))
    }

    fn start_renewal(&mut self, leased: &LeasedPartition) {
        self.stop_renewal();
        let token = CancellationToken::new();
        let stop = token.clone();
        let pool = self.pool.clone();
        let group = self.group.clone();
        let member = self.member.clone();
        let topic = leased.topic.clone();
        let partition = leased.partition;
        let lease = self.lease;

        tokio::spawn(async move {
            let mut tick = tokio::time::interval((lease / 3).max(Duration::from_millis(100)));
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tick.tick() => {
                        let renewed = sqlx::query(
                            r#"
                            UPDATE bus_offsets
                            SET lease_expires = NOW() + make_interval(secs => $5)
                            WHERE group_name = $1 AND topic = $2 AND partition = $3 AND leased_by = $4
                            "#,
                        )
                        .bind(&group)
                        .bind(&topic)
                        .bind(partition)
                        .bind(&member)
                        .bind(lease.as_secs_f64())
                        .execute(&pool)
                        .await;
                        if let Err(e) = renewed {
                            warn!(group = %group, topic = %topic, partition, error = %e, "Failed to renew partition lease");
                        }
                    }
                }
            }
        });
        self.renewal = Some(token);
    }

    fn stop_renewal(&mut self) {
        if let Some(token) = self.renewal.take() {
            token.cancel();
        }
    }
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn next(&mut self) -> BusResult<Option<Delivery>> {
        loop {
            if let Some(delivery) = self.try_claim().await? {
                return Ok(Some(delivery));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> BusResult<()> {
        self.stop_renewal();
        sqlx::query(
            r#"
            UPDATE bus_offsets SET committed = $4 + 1
            WHERE group_name = $1 AND topic = $2 AND partition = $3
              AND leased_by = $5 AND committed <= $4
            "#,
        )
        .bind(&self.group)
        .bind(delivery.topic.as_str())
        .bind(delivery.partition as i32)
        .bind(delivery.offset as i64)
        .bind(&self.member)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl Drop for PgSubscription {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        PgPool::connect(&url).await.unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL with the shipyard migrations applied
    async fn test_publish_and_consume() {
        let bus = PgBus::new(pool().await, &BusSettings::default());
        bus.ensure_topics(&[Topic::BuildLogs]).await.unwrap();

        let group = format!("test-{}", uuid::Uuid::new_v4());
        let mut sub = bus.attach(&group, &[Topic::BuildLogs]).await.unwrap();
        let key = uuid::Uuid::new_v4().to_string();
        bus.publish(Topic::BuildLogs, &key, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        // A fresh group starts from the earliest retained message, so skip
        // anything left over from other runs.
        loop {
            let d = tokio::time::timeout(Duration::from_secs(5), sub.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            sub.ack(&d).await.unwrap();
            if d.key == key {
                assert_eq!(d.payload, Bytes::from_static(b"hello"));
                break;
            }
        }
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL with the shipyard migrations applied
    async fn test_purge_removes_expired_messages() {
        let bus = PgBus::new(pool().await, &BusSettings::default());
        bus.ensure_topics(&[Topic::BuildStatus]).await.unwrap();
        let key = uuid::Uuid::new_v4().to_string();
        bus.publish(Topic::BuildStatus, &key, Bytes::from_static(b"s"))
            .await
            .unwrap();

        let (key, pool) = (key.as_str(), &bus.pool);
        let count = || async move {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM bus_messages WHERE key = $1")
                .bind(key)
                .fetch_one(pool)
                .await
                .unwrap()
        };
        bus.purge(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(count().await, 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bus.purge(Duration::ZERO).await.unwrap() >= 1);
        assert_eq!(count().await, 0);
    }
}
