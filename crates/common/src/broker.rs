//! Work-distribution broker.
//!
//! Delivery tasks travel through a broker with at-least-once semantics:
//! every fetched entry must be acknowledged or requeued, and entries left
//! unacknowledged past the visibility timeout are handed to another consumer.
//! The broker is never a system of record; a lost queue is rebuilt from the
//! database by the dispatcher sweep.
//!
//! Two implementations:
//! - [`RedisBroker`]: Redis streams + consumer groups, with a sorted set per
//!   topic holding delayed requeues until they are due.
//! - [`MemoryBroker`]: in-process queues for tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::AppError;

/// Stream carrying [`DeliveryTask`](crate::types::DeliveryTask) payloads.
pub const DELIVERY_TOPIC: &str = "notifications:delivery";

/// Stream carrying [`DeadLetter`](crate::types::DeadLetter) payloads for alerting.
pub const DEAD_LETTER_TOPIC: &str = "notifications:dead";

/// Consumer group shared by all delivery workers.
pub const DELIVERY_GROUP: &str = "delivery-workers";

/// Approximate cap on stream length.
const STREAM_MAXLEN: usize = 100_000;

/// Delayed entries promoted per fetch.
const PROMOTE_BATCH: isize = 100;

/// A fetched broker entry. Pass it back to `ack` or `nack_and_requeue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub group: String,
    pub id: String,
    pub payload: String,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), AppError>;

    /// Pull up to `max` entries for `consumer` within `group`.
    ///
    /// Returns redelivered (visibility-expired) entries first, then new ones.
    /// Never blocks; an empty vector means nothing is ready.
    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, AppError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError>;

    /// Acknowledge the entry and schedule its payload to reappear after `delay`.
    async fn nack_and_requeue(&self, delivery: &Delivery, delay: Duration)
    -> Result<(), AppError>;
}

/// Serialize `value` as JSON and publish it.
pub async fn publish_json<T: Serialize + Sync>(
    broker: &dyn Broker,
    topic: &str,
    value: &T,
) -> Result<(), AppError> {
    let payload = serde_json::to_string(value)?;
    broker.publish(topic, &payload).await
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

/// Redis-streams broker.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    visibility_timeout: Duration,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager, visibility_timeout: Duration) -> Self {
        Self {
            conn,
            visibility_timeout,
        }
    }

    /// Open a connection manager to `redis_url`.
    pub async fn connect(redis_url: &str, visibility_timeout: Duration) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        tracing::info!("Connected to Redis");
        Ok(Self::new(conn, visibility_timeout))
    }

    fn delayed_key(topic: &str) -> String {
        format!("{}:delayed", topic)
    }

    /// Create the consumer group (and stream) if missing.
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(topic, group, "0").await;
        match result {
            Ok(()) => {
                tracing::info!(topic, group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move due delayed entries into the stream.
    ///
    /// `ZREM` decides the winner when several consumers promote at once, so
    /// each delayed entry is re-added exactly once.
    async fn promote_due(&self, topic: &str) -> Result<usize, AppError> {
        let mut conn = self.conn.clone();
        let key = Self::delayed_key(topic);
        let now_ms = chrono::Utc::now().timestamp_millis();

        let due: Vec<String> = conn
            .zrangebyscore_limit(&key, "-inf", now_ms, 0, PROMOTE_BATCH)
            .await?;

        let mut promoted = 0;
        for payload in due {
            let removed: i32 = conn.zrem(&key, &payload).await?;
            if removed == 1 {
                let _: String = conn
                    .xadd_maxlen(
                        topic,
                        StreamMaxlen::Approx(STREAM_MAXLEN),
                        "*",
                        &[("payload", payload.as_str())],
                    )
                    .await?;
                promoted += 1;
            }
        }

        if promoted > 0 {
            tracing::debug!(topic, promoted, "Promoted delayed entries");
        }
        Ok(promoted)
    }

    /// Claim entries another consumer left unacknowledged past the visibility timeout.
    async fn reclaim_expired(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<StreamId>, AppError> {
        let mut conn = self.conn.clone();
        let visibility_ms = usize::try_from(self.visibility_timeout.as_millis()).unwrap_or(usize::MAX);

        let pending: StreamPendingCountReply =
            conn.xpending_count(topic, group, "-", "+", max).await?;

        let expired: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= visibility_ms)
            .map(|p| p.id)
            .collect();

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(topic, group, consumer, visibility_ms, &expired)
            .await?;

        if !claimed.ids.is_empty() {
            tracing::info!(
                topic,
                consumer,
                count = claimed.ids.len(),
                "Reclaimed entries past visibility timeout"
            );
        }
        Ok(claimed.ids)
    }

    fn to_delivery(topic: &str, group: &str, entry: &StreamId) -> Delivery {
        Delivery {
            topic: topic.to_string(),
            group: group.to_string(),
            id: entry.id.clone(),
            payload: entry.get::<String>("payload").unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(
                topic,
                StreamMaxlen::Approx(STREAM_MAXLEN),
                "*",
                &[("payload", payload)],
            )
            .await?;
        tracing::debug!(topic, entry_id = %id, "Published");
        Ok(())
    }

    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, AppError> {
        self.ensure_group(topic, group).await?;
        self.promote_due(topic).await?;

        let mut deliveries: Vec<Delivery> = self
            .reclaim_expired(topic, group, consumer, max)
            .await?
            .iter()
            .map(|entry| Self::to_delivery(topic, group, entry))
            .collect();

        let remaining = max.saturating_sub(deliveries.len());
        if remaining == 0 {
            return Ok(deliveries);
        }

        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(remaining);
        let reply: Option<StreamReadReply> = conn.xread_options(&[topic], &[">"], &opts).await?;

        if let Some(reply) = reply {
            for key in &reply.keys {
                deliveries.extend(
                    key.ids
                        .iter()
                        .map(|entry| Self::to_delivery(topic, group, entry)),
                );
            }
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&delivery.topic, &delivery.group, &[&delivery.id])
            .await?;
        Ok(())
    }

    async fn nack_and_requeue(
        &self,
        delivery: &Delivery,
        delay: Duration,
    ) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let due_ms = chrono::Utc::now().timestamp_millis().saturating_add(delay_ms);

        // Schedule first: a crash between the two calls duplicates rather than loses.
        let _: i64 = conn
            .zadd(Self::delayed_key(&delivery.topic), &delivery.payload, due_ms)
            .await?;
        self.ack(delivery).await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TopicQueue {
    ready: VecDeque<(String, String)>,
    delayed: Vec<(Instant, String)>,
    in_flight: HashMap<String, (String, Instant)>,
    published: Vec<String>,
    requeues: Vec<Duration>,
}

/// In-process broker. Consumer groups collapse into one shared queue per topic.
#[derive(Debug)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, TopicQueue>>,
    next_id: Mutex<u64>,
    visibility_timeout: Duration,
    fail_publish: Mutex<bool>,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
            visibility_timeout,
            fail_publish: Mutex::new(false),
        }
    }

    /// Make subsequent `publish` calls fail, simulating a broker outage.
    pub fn set_publish_failure(&self, fail: bool) {
        *lock(&self.fail_publish) = fail;
    }

    /// Every payload ever published to `topic`, in order.
    pub fn published(&self, topic: &str) -> Vec<String> {
        lock(&self.topics)
            .get(topic)
            .map(|q| q.published.clone())
            .unwrap_or_default()
    }

    /// Entries ready, delayed, or in flight on `topic`.
    pub fn outstanding(&self, topic: &str) -> usize {
        lock(&self.topics)
            .get(topic)
            .map(|q| q.ready.len() + q.delayed.len() + q.in_flight.len())
            .unwrap_or(0)
    }

    /// Delays passed to `nack_and_requeue` on `topic`, in order.
    pub fn requeue_delays(&self, topic: &str) -> Vec<Duration> {
        lock(&self.topics)
            .get(topic)
            .map(|q| q.requeues.clone())
            .unwrap_or_default()
    }

    fn next_entry_id(&self) -> String {
        let mut next = lock(&self.next_id);
        *next += 1;
        format!("{}-0", *next)
    }

    fn enqueue(&self, topic: &str, payload: String) {
        let id = self.next_entry_id();
        lock(&self.topics)
            .entry(topic.to_string())
            .or_default()
            .ready
            .push_back((id, payload));
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), AppError> {
        if *lock(&self.fail_publish) {
            return Err(AppError::Internal("broker unavailable".to_string()));
        }
        self.enqueue(topic, payload.to_string());
        lock(&self.topics)
            .entry(topic.to_string())
            .or_default()
            .published
            .push(payload.to_string());
        Ok(())
    }

    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        _consumer: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, AppError> {
        let now = Instant::now();

        let (due, expired) = {
            let mut topics = lock(&self.topics);
            let queue = topics.entry(topic.to_string()).or_default();

            let (due, later): (Vec<_>, Vec<_>) =
                queue.delayed.drain(..).partition(|(at, _)| *at <= now);
            queue.delayed = later;

            let expired: Vec<String> = queue
                .in_flight
                .iter()
                .filter(|(_, (_, since))| now.duration_since(*since) >= self.visibility_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            let expired: Vec<(String, String)> = expired
                .into_iter()
                .filter_map(|id| queue.in_flight.remove(&id).map(|(p, _)| (id, p)))
                .collect();
            (due, expired)
        };

        for (_, payload) in due {
            self.enqueue(topic, payload);
        }

        let mut topics = lock(&self.topics);
        let queue = topics.entry(topic.to_string()).or_default();
        let mut batch: Vec<(String, String)> = expired;
        while batch.len() < max {
            match queue.ready.pop_front() {
                Some(entry) => batch.push(entry),
                None => break,
            }
        }

        let deliveries = batch
            .into_iter()
            .take(max)
            .map(|(id, payload)| {
                queue.in_flight.insert(id.clone(), (payload.clone(), now));
                Delivery {
                    topic: topic.to_string(),
                    group: group.to_string(),
                    id,
                    payload,
                }
            })
            .collect();

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        if let Some(queue) = lock(&self.topics).get_mut(&delivery.topic) {
            queue.in_flight.remove(&delivery.id);
        }
        Ok(())
    }

    async fn nack_and_requeue(
        &self,
        delivery: &Delivery,
        delay: Duration,
    ) -> Result<(), AppError> {
        let mut topics = lock(&self.topics);
        let queue = topics.entry(delivery.topic.clone()).or_default();
        queue.in_flight.remove(&delivery.id);
        queue
            .delayed
            .push((Instant::now() + delay, delivery.payload.clone()));
        queue.requeues.push(delay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_fetch_ack() {
        let broker = MemoryBroker::default();
        broker.publish("t", "one").await.unwrap();
        broker.publish("t", "two").await.unwrap();

        let batch = broker.fetch("t", "g", "c1", 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, "one");

        for d in &batch {
            broker.ack(d).await.unwrap();
        }
        assert_eq!(broker.outstanding("t"), 0);
        assert_eq!(broker.published("t"), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_fetch_respects_max() {
        let broker = MemoryBroker::default();
        for i in 0..5 {
            broker.publish("t", &i.to_string()).await.unwrap();
        }
        let batch = broker.fetch("t", "g", "c1", 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(broker.outstanding("t"), 5);
    }

    #[tokio::test]
    async fn test_in_flight_entry_not_handed_out_twice() {
        let broker = MemoryBroker::default();
        broker.publish("t", "only").await.unwrap();

        let first = broker.fetch("t", "g", "c1", 10).await.unwrap();
        let second = broker.fetch("t", "g", "c2", 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_entry_redelivered_after_visibility_timeout() {
        let broker = MemoryBroker::new(Duration::from_secs(30));
        broker.publish("t", "task").await.unwrap();

        let first = broker.fetch("t", "g", "c1", 10).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let again = broker.fetch("t", "g", "c2", 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].payload, "task");
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_waits_for_delay() {
        let broker = MemoryBroker::default();
        broker.publish("t", "retry-me").await.unwrap();
        let batch = broker.fetch("t", "g", "c1", 1).await.unwrap();
        broker
            .nack_and_requeue(&batch[0], Duration::from_secs(5))
            .await
            .unwrap();

        assert!(broker.fetch("t", "g", "c1", 1).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        let retried = broker.fetch("t", "g", "c1", 1).await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].payload, "retry-me");
        assert_eq!(broker.requeue_delays("t"), vec![Duration::from_secs(5)]);
    }

    #[tokio::test]
    async fn test_publish_failure_simulation() {
        let broker = MemoryBroker::default();
        broker.set_publish_failure(true);
        assert!(broker.publish("t", "x").await.is_err());
        broker.set_publish_failure(false);
        assert!(broker.publish("t", "x").await.is_ok());
    }

    #[test]
    fn test_delayed_key() {
        assert_eq!(
            RedisBroker::delayed_key(DELIVERY_TOPIC),
            "notifications:delivery:delayed"
        );
    }
}
