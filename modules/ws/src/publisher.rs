//! Publishing side of the fabric: envelopes onto the partitioned log, with
//! an optional latest-value cache for greeting new subscribers.

use crate::stores::{Latest, LatestTable};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// The message format on the events log. `message_id` is a caller-provided
/// idempotency key (transaction hash, slot + pool id, ...) passed through
/// to clients for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,

    #[serde(rename = "messageId")]
    pub message_id: String,

    pub payload: Value,
}

/// The partitioned log the fabric publishes through. Records with the same
/// partition key are totally ordered.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn put_record(&self, partition_key: &str, data: &[u8]) -> Result<()>;
}

pub struct Publisher {
    log: Arc<dyn EventLog>,
    cache: Option<(Arc<dyn LatestTable>, Duration)>,
}

impl Publisher {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log, cache: None }
    }

    /// Also record each publish in the latest-value cache, enabling
    /// [`Publisher::send_and_cache`]
    pub fn with_cache(mut self, cache: Arc<dyn LatestTable>, ttl: Duration) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    /// Publish an event. The topic doubles as the partition key so that a
    /// topic's messages stay totally ordered.
    pub async fn send(
        &self,
        topic: &str,
        message_id: &str,
        payload: &impl Serialize,
    ) -> Result<()> {
        if topic.is_empty() {
            bail!("topic must not be empty");
        }

        let envelope = Envelope {
            topic: topic.to_string(),
            message_id: message_id.to_string(),
            payload: serde_json::to_value(payload).context("marshalling payload")?,
        };
        let data = serde_json::to_vec(&envelope).context("marshalling envelope")?;

        self.log
            .put_record(topic, &data)
            .await
            .with_context(|| format!("publishing to topic {topic}"))
    }

    /// Publish and overwrite the topic's latest-value cache entry so new
    /// subscribers get an immediate first message. Cache failures are
    /// logged, never fatal.
    pub async fn send_and_cache(
        &self,
        topic: &str,
        message_id: &str,
        payload: &impl Serialize,
    ) -> Result<()> {
        self.send(topic, message_id, payload).await?;

        if let Some((cache, ttl)) = &self.cache {
            let entry = Latest {
                topic: topic.to_string(),
                payload: serde_json::to_string(payload).context("marshalling payload for cache")?,
                message_id: message_id.to_string(),
                ttl: unix_now() + ttl.as_secs() as i64,
            };
            if let Err(e) = cache.put(entry).await {
                warn!(topic = %topic, error = %e, "failed to cache latest payload");
            }
        }

        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::MemoryWsStore;
    use crate::stores::StorageError;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryLog {
        records: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl EventLog for MemoryLog {
        async fn put_record(&self, partition_key: &str, data: &[u8]) -> Result<()> {
            self.records
                .lock()
                .unwrap()
                .push((partition_key.to_string(), data.to_vec()));
            Ok(())
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl LatestTable for BrokenCache {
        async fn put(&self, _latest: Latest) -> Result<(), StorageError> {
            Err(StorageError(anyhow::anyhow!("cache down")))
        }

        async fn get(&self, _topic: &str) -> Result<Option<Latest>, StorageError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn send_publishes_with_topic_as_partition_key() {
        let log = Arc::new(MemoryLog::default());
        let publisher = Publisher::new(log.clone());

        publisher.send("pools:p1", "m1", &json!({"tvl": 9})).await.unwrap();

        let records = log.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "pools:p1");

        let envelope: Envelope = serde_json::from_slice(&records[0].1).unwrap();
        assert_eq!(envelope.topic, "pools:p1");
        assert_eq!(envelope.message_id, "m1");
        assert_eq!(envelope.payload, json!({"tvl": 9}));
    }

    #[tokio::test]
    async fn empty_topic_is_rejected() {
        let publisher = Publisher::new(Arc::new(MemoryLog::default()));
        assert!(publisher.send("", "m1", &json!({})).await.is_err());
    }

    #[tokio::test]
    async fn send_and_cache_writes_the_latest_entry() {
        let log = Arc::new(MemoryLog::default());
        let store = Arc::new(MemoryWsStore::new());
        let publisher =
            Publisher::new(log.clone()).with_cache(store.clone(), Duration::from_secs(60));

        publisher
            .send_and_cache("pools:p1", "m2", &json!({"tvl": 10}))
            .await
            .unwrap();

        assert_eq!(log.records.lock().unwrap().len(), 1);
        let cached = LatestTable::get(store.as_ref(), "pools:p1").await.unwrap().unwrap();
        assert_eq!(cached.message_id, "m2");
        assert_eq!(cached.payload, r#"{"tvl":10}"#);
        assert!(cached.ttl > unix_now());
    }

    #[tokio::test]
    async fn cache_failures_are_not_fatal() {
        let log = Arc::new(MemoryLog::default());
        let publisher =
            Publisher::new(log.clone()).with_cache(Arc::new(BrokenCache), Duration::from_secs(60));

        publisher
            .send_and_cache("pools:p1", "m3", &json!({}))
            .await
            .unwrap();
        assert_eq!(log.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn without_cache_send_and_cache_just_sends() {
        let log = Arc::new(MemoryLog::default());
        let publisher = Publisher::new(log.clone());
        publisher.send_and_cache("t", "m", &json!({})).await.unwrap();
        assert_eq!(log.records.lock().unwrap().len(), 1);
    }
}
