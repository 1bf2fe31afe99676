//! Connection, subscription and latest-payload records, the table seams
//! they persist through, and the subscription store's batched cleanup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub mod fjall;
pub mod memory;

/// Document-store batch-write limit
const DELETE_BATCH_SIZE: usize = 25;

const DELETE_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
#[error("storage fault: {0}")]
pub struct StorageError(#[from] pub anyhow::Error);

/// A live WebSocket connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: String,
    pub endpoint: String,
    pub connected_at: i64,
    pub ttl: i64,
}

/// One client subscription. `subscription_id` is
/// `"{connection_id}#{client_sub_id}"`, so the pair reconstructs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub connection_id: String,
    pub topic: String,
    pub endpoint: String,
    pub client_sub_id: String,
    pub ttl: i64,
}

impl Subscription {
    pub fn id_for(connection_id: &str, client_sub_id: &str) -> String {
        format!("{connection_id}#{client_sub_id}")
    }
}

/// The most recently published payload for a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latest {
    pub topic: String,
    /// JSON-encoded payload
    pub payload: String,
    pub message_id: String,
    pub ttl: i64,
}

#[async_trait]
pub trait ConnectionTable: Send + Sync {
    async fn put(&self, connection: Connection) -> Result<(), StorageError>;
    async fn get(&self, connection_id: &str) -> Result<Option<Connection>, StorageError>;
    async fn delete(&self, connection_id: &str) -> Result<(), StorageError>;
}

/// Subscription rows with their two required secondary indexes
#[async_trait]
pub trait SubscriptionTable: Send + Sync {
    async fn put(&self, subscription: Subscription) -> Result<(), StorageError>;
    async fn delete(&self, subscription_id: &str) -> Result<(), StorageError>;

    /// All subscribers of a topic (the by-topic index)
    async fn query_by_topic(&self, topic: &str) -> Result<Vec<Subscription>, StorageError>;

    /// All subscriptions of a connection (the by-connection index)
    async fn query_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<Subscription>, StorageError>;

    async fn count_by_topic(&self, topic: &str) -> Result<u64, StorageError>;

    /// Delete up to [`DELETE_BATCH_SIZE`] rows; returns the ids the store
    /// could not process this round
    async fn batch_delete(&self, subscription_ids: &[String]) -> Result<Vec<String>, StorageError>;
}

#[async_trait]
pub trait LatestTable: Send + Sync {
    async fn put(&self, latest: Latest) -> Result<(), StorageError>;
    async fn get(&self, topic: &str) -> Result<Option<Latest>, StorageError>;
}

#[derive(Debug, Error)]
pub enum SubscriptionStoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("cancelled while deleting subscriptions for {connection_id}")]
    Cancelled { connection_id: String },

    #[error(
        "failed to delete all subscriptions for {connection_id}: \
         {remaining} items unprocessed after {attempts} retries"
    )]
    RetryExhausted {
        connection_id: String,
        remaining: usize,
        attempts: u32,
    },
}

/// Subscription access for the handler and dispatcher: the table operations
/// plus the batched, retrying delete-by-connection used on disconnect and
/// gone-connection reaping.
#[derive(Clone)]
pub struct SubscriptionStore {
    table: Arc<dyn SubscriptionTable>,
}

impl SubscriptionStore {
    pub fn new(table: Arc<dyn SubscriptionTable>) -> Self {
        Self { table }
    }

    pub async fn put(&self, subscription: Subscription) -> Result<(), StorageError> {
        self.table.put(subscription).await
    }

    pub async fn delete(&self, subscription_id: &str) -> Result<(), StorageError> {
        self.table.delete(subscription_id).await
    }

    pub async fn query_by_topic(&self, topic: &str) -> Result<Vec<Subscription>, StorageError> {
        self.table.query_by_topic(topic).await
    }

    pub async fn query_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<Subscription>, StorageError> {
        self.table.query_by_connection(connection_id).await
    }

    pub async fn count_by_topic(&self, topic: &str) -> Result<u64, StorageError> {
        self.table.count_by_topic(topic).await
    }

    /// Remove every subscription of a connection, in store-limit batches.
    /// Unprocessed leftovers are retried with exponential back-off; if the
    /// budget runs out the remaining count is reported rather than dropped.
    pub async fn delete_by_connection(
        &self,
        connection_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SubscriptionStoreError> {
        let subscriptions = self.table.query_by_connection(connection_id).await?;
        let ids: Vec<String> = subscriptions
            .into_iter()
            .map(|s| s.subscription_id)
            .collect();

        for chunk in ids.chunks(DELETE_BATCH_SIZE) {
            let mut pending = chunk.to_vec();
            let mut attempt = 0;
            loop {
                pending = self.table.batch_delete(&pending).await?;
                if pending.is_empty() {
                    break;
                }

                attempt += 1;
                if attempt >= DELETE_ATTEMPTS {
                    return Err(SubscriptionStoreError::RetryExhausted {
                        connection_id: connection_id.to_string(),
                        remaining: pending.len(),
                        attempts: DELETE_ATTEMPTS,
                    });
                }
                warn!(
                    connection_id,
                    attempt,
                    remaining = pending.len(),
                    "retrying unprocessed subscription deletes"
                );

                let backoff = Duration::from_millis(100) * 2u32.pow(attempt - 1);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(SubscriptionStoreError::Cancelled {
                            connection_id: connection_id.to_string(),
                        });
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
        Ok(())
    }
}
