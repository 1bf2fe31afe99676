//! Fjall-backed tables. The two secondary indexes are separate keyspaces
//! keyed `"{index-value}\0{subscription_id}"`, scanned by range; every
//! multi-keyspace mutation goes through an atomic batch.

use super::{
    Connection, ConnectionTable, Latest, LatestTable, StorageError, Subscription,
    SubscriptionTable,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use fjall::{Database, Keyspace};
use std::path::Path;

const CONNECTIONS_KEYSPACE: &str = "connections";
const SUBSCRIPTIONS_KEYSPACE: &str = "subscriptions";
const SUBS_BY_TOPIC_KEYSPACE: &str = "subs-by-topic";
const SUBS_BY_CONNECTION_KEYSPACE: &str = "subs-by-connection";
const LATEST_KEYSPACE: &str = "latest";

pub struct FjallWsStore {
    database: Database,
    connections: Keyspace,
    subscriptions: Keyspace,
    subs_by_topic: Keyspace,
    subs_by_connection: Keyspace,
    latest: Keyspace,
}

impl FjallWsStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let database = Database::builder(path.as_ref())
            .open()
            .context("opening websocket store")?;
        let connections =
            database.keyspace(CONNECTIONS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let subscriptions =
            database.keyspace(SUBSCRIPTIONS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let subs_by_topic =
            database.keyspace(SUBS_BY_TOPIC_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let subs_by_connection =
            database.keyspace(SUBS_BY_CONNECTION_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let latest = database.keyspace(LATEST_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        Ok(Self {
            database,
            connections,
            subscriptions,
            subs_by_topic,
            subs_by_connection,
            latest,
        })
    }

    fn index_key(value: &str, subscription_id: &str) -> Vec<u8> {
        let mut key = value.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(subscription_id.as_bytes());
        key
    }

    /// Bounds covering every index entry for `value`
    fn index_range(value: &str) -> (Vec<u8>, Vec<u8>) {
        let mut start = value.as_bytes().to_vec();
        start.push(0);
        let mut end = value.as_bytes().to_vec();
        end.push(1);
        (start, end)
    }

    fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>, StorageError> {
        let Some(bytes) = self
            .subscriptions
            .get(subscription_id)
            .map_err(anyhow::Error::from)?
        else {
            return Ok(None);
        };
        Ok(Some(
            serde_json::from_slice(&bytes)
                .context("decoding subscription record")
                .map_err(StorageError)?,
        ))
    }

    fn scan_index(
        &self,
        index: &Keyspace,
        value: &str,
    ) -> Result<Vec<Subscription>, StorageError> {
        let (start, end) = Self::index_range(value);
        let mut subscriptions = Vec::new();
        for entry in index.range(start..end) {
            let id = entry.value().map_err(anyhow::Error::from)?;
            let id = std::str::from_utf8(&id)
                .context("index value is not utf-8")
                .map_err(StorageError)?
                .to_string();
            if let Some(subscription) = self.get_subscription(&id)? {
                subscriptions.push(subscription);
            }
        }
        Ok(subscriptions)
    }

    fn remove_in_batch(&self, batch: &mut fjall::OwnedWriteBatch, subscription: &Subscription) {
        batch.remove(&self.subscriptions, subscription.subscription_id.as_bytes());
        batch.remove(
            &self.subs_by_topic,
            Self::index_key(&subscription.topic, &subscription.subscription_id),
        );
        batch.remove(
            &self.subs_by_connection,
            Self::index_key(&subscription.connection_id, &subscription.subscription_id),
        );
    }
}

#[async_trait]
impl ConnectionTable for FjallWsStore {
    async fn put(&self, connection: Connection) -> Result<(), StorageError> {
        self.connections
            .insert(
                connection.connection_id.as_bytes(),
                serde_json::to_vec(&connection)
                    .context("encoding connection")
                    .map_err(StorageError)?,
            )
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn get(&self, connection_id: &str) -> Result<Option<Connection>, StorageError> {
        let Some(bytes) = self
            .connections
            .get(connection_id)
            .map_err(anyhow::Error::from)?
        else {
            return Ok(None);
        };
        Ok(Some(
            serde_json::from_slice(&bytes)
                .context("decoding connection record")
                .map_err(StorageError)?,
        ))
    }

    async fn delete(&self, connection_id: &str) -> Result<(), StorageError> {
        self.connections
            .remove(connection_id)
            .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionTable for FjallWsStore {
    async fn put(&self, subscription: Subscription) -> Result<(), StorageError> {
        let mut batch = self.database.batch();
        // drop any previous index entries for this id first
        if let Some(existing) = self.get_subscription(&subscription.subscription_id)? {
            self.remove_in_batch(&mut batch, &existing);
        }
        batch.insert(
            &self.subscriptions,
            subscription.subscription_id.as_bytes(),
            serde_json::to_vec(&subscription)
                .context("encoding subscription")
                .map_err(StorageError)?,
        );
        batch.insert(
            &self.subs_by_topic,
            Self::index_key(&subscription.topic, &subscription.subscription_id),
            subscription.subscription_id.as_bytes(),
        );
        batch.insert(
            &self.subs_by_connection,
            Self::index_key(&subscription.connection_id, &subscription.subscription_id),
            subscription.subscription_id.as_bytes(),
        );
        batch.commit().map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn delete(&self, subscription_id: &str) -> Result<(), StorageError> {
        let Some(subscription) = self.get_subscription(subscription_id)? else {
            return Ok(());
        };
        let mut batch = self.database.batch();
        self.remove_in_batch(&mut batch, &subscription);
        batch.commit().map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn query_by_topic(&self, topic: &str) -> Result<Vec<Subscription>, StorageError> {
        self.scan_index(&self.subs_by_topic, topic)
    }

    async fn query_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<Subscription>, StorageError> {
        self.scan_index(&self.subs_by_connection, connection_id)
    }

    async fn count_by_topic(&self, topic: &str) -> Result<u64, StorageError> {
        let (start, end) = Self::index_range(topic);
        let mut count = 0;
        for entry in self.subs_by_topic.range(start..end) {
            entry.key().map_err(anyhow::Error::from)?;
            count += 1;
        }
        Ok(count)
    }

    async fn batch_delete(&self, subscription_ids: &[String]) -> Result<Vec<String>, StorageError> {
        let mut batch = self.database.batch();
        for id in subscription_ids {
            if let Some(subscription) = self.get_subscription(id)? {
                self.remove_in_batch(&mut batch, &subscription);
            }
        }
        batch.commit().map_err(anyhow::Error::from)?;
        // an embedded store never leaves items unprocessed
        Ok(Vec::new())
    }
}

#[async_trait]
impl LatestTable for FjallWsStore {
    async fn put(&self, latest: Latest) -> Result<(), StorageError> {
        self.latest
            .insert(
                latest.topic.as_bytes(),
                serde_json::to_vec(&latest)
                    .context("encoding latest payload")
                    .map_err(StorageError)?,
            )
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn get(&self, topic: &str) -> Result<Option<Latest>, StorageError> {
        let Some(bytes) = self.latest.get(topic).map_err(anyhow::Error::from)? else {
            return Ok(None);
        };
        Ok(Some(
            serde_json::from_slice(&bytes)
                .context("decoding latest payload")
                .map_err(StorageError)?,
        ))
    }
}
