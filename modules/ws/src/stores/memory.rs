//! In-memory tables for tests and local development, with both secondary
//! indexes kept alongside the primary map.

use super::{
    Connection, ConnectionTable, Latest, LatestTable, StorageError, Subscription,
    SubscriptionTable,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    connections: HashMap<String, Connection>,
    subscriptions: BTreeMap<String, Subscription>,
    by_topic: HashMap<String, Vec<String>>,
    by_connection: HashMap<String, Vec<String>>,
    latest: HashMap<String, Latest>,
    /// Countdown of batch deletes to report as fully unprocessed
    deferred_batches: usize,
}

#[derive(Default)]
pub struct MemoryWsStore {
    state: Mutex<State>,
}

impl MemoryWsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` batch deletes return their input unprocessed
    pub fn defer_batch_deletes(&self, times: usize) {
        self.state.lock().unwrap().deferred_batches = times;
    }
}

fn unindex(index: &mut HashMap<String, Vec<String>>, key: &str, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.retain(|existing| existing != id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

fn remove_subscription(state: &mut State, subscription_id: &str) {
    if let Some(subscription) = state.subscriptions.remove(subscription_id) {
        let topic = subscription.topic.clone();
        let connection = subscription.connection_id.clone();
        unindex(&mut state.by_topic, &topic, subscription_id);
        unindex(&mut state.by_connection, &connection, subscription_id);
    }
}

#[async_trait]
impl ConnectionTable for MemoryWsStore {
    async fn put(&self, connection: Connection) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state
            .connections
            .insert(connection.connection_id.clone(), connection);
        Ok(())
    }

    async fn get(&self, connection_id: &str) -> Result<Option<Connection>, StorageError> {
        Ok(self.state.lock().unwrap().connections.get(connection_id).cloned())
    }

    async fn delete(&self, connection_id: &str) -> Result<(), StorageError> {
        self.state.lock().unwrap().connections.remove(connection_id);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionTable for MemoryWsStore {
    async fn put(&self, subscription: Subscription) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        let id = subscription.subscription_id.clone();
        // replace cleanly so the indexes never hold stale entries
        remove_subscription(&mut state, &id);
        state
            .by_topic
            .entry(subscription.topic.clone())
            .or_default()
            .push(id.clone());
        state
            .by_connection
            .entry(subscription.connection_id.clone())
            .or_default()
            .push(id.clone());
        state.subscriptions.insert(id, subscription);
        Ok(())
    }

    async fn delete(&self, subscription_id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        remove_subscription(&mut state, subscription_id);
        Ok(())
    }

    async fn query_by_topic(&self, topic: &str) -> Result<Vec<Subscription>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .by_topic
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(|id| state.subscriptions.get(id).cloned())
            .collect())
    }

    async fn query_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<Subscription>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .by_connection
            .get(connection_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.subscriptions.get(id).cloned())
            .collect())
    }

    async fn count_by_topic(&self, topic: &str) -> Result<u64, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state.by_topic.get(topic).map_or(0, |ids| ids.len() as u64))
    }

    async fn batch_delete(&self, subscription_ids: &[String]) -> Result<Vec<String>, StorageError> {
        let mut state = self.state.lock().unwrap();
        if state.deferred_batches > 0 {
            if state.deferred_batches != usize::MAX {
                state.deferred_batches -= 1;
            }
            return Ok(subscription_ids.to_vec());
        }
        for id in subscription_ids {
            remove_subscription(&mut state, id);
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl LatestTable for MemoryWsStore {
    async fn put(&self, latest: Latest) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.latest.insert(latest.topic.clone(), latest);
        Ok(())
    }

    async fn get(&self, topic: &str) -> Result<Option<Latest>, StorageError> {
        Ok(self.state.lock().unwrap().latest.get(topic).cloned())
    }
}
