//! Seam to the WebSocket management (push) API, with the per-endpoint
//! client cache shared by the handler and the dispatcher.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PushError {
    /// The addressed connection no longer exists (the push API's 410).
    /// Detected structurally so callers can reap the connection.
    #[error("connection gone")]
    Gone,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PushError {
    pub fn is_gone(&self) -> bool {
        matches!(self, PushError::Gone)
    }
}

/// Push API for one endpoint
#[async_trait]
pub trait PushApi: Send + Sync {
    async fn post_to_connection(&self, connection_id: &str, data: &[u8]) -> Result<(), PushError>;
}

/// Creates push clients; one per endpoint, cached by [`ClientCache`]
pub trait PushApiFactory: Send + Sync {
    fn create(&self, endpoint: &str) -> Arc<dyn PushApi>;
}

/// Lazily-populated map of push clients by endpoint. Entries are immutable
/// once inserted and shared by all concurrent senders.
pub struct ClientCache {
    factory: Arc<dyn PushApiFactory>,
    clients: RwLock<HashMap<String, Arc<dyn PushApi>>>,
}

impl ClientCache {
    pub fn new(factory: Arc<dyn PushApiFactory>) -> Self {
        Self {
            factory,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self, endpoint: &str) -> Arc<dyn PushApi> {
        if let Some(client) = self.clients.read().unwrap().get(endpoint) {
            return client.clone();
        }

        let mut clients = self.clients.write().unwrap();
        // double-check after taking the write lock
        if let Some(client) = clients.get(endpoint) {
            return client.clone();
        }
        let client = self.factory.create(endpoint);
        clients.insert(endpoint.to_string(), client.clone());
        client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingFactory, RecordingPush};
    use std::sync::atomic::Ordering;

    #[test]
    fn clients_are_created_once_per_endpoint() {
        let push = Arc::new(RecordingPush::default());
        let factory = Arc::new(RecordingFactory::new(push));
        let cache = ClientCache::new(factory.clone());

        cache.client("https://a");
        cache.client("https://a");
        cache.client("https://b");

        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn gone_is_structural() {
        let gone = PushError::Gone;
        assert!(gone.is_gone());
        let other = PushError::Other(anyhow::anyhow!("GoneException in a string"));
        assert!(!other.is_gone());
    }
}
