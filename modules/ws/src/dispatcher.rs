//! Fan-out of partitioned-log records to WebSocket subscribers.

use crate::protocol;
use crate::publisher::Envelope;
use crate::push::{ClientCache, PushError};
use crate::stores::{ConnectionTable, Subscription, SubscriptionStore};
use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_CONCURRENCY: usize = 50;

pub struct Dispatcher {
    connections: Arc<dyn ConnectionTable>,
    subscriptions: SubscriptionStore,
    clients: ClientCache,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        connections: Arc<dyn ConnectionTable>,
        subscriptions: SubscriptionStore,
        clients: ClientCache,
    ) -> Self {
        Self {
            connections,
            subscriptions,
            clients,
            concurrency: DEFAULT_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }

    /// Cap on concurrent pushes per record
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Process a whole batch of log records. A record's failure does not
    /// stop its siblings; the first error is returned at the end.
    pub async fn handle_batch(&self, records: &[impl AsRef<[u8]>]) -> Result<()> {
        let mut first_error = None;
        for record in records {
            if let Err(e) = self.process_record(record.as_ref()).await {
                error!(error = %e, "failed to process log record");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn process_record(&self, data: &[u8]) -> Result<()> {
        let envelope: Envelope =
            serde_json::from_slice(data).context("unmarshalling log record")?;

        if envelope.topic.is_empty() {
            warn!("log record has empty topic, skipping");
            return Ok(());
        }

        let subscribers = self
            .subscriptions
            .query_by_topic(&envelope.topic)
            .await
            .with_context(|| format!("querying subscriptions for topic {}", envelope.topic))?;
        if subscribers.is_empty() {
            return Ok(());
        }

        debug!(
            topic = %envelope.topic,
            subscribers = subscribers.len(),
            "dispatching event"
        );

        // bounded fan-out; a failed push never cancels its siblings
        let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        futures::stream::iter(subscribers)
            .for_each_concurrent(self.concurrency, |subscriber| {
                let payload = envelope.payload.clone();
                let message_id = envelope.message_id.clone();
                let topic = envelope.topic.clone();
                let first_error = &first_error;
                async move {
                    if let Err(e) = self
                        .send_to_subscriber(&subscriber, payload, &message_id)
                        .await
                    {
                        error!(
                            connection_id = %subscriber.connection_id,
                            topic = %topic,
                            error = %e,
                            "failed to send to subscriber"
                        );
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
            })
            .await;

        match first_error.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn send_to_subscriber(
        &self,
        subscriber: &Subscription,
        payload: Value,
        message_id: &str,
    ) -> Result<()> {
        let frame = protocol::next_message(&subscriber.client_sub_id, payload, message_id);
        let client = self.clients.client(&subscriber.endpoint);

        match client
            .post_to_connection(&subscriber.connection_id, &frame)
            .await
        {
            Ok(()) => Ok(()),
            Err(PushError::Gone) => {
                info!(connection_id = %subscriber.connection_id, "connection gone, cleaning up");
                self.reap_connection(&subscriber.connection_id).await;
                Ok(())
            }
            Err(e) => {
                Err(anyhow::Error::from(e)
                    .context(format!("posting to connection {}", subscriber.connection_id)))
            }
        }
    }

    /// Best-effort removal of a gone connection and all its subscriptions
    async fn reap_connection(&self, connection_id: &str) {
        if let Err(e) = self
            .subscriptions
            .delete_by_connection(connection_id, &self.cancel)
            .await
        {
            error!(connection_id = %connection_id, error = %e, "failed to delete subscriptions for gone connection");
        }
        if let Err(e) = self.connections.delete(connection_id).await {
            error!(connection_id = %connection_id, error = %e, "failed to delete gone connection");
        }
    }
}
