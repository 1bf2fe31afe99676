//! Socket-event state machine: connect, disconnect, and the subscription
//! protocol over the default route.

use crate::protocol::{self, SubscribePayload, WsMessage};
use crate::push::ClientCache;
use crate::query;
use crate::stores::{
    Connection, ConnectionTable, LatestTable, Subscription, SubscriptionStore,
};
use anyhow::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_CONNECTION_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Resolves subscription fields to topics. The host application supplies
/// the only implementation; this is the fabric's sole schema knowledge.
pub trait TopicResolver: Send + Sync {
    fn validate_field(&self, field_name: &str) -> Result<()>;
    fn compute_topic(&self, field_name: &str, args: &Map<String, Value>) -> Result<String>;
}

/// One socket event as delivered by the gateway
#[derive(Debug, Clone)]
pub struct SocketEvent {
    /// `$connect`, `$disconnect` or `$default`
    pub route: String,
    pub connection_id: String,
    pub domain_name: String,
    pub stage: String,
    pub body: String,
}

impl SocketEvent {
    fn endpoint(&self) -> String {
        format!("https://{}/{}", self.domain_name, self.stage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketResponse {
    pub status: u16,
}

impl SocketResponse {
    fn ok() -> Self {
        Self { status: 200 }
    }

    fn bad_request() -> Self {
        Self { status: 400 }
    }

    fn internal_error() -> Self {
        Self { status: 500 }
    }
}

pub struct Handler {
    connections: Arc<dyn ConnectionTable>,
    subscriptions: SubscriptionStore,
    latest: Option<Arc<dyn LatestTable>>,
    topics: Arc<dyn TopicResolver>,
    clients: ClientCache,
    connection_ttl: Duration,
    cancel: CancellationToken,
}

impl Handler {
    pub fn new(
        connections: Arc<dyn ConnectionTable>,
        subscriptions: SubscriptionStore,
        topics: Arc<dyn TopicResolver>,
        clients: ClientCache,
    ) -> Self {
        Self {
            connections,
            subscriptions,
            latest: None,
            topics,
            clients,
            connection_ttl: DEFAULT_CONNECTION_TTL,
            cancel: CancellationToken::new(),
        }
    }

    /// Greet new subscribers with the topic's last published payload
    pub fn with_latest_cache(mut self, latest: Arc<dyn LatestTable>) -> Self {
        self.latest = Some(latest);
        self
    }

    pub fn with_connection_ttl(mut self, ttl: Duration) -> Self {
        self.connection_ttl = ttl;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Route one socket event
    pub async fn handle_event(&self, event: &SocketEvent) -> SocketResponse {
        match event.route.as_str() {
            "$connect" => self.handle_connect(event).await,
            "$disconnect" => self.handle_disconnect(event).await,
            "$default" => self.handle_message(event).await,
            other => {
                warn!(route = other, "unknown route");
                SocketResponse::bad_request()
            }
        }
    }

    async fn handle_connect(&self, event: &SocketEvent) -> SocketResponse {
        let now = unix_now();
        let connection = Connection {
            connection_id: event.connection_id.clone(),
            endpoint: event.endpoint(),
            connected_at: now,
            ttl: now + self.connection_ttl.as_secs() as i64,
        };

        if let Err(e) = self.connections.put(connection).await {
            warn!(connection_id = %event.connection_id, error = %e, "failed to store connection");
            return SocketResponse::internal_error();
        }
        info!(connection_id = %event.connection_id, "connection established");
        SocketResponse::ok()
    }

    async fn handle_disconnect(&self, event: &SocketEvent) -> SocketResponse {
        let connection_id = &event.connection_id;

        if let Err(e) = self
            .subscriptions
            .delete_by_connection(connection_id, &self.cancel)
            .await
        {
            warn!(connection_id = %connection_id, error = %e, "failed to delete subscriptions");
        }
        if let Err(e) = self.connections.delete(connection_id).await {
            warn!(connection_id = %connection_id, error = %e, "failed to delete connection");
        }

        info!(connection_id = %connection_id, "connection closed");
        SocketResponse::ok()
    }

    async fn handle_message(&self, event: &SocketEvent) -> SocketResponse {
        let message = match protocol::parse_message(&event.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection_id = %event.connection_id, error = %e, "invalid message");
                return SocketResponse::bad_request();
            }
        };

        match message.message_type.as_str() {
            protocol::MSG_CONNECTION_INIT => self.handle_connection_init(event).await,
            protocol::MSG_PING => {
                if let Err(e) = self.post(event, &protocol::pong_message()).await {
                    warn!(connection_id = %event.connection_id, error = %e, "failed to send pong");
                }
                SocketResponse::ok()
            }
            protocol::MSG_SUBSCRIBE => self.handle_subscribe(event, &message).await,
            protocol::MSG_COMPLETE => self.handle_complete(event, &message).await,
            other => {
                warn!(message_type = other, "unhandled message type");
                SocketResponse::ok()
            }
        }
    }

    async fn handle_connection_init(&self, event: &SocketEvent) -> SocketResponse {
        if let Err(e) = self.post(event, &protocol::ack_message()).await {
            warn!(connection_id = %event.connection_id, error = %e, "failed to send connection_ack");
            return SocketResponse::internal_error();
        }
        debug!(connection_id = %event.connection_id, "connection_ack sent");
        SocketResponse::ok()
    }

    async fn handle_subscribe(&self, event: &SocketEvent, message: &WsMessage) -> SocketResponse {
        let client_sub_id = message.id.clone().unwrap_or_default();

        let payload: SubscribePayload = match message
            .payload
            .clone()
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(payload)) => payload,
            Ok(None) | Err(_) => {
                warn!(connection_id = %event.connection_id, "invalid subscribe payload");
                return self
                    .subscribe_error(event, &client_sub_id, "invalid subscribe payload")
                    .await;
            }
        };

        let (field_name, args) = match query::extract_subscription_field(&payload) {
            Ok(extracted) => extracted,
            Err(e) => {
                warn!(connection_id = %event.connection_id, error = %e, "failed to extract subscription field");
                return self.subscribe_error(event, &client_sub_id, &e.to_string()).await;
            }
        };

        if let Err(e) = self.topics.validate_field(&field_name) {
            warn!(field = %field_name, error = %e, "unknown subscription field");
            return self.subscribe_error(event, &client_sub_id, &e.to_string()).await;
        }

        let topic = match self.topics.compute_topic(&field_name, &args) {
            Ok(topic) => topic,
            Err(e) => {
                warn!(field = %field_name, error = %e, "failed to compute topic");
                return self.subscribe_error(event, &client_sub_id, &e.to_string()).await;
            }
        };

        let subscription = Subscription {
            subscription_id: Subscription::id_for(&event.connection_id, &client_sub_id),
            connection_id: event.connection_id.clone(),
            topic: topic.clone(),
            endpoint: event.endpoint(),
            client_sub_id: client_sub_id.clone(),
            ttl: unix_now() + self.connection_ttl.as_secs() as i64,
        };

        if let Err(e) = self.subscriptions.put(subscription).await {
            warn!(connection_id = %event.connection_id, error = %e, "failed to store subscription");
            let _ = self.subscribe_error(event, &client_sub_id, "internal error").await;
            return SocketResponse::internal_error();
        }

        info!(
            sub_id = %client_sub_id,
            field = %field_name,
            topic = %topic,
            "subscription created"
        );

        self.replay_latest(event, &client_sub_id, &topic).await;
        SocketResponse::ok()
    }

    /// Push the topic's cached last value, if any, as an immediate first
    /// `next` frame. Best-effort.
    async fn replay_latest(&self, event: &SocketEvent, client_sub_id: &str, topic: &str) {
        let Some(latest) = &self.latest else {
            return;
        };
        let cached = match latest.get(topic).await {
            Ok(Some(cached)) => cached,
            Ok(None) => return,
            Err(e) => {
                warn!(topic = %topic, error = %e, "failed to read latest payload");
                return;
            }
        };
        let payload: Value = match serde_json::from_str(&cached.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %topic, error = %e, "cached payload is not valid JSON");
                return;
            }
        };

        let frame = protocol::next_message(client_sub_id, payload, &cached.message_id);
        if let Err(e) = self.post(event, &frame).await {
            warn!(connection_id = %event.connection_id, error = %e, "failed to send initial payload");
        } else {
            debug!(topic = %topic, "sent cached payload to new subscriber");
        }
    }

    async fn handle_complete(&self, event: &SocketEvent, message: &WsMessage) -> SocketResponse {
        let client_sub_id = message.id.clone().unwrap_or_default();
        let subscription_id = Subscription::id_for(&event.connection_id, &client_sub_id);

        if let Err(e) = self.subscriptions.delete(&subscription_id).await {
            warn!(sub_id = %client_sub_id, error = %e, "failed to delete subscription");
        }
        info!(sub_id = %client_sub_id, "subscription completed");
        SocketResponse::ok()
    }

    async fn subscribe_error(
        &self,
        event: &SocketEvent,
        client_sub_id: &str,
        text: &str,
    ) -> SocketResponse {
        let frame = protocol::error_message(client_sub_id, text);
        if let Err(e) = self.post(event, &frame).await {
            warn!(connection_id = %event.connection_id, error = %e, "failed to send error");
        }
        SocketResponse::ok()
    }

    async fn post(&self, event: &SocketEvent, data: &[u8]) -> Result<()> {
        let client = self.clients.client(&event.endpoint());
        client
            .post_to_connection(&event.connection_id, data)
            .await?;
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
    use crate::stores::Latest;
    use crate::stores::SubscriptionTable;
    use crate::testing::{RecordingFactory, RecordingPush};
    use anyhow::bail;
    use serde_json::json;

    struct PoolTopics;

    impl TopicResolver for PoolTopics {
        fn validate_field(&self, field_name: &str) -> Result<()> {
            if field_name == "poolUpdated" {
                Ok(())
            } else {
                bail!("unknown field {field_name}")
            }
        }

        fn compute_topic(&self, field_name: &str, args: &Map<String, Value>) -> Result<String> {
            let pool = args
                .get("poolId")
                .and_then(Value::as_str)
                .unwrap_or("all");
            Ok(format!("{field_name}:{pool}"))
        }
    }

    struct Fixture {
        store: Arc<MemoryWsStore>,
        push: Arc<RecordingPush>,
        handler: Handler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryWsStore::new());
        let push = Arc::new(RecordingPush::default());
        let handler = Handler::new(
            store.clone(),
            SubscriptionStore::new(store.clone()),
            Arc::new(PoolTopics),
            ClientCache::new(Arc::new(RecordingFactory::new(push.clone()))),
        )
        .with_latest_cache(store.clone());
        Fixture {
            store,
            push,
            handler,
        }
    }

    fn event(route: &str, connection_id: &str, body: &str) -> SocketEvent {
        SocketEvent {
            route: route.to_string(),
            connection_id: connection_id.to_string(),
            domain_name: "ws.example.com".to_string(),
            stage: "prod".to_string(),
            body: body.to_string(),
        }
    }

    fn subscribe_body(id: &str, query: &str) -> String {
        json!({"id": id, "type": "subscribe", "payload": {"query": query}}).to_string()
    }

    fn last_frame(push: &RecordingPush, connection_id: &str) -> WsMessage {
        let frames = push.sent_to(connection_id);
        let last = frames.last().expect("no frames sent");
        serde_json::from_slice(last).unwrap()
    }

    #[tokio::test]
    async fn connect_stores_a_connection_record() {
        let f = fixture();
        let response = f.handler.handle_event(&event("$connect", "c1", "")).await;
        assert_eq!(response, SocketResponse::ok());

        let connection = ConnectionTable::get(f.store.as_ref(), "c1").await.unwrap().unwrap();
        assert_eq!(connection.endpoint, "https://ws.example.com/prod");
        assert!(connection.ttl >= connection.connected_at + 7200);
    }

    #[tokio::test]
    async fn connection_init_is_acked() {
        let f = fixture();
        let body = json!({"type": "connection_init"}).to_string();
        let response = f.handler.handle_event(&event("$default", "c1", &body)).await;
        assert_eq!(response, SocketResponse::ok());
        assert_eq!(last_frame(&f.push, "c1").message_type, "connection_ack");
    }

    #[tokio::test]
    async fn ping_gets_a_pong() {
        let f = fixture();
        let body = json!({"type": "ping"}).to_string();
        f.handler.handle_event(&event("$default", "c1", &body)).await;
        assert_eq!(last_frame(&f.push, "c1").message_type, "pong");
    }

    #[tokio::test]
    async fn subscribe_registers_the_topic() {
        let f = fixture();
        let body = subscribe_body("s1", r#"subscription { poolUpdated(poolId: "p1") { tvl } }"#);
        let response = f.handler.handle_event(&event("$default", "c1", &body)).await;
        assert_eq!(response, SocketResponse::ok());

        let subs = f.store.query_by_topic("poolUpdated:p1").await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].subscription_id, "c1#s1");
        assert_eq!(subs[0].client_sub_id, "s1");
        // no cached value yet, so nothing was pushed
        assert!(f.push.sent_to("c1").is_empty());
    }

    #[tokio::test]
    async fn subscribe_replays_the_cached_latest_value() {
        let f = fixture();
        LatestTable::put(
            f.store.as_ref(),
            Latest {
                topic: "poolUpdated:p1".to_string(),
                payload: r#"{"tvl": 7}"#.to_string(),
                message_id: "m9".to_string(),
                ttl: 0,
            },
        )
        .await
        .unwrap();

        let body = subscribe_body("s1", r#"subscription { poolUpdated(poolId: "p1") { tvl } }"#);
        f.handler.handle_event(&event("$default", "c1", &body)).await;

        let frame = last_frame(&f.push, "c1");
        assert_eq!(frame.message_type, "next");
        assert_eq!(frame.id.as_deref(), Some("s1"));
        assert_eq!(
            frame.payload,
            Some(json!({"tvl": 7, "extensions": {"messageId": "m9"}}))
        );
    }

    #[tokio::test]
    async fn unknown_field_sends_an_error_frame() {
        let f = fixture();
        let body = subscribe_body("s1", r#"subscription { nope { tvl } }"#);
        let response = f.handler.handle_event(&event("$default", "c1", &body)).await;
        assert_eq!(response, SocketResponse::ok());

        let frame = last_frame(&f.push, "c1");
        assert_eq!(frame.message_type, "error");
        assert_eq!(frame.id.as_deref(), Some("s1"));
        let payload = frame.payload.unwrap();
        assert!(payload[0]["message"].as_str().unwrap().contains("unknown field"));

        assert!(f.store.query_by_connection("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_query_sends_an_error_frame() {
        let f = fixture();
        let body = subscribe_body("s1", "not a subscription");
        let response = f.handler.handle_event(&event("$default", "c1", &body)).await;
        assert_eq!(response, SocketResponse::ok());
        assert_eq!(last_frame(&f.push, "c1").message_type, "error");
    }

    #[tokio::test]
    async fn complete_removes_the_subscription() {
        let f = fixture();
        let body = subscribe_body("s1", r#"subscription { poolUpdated(poolId: "p1") { tvl } }"#);
        f.handler.handle_event(&event("$default", "c1", &body)).await;

        let body = json!({"id": "s1", "type": "complete"}).to_string();
        f.handler.handle_event(&event("$default", "c1", &body)).await;

        assert!(f.store.query_by_connection("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_clears_connection_and_subscriptions() {
        let f = fixture();
        f.handler.handle_event(&event("$connect", "c1", "")).await;
        for (id, pool) in [("s1", "p1"), ("s2", "p2")] {
            let body = subscribe_body(
                id,
                &format!(r#"subscription {{ poolUpdated(poolId: "{pool}") {{ tvl }} }}"#),
            );
            f.handler.handle_event(&event("$default", "c1", &body)).await;
        }

        let response = f.handler.handle_event(&event("$disconnect", "c1", "")).await;
        assert_eq!(response, SocketResponse::ok());
        assert!(f.store.query_by_connection("c1").await.unwrap().is_empty());
        assert_eq!(ConnectionTable::get(f.store.as_ref(), "c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_route_is_a_bad_request() {
        let f = fixture();
        let response = f.handler.handle_event(&event("$bogus", "c1", "")).await;
        assert_eq!(response, SocketResponse::bad_request());
    }

    #[tokio::test]
    async fn malformed_message_is_a_bad_request() {
        let f = fixture();
        let response = f.handler.handle_event(&event("$default", "c1", "{oops")).await;
        assert_eq!(response, SocketResponse::bad_request());
    }

    #[tokio::test]
    async fn unhandled_types_are_ignored() {
        let f = fixture();
        let body = json!({"type": "mystery"}).to_string();
        let response = f.handler.handle_event(&event("$default", "c1", &body)).await;
        assert_eq!(response, SocketResponse::ok());
        assert!(f.push.sent_to("c1").is_empty());
    }
}
