//! The subscription wire protocol (graphql-transport-ws message shapes)

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const MSG_CONNECTION_INIT: &str = "connection_init";
pub const MSG_CONNECTION_ACK: &str = "connection_ack";
pub const MSG_PING: &str = "ping";
pub const MSG_PONG: &str = "pong";
pub const MSG_SUBSCRIBE: &str = "subscribe";
pub const MSG_NEXT: &str = "next";
pub const MSG_ERROR: &str = "error";
pub const MSG_COMPLETE: &str = "complete";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

/// A protocol frame in either direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type", default)]
    pub message_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Payload of a `subscribe` message
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    #[serde(default)]
    pub query: String,

    #[serde(default)]
    pub variables: Option<serde_json::Map<String, Value>>,

    #[serde(default)]
    pub operation_name: Option<String>,
}

/// Decode a protocol message. Bad JSON or a missing type is malformed.
pub fn parse_message(body: &str) -> Result<WsMessage, ProtocolError> {
    let message: WsMessage = serde_json::from_str(body)
        .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
    if message.message_type.is_empty() {
        return Err(ProtocolError::MalformedMessage(
            "missing message type".to_string(),
        ));
    }
    Ok(message)
}

fn encode(message: &WsMessage) -> Vec<u8> {
    // WsMessage serialization cannot fail: string keys, Value payloads
    serde_json::to_vec(message).expect("protocol message is always serializable")
}

/// A `connection_ack` frame
pub fn ack_message() -> Vec<u8> {
    encode(&WsMessage {
        id: None,
        message_type: MSG_CONNECTION_ACK.to_string(),
        payload: None,
    })
}

/// A `pong` frame
pub fn pong_message() -> Vec<u8> {
    encode(&WsMessage {
        id: None,
        message_type: MSG_PONG.to_string(),
        payload: None,
    })
}

/// A `next` frame. A non-empty `message_id` rides along inside the payload
/// as `extensions.messageId` so clients can deduplicate redeliveries; it is
/// only attached when the payload is an object.
pub fn next_message(id: &str, payload: Value, message_id: &str) -> Vec<u8> {
    let mut payload = payload;
    if !message_id.is_empty() {
        if let Value::Object(map) = &mut payload {
            map.insert("extensions".to_string(), json!({ "messageId": message_id }));
        }
    }
    encode(&WsMessage {
        id: Some(id.to_string()),
        message_type: MSG_NEXT.to_string(),
        payload: Some(payload),
    })
}

/// An `error` frame; the payload is a one-element array of message objects,
/// per the subscription-protocol convention
pub fn error_message(id: &str, text: &str) -> Vec<u8> {
    encode(&WsMessage {
        id: Some(id.to_string()),
        message_type: MSG_ERROR.to_string(),
        payload: Some(json!([{ "message": text }])),
    })
}

/// A `complete` frame
pub fn complete_message(id: &str) -> Vec<u8> {
    encode(&WsMessage {
        id: Some(id.to_string()),
        message_type: MSG_COMPLETE.to_string(),
        payload: None,
    })
}
