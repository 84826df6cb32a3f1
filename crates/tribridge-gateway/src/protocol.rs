//! Gateway wire frames
//!
//! Three frame shapes share the socket. Events carry an `eventType`
//! marker, responses carry a `status`, commands are outbound only.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tribridge_core::RelayError;

/// Unsolicited event: `{eventType, chatType, groupId, messageId, sender, time, messageParts}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub event_type: String,
    #[serde(default)]
    pub chat_type: String,
    #[serde(default)]
    pub group_id: i64,
    pub message_id: i64,
    pub sender: EventSender,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub message_parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSender {
    pub user_id: i64,
    #[serde(default)]
    pub nickname: String,
}

/// One typed segment of a rich-text message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Outbound command: `{action, correlationToken, params}`. A command sent
/// without a token expects no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFrame {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<String>,
    #[serde(default)]
    pub params: Value,
}

/// Command response: `{status, data, correlationToken}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub status: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub correlation_token: Option<String>,
}

/// A parsed inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Event(EventFrame),
    Response(ResponseFrame),
}

/// Classify and parse one inbound frame. The `status` field marks a
/// response, `eventType` marks an event; anything else is malformed.
pub fn parse_frame(raw: &str) -> Result<Frame, RelayError> {
    let value: Value = serde_json::from_str(raw)?;
    if value.get("status").is_some() {
        let resp: ResponseFrame = serde_json::from_value(value)?;
        return Ok(Frame::Response(resp));
    }
    if value.get("eventType").is_some() {
        let event: EventFrame = serde_json::from_value(value)?;
        return Ok(Frame::Event(event));
    }
    Err(RelayError::Protocol(format!(
        "frame is neither event nor response: {}",
        raw.chars().take(120).collect::<String>()
    )))
}
