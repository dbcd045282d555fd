//! Consumer-facing payload shapes.
//!
//! Message payloads are reduced to the fields a consumer acts on. Other
//! events pass through unchanged.

use serde_json::{Value, json};

use crate::codec::{as_id, conversation_id_of};

/// Who produced a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// From the remote party (contact).
    Incoming,
    /// From an agent or bot.
    Outgoing,
    /// System activity note.
    Activity,
    /// Template message.
    Template,
    /// Missing or unrecognized `message_type`.
    Unknown,
}

impl Direction {
    /// Read `message_type`, which may be numeric (`0`..`3`) or a name.
    pub fn of(payload: &Value) -> Self {
        match payload.get("message_type") {
            Some(Value::Number(n)) => match n.as_u64() {
                Some(0) => Self::Incoming,
                Some(1) => Self::Outgoing,
                Some(2) => Self::Activity,
                Some(3) => Self::Template,
                _ => Self::Unknown,
            },
            Some(Value::String(s)) => match s.as_str() {
                "incoming" => Self::Incoming,
                "outgoing" => Self::Outgoing,
                "activity" => Self::Activity,
                "template" => Self::Template,
                _ => Self::Unknown,
            },
            _ => Self::Unknown,
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
            Self::Activity => "activity",
            Self::Template => "template",
            Self::Unknown => "unknown",
        }
    }
}

/// Normalize an event payload for emission.
pub fn normalize(event_name: &str, payload: &Value) -> Value {
    if event_name.starts_with("message.") && payload.is_object() {
        normalize_message(event_name, payload)
    } else {
        payload.clone()
    }
}

fn normalize_message(event_name: &str, payload: &Value) -> Value {
    let sender = payload.get("sender").filter(|s| s.is_object()).map(|s| {
        json!({
            "id": s.get("id").and_then(as_id),
            "name": s.get("name").cloned().unwrap_or(Value::Null),
            "type": s
                .get("type")
                .or_else(|| payload.get("sender_type"))
                .cloned()
                .unwrap_or(Value::Null),
        })
    });
    let attachments = payload
        .get("attachments")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);

    json!({
        "id": payload.get("id").and_then(as_id),
        "conversation_id": conversation_id_of(event_name, payload),
        "content": payload.get("content").cloned().unwrap_or(Value::Null),
        "direction": Direction::of(payload).as_str(),
        "private": payload.get("private").and_then(Value::as_bool).unwrap_or(false),
        "sender": sender,
        "created_at": payload.get("created_at").cloned().unwrap_or(Value::Null),
        "attachments": attachments,
    })
}
