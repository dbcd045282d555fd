//! Records written to the consumer sink.
//!
//! Every record is one self-contained JSON object on its own line:
//!
//! ```json
//! {"event":"message.batch","conversation_id":100,"items":[...],"raw_items":[...]}
//! {"event":"conversation.status_changed","conversation_id":100,"data":{...},"raw":{...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name of coalesced `message.created` records.
pub const BATCH_EVENT: &str = "message.batch";

/// A single emitted record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundEventRecord {
    /// Coalesced batch of messages for one conversation.
    Batch(BatchRecord),
    /// Immediate pass-through event.
    Event(EventRecord),
}

/// Immediate pass-through event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event name as received (e.g. `conversation.status_changed`).
    pub event: String,
    /// Conversation the event belongs to, when the payload names one.
    pub conversation_id: Option<u64>,
    /// Normalized payload.
    pub data: Value,
    /// Original payload, only when raw passthrough is requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

/// Coalesced batch of `message.created` payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Always [`BATCH_EVENT`].
    pub event: String,
    /// Conversation all items belong to.
    pub conversation_id: Option<u64>,
    /// Normalized payloads in arrival order.
    pub items: Vec<Value>,
    /// Original payloads parallel to `items`, only when raw passthrough is requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_items: Option<Vec<Value>>,
}

impl OutboundEventRecord {
    /// Build a pass-through record.
    pub fn event(
        event: impl Into<String>,
        conversation_id: Option<u64>,
        data: Value,
        raw: Option<Value>,
    ) -> Self {
        Self::Event(EventRecord {
            event: event.into(),
            conversation_id,
            data,
            raw,
        })
    }

    /// Build a batch record.
    pub fn batch(
        conversation_id: Option<u64>,
        items: Vec<Value>,
        raw_items: Option<Vec<Value>>,
    ) -> Self {
        Self::Batch(BatchRecord {
            event: BATCH_EVENT.to_string(),
            conversation_id,
            items,
            raw_items,
        })
    }

    /// Event name of the record.
    pub fn event_name(&self) -> &str {
        match self {
            Self::Batch(b) => &b.event,
            Self::Event(e) => &e.event,
        }
    }

    /// Conversation the record belongs to.
    pub fn conversation_id(&self) -> Option<u64> {
        match self {
            Self::Batch(b) => b.conversation_id,
            Self::Event(e) => e.conversation_id,
        }
    }

    /// Short label for metrics (`"batch"` or `"event"`).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Batch(_) => "batch",
            Self::Event(_) => "event",
        }
    }
}
