//! Frame codec.
//!
//! Control frames carry a `type` field; data frames carry `identifier` and a
//! `message` object with `event` and `data`:
//!
//! ```json
//! {"type":"welcome"}
//! {"type":"ping","message":1718000000}
//! {"type":"confirm_subscription","identifier":"{...}"}
//! {"identifier":"{...}","message":{"event":"message.created","data":{...}}}
//! ```

use cablewatch_core::{ChannelIdentity, DecodeError};
use serde::Deserialize;
use serde_json::{Value, json};

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Connection accepted by the gateway.
    Welcome,
    /// Keep-alive.
    Ping {
        /// Server timestamp, when present.
        at: Option<i64>,
    },
    /// The gateway is closing the connection.
    Disconnect {
        /// Server-supplied reason (e.g. `unauthorized`).
        reason: Option<String>,
        /// Whether the server invites a reconnect.
        reconnect: bool,
    },
    /// Subscription accepted.
    SubscriptionConfirmed {
        /// Identifier of the confirmed subscription.
        identifier: String,
    },
    /// Subscription refused.
    SubscriptionRejected {
        /// Identifier of the refused subscription.
        identifier: String,
    },
    /// Event delivered on a subscription.
    Data(DataFrame),
}

/// Event delivered on a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct DataFrame {
    /// Subscription identifier the event was published on.
    pub identifier: String,
    /// Event name (e.g. `message.created`).
    pub event_name: String,
    /// Conversation the event refers to, when it names one.
    pub conversation_id: Option<u64>,
    /// Message id for `message.*` events.
    pub message_id: Option<u64>,
    /// The event's `data` object as received.
    pub payload: Value,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    identifier: Option<String>,
    message: Option<Value>,
    reason: Option<String>,
    reconnect: Option<bool>,
}

/// Decode one raw frame.
pub fn decode(raw: &[u8]) -> Result<InboundFrame, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(raw)?;

    match envelope.kind.as_deref() {
        Some("welcome") => Ok(InboundFrame::Welcome),
        Some("ping") => Ok(InboundFrame::Ping {
            at: envelope.message.as_ref().and_then(Value::as_i64),
        }),
        Some("disconnect") => Ok(InboundFrame::Disconnect {
            reason: envelope.reason,
            reconnect: envelope.reconnect.unwrap_or(false),
        }),
        Some(kind @ "confirm_subscription") => Ok(InboundFrame::SubscriptionConfirmed {
            identifier: require_identifier(kind, envelope.identifier)?,
        }),
        Some(kind @ "reject_subscription") => Ok(InboundFrame::SubscriptionRejected {
            identifier: require_identifier(kind, envelope.identifier)?,
        }),
        Some(other) => Err(DecodeError::UnknownType {
            kind: other.to_string(),
        }),
        None => decode_data(envelope.identifier, envelope.message),
    }
}

fn require_identifier(kind: &str, identifier: Option<String>) -> Result<String, DecodeError> {
    identifier.ok_or_else(|| DecodeError::MalformedControl {
        kind: kind.to_string(),
        field: "identifier",
    })
}

fn decode_data(identifier: Option<String>, message: Option<Value>) -> Result<InboundFrame, DecodeError> {
    let (Some(identifier), Some(message)) = (identifier, message) else {
        return Err(DecodeError::UnrecognizedShape(
            "expected type, or identifier and message".into(),
        ));
    };
    let Value::Object(mut message) = message else {
        return Err(DecodeError::UnrecognizedShape("message is not an object".into()));
    };
    let Some(Value::String(event_name)) = message.remove("event") else {
        return Err(DecodeError::UnrecognizedShape("message has no event name".into()));
    };
    let payload = message.remove("data").unwrap_or(Value::Null);

    Ok(InboundFrame::Data(DataFrame {
        conversation_id: conversation_id_of(&event_name, &payload),
        message_id: message_id_of(&event_name, &payload),
        identifier,
        event_name,
        payload,
    }))
}

/// Conversation id referenced by an event payload.
///
/// Looks at `conversation_id`, then `conversation.id`, then `id` for events
/// whose payload is the conversation itself.
pub fn conversation_id_of(event_name: &str, payload: &Value) -> Option<u64> {
    payload
        .get("conversation_id")
        .and_then(as_id)
        .or_else(|| payload.get("conversation").and_then(|c| c.get("id")).and_then(as_id))
        .or_else(|| {
            let is_conversation_payload = event_name.starts_with("conversation.")
                || event_name.starts_with("assignee.")
                || event_name.starts_with("team.");
            if is_conversation_payload {
                payload.get("id").and_then(as_id)
            } else {
                None
            }
        })
}

/// Message id carried by `message.*` events.
pub fn message_id_of(event_name: &str, payload: &Value) -> Option<u64> {
    if event_name.starts_with("message.") {
        payload.get("id").and_then(as_id)
    } else {
        None
    }
}

/// Read an id that may be encoded as a number or a numeric string.
pub fn as_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Encode the subscribe command for `identity`.
pub fn encode_subscribe(identity: &ChannelIdentity) -> String {
    json!({
        "command": "subscribe",
        "identifier": identity.identifier(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn identity() -> ChannelIdentity {
        ChannelIdentity::new("tok", 1, 2)
    }

    #[test]
    fn decodes_welcome() {
        assert_eq!(decode(br#"{"type":"welcome"}"#).unwrap(), InboundFrame::Welcome);
    }

    #[test]
    fn decodes_ping_with_timestamp() {
        let frame = decode(br#"{"type":"ping","message":1718000000}"#).unwrap();
        assert_eq!(frame, InboundFrame::Ping { at: Some(1_718_000_000) });
    }

    #[test]
    fn decodes_disconnect() {
        let frame =
            decode(br#"{"type":"disconnect","reason":"unauthorized","reconnect":false}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Disconnect {
                reason: Some("unauthorized".into()),
                reconnect: false
            }
        );
    }

    #[test]
    fn decodes_confirm_and_reject() {
        let id = identity().identifier();
        let confirm = json!({"type": "confirm_subscription", "identifier": id}).to_string();
        assert_eq!(
            decode(confirm.as_bytes()).unwrap(),
            InboundFrame::SubscriptionConfirmed { identifier: id.clone() }
        );
        let reject = json!({"type": "reject_subscription", "identifier": id}).to_string();
        assert_eq!(
            decode(reject.as_bytes()).unwrap(),
            InboundFrame::SubscriptionRejected { identifier: id }
        );
    }

    #[test]
    fn confirm_without_identifier_is_malformed_control() {
        let err = decode(br#"{"type":"confirm_subscription"}"#).unwrap_err();
        assert!(err.is_handshake_frame());
    }

    #[test]
    fn decodes_message_created() {
        let raw = json!({
            "identifier": identity().identifier(),
            "message": {
                "event": "message.created",
                "data": {"id": 55, "conversation_id": 100, "content": "hi", "message_type": 0}
            }
        })
        .to_string();
        let frame = decode(raw.as_bytes()).unwrap();
        assert_matches!(frame, InboundFrame::Data(ref d) => {
            assert_eq!(d.event_name, "message.created");
            assert_eq!(d.conversation_id, Some(100));
            assert_eq!(d.message_id, Some(55));
            assert_eq!(d.payload["content"], "hi");
        });
    }

    #[test]
    fn conversation_event_uses_payload_id() {
        let raw = json!({
            "identifier": "x",
            "message": {"event": "conversation.status_changed", "data": {"id": 100, "status": "open"}}
        })
        .to_string();
        let InboundFrame::Data(d) = decode(raw.as_bytes()).unwrap() else {
            panic!("expected data frame");
        };
        assert_eq!(d.conversation_id, Some(100));
        assert_eq!(d.message_id, None);
    }

    #[test]
    fn nested_conversation_object() {
        let payload = json!({"conversation": {"id": "77"}});
        assert_eq!(conversation_id_of("typing.on", &payload), Some(77));
    }

    #[test]
    fn unrelated_event_id_is_not_a_conversation() {
        let payload = json!({"id": 9});
        assert_eq!(conversation_id_of("contact.updated", &payload), None);
    }

    #[test]
    fn missing_data_becomes_null() {
        let raw = br#"{"identifier":"x","message":{"event":"presence.update"}}"#;
        let InboundFrame::Data(d) = decode(raw).unwrap() else {
            panic!("expected data frame");
        };
        assert!(d.payload.is_null());
        assert_eq!(d.conversation_id, None);
    }

    #[test]
    fn rejects_garbage() {
        assert_matches!(decode(b"not json"), Err(DecodeError::Json(_)));
        assert_matches!(decode(b"[1,2]"), Err(DecodeError::Json(_)));
        assert_matches!(decode(br#"{"type":"mystery"}"#), Err(DecodeError::UnknownType { .. }));
        assert_matches!(decode(br#"{"identifier":"x"}"#), Err(DecodeError::UnrecognizedShape(_)));
        assert_matches!(
            decode(br#"{"identifier":"x","message":"hello"}"#),
            Err(DecodeError::UnrecognizedShape(_))
        );
        assert_matches!(
            decode(br#"{"identifier":"x","message":{"data":{}}}"#),
            Err(DecodeError::UnrecognizedShape(_))
        );
    }

    #[test]
    fn as_id_accepts_numbers_and_numeric_strings() {
        assert_eq!(as_id(&json!(5)), Some(5));
        assert_eq!(as_id(&json!("12")), Some(12));
        assert_eq!(as_id(&json!(-1)), None);
        assert_eq!(as_id(&json!("abc")), None);
        assert_eq!(as_id(&json!(null)), None);
    }

    #[test]
    fn subscribe_command_carries_identifier_string() {
        let cmd: Value = serde_json::from_str(&encode_subscribe(&identity())).unwrap();
        assert_eq!(cmd["command"], "subscribe");
        let ident = cmd["identifier"].as_str().unwrap();
        assert!(identity().matches(ident));
    }
}
