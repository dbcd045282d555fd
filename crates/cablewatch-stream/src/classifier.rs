//! Data frame classification.
//!
//! Pure and synchronous: a fixed frame, identity and filter always produce
//! the same result. Drop checks run in this order:
//!
//! 1. identifier does not match the subscription → `WrongIdentifier`
//! 2. conversation filter set and not matched → `WrongConversation`
//! 3. event not in the allowlist → `EventNotAllowed`
//! 4. `incoming_only` and a non-inbound `message.created` → `NotIncoming`

use cablewatch_core::ChannelIdentity;
use serde_json::Value;

use crate::codec::DataFrame;
use crate::config::StreamFilter;
use crate::normalize::Direction;

/// The only batchable event.
pub const MESSAGE_CREATED: &str = "message.created";

/// Whether events with this name are coalesced.
pub fn is_batchable(event_name: &str) -> bool {
    event_name == MESSAGE_CREATED
}

/// Why a data frame produced no record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Published on a different subscription.
    WrongIdentifier,
    /// Belongs to a conversation other than the filtered one.
    WrongConversation,
    /// Event name is not allowlisted.
    EventNotAllowed,
    /// Outbound message while `incoming_only` is set.
    NotIncoming,
}

impl DropReason {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WrongIdentifier => "wrong_identifier",
            Self::WrongConversation => "wrong_conversation",
            Self::EventNotAllowed => "event_not_allowed",
            Self::NotIncoming => "not_incoming",
        }
    }
}

/// An event that passed every filter.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifiedEvent {
    /// Event name.
    pub event_name: String,
    /// Conversation the event refers to.
    pub conversation_id: Option<u64>,
    /// Message id, for `message.*` events.
    pub message_id: Option<u64>,
    /// Payload as received.
    pub payload: Value,
}

/// Outcome of [`classify`].
#[derive(Clone, Debug, PartialEq)]
pub enum Classification {
    /// Route the event onwards.
    Accepted(ClassifiedEvent),
    /// Produce nothing.
    Dropped(DropReason),
}

impl Classification {
    /// Whether the frame was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Classify one data frame.
pub fn classify(frame: DataFrame, identity: &ChannelIdentity, filter: &StreamFilter) -> Classification {
    if !identity.matches(&frame.identifier) {
        return Classification::Dropped(DropReason::WrongIdentifier);
    }
    if filter.target_conversation_id != 0
        && frame.conversation_id != Some(filter.target_conversation_id)
    {
        return Classification::Dropped(DropReason::WrongConversation);
    }
    if !filter.allowed_events.contains(&frame.event_name) {
        return Classification::Dropped(DropReason::EventNotAllowed);
    }
    if filter.incoming_only
        && frame.event_name == MESSAGE_CREATED
        && Direction::of(&frame.payload) != Direction::Incoming
    {
        return Classification::Dropped(DropReason::NotIncoming);
    }

    Classification::Accepted(ClassifiedEvent {
        event_name: frame.event_name,
        conversation_id: frame.conversation_id,
        message_id: frame.message_id,
        payload: frame.payload,
    })
}
