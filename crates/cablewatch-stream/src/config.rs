//! Runtime configuration for one subscription stream.

use std::collections::HashSet;
use std::time::Duration;

use cablewatch_settings::{CablewatchSettings, DebouncePolicy};

/// Which data frames may produce records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamFilter {
    /// Only accept events for this conversation (0 = any).
    pub target_conversation_id: u64,
    /// Event names that may produce records.
    pub allowed_events: HashSet<String>,
    /// Only accept `message.created` from the remote party.
    pub incoming_only: bool,
}

impl StreamFilter {
    /// Build a filter from an allowlist.
    pub fn new<I, S>(allowed_events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target_conversation_id: 0,
            allowed_events: allowed_events.into_iter().map(Into::into).collect(),
            incoming_only: false,
        }
    }

    /// Restrict to one conversation.
    #[must_use]
    pub fn for_conversation(mut self, conversation_id: u64) -> Self {
        self.target_conversation_id = conversation_id;
        self
    }

    /// Restrict `message.created` to inbound messages.
    #[must_use]
    pub fn incoming_only(mut self, incoming_only: bool) -> Self {
        self.incoming_only = incoming_only;
        self
    }
}

/// Coalescing behavior for batchable events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Window after bucket creation (or last append, when sliding).
    pub window: Duration,
    /// Fixed or sliding deadline.
    pub policy: DebouncePolicy,
    /// Cap on a sliding bucket's lifetime.
    pub max_wait: Duration,
    /// Flush pending buckets on shutdown instead of dropping them.
    pub flush_on_shutdown: bool,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(2),
            policy: DebouncePolicy::Fixed,
            max_wait: Duration::from_secs(10),
            flush_on_shutdown: false,
        }
    }
}

/// Everything a [`StreamClient`](crate::StreamClient) needs besides the identity.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// WebSocket endpoint.
    pub cable_url: String,
    /// Data frame filter.
    pub filter: StreamFilter,
    /// Coalescing behavior.
    pub debounce: DebounceConfig,
    /// Attach original payloads to records.
    pub include_raw: bool,
    /// Fail when no frame arrives for this long.
    pub idle_timeout: Option<Duration>,
    /// Fail when the subscription is not confirmed within this long.
    pub handshake_timeout: Option<Duration>,
}

impl StreamConfig {
    /// Configuration with defaults for everything but the endpoint and filter.
    pub fn new(cable_url: impl Into<String>, filter: StreamFilter) -> Self {
        Self {
            cable_url: cable_url.into(),
            filter,
            debounce: DebounceConfig::default(),
            include_raw: false,
            idle_timeout: None,
            handshake_timeout: None,
        }
    }

    /// Derive a configuration from loaded settings.
    pub fn from_settings(settings: &CablewatchSettings, target_conversation_id: u64) -> Self {
        Self {
            cable_url: settings.cable_url.clone(),
            filter: StreamFilter::new(settings.allowed_events.iter().cloned())
                .for_conversation(target_conversation_id)
                .incoming_only(settings.incoming_only),
            debounce: DebounceConfig {
                window: settings.debounce_window(),
                policy: settings.debounce_policy,
                max_wait: settings.max_wait(),
                flush_on_shutdown: settings.flush_on_shutdown,
            },
            include_raw: settings.include_raw,
            idle_timeout: settings.idle_timeout(),
            handshake_timeout: settings.handshake_timeout(),
        }
    }
}
