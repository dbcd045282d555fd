//! Settings type definitions.
//!
//! camelCase JSON; missing fields take their default during deserialization.

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Accepted `debounceWindowMs` values.
pub const DEBOUNCE_WINDOW_MS: RangeInclusive<u64> = 1..=600_000;
/// Accepted `maxWaitMs` values.
pub const MAX_WAIT_MS: RangeInclusive<u64> = 1..=3_600_000;
/// Accepted `idleTimeoutMs` values (0 disables).
pub const IDLE_TIMEOUT_MS: RangeInclusive<u64> = 0..=3_600_000;
/// Accepted `handshakeTimeoutMs` values (0 disables).
pub const HANDSHAKE_TIMEOUT_MS: RangeInclusive<u64> = 0..=600_000;

/// How a pending debounce bucket reacts to further events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebouncePolicy {
    /// Deadline is fixed when the bucket is created.
    #[default]
    Fixed,
    /// Each append pushes the deadline out by one window, up to `maxWaitMs`
    /// after bucket creation.
    Sliding,
}

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "cableUrl": "wss://support.example.com/cable",
///   "debounceWindowMs": 1500,
///   "debouncePolicy": "sliding"
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CablewatchSettings {
    /// WebSocket endpoint of the gateway.
    pub cable_url: String,
    /// Channel class to subscribe to.
    pub channel_name: String,
    /// Event names that may produce records.
    pub allowed_events: Vec<String>,
    /// Coalescing window for `message.created`.
    pub debounce_window_ms: u64,
    /// Window policy for pending buckets.
    pub debounce_policy: DebouncePolicy,
    /// Upper bound on a sliding bucket's lifetime.
    pub max_wait_ms: u64,
    /// Flush pending buckets on shutdown instead of dropping them.
    pub flush_on_shutdown: bool,
    /// Attach the original payload(s) to every record.
    pub include_raw: bool,
    /// Only accept `message.created` from the remote party.
    pub incoming_only: bool,
    /// Fail the stream when no frame arrives for this long (0 disables).
    pub idle_timeout_ms: u64,
    /// Fail the stream when the handshake takes longer (0 disables).
    pub handshake_timeout_ms: u64,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl Default for CablewatchSettings {
    fn default() -> Self {
        Self {
            cable_url: "ws://127.0.0.1:3000/cable".to_string(),
            channel_name: "RoomChannel".to_string(),
            allowed_events: vec![
                "message.created".to_string(),
                "conversation.status_changed".to_string(),
            ],
            debounce_window_ms: 2000,
            debounce_policy: DebouncePolicy::Fixed,
            max_wait_ms: 10_000,
            flush_on_shutdown: false,
            include_raw: false,
            incoming_only: false,
            idle_timeout_ms: 60_000,
            handshake_timeout_ms: 15_000,
            log_level: "warn".to_string(),
            log_json: false,
        }
    }
}

impl CablewatchSettings {
    /// Debounce window as a [`Duration`].
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    /// Sliding-window cap as a [`Duration`].
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Idle timeout, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// Handshake timeout, `None` when disabled.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_ms > 0).then(|| Duration::from_millis(self.handshake_timeout_ms))
    }

    /// Check ranges and cross-field constraints.
    ///
    /// Ranges match the ones enforced on `CABLEWATCH_*` overrides, so a value
    /// from a file or a flag is held to the same bounds.
    pub fn validate(&self) -> Result<()> {
        if !(self.cable_url.starts_with("ws://") || self.cable_url.starts_with("wss://")) {
            return Err(SettingsError::invalid(
                "cableUrl",
                format!("must use ws:// or wss://, got {:?}", self.cable_url),
            ));
        }
        check_range("debounceWindowMs", self.debounce_window_ms, &DEBOUNCE_WINDOW_MS)?;
        check_range("maxWaitMs", self.max_wait_ms, &MAX_WAIT_MS)?;
        check_range("idleTimeoutMs", self.idle_timeout_ms, &IDLE_TIMEOUT_MS)?;
        check_range("handshakeTimeoutMs", self.handshake_timeout_ms, &HANDSHAKE_TIMEOUT_MS)?;
        if self.debounce_policy == DebouncePolicy::Sliding
            && self.max_wait_ms < self.debounce_window_ms
        {
            return Err(SettingsError::invalid(
                "maxWaitMs",
                format!(
                    "{} is below debounceWindowMs ({})",
                    self.max_wait_ms, self.debounce_window_ms
                ),
            ));
        }
        if self.allowed_events.iter().any(String::is_empty) {
            return Err(SettingsError::invalid("allowedEvents", "contains an empty name"));
        }
        Ok(())
    }
}

fn check_range(key: &'static str, value: u64, range: &RangeInclusive<u64>) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(SettingsError::invalid(
            key,
            format!("must be between {} and {}, got {value}", range.start(), range.end()),
        ))
    }
}
