//! Channel identity and identifier matching.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default channel name used by the gateway for per-user event streams.
pub const DEFAULT_CHANNEL: &str = "RoomChannel";

/// The subscription key for one pub/sub channel.
///
/// Produced by the auth collaborator and read-only afterwards. Its serialized
/// form is the `identifier` string sent with `subscribe` and echoed back on
/// every frame belonging to the subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentity {
    /// Channel class name on the gateway (e.g. `"RoomChannel"`).
    #[serde(rename = "channel")]
    pub channel_name: String,
    /// Per-user pub/sub token.
    pub pubsub_token: String,
    /// Account the user belongs to.
    pub account_id: u64,
    /// User the token was issued for.
    pub user_id: u64,
}

impl ChannelIdentity {
    /// Create an identity for the default channel.
    pub fn new(pubsub_token: impl Into<String>, account_id: u64, user_id: u64) -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL.to_string(),
            pubsub_token: pubsub_token.into(),
            account_id,
            user_id,
        }
    }

    /// Override the channel name.
    #[must_use]
    pub fn with_channel(mut self, channel_name: impl Into<String>) -> Self {
        self.channel_name = channel_name.into();
        self
    }

    /// Serialized identifier string.
    pub fn identifier(&self) -> String {
        // Plain strings and integers cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Whether an inbound identifier refers to this subscription.
    ///
    /// Comparison is structural: key order and whitespace are irrelevant.
    /// Identifiers that are not JSON are compared verbatim.
    pub fn matches(&self, identifier: &str) -> bool {
        let ours = self.identifier();
        match (
            serde_json::from_str::<Value>(&ours),
            serde_json::from_str::<Value>(identifier),
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => ours == identifier,
        }
    }
}
