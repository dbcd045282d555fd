//! Error types for the subscription stream.
//!
//! - [`DecodeError`]: a single frame could not be decoded. Recovered locally
//!   by skipping the frame, except for malformed handshake frames while the
//!   handshake is still running.
//! - [`StreamError`]: a terminal failure surfaced to the caller. Cancellation
//!   is never an error.

use thiserror::Error;

/// Failure to decode one inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame is not valid JSON.
    #[error("invalid frame JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame carries a `type` this client does not know.
    #[error("unknown frame type '{kind}'")]
    UnknownType {
        /// The unrecognized `type` value.
        kind: String,
    },

    /// A known control frame is missing a required field.
    #[error("malformed {kind} frame: missing {field}")]
    MalformedControl {
        /// Control frame type (e.g. `confirm_subscription`).
        kind: String,
        /// The missing field.
        field: &'static str,
    },

    /// Frame matches none of the recognized shapes.
    #[error("unrecognized frame shape: {0}")]
    UnrecognizedShape(String),
}

impl DecodeError {
    /// Whether this error concerns a handshake control frame.
    pub fn is_handshake_frame(&self) -> bool {
        matches!(self, Self::MalformedControl { .. })
    }
}

/// Terminal failure of a subscription stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Could not open the WebSocket.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// Endpoint that was dialed.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// Read or write failure on an open socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connect/welcome/subscribe/confirm sequence failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The gateway refused the subscription.
    #[error("subscription rejected for {identifier}")]
    Rejected {
        /// Identifier echoed by the gateway.
        identifier: String,
    },

    /// No frame arrived within the idle timeout.
    #[error("connection stale: no frames for {idle_ms}ms")]
    Stale {
        /// Configured idle timeout.
        idle_ms: u64,
    },

    /// Writing to the consumer sink failed.
    #[error("sink write failed: {0}")]
    Sink(#[from] std::io::Error),
}

impl StreamError {
    /// Whether a caller-side retry loop may reasonably reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Transport(_) | Self::Stale { .. }
        )
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "CONNECT",
            Self::Transport(_) => "TRANSPORT",
            Self::Handshake(_) => "HANDSHAKE",
            Self::Rejected { .. } => "REJECTED",
            Self::Stale { .. } => "STALE",
            Self::Sink(_) => "SINK",
        }
    }
}

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;
