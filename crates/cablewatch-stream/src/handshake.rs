//! Connection/subscription handshake.
//!
//! ```text
//! Connecting ─▶ AwaitingWelcome ─▶ Subscribing ─▶ Subscribed
//!                                      │
//!                                      ├─▶ Rejected
//!                 (any state) ─────────┴─▶ Failed
//! ```
//!
//! Data frames are only delivered once `Subscribed`; earlier ones are ignored.

use cablewatch_core::{ChannelIdentity, StreamError};
use tracing::{debug, info, warn};

use crate::codec::{DataFrame, InboundFrame, encode_subscribe};

/// Handshake progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// Socket not yet open.
    Connecting,
    /// Socket open, waiting for `welcome`.
    AwaitingWelcome,
    /// Subscribe sent, waiting for confirmation.
    Subscribing,
    /// Subscription confirmed; data frames flow.
    Subscribed,
    /// Subscription refused by the gateway.
    Rejected,
    /// Transport or protocol failure.
    Failed,
}

impl HandshakeState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Failed)
    }
}

/// What the read loop should do after a frame.
#[derive(Debug)]
pub enum HandshakeStep {
    /// Send this subscribe command on the socket.
    Subscribe(String),
    /// The subscription was just confirmed.
    Subscribed,
    /// Nothing to do.
    Ignore,
    /// Hand the data frame to the classifier.
    Deliver(DataFrame),
    /// The gateway ended an established session.
    Closed {
        /// Server-supplied reason.
        reason: Option<String>,
    },
    /// Terminal failure.
    Fail(StreamError),
}

/// Handshake state machine for one connection.
#[derive(Debug)]
pub struct Handshake {
    identity: ChannelIdentity,
    state: HandshakeState,
}

impl Handshake {
    /// Start in `Connecting`.
    pub fn new(identity: ChannelIdentity) -> Self {
        Self {
            identity,
            state: HandshakeState::Connecting,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether data frames are being delivered.
    pub fn is_subscribed(&self) -> bool {
        self.state == HandshakeState::Subscribed
    }

    /// The socket is open.
    pub fn connected(&mut self) {
        if self.state == HandshakeState::Connecting {
            self.state = HandshakeState::AwaitingWelcome;
        }
    }

    /// Record a transport or protocol failure and hand the error back.
    pub fn fail(&mut self, err: StreamError) -> StreamError {
        warn!(state = ?self.state, error = %err, "handshake failed");
        self.state = HandshakeState::Failed;
        err
    }

    /// Advance on one decoded frame.
    pub fn on_frame(&mut self, frame: InboundFrame) -> HandshakeStep {
        if self.state.is_terminal() {
            return HandshakeStep::Ignore;
        }

        match frame {
            InboundFrame::Welcome => {
                if self.state == HandshakeState::AwaitingWelcome {
                    info!(channel = %self.identity.channel_name, "welcome received, subscribing");
                    self.state = HandshakeState::Subscribing;
                    HandshakeStep::Subscribe(encode_subscribe(&self.identity))
                } else {
                    debug!(state = ?self.state, "ignoring repeated welcome");
                    HandshakeStep::Ignore
                }
            }
            InboundFrame::Ping { .. } => HandshakeStep::Ignore,
            InboundFrame::SubscriptionConfirmed { identifier } => {
                if self.state != HandshakeState::Subscribing {
                    debug!(state = ?self.state, "ignoring unexpected confirmation");
                    return HandshakeStep::Ignore;
                }
                if self.identity.matches(&identifier) {
                    info!("subscription confirmed");
                    self.state = HandshakeState::Subscribed;
                    HandshakeStep::Subscribed
                } else {
                    HandshakeStep::Fail(self.fail(StreamError::Handshake(format!(
                        "confirmation for unexpected identifier {identifier}"
                    ))))
                }
            }
            InboundFrame::SubscriptionRejected { identifier } => {
                if self.state == HandshakeState::Subscribing && self.identity.matches(&identifier) {
                    warn!("subscription rejected");
                    self.state = HandshakeState::Rejected;
                    HandshakeStep::Fail(StreamError::Rejected { identifier })
                } else {
                    debug!(state = ?self.state, "ignoring rejection for another subscription");
                    HandshakeStep::Ignore
                }
            }
            InboundFrame::Disconnect { reason, reconnect } => {
                if self.is_subscribed() {
                    info!(?reason, reconnect, "gateway closed the session");
                    HandshakeStep::Closed { reason }
                } else {
                    HandshakeStep::Fail(self.fail(StreamError::Handshake(format!(
                        "gateway disconnected during handshake: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    ))))
                }
            }
            InboundFrame::Data(data) => {
                if self.is_subscribed() {
                    HandshakeStep::Deliver(data)
                } else {
                    debug!(state = ?self.state, event = %data.event_name, "dropping data before subscription");
                    HandshakeStep::Ignore
                }
            }
        }
    }
}
