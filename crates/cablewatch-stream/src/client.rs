//! Stream lifecycle: connect, handshake, read loop, drain.
//!
//! One task owns the socket and reads frames. Accepted events are routed
//! through the [`DebounceEngine`]; records reach the sink through the single
//! writer task. Cancellation, a sink failure, a handshake or idle deadline,
//! or the end of the socket moves the loop into draining: the engine is shut
//! down (its timers are joined), the socket is closed best-effort and the
//! writer finishes. On cancellation the writer stops after the record in
//! flight and discards the rest of the queue, so `run` returns within one
//! sink write; shutdown batches from `flush_on_shutdown` are still written.
//! `run` returns exactly once, after all of that.

use std::ops::ControlFlow;
use std::time::Duration;

use cablewatch_core::metrics::{DECODE_ERRORS_TOTAL, FRAMES_DROPPED_TOTAL, FRAMES_RECEIVED_TOTAL};
use cablewatch_core::{ChannelIdentity, LastSeenCursor, Result, StreamError};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::classifier::{Classification, classify};
use crate::codec::decode;
use crate::config::StreamConfig;
use crate::debounce::DebounceEngine;
use crate::emitter::spawn_writer;
use crate::handshake::{Handshake, HandshakeStep};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the closing handshake during drain.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Subscription client for one channel identity.
#[derive(Clone, Debug)]
pub struct StreamClient {
    config: StreamConfig,
    identity: ChannelIdentity,
}

impl StreamClient {
    /// Create a client. Nothing is opened until [`run`](Self::run).
    pub fn new(config: StreamConfig, identity: ChannelIdentity) -> Self {
        Self { config, identity }
    }

    /// Stream configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Subscription identity.
    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    /// Connect, subscribe and stream records to `sink` until cancelled or
    /// the connection ends.
    ///
    /// Returns `Ok(())` on cancellation and on a peer close after the
    /// subscription was confirmed. `cursor` is advanced to the highest
    /// accepted message id.
    #[instrument(name = "cable_stream", skip_all, fields(url = %self.config.cable_url, conversation_id = self.config.filter.target_conversation_id))]
    pub async fn run<W>(&self, sink: W, cursor: &LastSeenCursor, cancel: CancellationToken) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let handshake_deadline = self.config.handshake_timeout.map(|t| Instant::now() + t);

        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("cancelled before connect");
                return Ok(());
            }
            () = sleep_until_opt(handshake_deadline) => {
                return Err(StreamError::Connect {
                    url: self.config.cable_url.clone(),
                    reason: "timed out".into(),
                });
            }
            result = connect_async(self.config.cable_url.as_str()) => result,
        };
        let (ws, _response) = connected.map_err(|e| StreamError::Connect {
            url: self.config.cable_url.clone(),
            reason: e.to_string(),
        })?;
        info!("connected");

        self.session(ws, sink, cursor, &cancel, handshake_deadline).await
    }

    async fn session<W>(
        &self,
        mut ws: WsStream,
        sink: W,
        cursor: &LastSeenCursor,
        cancel: &CancellationToken,
        handshake_deadline: Option<Instant>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (emitter, writer) = spawn_writer(sink);
        let mut engine = DebounceEngine::new(
            self.config.debounce.clone(),
            self.config.include_raw,
            emitter,
            cancel,
        );
        let mut handshake = Handshake::new(self.identity.clone());
        handshake.connected();
        let mut last_frame = Instant::now();

        let outcome = loop {
            let idle_deadline = self.config.idle_timeout.map(|t| last_frame + t);
            let pending_handshake = if handshake.is_subscribed() {
                None
            } else {
                handshake_deadline
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("cancelled, draining");
                    writer.drain();
                    break Ok(());
                }
                () = writer.failed() => {
                    // the writer reports the error from `finish`
                    break Ok(());
                }
                () = sleep_until_opt(pending_handshake) => {
                    let limit = self.config.handshake_timeout.unwrap_or_default();
                    break Err(handshake.fail(StreamError::Handshake(format!(
                        "subscription not confirmed within {}ms",
                        limit.as_millis()
                    ))));
                }
                () = sleep_until_opt(idle_deadline) => {
                    let idle_ms = self.config.idle_timeout.unwrap_or_default().as_millis() as u64;
                    break Err(handshake.fail(StreamError::Stale { idle_ms }));
                }
                next = ws.next() => match next {
                    None => break peer_closed(&handshake, None),
                    Some(Err(err)) => {
                        break Err(handshake.fail(StreamError::Transport(err.to_string())));
                    }
                    Some(Ok(message)) => {
                        let flow = self
                            .on_message(message, &mut ws, &mut handshake, &mut engine, cursor)
                            .await;
                        if let ControlFlow::Break(result) = flow {
                            break result;
                        }
                        // waiting on a slow sink is not idle time
                        last_frame = Instant::now();
                    }
                },
            }
        };

        engine.shutdown().await;
        if timeout(CLOSE_GRACE, ws.close(None)).await.is_err() {
            debug!("close handshake timed out");
        }
        let written = writer.finish().await;
        debug!(cursor = cursor.get(), ok = outcome.is_ok(), "stream finished");
        outcome.and(written)
    }

    async fn on_message(
        &self,
        message: Message,
        ws: &mut WsStream,
        handshake: &mut Handshake,
        engine: &mut DebounceEngine,
        cursor: &LastSeenCursor,
    ) -> ControlFlow<Result<()>> {
        let raw = match &message {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(bytes) => &bytes[..],
            Message::Close(frame) => {
                let reason = frame.as_ref().map(|f| f.reason.as_str().to_owned());
                return ControlFlow::Break(peer_closed(handshake, reason));
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                return ControlFlow::Continue(());
            }
        };
        counter!(FRAMES_RECEIVED_TOTAL).increment(1);

        let frame = match decode(raw) {
            Ok(frame) => frame,
            Err(err) if err.is_handshake_frame() && !handshake.is_subscribed() => {
                return ControlFlow::Break(Err(
                    handshake.fail(StreamError::Handshake(err.to_string()))
                ));
            }
            Err(err) => {
                counter!(DECODE_ERRORS_TOTAL).increment(1);
                debug!(error = %err, "skipping undecodable frame");
                return ControlFlow::Continue(());
            }
        };

        match handshake.on_frame(frame) {
            HandshakeStep::Subscribe(command) => {
                if let Err(err) = ws.send(Message::text(command)).await {
                    return ControlFlow::Break(Err(
                        handshake.fail(StreamError::Transport(err.to_string()))
                    ));
                }
            }
            HandshakeStep::Subscribed | HandshakeStep::Ignore => {}
            HandshakeStep::Closed { .. } => return ControlFlow::Break(Ok(())),
            HandshakeStep::Fail(err) => return ControlFlow::Break(Err(err)),
            HandshakeStep::Deliver(data) => {
                match classify(data, &self.identity, &self.config.filter) {
                    Classification::Accepted(event) => {
                        if let Some(id) = event.message_id {
                            let _ = cursor.advance(id);
                        }
                        engine.route(event).await;
                    }
                    Classification::Dropped(reason) => {
                        counter!(FRAMES_DROPPED_TOTAL, "reason" => reason.as_str()).increment(1);
                        trace!(reason = reason.as_str(), "dropped data frame");
                    }
                }
            }
        }
        ControlFlow::Continue(())
    }
}

fn peer_closed(handshake: &Handshake, reason: Option<String>) -> Result<()> {
    if handshake.is_subscribed() {
        info!(?reason, "connection closed by peer");
        Ok(())
    } else {
        warn!(state = ?handshake.state(), ?reason, "connection closed during handshake");
        Err(StreamError::Handshake(format!(
            "connection closed before subscription was confirmed{}",
            reason.map(|r| format!(": {r}")).unwrap_or_default()
        )))
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamFilter;
    use assert_matches::assert_matches;

    #[test]
    fn close_after_subscription_is_clean() {
        let identity = ChannelIdentity::new("tok", 1, 2);
        let mut hs = Handshake::new(identity.clone());
        hs.connected();
        let _ = hs.on_frame(crate::codec::InboundFrame::Welcome);
        assert_matches!(peer_closed(&hs, None), Err(StreamError::Handshake(_)));
        let _ = hs.on_frame(crate::codec::InboundFrame::SubscriptionConfirmed {
            identifier: identity.identifier(),
        });
        assert!(peer_closed(&hs, Some("bye".into())).is_ok());
    }

    #[tokio::test]
    async fn cancelled_before_connect_returns_ok() {
        let client = StreamClient::new(
            StreamConfig::new("ws://192.0.2.1:9/cable", StreamFilter::default()),
            ChannelIdentity::new("tok", 1, 2),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client.run(tokio::io::sink(), &LastSeenCursor::default(), cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_deadline_never_fires() {
        let fired = timeout(Duration::from_secs(3600), sleep_until_opt(None)).await;
        assert!(fired.is_err());
    }
}
