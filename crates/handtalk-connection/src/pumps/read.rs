//! WebSocket read pump: the receive loop.

use chrono::Utc;
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use handtalk_protocol::constants::LOG_PREVIEW_CHARS;
use handtalk_protocol::{InboundEnvelope, decode};

use crate::events::EventBus;
use crate::types::ConnectionEvent;

/// Why the receive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// The backend sent a close frame.
    Closed,
    /// The generation was cancelled locally.
    Cancelled,
    /// The transport broke without a close handshake.
    Failed(String),
}

/// Drains inbound messages until close, cancellation or a transport error.
///
/// Continuation frames are reassembled by the protocol layer, so every
/// `Text` item is a complete message. Cancellation is checked around each
/// receive and always wins over a failure seen at the same time.
pub(crate) async fn read_pump<S>(mut read: S, bus: &EventBus, cancel: CancellationToken) -> ReadOutcome
where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        if cancel.is_cancelled() {
            return ReadOutcome::Cancelled;
        }

        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReadOutcome::Cancelled,
            msg = read.next() => msg,
        };

        if cancel.is_cancelled() {
            return ReadOutcome::Cancelled;
        }

        match msg {
            Some(Ok(tungstenite::Message::Text(text))) => dispatch_text(&text, bus),
            Some(Ok(tungstenite::Message::Binary(data))) => {
                trace!(len = data.len(), "ignoring binary message");
            }
            Some(Ok(tungstenite::Message::Ping(_))) => trace!("received ping"),
            Some(Ok(tungstenite::Message::Pong(_))) => trace!("received pong"),
            Some(Ok(tungstenite::Message::Close(frame))) => {
                debug!(?frame, "received close frame");
                return ReadOutcome::Closed;
            }
            Some(Ok(tungstenite::Message::Frame(_))) => {}
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket read error");
                return ReadOutcome::Failed(e.to_string());
            }
            None => {
                debug!("WebSocket stream ended without close frame");
                return ReadOutcome::Failed("stream ended".into());
            }
        }
    }
}

/// Decodes one complete text message and publishes it if recognized.
///
/// Shared by the receive loop and the manager's injection hook. Bad input
/// is logged and dropped, never propagated.
pub(crate) fn dispatch_text(text: &str, bus: &EventBus) {
    match decode(text, Utc::now()) {
        Ok(envelope) if envelope.is_dispatchable() => {
            trace!(msg_type = %envelope.kind(), "dispatching inbound message");
            bus.publish(ConnectionEvent::MessageReceived(envelope));
        }
        Ok(InboundEnvelope::Heartbeat { .. }) => trace!("received heartbeat"),
        Ok(InboundEnvelope::Unrecognized { msg_type }) => {
            debug!(%msg_type, "dropping unrecognized message");
        }
        Ok(envelope) => trace!(msg_type = %envelope.kind(), "dropping message"),
        Err(e) => {
            warn!(error = %e, preview = %preview(text), "failed to decode inbound message");
        }
    }
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(LOG_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
