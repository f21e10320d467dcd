//! Heartbeat pump: periodic keep-alive frames.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use handtalk_protocol::Envelope;

/// Sends a heartbeat immediately and then every `period` until the
/// connection generation is cancelled.
///
/// Write failures are only logged: the receive loop is the one place that
/// declares a transport dead.
pub(crate) async fn heartbeat_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if write_tx.is_closed() {
                    trace!("write path closed, skipping heartbeat");
                    continue;
                }
                let frame = match Envelope::heartbeat(Utc::now()).to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode heartbeat");
                        continue;
                    }
                };
                if let Err(e) = write_tx.send(tungstenite::Message::Text(frame.into())).await {
                    warn!(error = %e, "heartbeat write failed");
                }
            }
        }
    }

    debug!("heartbeat stopped");
}
