//! WebSocket write pump: the single serialized write path.

use std::time::Duration;

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Writes queued messages to the WebSocket until cancelled.
///
/// Application sends and heartbeats both go through `write_rx`, so frames
/// are never interleaved. On exit a close frame is sent and the sink is
/// closed, bounded by `close_timeout`.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
    close_timeout: Duration,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                match msg {
                    Some(m) => {
                        if let Err(e) = write.send(m).await {
                            warn!(error = %e, "WebSocket write error");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let close = async {
        write.send(tungstenite::Message::Close(None)).await?;
        write.close().await
    };
    match tokio::time::timeout(close_timeout, close).await {
        Ok(Ok(())) => debug!("close frame sent"),
        Ok(Err(e)) => debug!(error = %e, "close handshake incomplete"),
        Err(_) => warn!("close handshake timed out"),
    }
}
