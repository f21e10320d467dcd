//! Application loop: keeps the backend connection open and reports what
//! arrives until Ctrl-C.

use handtalk_connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use handtalk_protocol::{InboundEnvelope, VideoMessage};

use crate::config::ClientConfig;

/// Runs the client until shutdown is requested.
pub async fn run(config: ClientConfig) -> anyhow::Result<()> {
    let manager = ConnectionManager::new(config.to_connection_config());
    let mut events = manager.subscribe();

    manager.connect(config.identity.as_str()).await;
    if manager.status() == ConnectionState::Failed {
        // Retries only follow a connection that was live; nothing will
        // happen until the next explicit connect.
        anyhow::bail!("could not connect to {}", manager.config().base_url);
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_event(event);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    manager.disconnect().await;
    events.unsubscribe();
    Ok(())
}

fn handle_event(event: ConnectionEvent) {
    match event {
        ConnectionEvent::StateChanged(ConnectionState::Failed) => {
            tracing::warn!("connection failed; a single reconnect follows only if it was live");
        }
        ConnectionEvent::StateChanged(state) => {
            tracing::info!(%state, "connection state");
        }
        ConnectionEvent::MessageReceived(InboundEnvelope::SignLanguageResult(result)) => {
            let message = VideoMessage::incoming(result);
            match message.image_bytes() {
                Ok(bytes) => tracing::info!(
                    id = %message.id,
                    timestamp = %message.timestamp,
                    bytes = bytes.len(),
                    "sign language result"
                ),
                Err(e) => tracing::warn!(id = %message.id, error = %e, "result image is not valid base64"),
            }
        }
        ConnectionEvent::MessageReceived(other) => {
            tracing::debug!(msg_type = %other.kind(), "ignoring message");
        }
    }
}
