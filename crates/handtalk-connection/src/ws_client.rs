//! WebSocket transport for one connection generation.
//!
//! Opens the socket with the configured headers and runs the receive loop,
//! write pump and heartbeat as sibling tasks bound to one cancellation token.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pumps::heartbeat::heartbeat_pump;
use crate::pumps::read::read_pump;
use crate::pumps::write::write_pump;
use crate::reconnection::{ManagerContext, handle_receive_exit};
use crate::types::{ConnectionConfig, ConnectionIdentity};

/// Depth of the outbound queue shared by sends and heartbeats.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Errors from the connection manager.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("connection attempt timed out")]
    Timeout,
}

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens the WebSocket for `identity`, sending the configured headers.
pub(crate) async fn open_transport(
    config: &ConnectionConfig,
    identity: &ConnectionIdentity,
) -> Result<WsStream, ConnectionError> {
    let url = config.endpoint(identity);
    let mut request = url.as_str().into_client_request()?;
    for (name, value) in &config.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ConnectionError::InvalidHeader(name.clone()))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| ConnectionError::InvalidHeader(format!("{name}: {value}")))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);
    ws_config.max_frame_size = Some(config.max_message_size);

    let (stream, _) = tokio::time::timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false),
    )
    .await
    .map_err(|_| ConnectionError::Timeout)??;
    Ok(stream)
}

/// Immutable context handed to every task of one generation.
#[derive(Clone)]
pub(crate) struct GenerationContext {
    /// Distinguishes this generation's write path from its successors'.
    pub(crate) id: u64,
    pub(crate) identity: ConnectionIdentity,
    /// Token of the session this generation belongs to; cancelled by an
    /// explicit connect or disconnect.
    pub(crate) session: CancellationToken,
    /// Child of `session`; cancelled when this generation is retired.
    pub(crate) cancel: CancellationToken,
}

/// A live connection generation.
pub(crate) struct WsClient {
    generation: GenerationContext,
    write_tx: mpsc::Sender<tungstenite::Message>,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
    heartbeat_handle: JoinHandle<()>,
}

impl WsClient {
    /// Starts the receive loop, write pump and heartbeat over `stream`.
    pub(crate) fn start<S>(
        stream: S,
        identity: ConnectionIdentity,
        session: &CancellationToken,
        ctx: Arc<ManagerContext>,
    ) -> Self
    where
        S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
            + Sink<tungstenite::Message, Error = tungstenite::Error>
            + Send
            + Unpin
            + 'static,
    {
        let (write, read) = stream.split();
        let generation = GenerationContext {
            id: ctx.next_generation_id(),
            identity,
            session: session.clone(),
            cancel: session.child_token(),
        };
        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(WRITE_QUEUE_DEPTH);

        let write_handle = tokio::spawn(write_pump(
            write,
            write_rx,
            generation.cancel.clone(),
            ctx.config.close_timeout,
        ));

        let heartbeat_handle = tokio::spawn(heartbeat_pump(
            write_tx.clone(),
            ctx.config.heartbeat_period,
            generation.cancel.clone(),
        ));

        let read_handle = {
            let generation = generation.clone();
            tokio::spawn(async move {
                let outcome = read_pump(read, &ctx.bus, generation.cancel.clone()).await;
                handle_receive_exit(&ctx, &generation, outcome);
            })
        };

        Self {
            generation,
            write_tx,
            read_handle,
            write_handle,
            heartbeat_handle,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.generation.id
    }

    /// Token cancelled when this generation is retired.
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.generation.cancel
    }

    /// Sender for the serialized write path.
    pub(crate) fn writer(&self) -> mpsc::Sender<tungstenite::Message> {
        self.write_tx.clone()
    }

    /// Stops all tasks of this generation without waiting for them.
    pub(crate) fn cancel(&self) {
        self.generation.cancel.cancel();
    }

    /// Cancels the generation and waits, bounded by `timeout`, for its tasks
    /// to finish. The write pump performs the close handshake on its way out.
    /// Tasks still running at the deadline are aborted.
    pub(crate) async fn shutdown(&mut self, timeout: Duration) {
        self.cancel();
        let deadline = tokio::time::Instant::now() + timeout;
        for (name, handle) in [
            ("write", &mut self.write_handle),
            ("heartbeat", &mut self.heartbeat_handle),
            ("read", &mut self.read_handle),
        ] {
            if tokio::time::timeout_at(deadline, &mut *handle).await.is_err() {
                warn!(task = name, "task did not stop in time, aborting");
                handle.abort();
            }
        }
        debug!(identity = %self.generation.identity, "connection generation stopped");
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.generation.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
        self.heartbeat_handle.abort();
    }
}
