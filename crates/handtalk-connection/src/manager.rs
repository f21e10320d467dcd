//! Connection manager facade.
//!
//! Owns the lifecycle of the backend connection: connect, disconnect, send,
//! status snapshots and event subscriptions. Transport failures are recovered
//! in the background and surface only as status events.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_tungstenite::tungstenite;
use tracing::{debug, info};

use handtalk_protocol::Envelope;

use crate::events::Subscription;
use crate::pumps::read::dispatch_text;
use crate::reconnection::{ManagerContext, open_generation};
use crate::types::{ConnectionConfig, ConnectionIdentity, ConnectionState};
use crate::ws_client::ConnectionError;

/// Persistent connection to the signaling backend.
pub struct ConnectionManager {
    ctx: Arc<ManagerContext>,
}

impl ConnectionManager {
    /// Creates a manager in the `Disconnected` state.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            ctx: Arc::new(ManagerContext::new(config)),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.ctx.config
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionState {
        self.ctx.state()
    }

    /// Registers for status and message events published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.ctx.bus.subscribe()
    }

    /// Opens the connection for `identity`.
    ///
    /// An existing connection is closed first (publishing `Disconnected`) and
    /// any pending reconnection is abandoned. Returns once the attempt has
    /// settled; failure is reported only through the `Failed` status.
    pub async fn connect(&self, identity: impl Into<ConnectionIdentity>) {
        let identity = identity.into();

        // Abort an in-flight attempt before queueing for the lifecycle lock.
        self.ctx.cancel_session();
        let mut slot = self.ctx.lifecycle.lock().await;
        let session = self.ctx.begin_session();

        if let Some(mut old) = slot.take() {
            self.ctx.clear_writer();
            if self.ctx.state() == ConnectionState::Connected {
                self.ctx.force_transition(ConnectionState::Disconnected);
            }
            old.shutdown(self.ctx.config.close_timeout).await;
        }

        open_generation(&self.ctx, &mut slot, identity, &session).await;
    }

    /// Closes the connection and cancels any pending reconnection.
    ///
    /// Idempotent: calling it while `Disconnected` publishes nothing.
    pub async fn disconnect(&self) {
        self.ctx.cancel_session();
        let mut slot = self.ctx.lifecycle.lock().await;
        // A reconnect may have started a generation while we waited.
        self.ctx.cancel_session();
        self.ctx.clear_writer();
        let client = slot.take();

        if self.ctx.state() != ConnectionState::Disconnected {
            info!("disconnecting");
        }
        self.ctx.force_transition(ConnectionState::Disconnected);

        if let Some(mut client) = client {
            client.shutdown(self.ctx.config.close_timeout).await;
        }
    }

    /// Sends `{"type": msg_type, "data": data, "timestamp": now}` to the backend.
    ///
    /// Fails with [`ConnectionError::NotConnected`] unless the state is
    /// `Connected`. Frames share the write path with heartbeats.
    pub async fn send<T: Serialize>(
        &self,
        msg_type: &str,
        data: Option<&T>,
    ) -> Result<(), ConnectionError> {
        if self.ctx.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        let writer = self.ctx.writer().ok_or(ConnectionError::NotConnected)?;

        let json = Envelope::new(msg_type, data, Utc::now())?.to_json()?;
        writer
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| ConnectionError::Closed)?;
        debug!(%msg_type, "message queued");
        Ok(())
    }

    /// Feeds a raw JSON message through the same decode and dispatch path
    /// as a frame received from the backend.
    pub fn inject_inbound_message(&self, raw_json: &str) {
        dispatch_text(raw_json, &self.ctx.bus);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.ctx.cancel_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures_util::StreamExt;
    use handtalk_protocol::InboundEnvelope;
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http::HeaderMap;

    use crate::types::ConnectionEvent;

    use crate::types::ConnectionState::*;

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(300);

    /// One accepted backend-side connection.
    struct ServerConn {
        path: String,
        headers: HeaderMap,
        ws: WebSocketStream<TcpStream>,
    }

    /// Local WebSocket backend accepting any number of connections.
    struct MockServer {
        base_url: String,
        conns: mpsc::UnboundedReceiver<ServerConn>,
        task: JoinHandle<()>,
    }

    impl MockServer {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("ws://{}/", listener.local_addr().unwrap());
            let (tx, conns) = mpsc::unbounded_channel();

            let task = tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let mut seen = None;
                    let callback =
                        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            seen = Some((req.uri().path().to_string(), req.headers().clone()));
                            Ok(resp)
                        };
                    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                    else {
                        continue;
                    };
                    let Some((path, headers)) = seen else {
                        continue;
                    };
                    if tx.send(ServerConn { path, headers, ws }).is_err() {
                        break;
                    }
                }
            });

            Self {
                base_url,
                conns,
                task,
            }
        }

        async fn next_conn(&mut self) -> ServerConn {
            tokio::time::timeout(WAIT, self.conns.recv())
                .await
                .expect("timed out waiting for a connection")
                .expect("server stopped")
        }

        /// Stops listening; later connection attempts are refused.
        async fn stop(&mut self) {
            self.task.abort();
            let _ = (&mut self.task).await;
        }
    }

    fn test_config(base_url: &str) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(base_url);
        config.reconnect_delay = Duration::from_millis(50);
        config.connect_timeout = Duration::from_secs(2);
        config.close_timeout = Duration::from_secs(1);
        config
    }

    async fn refused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}/")
    }

    async fn next_event(sub: &mut Subscription) -> ConnectionEvent {
        tokio::time::timeout(WAIT, sub.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("subscription closed")
    }

    async fn expect_states(sub: &mut Subscription, states: &[ConnectionState]) {
        for state in states {
            assert_eq!(next_event(sub).await, ConnectionEvent::StateChanged(*state));
        }
    }

    async fn assert_quiet(sub: &mut Subscription) {
        tokio::time::sleep(QUIET).await;
        assert_eq!(sub.try_recv(), None);
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
        match tokio::time::timeout(WAIT, ws.next()).await.expect("timed out") {
            Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Next frame that is not a heartbeat.
    async fn next_app_json(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
        loop {
            let value = next_json(ws).await;
            if value["type"] != "heartbeat" {
                return value;
            }
        }
    }

    /// Waits for the client's close frame, skipping heartbeats, then checks
    /// that no text frame follows. Returns the number of heartbeats skipped.
    async fn expect_close(ws: &mut WebSocketStream<TcpStream>) -> usize {
        let mut beats = 0;
        loop {
            match tokio::time::timeout(WAIT, ws.next()).await.expect("timed out") {
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Text(text))) if text.contains("\"heartbeat\"") => beats += 1,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
        let deadline = tokio::time::Instant::now() + QUIET;
        while let Ok(Some(Ok(msg))) = tokio::time::timeout_at(deadline, ws.next()).await {
            assert!(!msg.is_text(), "frame after close: {msg:?}");
        }
        beats
    }

    /// Reads from a backend-side connection for a while. A connection is live
    /// if it keeps delivering heartbeats and is never closed.
    async fn still_beating(ws: &mut WebSocketStream<TcpStream>) -> bool {
        let deadline = tokio::time::Instant::now() + QUIET;
        let mut beats = 0;
        loop {
            match tokio::time::timeout_at(deadline, ws.next()).await {
                Err(_) => return beats > 0,
                Ok(Some(Ok(Message::Text(_)))) => beats += 1,
                Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => return false,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Drains every connection the server accepted and counts the live ones,
    /// returning their paths.
    async fn live_paths(server: &mut MockServer) -> Vec<String> {
        let mut live = Vec::new();
        while let Ok(mut conn) = server.conns.try_recv() {
            if still_beating(&mut conn.ws).await {
                live.push(conn.path);
            }
        }
        live
    }

    fn fast_heartbeat(mut config: ConnectionConfig) -> ConnectionConfig {
        config.heartbeat_period = Duration::from_millis(50);
        config
    }

    #[tokio::test]
    async fn connect_inject_disconnect() {
        let mut server = MockServer::start().await;
        let manager = ConnectionManager::new(fast_heartbeat(test_config(&server.base_url)));
        let mut sub = manager.subscribe();
        assert_eq!(manager.status(), Disconnected);

        manager.connect("abc").await;
        expect_states(&mut sub, &[Connecting, Connected]).await;
        assert_eq!(manager.status(), Connected);

        let mut conn = server.next_conn().await;
        assert_eq!(conn.path, "/abc");
        assert_eq!(
            conn.headers.get("ngrok-skip-browser-warning").unwrap(),
            "true"
        );
        let beat = next_json(&mut conn.ws).await;
        assert_eq!(beat["type"], "heartbeat");
        assert!(beat["timestamp"].is_string());

        let before = Utc::now();
        manager.inject_inbound_message(r#"{"type":"sign_language_result","data":{"img":"Zm9v"}}"#);
        match next_event(&mut sub).await {
            ConnectionEvent::MessageReceived(InboundEnvelope::SignLanguageResult(r)) => {
                assert_eq!(r.image_base64, "Zm9v");
                assert!(r.timestamp >= before && r.timestamp <= Utc::now());
            }
            other => panic!("expected message event, got {other:?}"),
        }

        // Let a few periodic heartbeats go out before closing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.disconnect().await;
        expect_states(&mut sub, &[Disconnected]).await;
        let beats = expect_close(&mut conn.ws).await;
        assert!(beats >= 2, "only {beats} periodic heartbeats before close");
        assert_quiet(&mut sub).await;
    }

    #[tokio::test]
    async fn connect_refused_settles_failed() {
        let manager = ConnectionManager::new(test_config(&refused_url().await));
        let mut sub = manager.subscribe();

        manager.connect("abc").await;
        expect_states(&mut sub, &[Connecting, Failed]).await;
        assert_eq!(manager.status(), Failed);

        let result = manager.send("video_frame", Some(&json!({"frame": "x"}))).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
        assert_quiet(&mut sub).await;
    }

    #[tokio::test]
    async fn disconnect_when_disconnected_is_silent() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let mut sub = manager.subscribe();

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.status(), Disconnected);
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let result = manager.send("video_frame", Some(&json!({}))).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn send_reaches_backend() {
        let mut server = MockServer::start().await;
        let manager = ConnectionManager::new(test_config(&server.base_url));

        manager.connect("abc").await;
        let mut conn = server.next_conn().await;

        manager
            .send("video_frame", Some(&json!({"frame": "AAEC"})))
            .await
            .unwrap();

        let msg = next_app_json(&mut conn.ws).await;
        assert_eq!(msg["type"], "video_frame");
        assert_eq!(msg["data"]["frame"], "AAEC");
        assert!(msg["timestamp"].is_string());

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn backend_close_settles_disconnected() {
        let mut server = MockServer::start().await;
        let manager = ConnectionManager::new(test_config(&server.base_url));
        let mut sub = manager.subscribe();

        manager.connect("abc").await;
        expect_states(&mut sub, &[Connecting, Connected]).await;
        let mut conn = server.next_conn().await;

        conn.ws.close(None).await.unwrap();
        expect_states(&mut sub, &[Disconnected]).await;
        assert_quiet(&mut sub).await;

        let result = manager.send("video_frame", Some(&json!({}))).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn dropped_transport_reconnects_once() {
        let mut server = MockServer::start().await;
        let manager = ConnectionManager::new(test_config(&server.base_url));
        let mut sub = manager.subscribe();

        manager.connect("abc").await;
        expect_states(&mut sub, &[Connecting, Connected]).await;
        drop(server.next_conn().await);

        expect_states(&mut sub, &[Failed, Reconnecting, Connecting, Connected]).await;
        let conn = server.next_conn().await;
        assert_eq!(conn.path, "/abc");
        assert_eq!(manager.status(), Connected);

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn failed_reconnect_settles_failed() {
        let mut server = MockServer::start().await;
        let manager = ConnectionManager::new(test_config(&server.base_url));
        let mut sub = manager.subscribe();

        manager.connect("abc").await;
        expect_states(&mut sub, &[Connecting, Connected]).await;
        let conn = server.next_conn().await;

        server.stop().await;
        drop(conn);

        expect_states(&mut sub, &[Failed, Reconnecting, Connecting, Failed]).await;
        assert_quiet(&mut sub).await;
        assert_eq!(manager.status(), Failed);
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let mut server = MockServer::start().await;
        let mut config = test_config(&server.base_url);
        config.reconnect_delay = Duration::from_millis(500);
        let manager = ConnectionManager::new(config);
        let mut sub = manager.subscribe();

        manager.connect("abc").await;
        expect_states(&mut sub, &[Connecting, Connected]).await;
        drop(server.next_conn().await);
        expect_states(&mut sub, &[Failed, Reconnecting]).await;

        let result = manager.send("video_frame", Some(&json!({"frame": "x"}))).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));

        manager.disconnect().await;
        expect_states(&mut sub, &[Disconnected]).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sub.try_recv(), None);
        assert!(server.conns.try_recv().is_err(), "no reconnection attempt");
        assert_eq!(manager.status(), Disconnected);
    }

    #[tokio::test]
    async fn empty_identity_does_not_reconnect() {
        let mut server = MockServer::start().await;
        let manager = ConnectionManager::new(test_config(&server.base_url));
        let mut sub = manager.subscribe();

        manager.connect("").await;
        expect_states(&mut sub, &[Connecting, Connected]).await;
        let conn = server.next_conn().await;
        assert_eq!(conn.path, "/");

        drop(conn);
        expect_states(&mut sub, &[Failed]).await;
        let result = manager.send("video_frame", Some(&json!({}))).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
        assert_quiet(&mut sub).await;
        assert!(server.conns.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_while_connected_replaces_connection() {
        let mut server = MockServer::start().await;
        let manager = ConnectionManager::new(test_config(&server.base_url));
        let mut sub = manager.subscribe();

        manager.connect("first").await;
        expect_states(&mut sub, &[Connecting, Connected]).await;
        let mut old = server.next_conn().await;

        manager.connect("second").await;
        expect_states(&mut sub, &[Disconnected, Connecting, Connected]).await;
        let new = server.next_conn().await;
        assert_eq!(new.path, "/second");

        expect_close(&mut old.ws).await;
        assert_eq!(manager.status(), Connected);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn inject_drops_unusable_messages() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let mut sub = manager.subscribe();

        manager.inject_inbound_message("not valid json {{{");
        manager.inject_inbound_message(r#"{"type":"video_status","data":{}}"#);
        manager.inject_inbound_message(r#"{"type":"heartbeat","timestamp":"2024-01-01T00:00:00Z"}"#);
        manager.inject_inbound_message(r#"{"type":"sign_language_result","data":{}}"#);

        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn messages_arrive_in_order_for_every_subscriber() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let mut a = manager.subscribe();
        let mut b = manager.subscribe();
        let dropped = manager.subscribe();
        dropped.unsubscribe();

        for img in ["MQ==", "Mg==", "Mw=="] {
            manager.inject_inbound_message(&format!(
                r#"{{"type":"sign_language_result","data":{{"img":"{img}"}}}}"#
            ));
        }

        for sub in [&mut a, &mut b] {
            let images: Vec<String> = std::iter::from_fn(|| sub.try_recv())
                .map(|e| match e {
                    ConnectionEvent::MessageReceived(InboundEnvelope::SignLanguageResult(r)) => {
                        r.image_base64
                    }
                    other => panic!("unexpected event {other:?}"),
                })
                .collect();
            assert_eq!(images, vec!["MQ==", "Mg==", "Mw=="]);
        }
    }

    #[tokio::test]
    async fn send_while_connecting_fails_and_writes_nothing() {
        use tokio::io::AsyncReadExt;

        // Accepts TCP but never answers the opening handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config(&format!("ws://{}/", listener.local_addr().unwrap()));
        config.connect_timeout = Duration::from_millis(500);
        let manager = ConnectionManager::new(config);
        let mut sub = manager.subscribe();

        let backend = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let _ = tokio::time::timeout(WAIT, stream.read_to_end(&mut received)).await;
            String::from_utf8_lossy(&received).into_owned()
        });

        tokio::join!(manager.connect("abc"), async {
            expect_states(&mut sub, &[Connecting]).await;
            assert_eq!(manager.status(), Connecting);
            let result = manager.send("video_frame", Some(&json!({"frame": "x"}))).await;
            assert!(matches!(result, Err(ConnectionError::NotConnected)));
        });
        expect_states(&mut sub, &[Failed]).await;

        let received = backend.await.unwrap();
        assert!(received.starts_with("GET /abc"), "got {received:?}");
        assert!(!received.contains("video_frame"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_connects_leave_one_live_connection() {
        let mut server = MockServer::start().await;
        let manager = ConnectionManager::new(fast_heartbeat(test_config(&server.base_url)));
        let mut sub = manager.subscribe();

        tokio::join!(manager.connect("a"), manager.connect("b"));

        expect_states(&mut sub, &[Connecting, Connected]).await;
        assert_quiet(&mut sub).await;
        assert_eq!(manager.status(), Connected);
        assert_eq!(live_paths(&mut server).await, vec!["/b".to_string()]);

        manager.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_overlapping_connect_leaves_nothing_live() {
        let mut server = MockServer::start().await;
        let manager = ConnectionManager::new(fast_heartbeat(test_config(&server.base_url)));
        let mut sub = manager.subscribe();

        tokio::join!(manager.connect("abc"), manager.disconnect());

        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(QUIET, sub.recv()).await {
            events.push(event);
        }
        assert_eq!(events.last(), Some(&ConnectionEvent::StateChanged(Disconnected)));
        assert_eq!(manager.status(), Disconnected);
        assert!(live_paths(&mut server).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_succeeds_as_soon_as_connected_is_observed() {
        let mut server = MockServer::start().await;
        let manager = Arc::new(ConnectionManager::new(test_config(&server.base_url)));
        let mut sub = manager.subscribe();

        let sender = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                loop {
                    if next_event(&mut sub).await == ConnectionEvent::StateChanged(Connected) {
                        return manager.send("video_frame", Some(&json!({"frame": "first"}))).await;
                    }
                }
            })
        };

        manager.connect("abc").await;
        sender.await.unwrap().unwrap();

        let mut conn = server.next_conn().await;
        let msg = next_app_json(&mut conn.ws).await;
        assert_eq!(msg["data"]["frame"], "first");
        manager.disconnect().await;
    }
}
