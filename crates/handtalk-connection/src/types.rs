//! Public types for the connection manager.

use std::fmt;
use std::time::Duration;

use handtalk_protocol::InboundEnvelope;
use handtalk_protocol::constants::{
    CLOSE_TIMEOUT, CONNECT_TIMEOUT, HEARTBEAT_PERIOD, RECONNECT_DELAY,
    SKIP_BROWSER_WARNING_HEADER, WS_MAX_MESSAGE_SIZE,
};

/// Connection state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport. Initial state, and the state after an explicit
    /// disconnect or a clean close from the backend.
    #[default]
    Disconnected,
    /// WebSocket handshake in progress.
    Connecting,
    /// Transport open; receive loop and heartbeat running.
    Connected,
    /// Transport lost, waiting to retry.
    Reconnecting,
    /// The last connection attempt or the live transport failed.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Caller-supplied identifier appended to the base URL (a session or user
/// token). The manager passes it through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity(String);

impl ConnectionIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty identity does not count as being on record, so no
    /// automatic reconnection is attempted for it.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ConnectionIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConnectionIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection state changed. Fired once per distinct transition.
    StateChanged(ConnectionState),
    /// A recognized application message was received.
    MessageReceived(InboundEnvelope),
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Endpoint prefix; the identity is appended verbatim.
    pub base_url: String,
    /// Extra headers sent with the opening handshake.
    pub headers: Vec<(String, String)>,
    /// Interval between heartbeats while connected.
    pub heartbeat_period: Duration,
    /// Delay before the reconnection attempt that follows a failure.
    pub reconnect_delay: Duration,
    /// Upper bound for the opening handshake.
    pub connect_timeout: Duration,
    /// Upper bound for the close handshake and task teardown.
    pub close_timeout: Duration,
    /// Largest reassembled message accepted from the backend.
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            headers: vec![(SKIP_BROWSER_WARNING_HEADER.into(), "true".into())],
            heartbeat_period: HEARTBEAT_PERIOD,
            reconnect_delay: RECONNECT_DELAY,
            connect_timeout: CONNECT_TIMEOUT,
            close_timeout: CLOSE_TIMEOUT,
            max_message_size: WS_MAX_MESSAGE_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Creates a configuration with default timings for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Full WebSocket URL for an identity.
    pub fn endpoint(&self, identity: &ConnectionIdentity) -> String {
        format!("{}{}", self.base_url, identity)
    }
}
