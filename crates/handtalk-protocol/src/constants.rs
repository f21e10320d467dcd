use std::fmt;
use std::time::Duration;

/// How often a heartbeat is written while connected.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Delay between a transport failure and the single reconnection attempt
/// scheduled for it.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Upper bound for the WebSocket opening handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for the close handshake before resources are force-released.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum reassembled message size in bytes (16 MB).
///
/// Sign-language results carry a base64 image, so this has to stay well
/// above a typical encoded frame.
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Header the tunneling proxy in front of the backend requires to skip its
/// browser interstitial.
pub const SKIP_BROWSER_WARNING_HEADER: &str = "ngrok-skip-browser-warning";

/// Number of characters of an undecodable message kept in log output.
pub const LOG_PREVIEW_CHARS: usize = 1000;

/// Application-level message kind carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Inference result for a captured frame.
    SignLanguageResult,
    /// Keep-alive, sent by the client and optionally echoed by the backend.
    Heartbeat,
    /// Forward compatibility: any type this client does not know.
    Unknown,
}

impl MessageType {
    /// Maps a wire `type` value to a message kind.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "sign_language_result" => Self::SignLanguageResult,
            "heartbeat" => Self::Heartbeat,
            _ => Self::Unknown,
        }
    }

    /// Wire name of a known kind. `Unknown` has no wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignLanguageResult => "sign_language_result",
            Self::Heartbeat => "heartbeat",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
