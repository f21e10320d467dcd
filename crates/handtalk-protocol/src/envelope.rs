use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Errors from decoding an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` has the wrong type, expected {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}

/// Envelope for all WebSocket communication.
///
/// The `data` field uses `serde_json::value::RawValue` so that the payload
/// is only parsed once the message kind is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<serde_json::value::RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    /// Creates an outbound envelope with the given type, payload and time.
    pub fn new<T: Serialize>(
        msg_type: impl Into<String>,
        data: Option<&T>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match data {
            Some(d) => {
                let json = serde_json::to_string(d)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            msg_type: msg_type.into(),
            data: raw,
            timestamp: Some(format_timestamp(timestamp)),
        })
    }

    /// Creates the keep-alive frame: `{"type":"heartbeat","timestamp":...}`.
    pub fn heartbeat(timestamp: DateTime<Utc>) -> Self {
        Self {
            msg_type: MessageType::Heartbeat.as_str().to_string(),
            data: None,
            timestamp: Some(format_timestamp(timestamp)),
        }
    }

    /// Returns the message kind of this envelope.
    pub fn kind(&self) -> MessageType {
        MessageType::from_wire(&self.msg_type)
    }

    /// Deserializes the payload into the given type.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.data {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Serializes the envelope to its wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses the envelope timestamp, if present and well-formed.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Decoded payload of a `sign_language_result` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignLanguageResult {
    /// Rendered result frame, base64-encoded.
    pub image_base64: String,
    /// Time the result was received by this client.
    pub timestamp: DateTime<Utc>,
}

/// An inbound message after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEnvelope {
    SignLanguageResult(SignLanguageResult),
    /// Keep-alive from the backend; never forwarded to subscribers.
    Heartbeat { timestamp: DateTime<Utc> },
    /// Well-formed envelope with a type this client does not handle.
    Unrecognized { msg_type: String },
}

impl InboundEnvelope {
    /// Returns `true` for messages that are delivered to subscribers.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::SignLanguageResult(_))
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Self::SignLanguageResult(_) => MessageType::SignLanguageResult,
            Self::Heartbeat { .. } => MessageType::Heartbeat,
            Self::Unrecognized { .. } => MessageType::Unknown,
        }
    }
}

/// Decodes one complete text frame.
///
/// `received_at` stamps results whose wire form carries no time of its own.
/// Unknown `type` values decode to [`InboundEnvelope::Unrecognized`]; only
/// structurally broken input is an error.
pub fn decode(text: &str, received_at: DateTime<Utc>) -> Result<InboundEnvelope, DecodeError> {
    let envelope: Envelope = serde_json::from_str(text)?;

    match envelope.kind() {
        MessageType::SignLanguageResult => {
            let data: serde_json::Value = envelope
                .parse_data()?
                .filter(|d: &serde_json::Value| !d.is_null())
                .ok_or(DecodeError::MissingField("data"))?;
            let image_base64 = match data.get("img") {
                None => return Err(DecodeError::MissingField("data.img")),
                Some(serde_json::Value::Null) => String::new(),
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(_) => {
                    return Err(DecodeError::InvalidField {
                        field: "data.img",
                        expected: "string",
                    });
                }
            };
            Ok(InboundEnvelope::SignLanguageResult(SignLanguageResult {
                image_base64,
                timestamp: received_at,
            }))
        }
        MessageType::Heartbeat => Ok(InboundEnvelope::Heartbeat {
            timestamp: envelope.parsed_timestamp().unwrap_or(received_at),
        }),
        MessageType::Unknown => Ok(InboundEnvelope::Unrecognized {
            msg_type: envelope.msg_type,
        }),
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
