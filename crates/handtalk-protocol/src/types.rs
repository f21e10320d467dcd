use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::SignLanguageResult;

/// A message shown in the conversation view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMessage {
    pub id: uuid::Uuid,
    pub image_base64: String,
    pub timestamp: DateTime<Utc>,
    pub is_incoming: bool,
}

impl VideoMessage {
    /// Builds an incoming message from a backend result.
    pub fn incoming(result: SignLanguageResult) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            image_base64: result.image_base64,
            timestamp: result.timestamp,
            is_incoming: true,
        }
    }

    /// Decodes the base64 image payload.
    pub fn image_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.image_base64)
    }
}
