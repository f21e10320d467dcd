pub mod constants;
pub mod envelope;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{DecodeError, Envelope, InboundEnvelope, SignLanguageResult, decode};
pub use types::VideoMessage;
