//! Persistent WebSocket connection to the HandTalk signaling backend.
//!
//! [`ConnectionManager`] opens one connection per identity, keeps it alive
//! with heartbeats, decodes inbound messages, and retries once after a
//! transport failure. Subscribers receive status transitions and decoded
//! messages through a [`Subscription`].

mod events;
pub mod manager;
mod pumps;
pub(crate) mod reconnection;
pub mod types;
mod ws_client;

pub use events::Subscription;
pub use manager::ConnectionManager;
pub use types::{ConnectionConfig, ConnectionEvent, ConnectionIdentity, ConnectionState};
pub use ws_client::ConnectionError;
