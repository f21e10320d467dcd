//! Per-connection tasks: receive loop, serialized writer and heartbeat.

pub(crate) mod heartbeat;
pub(crate) mod read;
pub(crate) mod write;
