//! Transport layer for the operator's browser connection.
//!
//! Provides:
//! - Wire protocol (JSON commands in, JSON status messages out)
//! - WebSocket gateway that owns the operator connection (feature: websocket)
//! - Status relay, the single writer to that connection (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod relay;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use protocol::{CommandMessage, ProtocolError, StatusMessage};
