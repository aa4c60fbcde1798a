//! Wire protocol for operator-server communication.
//!
//! Inbound: `{"subjectID": .., "action": .., "content": .., "keyCode": ..}`.
//! Outbound: `{"kind": .., "message": ..}`.

pub use psych_timer_core::{CommandMessage, StatusMessage};

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decode one command from a text frame.
///
/// # Errors
/// Returns error if the text is not a JSON command object.
pub fn decode_command(text: &str) -> Result<CommandMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode one command from a binary frame holding UTF-8 JSON.
///
/// # Errors
/// Returns error if the bytes are not a JSON command object.
pub fn decode_command_bytes(data: &[u8]) -> Result<CommandMessage, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}

/// Encode one status message for the wire.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_status(msg: &StatusMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}
