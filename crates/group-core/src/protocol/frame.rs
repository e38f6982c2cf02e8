//! Transport frames: a [`Message`] encoded with bincode.

use super::ProtocolError;
use crate::Message;

/// Maximum frame size (16MB) to bound memory used by a single malformed or hostile frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a message into a transport frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode::serialize(message)?)
}

/// Decode a transport frame.
///
/// Fails for empty, oversized, truncated or otherwise invalid frames.
pub fn decode_frame(data: &[u8]) -> Result<Message, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::TooLarge(data.len()));
    }
    Ok(bincode::deserialize(data)?)
}
