//! Wire protocol for group communication.
//!
//! Two layers:
//! - **Frames** (bincode): the `Message` envelope carried by the transport
//! - **Payloads** (JSON): the tagged `GroupPayload` inside a message's `payload` bytes

mod encoding;
pub mod frame;
pub mod payload;

pub use frame::{decode_frame, encode_frame, MAX_FRAME_SIZE};
pub use payload::GroupPayload;

use thiserror::Error;

/// A frame or payload that cannot be interpreted.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Empty frame")]
    Empty,

    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("Invalid frame: {0}")]
    Frame(#[from] bincode::Error),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Payload is not JSON")]
    NotJson,
}
