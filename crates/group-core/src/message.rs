//! Messages disseminated to the group and the identity used to deduplicate them.

use crate::ProcessId;
use serde::{Deserialize, Serialize};

/// Per-sender message sequence number.
///
/// Senders are responsible for uniqueness; [`crate::UniformBroadcaster::next_message`]
/// hands out a monotonically increasing counter per local process.
pub type MessageId = u64;

/// Delivery guarantee requested for a message.
///
/// Set by the broadcaster before send, read-only to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryGuarantee {
    #[default]
    BestEffort,
    Reliable,
}

/// Value identity of a message: `(message_id, sender_id)`.
///
/// Used solely as the dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageIdentity {
    pub message_id: MessageId,
    pub sender_id: ProcessId,
}

impl MessageIdentity {
    pub fn new(message_id: MessageId, sender_id: ProcessId) -> Self {
        Self {
            message_id,
            sender_id,
        }
    }
}

/// A group message.
///
/// Wire shape: `{ id, senderId, guarantee, payload }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique per sender
    pub id: MessageId,
    /// Process that originated the message (not the last hop)
    pub sender_id: ProcessId,
    pub guarantee: DeliveryGuarantee,
    /// Opaque bytes, interpreted by the layer above the broadcaster
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a best-effort message. The broadcaster upgrades the guarantee on multicast.
    pub fn new(id: MessageId, sender_id: ProcessId, payload: Vec<u8>) -> Self {
        Self {
            id,
            sender_id,
            guarantee: DeliveryGuarantee::BestEffort,
            payload,
        }
    }

    pub fn identity(&self) -> MessageIdentity {
        MessageIdentity::new(self.id, self.sender_id)
    }
}
