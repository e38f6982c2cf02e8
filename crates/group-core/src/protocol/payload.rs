//! Group payloads: what a delivered message means to the layer above the broadcaster.
//!
//! Wire format (JSON, tagged by `type`):
//! - `{"type":"referenceRequest"}`
//! - `{"type":"referenceAnnouncement","reference":{"owner":"...","endpoint":"..."}}`
//! - `{"type":"application","data":[1,2,3]}`

use super::encoding::is_likely_json;
use super::ProtocolError;
use crate::ServiceReference;
use serde::{Deserialize, Serialize};

/// Tagged payload carried in a [`crate::Message`].
///
/// Each variant has exactly one handler; dispatch is an exhaustive match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GroupPayload {
    /// Ask every authorized member to announce its service reference.
    ReferenceRequest,

    /// A member's service reference.
    ReferenceAnnouncement { reference: ServiceReference },

    /// Opaque application data.
    Application { data: Vec<u8> },
}

impl GroupPayload {
    pub fn application(data: impl Into<Vec<u8>>) -> Self {
        Self::Application { data: data.into() }
    }

    pub fn announcement(reference: ServiceReference) -> Self {
        Self::ReferenceAnnouncement { reference }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("GroupPayload serialization should not fail")
    }

    /// Parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::Empty);
        }
        if !is_likely_json(data) {
            return Err(ProtocolError::NotJson);
        }
        Ok(serde_json::from_slice(data)?)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReferenceRequest => "referenceRequest",
            Self::ReferenceAnnouncement { .. } => "referenceAnnouncement",
            Self::Application { .. } => "application",
        }
    }
}
