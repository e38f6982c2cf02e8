//! ProcessId: Unique identifier for a member of the process group.
//!
//! Wraps a u64 internally but displays as a 16-character hex string
//! for human readability. Used both as a transport destination and as
//! a membership participant.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessIdError {
    #[error("Invalid process ID format: expected 16 hex chars or a decimal number")]
    InvalidFormat,
    #[error("Invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),
}

/// A unique identifier for a process in the group.
///
/// # Examples
/// ```
/// use group_core::ProcessId;
///
/// let id = ProcessId::from(7);
/// assert_eq!(id.to_string(), "0000000000000007");
///
/// let parsed: ProcessId = "0000000000000007".parse().unwrap();
/// assert_eq!(parsed, id);
///
/// let short: ProcessId = "7".parse().unwrap();
/// assert_eq!(short, id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    /// Get the underlying u64 value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ProcessId {
    type Err = ProcessIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Canonical format: 16 hex chars
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
            return Ok(Self(id));
        }

        // Short decimal form, convenient in config files ("1", "2", ...)
        if !s.is_empty() && s.len() < 16 && s.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Self(s.parse()?));
        }

        Err(ProcessIdError::InvalidFormat)
    }
}

impl From<u64> for ProcessId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ProcessId> for u64 {
    fn from(id: ProcessId) -> u64 {
        id.0
    }
}

// Serialize as hex string for consistency in logs, errors, JSON
impl serde::Serialize for ProcessId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ProcessId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
