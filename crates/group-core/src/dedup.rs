//! Dedup store: the set of message identities this process has already seen.
//!
//! Insert-if-absent only. Entries are never removed while the broadcaster
//! stays bound; the store is reset only when the broadcaster is (re)initialized.

use crate::MessageIdentity;
use std::collections::HashSet;
use std::sync::RwLock;

/// Thread-safe set of seen message identities.
///
/// Safe to share between concurrent delivery callbacks.
#[derive(Default)]
pub struct DedupStore {
    seen: RwLock<HashSet<MessageIdentity>>,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an identity.
    ///
    /// Returns true if it was not present before (the message is new).
    pub fn insert(&self, identity: MessageIdentity) -> bool {
        self.seen
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity)
    }

    pub fn contains(&self, identity: &MessageIdentity) -> bool {
        self.seen
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(identity)
    }

    /// Number of distinct identities ever inserted since the last reset.
    pub fn len(&self) -> usize {
        self.seen.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        self.seen.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
