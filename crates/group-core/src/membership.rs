//! Membership events and the local view of the group.
//!
//! The membership service itself is external: it reports joins and leaves,
//! at least once, to every live member including the one that caused them
//! (tagged `self_originated`).

use crate::ProcessId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A join and/or leave reported by the membership service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipEvent {
    pub joined: Option<ProcessId>,
    pub left: Option<ProcessId>,
    /// The local process caused this event (e.g. our own join)
    pub self_originated: bool,
}

impl MembershipEvent {
    /// A peer joined.
    pub fn joined(id: ProcessId) -> Self {
        Self {
            joined: Some(id),
            left: None,
            self_originated: false,
        }
    }

    /// A peer left.
    pub fn left(id: ProcessId) -> Self {
        Self {
            joined: None,
            left: Some(id),
            self_originated: false,
        }
    }

    /// Mark this event as caused by the local process.
    pub fn from_self(mut self) -> Self {
        self.self_originated = true;
        self
    }
}

/// The set of processes this process believes to be in the group.
///
/// Always contains the local process.
#[derive(Debug, Clone)]
pub struct MembershipView {
    local: ProcessId,
    members: BTreeSet<ProcessId>,
}

impl MembershipView {
    pub fn new(local: ProcessId, members: impl IntoIterator<Item = ProcessId>) -> Self {
        let mut members: BTreeSet<ProcessId> = members.into_iter().collect();
        members.insert(local);
        Self { local, members }
    }

    pub fn local_id(&self) -> ProcessId {
        self.local
    }

    /// Apply a membership event.
    ///
    /// Returns true if the view changed. The local process is never removed.
    pub fn apply(&mut self, event: &MembershipEvent) -> bool {
        let mut changed = false;
        if let Some(joined) = event.joined {
            changed |= self.members.insert(joined);
        }
        if let Some(left) = event.left
            && left != self.local
        {
            changed |= self.members.remove(&left);
        }
        changed
    }

    pub fn contains(&self, id: &ProcessId) -> bool {
        self.members.contains(id)
    }

    /// Members in ascending order, local process included.
    pub fn members(&self) -> Vec<ProcessId> {
        self.members.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
