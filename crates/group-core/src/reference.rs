//! Service references and the directory of references announced by group members.

use crate::{ProcessId, ServiceProxy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::RwLock;

/// A handle on a remotely callable service endpoint.
///
/// Created by the process that owns the endpoint; immutable and shared
/// read-only once announced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    /// Process exposing the endpoint
    pub owner: ProcessId,
    /// Where the endpoint can be reached (URL, RPC address, ...)
    pub endpoint: String,
}

impl ServiceReference {
    pub fn new(owner: ProcessId, endpoint: impl Into<String>) -> Self {
        Self {
            owner,
            endpoint: endpoint.into(),
        }
    }
}

impl Display for ServiceReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.owner, self.endpoint)
    }
}

/// Known service references keyed by announcing process.
///
/// Insert-or-replace per process; safe for concurrent use.
#[derive(Default)]
pub struct ReferenceDirectory {
    entries: RwLock<HashMap<ProcessId, ServiceReference>>,
}

impl ReferenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the reference announced by `process`.
    ///
    /// Returns true if the directory changed: a new process, or a different
    /// reference for a known one. Callers use this to skip redundant proxy rebuilds.
    pub fn add_reference(&self, process: ProcessId, reference: ServiceReference) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get(&process) {
            Some(existing) if *existing == reference => false,
            _ => {
                entries.insert(process, reference);
                true
            }
        }
    }

    /// Drop the entry for a departed process.
    pub fn remove_reference(&self, process: ProcessId) -> Option<ServiceReference> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&process)
    }

    pub fn get(&self, process: &ProcessId) -> Option<ServiceReference> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(process)
            .cloned()
    }

    pub fn contains(&self, process: &ProcessId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(process)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All references, ordered by owning process.
    pub fn snapshot(&self) -> Vec<(ProcessId, ServiceReference)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, r)| (*id, r.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Build a proxy over every reference currently known.
    ///
    /// The proxy is a snapshot; later directory changes need a new proxy.
    pub fn build_proxy(&self) -> ServiceProxy {
        ServiceProxy::new(self.snapshot().into_iter().map(|(_, r)| r).collect())
    }
}
