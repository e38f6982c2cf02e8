//! Event infrastructure for group-core.
//!
//! Provides `GroupEvent` for monitoring and `EventBus` for subscriptions.
//! An `Arc<EventBus>` is handed to each component at construction so tests
//! can observe one process in isolation.

use crate::ProcessId;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the broadcaster, the discovery coordinator and the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GroupEvent {
    /// A fresh message was handed to the local application.
    #[serde(rename_all = "camelCase")]
    MessageDelivered {
        process: ProcessId,
        message_id: u64,
        sender: ProcessId,
    },
    /// A fresh message was re-flooded before delivery.
    #[serde(rename_all = "camelCase")]
    MessageForwarded {
        process: ProcessId,
        message_id: u64,
        sender: ProcessId,
        /// Number of peers the forward succeeded for
        peers: usize,
    },
    /// A copy of an already-seen message was dropped.
    #[serde(rename_all = "camelCase")]
    DuplicateDropped {
        process: ProcessId,
        message_id: u64,
        sender: ProcessId,
    },
    /// A unicast during fan-out failed; remaining sends continued.
    SendFailed {
        process: ProcessId,
        destination: ProcessId,
        error: String,
    },
    /// An incoming frame or payload could not be interpreted and was dropped.
    MalformedMessage {
        process: ProcessId,
        from: ProcessId,
        reason: String,
    },
    /// The membership view changed.
    MembershipChanged {
        process: ProcessId,
        joined: Option<ProcessId>,
        left: Option<ProcessId>,
    },
    /// The reference directory gained or replaced an entry.
    ReferenceAdded { process: ProcessId, owner: ProcessId },
    /// The reference directory dropped an entry.
    ReferenceRemoved { process: ProcessId, owner: ProcessId },
    /// A new proxy was exported at the lookup name.
    ProxyRebuilt { process: ProcessId, replicas: usize },
}

impl GroupEvent {
    /// Process that emitted the event.
    pub fn process(&self) -> ProcessId {
        match self {
            Self::MessageDelivered { process, .. }
            | Self::MessageForwarded { process, .. }
            | Self::DuplicateDropped { process, .. }
            | Self::SendFailed { process, .. }
            | Self::MalformedMessage { process, .. }
            | Self::MembershipChanged { process, .. }
            | Self::ReferenceAdded { process, .. }
            | Self::ReferenceRemoved { process, .. }
            | Self::ProxyRebuilt { process, .. } => *process,
        }
    }
}

/// Keeps a handler registered on an [`EventBus`]; dropping it unregisters.
pub struct Subscription {
    bus: Weak<EventBus>,
    key: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.key);
        }
    }
}

type Handler = Arc<dyn Fn(GroupEvent) + Send + Sync>;

/// Fan-out of [`GroupEvent`]s to registered handlers.
///
/// Handlers run synchronously on the emitting task, in registration order.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(usize, Handler)>>,
    next_key: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every future event.
    pub fn subscribe(
        self: &Arc<Self>,
        handler: impl Fn(GroupEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((key, Arc::new(handler)));
        Subscription {
            bus: Arc::downgrade(self),
            key,
        }
    }

    /// Number of registered handlers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn remove(&self, key: usize) {
        // emit never holds the lock while handlers run, so this can't deadlock
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(k, _)| *k != key);
    }

    /// Hand `event` to every handler.
    pub fn emit(&self, event: GroupEvent) {
        let handlers: Vec<Handler> = {
            let guard = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(_, h)| Arc::clone(h)).collect()
        };

        let Some((last, rest)) = handlers.split_last() else {
            return;
        };
        for handler in rest {
            handler(event.clone());
        }
        last(event);
    }
}
