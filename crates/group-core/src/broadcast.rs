//! Uniform broadcast by flooding.
//!
//! # Protocol
//!
//! **Multicast:** mark the message `Reliable` and unicast it to every member of
//! the view. A failed unicast is logged and skipped; the remaining sends go on.
//!
//! **Receive:**
//! 1. Look up `(id, sender)` in the dedup store; a known identity is dropped.
//! 2. A new identity is re-flooded to every member except ourselves and the
//!    process we got it from.
//! 3. Only after that fan-out completes is the message delivered locally.
//!
//! Forward-before-deliver means that once any process delivers a message, every
//! other live member has already been sent a copy, assuming a complete topology
//! and no crash mid-flood. There is no acknowledgement, retransmission or
//! ordering: concurrent multicasts may be delivered in different orders at
//! different processes.

use crate::events::{EventBus, GroupEvent};
use crate::transport::Transport;
use crate::{DedupStore, DeliveryGuarantee, Message, Process, ProcessId};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn, Instrument, Span};

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Broadcaster used before initialize")]
    NotInitialized,
}

/// Broadcaster settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastConfig {
    /// Send our own multicasts to ourselves through the transport, so local
    /// delivery goes through `receive` like everyone else's.
    #[serde(default = "default_true")]
    pub include_self: bool,

    /// Issue fan-out sends concurrently instead of one peer at a time.
    #[serde(default)]
    pub parallel_fanout: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            include_self: true,
            parallel_fanout: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Destinations the transport accepted
    pub sent: Vec<ProcessId>,
    /// Destinations whose unicast failed
    pub failed: Vec<ProcessId>,
}

impl FanOutReport {
    pub fn attempted(&self) -> usize {
        self.sent.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Sending capability of a group communication protocol.
#[async_trait]
pub trait GroupSender: Send + Sync {
    /// Allocate the next message id for the local process.
    fn next_message(&self, payload: Vec<u8>) -> Result<Message, BroadcastError>;

    /// Send a message to every member of the group.
    async fn multicast(&self, message: Message) -> Result<FanOutReport, BroadcastError>;
}

/// Receiving capability of a group communication protocol.
///
/// Never fails towards the caller: whatever goes wrong is handled locally.
#[async_trait]
pub trait GroupReceiver: Send + Sync {
    async fn receive(&self, message: Message, from: ProcessId);
}

#[derive(Clone)]
struct Binding {
    process: Arc<dyn Process>,
    transport: Arc<dyn Transport>,
}

/// Flooding broadcaster with exactly-once local delivery.
pub struct UniformBroadcaster {
    config: BroadcastConfig,
    binding: RwLock<Option<Binding>>,
    members: RwLock<Vec<ProcessId>>,
    seen: DedupStore,
    next_id: AtomicU64,
    events: Option<Arc<EventBus>>,
    span: Span,
}

impl UniformBroadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            binding: RwLock::new(None),
            members: RwLock::new(Vec::new()),
            seen: DedupStore::new(),
            next_id: AtomicU64::new(0),
            events: None,
            span: Span::none(),
        }
    }

    /// Emit events to this bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Log inside this span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Bind the local process and transport, set the membership view and
    /// reset the dedup store.
    ///
    /// Expected once per process. A second call rebinds and forgets every
    /// message seen so far.
    pub fn initialize(
        &self,
        process: Arc<dyn Process>,
        transport: Arc<dyn Transport>,
        members: Vec<ProcessId>,
    ) {
        let _entered = self.span.enter();
        let local = process.local_id();

        let mut binding = self.binding.write().unwrap_or_else(|e| e.into_inner());
        if binding.is_some() {
            warn!(process = %local, "Re-initializing broadcaster, seen messages are forgotten");
        }
        *binding = Some(Binding { process, transport });
        drop(binding);

        let count = members.len();
        self.update_view(members);
        self.seen.clear();
        info!(process = %local, members = count, "Broadcaster initialized");
    }

    /// Replace the membership view. The dedup store is kept.
    pub fn update_view(&self, mut members: Vec<ProcessId>) {
        members.sort();
        members.dedup();
        *self.members.write().unwrap_or_else(|e| e.into_inner()) = members;
    }

    /// Drop the process and transport binding.
    ///
    /// Later calls behave as if `initialize` never happened.
    pub fn shutdown(&self) {
        let previous = self
            .binding
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(binding) = previous {
            let _entered = self.span.enter();
            info!(process = %binding.process.local_id(), "Broadcaster shut down");
        }
    }

    /// Current membership view, sorted.
    pub fn members(&self) -> Vec<ProcessId> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.binding
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Number of distinct messages seen since initialization.
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    fn binding(&self) -> Option<Binding> {
        self.binding
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn emit(&self, event: GroupEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    async fn multicast_impl(&self, mut message: Message) -> Result<FanOutReport, BroadcastError> {
        let binding = self.binding().ok_or(BroadcastError::NotInitialized)?;
        let local = binding.process.local_id();
        message.guarantee = DeliveryGuarantee::Reliable;

        if !self.config.include_self {
            // Our own copy may bounce back through a re-flooding peer.
            self.seen.insert(message.identity());
        }

        let targets: Vec<ProcessId> = self
            .members()
            .into_iter()
            .filter(|id| self.config.include_self || *id != local)
            .collect();

        debug!(
            process = %local,
            message_id = message.id,
            sender = %message.sender_id,
            peers = targets.len(),
            "Multicasting"
        );

        let report = self.fan_out(&binding, &message, &targets).await;
        Ok(report)
    }

    async fn receive_impl(&self, message: Message, from: ProcessId) {
        let Some(binding) = self.binding() else {
            warn!(
                from = %from,
                message_id = message.id,
                "Dropping message received before initialize"
            );
            return;
        };
        let local = binding.process.local_id();
        let identity = message.identity();

        if !self.seen.insert(identity) {
            debug!(
                process = %local,
                from = %from,
                message_id = identity.message_id,
                sender = %identity.sender_id,
                "Already knows this message"
            );
            self.emit(GroupEvent::DuplicateDropped {
                process: local,
                message_id: identity.message_id,
                sender: identity.sender_id,
            });
            return;
        }

        debug!(
            process = %local,
            from = %from,
            message_id = identity.message_id,
            sender = %identity.sender_id,
            "Message is new, flooding"
        );

        let mut forward = message.clone();
        forward.guarantee = DeliveryGuarantee::Reliable;
        let targets: Vec<ProcessId> = self
            .members()
            .into_iter()
            .filter(|id| *id != local && *id != from)
            .collect();
        let report = self.fan_out(&binding, &forward, &targets).await;

        self.emit(GroupEvent::MessageForwarded {
            process: local,
            message_id: identity.message_id,
            sender: identity.sender_id,
            peers: report.sent.len(),
        });
        debug!(process = %local, message_id = identity.message_id, "Flooded to peers, delivering");

        binding.process.deliver(message).await;

        self.emit(GroupEvent::MessageDelivered {
            process: local,
            message_id: identity.message_id,
            sender: identity.sender_id,
        });
    }

    /// Unicast to every target. Failures are logged and skipped, never retried.
    async fn fan_out(
        &self,
        binding: &Binding,
        message: &Message,
        targets: &[ProcessId],
    ) -> FanOutReport {
        let transport = &binding.transport;

        let results = if self.config.parallel_fanout {
            join_all(
                targets
                    .iter()
                    .map(|&to| async move { (to, transport.unicast(message, to).await) }),
            )
            .await
        } else {
            let mut results = Vec::with_capacity(targets.len());
            for &to in targets {
                results.push((to, transport.unicast(message, to).await));
            }
            results
        };

        let local = binding.process.local_id();
        let mut report = FanOutReport::default();
        for (to, result) in results {
            match result {
                Ok(()) => report.sent.push(to),
                Err(e) => {
                    warn!(
                        process = %local,
                        destination = %to,
                        message_id = message.id,
                        error = %e,
                        "Unicast failed, continuing fan-out"
                    );
                    self.emit(GroupEvent::SendFailed {
                        process: local,
                        destination: to,
                        error: e.to_string(),
                    });
                    report.failed.push(to);
                }
            }
        }
        report
    }
}

#[async_trait]
impl GroupSender for UniformBroadcaster {
    fn next_message(&self, payload: Vec<u8>) -> Result<Message, BroadcastError> {
        let binding = self.binding().ok_or(BroadcastError::NotInitialized)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Message::new(id, binding.process.local_id(), payload))
    }

    async fn multicast(&self, message: Message) -> Result<FanOutReport, BroadcastError> {
        let span = self.span.clone();
        self.multicast_impl(message).instrument(span).await
    }
}

#[async_trait]
impl GroupReceiver for UniformBroadcaster {
    async fn receive(&self, message: Message, from: ProcessId) {
        let span = self.span.clone();
        self.receive_impl(message, from).instrument(span).await
    }
}
