//! Group node: one local process wired together.
//!
//! Owns the broadcaster, the discovery coordinator and the reference directory
//! of a single process, and sits between them and the outside world:
//! - inbound messages are validated, then handed to the broadcaster
//! - delivered messages are dispatched by payload variant
//! - membership events update the broadcaster's view, then reach the coordinator
//!
//! The broadcaster holds the node's process port, which holds the coordinator,
//! which holds the broadcaster. [`GroupNode::shutdown`] breaks that cycle.

use crate::events::{EventBus, GroupEvent};
use crate::proxy::Publisher;
use crate::protocol::{decode_frame, GroupPayload};
use crate::transport::Transport;
use crate::{
    BroadcastConfig, BroadcastError, DiscoveryConfig, DiscoveryCoordinator, FanOutReport,
    GroupReceiver, GroupSender, MembershipEvent, MembershipView, Message, Process, ProcessId,
    ReferenceDirectory, ServiceReference, UniformBroadcaster,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Settings for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Receiver of application payloads delivered through the group.
#[async_trait]
pub trait Application: Send + Sync {
    /// Called exactly once per delivered application message.
    async fn on_message(&self, sender: ProcessId, data: Vec<u8>);
}

/// Process port of a node: dispatches delivered messages by payload variant.
struct NodeProcess {
    local: ProcessId,
    coordinator: Arc<DiscoveryCoordinator>,
    application: Arc<dyn Application>,
    events: Arc<EventBus>,
}

#[async_trait]
impl Process for NodeProcess {
    fn local_id(&self) -> ProcessId {
        self.local
    }

    async fn deliver(&self, message: Message) {
        let payload = match GroupPayload::from_json(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                // Inbound messages are validated before flooding; only a
                // locally injected message can get here.
                warn!(sender = %message.sender_id, error = %e, "Undeliverable payload dropped");
                self.events.emit(GroupEvent::MalformedMessage {
                    process: self.local,
                    from: message.sender_id,
                    reason: e.to_string(),
                });
                return;
            }
        };

        debug!(sender = %message.sender_id, kind = payload.kind(), "Dispatching delivered message");
        match payload {
            GroupPayload::ReferenceRequest => {
                self.coordinator.on_reference_request(message.sender_id).await;
            }
            GroupPayload::ReferenceAnnouncement { reference } => {
                self.coordinator
                    .on_reference_announcement(message.sender_id, reference)
                    .await;
            }
            GroupPayload::Application { data } => {
                self.application.on_message(message.sender_id, data).await;
            }
        }
    }
}

/// A local process participating in the group.
pub struct GroupNode {
    local: ProcessId,
    broadcaster: Arc<UniformBroadcaster>,
    coordinator: Arc<DiscoveryCoordinator>,
    directory: Arc<ReferenceDirectory>,
    view: RwLock<MembershipView>,
    events: Arc<EventBus>,
    span: Span,
}

impl GroupNode {
    /// Build and initialize a node.
    ///
    /// `members` is the initial group view; the local process is always part of it.
    /// Register the node with its transport, then call [`GroupNode::announce`].
    pub fn new(
        reference: ServiceReference,
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        members: Vec<ProcessId>,
        publisher: Arc<dyn Publisher>,
        application: Arc<dyn Application>,
    ) -> Arc<Self> {
        Self::with_events(
            reference,
            config,
            transport,
            members,
            publisher,
            application,
            Arc::new(EventBus::new()),
        )
    }

    /// Like [`GroupNode::new`], emitting events to an existing bus.
    pub fn with_events(
        reference: ServiceReference,
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        members: Vec<ProcessId>,
        publisher: Arc<dyn Publisher>,
        application: Arc<dyn Application>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let local = reference.owner;
        let span = info_span!("process", id = %local);
        let view = MembershipView::new(local, members);

        let broadcaster = Arc::new(
            UniformBroadcaster::new(config.broadcast.clone())
                .with_events(events.clone())
                .with_span(span.clone()),
        );
        let directory = Arc::new(ReferenceDirectory::new());
        let coordinator = Arc::new(
            DiscoveryCoordinator::new(
                reference,
                config.discovery.clone(),
                broadcaster.clone(),
                directory.clone(),
                publisher,
            )
            .with_events(events.clone())
            .with_span(span.clone()),
        );
        let process = Arc::new(NodeProcess {
            local,
            coordinator: coordinator.clone(),
            application,
            events: events.clone(),
        });

        broadcaster.initialize(process, transport, view.members());

        Arc::new(Self {
            local,
            broadcaster,
            coordinator,
            directory,
            view: RwLock::new(view),
            events,
            span,
        })
    }

    /// Announce our reference to the group. No-op unless authorized.
    ///
    /// An authorized node calls this once it is reachable, so that it
    /// registers itself and builds its first proxy.
    pub async fn announce(&self) {
        self.coordinator
            .announce()
            .instrument(self.span.clone())
            .await
    }

    pub fn local_id(&self) -> ProcessId {
        self.local
    }

    pub fn broadcaster(&self) -> &Arc<UniformBroadcaster> {
        &self.broadcaster
    }

    pub fn coordinator(&self) -> &Arc<DiscoveryCoordinator> {
        &self.coordinator
    }

    pub fn directory(&self) -> &Arc<ReferenceDirectory> {
        &self.directory
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Current membership view.
    pub fn members(&self) -> Vec<ProcessId> {
        self.view
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .members()
    }

    /// Multicast application data to the group.
    pub async fn multicast(
        &self,
        data: impl Into<Vec<u8>>,
    ) -> Result<FanOutReport, BroadcastError> {
        let payload = GroupPayload::application(data);
        let message = self.broadcaster.next_message(payload.to_json())?;
        self.broadcaster.multicast(message).await
    }

    /// Entry point for raw transport frames.
    ///
    /// Frames that don't decode are dropped without delivery or propagation.
    pub async fn receive_frame(&self, frame: &[u8], from: ProcessId) {
        match decode_frame(frame) {
            Ok(message) => self.receive(message, from).await,
            Err(e) => self.reject(from, e.to_string()),
        }
    }

    /// Entry point for the membership service.
    pub async fn on_membership_event(&self, event: MembershipEvent) {
        let changed = {
            let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
            let changed = view.apply(&event);
            if changed {
                self.broadcaster.update_view(view.members());
            }
            changed
        };

        if changed {
            self.events.emit(GroupEvent::MembershipChanged {
                process: self.local,
                joined: event.joined,
                left: event.left,
            });
        }

        // Membership can change before the join notification arrives; the
        // coordinator reacts to every peer event regardless.
        self.coordinator.on_membership_event(event).await;
    }

    /// Release the proxy export and unbind the broadcaster.
    pub async fn shutdown(&self) {
        let span = self.span.clone();
        async move {
            self.coordinator.shutdown().await;
            self.broadcaster.shutdown();
            info!("Node shut down");
        }
        .instrument(span)
        .await
    }

    fn reject(&self, from: ProcessId, reason: String) {
        let _entered = self.span.enter();
        warn!(from = %from, reason = %reason, "Malformed message dropped");
        self.events.emit(GroupEvent::MalformedMessage {
            process: self.local,
            from,
            reason,
        });
    }
}

#[async_trait]
impl GroupReceiver for GroupNode {
    /// Validate the payload, then hand the message to the broadcaster.
    async fn receive(&self, message: Message, from: ProcessId) {
        if let Err(e) = GroupPayload::from_json(&message.payload) {
            self.reject(from, e.to_string());
            return;
        }
        self.broadcaster.receive(message, from).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;
    use crate::{InMemoryRegistry, MemoryNetwork};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inbox {
        messages: Mutex<Vec<(ProcessId, Vec<u8>)>>,
    }

    #[async_trait]
    impl Application for Inbox {
        async fn on_message(&self, sender: ProcessId, data: Vec<u8>) {
            self.messages.lock().unwrap().push((sender, data));
        }
    }

    fn pid(n: u64) -> ProcessId {
        ProcessId::from(n)
    }

    fn single_node(
        authorized: bool,
        registry: Arc<InMemoryRegistry>,
    ) -> (Arc<GroupNode>, Arc<Inbox>, Arc<MemoryNetwork>) {
        let network = MemoryNetwork::new();
        let inbox = Arc::new(Inbox::default());
        let config = NodeConfig {
            discovery: DiscoveryConfig {
                authorized,
                ..Default::default()
            },
            ..Default::default()
        };
        let node = GroupNode::new(
            ServiceReference::new(pid(1), "rpc://server-1"),
            config,
            Arc::new(network.transport_for(pid(1))),
            vec![pid(1)],
            registry,
            inbox.clone(),
        );
        network.register(pid(1), node.clone());
        (node, inbox, network)
    }

    #[tokio::test]
    async fn test_application_message_delivered_to_self() {
        let (node, inbox, _network) = single_node(false, Arc::new(InMemoryRegistry::new()));

        node.multicast(b"hello".to_vec()).await.unwrap();

        let messages = inbox.messages.lock().unwrap();
        assert_eq!(messages.as_slice(), &[(pid(1), b"hello".to_vec())]);
    }

    #[tokio::test]
    async fn test_malformed_payload_not_flooded() {
        let (node, inbox, network) = single_node(false, Arc::new(InMemoryRegistry::new()));
        let malformed = Arc::new(Mutex::new(0));
        let counter = malformed.clone();
        let _sub = node.events().subscribe(move |e| {
            if matches!(e, GroupEvent::MalformedMessage { .. }) {
                *counter.lock().unwrap() += 1;
            }
        });

        node.receive(Message::new(1, pid(2), b"\x00garbage".to_vec()), pid(2))
            .await;

        assert_eq!(*malformed.lock().unwrap(), 1);
        assert!(inbox.messages.lock().unwrap().is_empty());
        assert!(network.sent().is_empty());
        assert_eq!(node.broadcaster().seen_count(), 0);
    }

    #[tokio::test]
    async fn test_receive_frame() {
        let (node, inbox, _network) = single_node(false, Arc::new(InMemoryRegistry::new()));

        let message = Message::new(1, pid(2), GroupPayload::application(vec![5]).to_json());
        node.receive_frame(&encode_frame(&message).unwrap(), pid(2))
            .await;
        node.receive_frame(b"", pid(2)).await;
        node.receive_frame(&[1, 2, 3], pid(2)).await;

        assert_eq!(inbox.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_authorized_node_exports_itself_on_announce() {
        let registry = Arc::new(InMemoryRegistry::new());
        let (node, _inbox, _network) = single_node(true, registry.clone());
        assert!(registry.lookup("group-service").is_none());

        node.announce().await;

        assert!(node.directory().contains(&pid(1)));
        assert_eq!(registry.lookup("group-service").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_node_announce_is_noop() {
        let registry = Arc::new(InMemoryRegistry::new());
        let (node, _inbox, network) = single_node(false, registry.clone());

        node.announce().await;

        assert!(network.sent().is_empty());
        assert_eq!(registry.live_exports(), 0);
    }

    #[tokio::test]
    async fn test_membership_event_updates_view() {
        let (node, _inbox, _network) = single_node(false, Arc::new(InMemoryRegistry::new()));

        node.on_membership_event(MembershipEvent::joined(pid(2))).await;
        assert_eq!(node.members(), vec![pid(1), pid(2)]);
        assert_eq!(node.broadcaster().members(), vec![pid(1), pid(2)]);

        node.on_membership_event(MembershipEvent::left(pid(2))).await;
        assert_eq!(node.broadcaster().members(), vec![pid(1)]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_multicast() {
        let (node, _inbox, _network) = single_node(true, Arc::new(InMemoryRegistry::new()));
        node.shutdown().await;

        assert!(node.multicast(vec![1]).await.is_err());
    }
}
