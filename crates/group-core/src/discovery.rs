//! Membership-driven discovery of service references.
//!
//! # Protocol
//!
//! 1. A peer joins (not self-originated) → multicast a `ReferenceRequest` to the group.
//! 2. An authorized process receiving a request → multicast its own
//!    `ReferenceAnnouncement`. Unauthorized processes ignore requests.
//! 3. Every process receiving an announcement records it in its directory.
//!    If the directory changed and the local process is authorized, it exports
//!    a fresh proxy over all known references at the lookup name.
//! 4. A peer leaves (not self-originated) → its directory entry is pruned
//!    (configurable), which may trigger another rebuild.
//!
//! Requests and announcements ride the same best-effort broadcaster: a lost
//! announcement only delays convergence until the next membership event.
//! There is no timeout or retry.

use crate::events::{EventBus, GroupEvent};
use crate::proxy::{ProxyExport, Publisher};
use crate::{
    GroupPayload, GroupSender, MembershipEvent, ProcessId, ReferenceDirectory, ServiceReference,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, Instrument, Span};

/// Default lookup name the proxy is exported under.
pub const DEFAULT_LOOKUP_NAME: &str = "group-service";

/// Discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// Whether this process may expose its reference and own the proxy export
    #[serde(default)]
    pub authorized: bool,

    /// Name the proxy is exported under
    #[serde(default = "default_lookup_name")]
    pub lookup_name: String,

    /// Drop a departed member's reference on leave
    #[serde(default = "default_true")]
    pub prune_on_leave: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            authorized: false,
            lookup_name: default_lookup_name(),
            prune_on_leave: true,
        }
    }
}

fn default_lookup_name() -> String {
    DEFAULT_LOOKUP_NAME.to_string()
}

fn default_true() -> bool {
    true
}

/// Keeps the reference directory current in response to membership churn.
pub struct DiscoveryCoordinator {
    local: ProcessId,
    reference: ServiceReference,
    config: DiscoveryConfig,
    sender: Arc<dyn GroupSender>,
    directory: Arc<ReferenceDirectory>,
    export: ProxyExport,
    events: Option<Arc<EventBus>>,
    span: Span,
}

impl DiscoveryCoordinator {
    pub fn new(
        reference: ServiceReference,
        config: DiscoveryConfig,
        sender: Arc<dyn GroupSender>,
        directory: Arc<ReferenceDirectory>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let export = ProxyExport::new(publisher, config.lookup_name.clone());
        Self {
            local: reference.owner,
            reference,
            config,
            sender,
            directory,
            export,
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

    pub fn is_authorized(&self) -> bool {
        self.config.authorized
    }

    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }

    pub fn directory(&self) -> &Arc<ReferenceDirectory> {
        &self.directory
    }

    pub fn export(&self) -> &ProxyExport {
        &self.export
    }

    /// React to a join or leave.
    pub async fn on_membership_event(&self, event: MembershipEvent) {
        let span = self.span.clone();
        async move {
            if event.self_originated {
                debug!(?event, "Ignoring self-originated membership event");
                return;
            }

            if let Some(joined) = event.joined {
                info!(process = %joined, "Process has joined the group");
                self.request_references().await;
            }

            if let Some(left) = event.left {
                info!(process = %left, "Process has left the group");
                if self.config.prune_on_leave && self.directory.remove_reference(left).is_some() {
                    self.emit(GroupEvent::ReferenceRemoved {
                        process: self.local,
                        owner: left,
                    });
                    self.rebuild_proxy().await;
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Answer a reference request with our own reference, if authorized.
    pub async fn on_reference_request(&self, from: ProcessId) {
        let span = self.span.clone();
        async move {
            if !self.config.authorized {
                debug!(from = %from, "Not authorized to export a reference, ignoring request");
                return;
            }
            debug!(from = %from, "Answering reference request");
            self.announce().await;
        }
        .instrument(span)
        .await
    }

    /// Record an announced reference and rebuild the proxy if anything changed.
    pub async fn on_reference_announcement(&self, process: ProcessId, reference: ServiceReference) {
        let span = self.span.clone();
        self.record(process, reference).instrument(span).await
    }

    /// Multicast our own reference. No-op unless authorized.
    ///
    /// Our own reference is recorded directly, since the broadcaster may be
    /// configured not to deliver our multicasts back to us.
    pub async fn announce(&self) {
        if !self.config.authorized {
            return;
        }
        self.record(self.local, self.reference.clone()).await;
        let payload = GroupPayload::announcement(self.reference.clone());
        self.send(payload).await;
    }

    /// Release our proxy export, if any.
    pub async fn shutdown(&self) {
        if let Err(e) = self.export.release().await {
            error!(error = %e, "Failed to release proxy export");
        }
    }

    async fn record(&self, process: ProcessId, reference: ServiceReference) {
        if !self.directory.add_reference(process, reference) {
            debug!(process = %process, "Reference already known");
            return;
        }

        info!(process = %process, known = self.directory.len(), "Learned service reference");
        self.emit(GroupEvent::ReferenceAdded {
            process: self.local,
            owner: process,
        });
        self.rebuild_proxy().await;
    }

    async fn request_references(&self) {
        info!("Asking for service references to refresh proxy");
        self.send(GroupPayload::ReferenceRequest).await;
    }

    async fn send(&self, payload: GroupPayload) {
        let kind = payload.kind();
        let message = match self.sender.next_message(payload.to_json()) {
            Ok(message) => message,
            Err(e) => {
                error!(kind, error = %e, "Cannot create message");
                return;
            }
        };

        match self.sender.multicast(message).await {
            Ok(report) if report.is_complete() => {
                debug!(kind, peers = report.sent.len(), "Multicast complete");
            }
            Ok(report) => {
                info!(
                    kind,
                    sent = report.sent.len(),
                    failed = report.failed.len(),
                    "Multicast reached only part of the group"
                );
            }
            Err(e) => error!(kind, error = %e, "Multicast failed"),
        }
    }

    /// Export a fresh proxy over the whole directory. Authorized processes only.
    async fn rebuild_proxy(&self) {
        if !self.config.authorized {
            return;
        }

        let proxy = Arc::new(self.directory.build_proxy());
        let replicas = proxy.len();
        info!(replicas, "Rebinding proxy");

        match self.export.replace(proxy).await {
            Ok(_) => self.emit(GroupEvent::ProxyRebuilt {
                process: self.local,
                replicas,
            }),
            Err(e) => error!(error = %e, "Failed to export proxy"),
        }
    }

    fn emit(&self, event: GroupEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BroadcastError, FanOutReport, InMemoryRegistry, Message};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Sender that records payloads instead of sending them.
    #[derive(Default)]
    struct CapturingSender {
        next_id: AtomicU64,
        sent: Mutex<Vec<GroupPayload>>,
    }

    impl CapturingSender {
        fn payloads(&self) -> Vec<GroupPayload> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GroupSender for CapturingSender {
        fn next_message(&self, payload: Vec<u8>) -> Result<Message, BroadcastError> {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(Message::new(id, ProcessId::from(1), payload))
        }

        async fn multicast(&self, message: Message) -> Result<FanOutReport, BroadcastError> {
            let payload = GroupPayload::from_json(&message.payload).unwrap();
            self.sent.lock().unwrap().push(payload);
            Ok(FanOutReport::default())
        }
    }

    fn pid(n: u64) -> ProcessId {
        ProcessId::from(n)
    }

    fn reference(n: u64) -> ServiceReference {
        ServiceReference::new(pid(n), format!("rpc://server-{n}"))
    }

    struct Fixture {
        coordinator: DiscoveryCoordinator,
        sender: Arc<CapturingSender>,
        registry: Arc<InMemoryRegistry>,
    }

    fn fixture(authorized: bool) -> Fixture {
        let sender = Arc::new(CapturingSender::default());
        let registry = Arc::new(InMemoryRegistry::new());
        let config = DiscoveryConfig {
            authorized,
            ..Default::default()
        };
        let coordinator = DiscoveryCoordinator::new(
            reference(1),
            config,
            sender.clone(),
            Arc::new(ReferenceDirectory::new()),
            registry.clone(),
        );
        Fixture {
            coordinator,
            sender,
            registry,
        }
    }

    #[tokio::test]
    async fn test_peer_join_requests_references() {
        let f = fixture(false);
        f.coordinator
            .on_membership_event(MembershipEvent::joined(pid(4)))
            .await;

        assert_eq!(f.sender.payloads(), vec![GroupPayload::ReferenceRequest]);
    }

    #[tokio::test]
    async fn test_self_originated_join_ignored() {
        let f = fixture(true);
        f.coordinator
            .on_membership_event(MembershipEvent::joined(pid(1)).from_self())
            .await;

        assert!(f.sender.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_authorized_process_answers_request() {
        let f = fixture(true);
        f.coordinator.on_reference_request(pid(2)).await;

        assert_eq!(
            f.sender.payloads(),
            vec![GroupPayload::announcement(reference(1))]
        );
    }

    #[tokio::test]
    async fn test_announce_records_own_reference() {
        let f = fixture(true);
        f.coordinator.announce().await;

        assert!(f.coordinator.directory().contains(&pid(1)));
        assert_eq!(f.registry.lookup(DEFAULT_LOOKUP_NAME).unwrap().len(), 1);

        // Our announcement coming back changes nothing
        f.coordinator.on_reference_announcement(pid(1), reference(1)).await;
        assert_eq!(f.registry.live_exports(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_process_ignores_request() {
        let f = fixture(false);
        f.coordinator.on_reference_request(pid(2)).await;
        f.coordinator.announce().await;

        assert!(f.sender.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_announcement_rebuilds_proxy_once() {
        let f = fixture(true);
        let name = f.coordinator.export().name().to_string();

        f.coordinator.on_reference_announcement(pid(2), reference(2)).await;
        let first = f.coordinator.export().current().await.unwrap();

        // Same pair again: no redundant re-export
        f.coordinator.on_reference_announcement(pid(2), reference(2)).await;
        assert_eq!(f.coordinator.export().current().await.unwrap(), first);

        f.coordinator.on_reference_announcement(pid(3), reference(3)).await;
        assert_eq!(f.registry.lookup(&name).unwrap().len(), 2);
        assert_eq!(f.registry.live_exports(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_records_but_never_exports() {
        let f = fixture(false);
        f.coordinator.on_reference_announcement(pid(2), reference(2)).await;

        assert!(f.coordinator.directory().contains(&pid(2)));
        assert_eq!(f.registry.live_exports(), 0);
    }

    #[tokio::test]
    async fn test_leave_prunes_and_rebuilds() {
        let f = fixture(true);
        f.coordinator.on_reference_announcement(pid(2), reference(2)).await;
        f.coordinator.on_reference_announcement(pid(3), reference(3)).await;

        f.coordinator
            .on_membership_event(MembershipEvent::left(pid(2)))
            .await;

        assert!(!f.coordinator.directory().contains(&pid(2)));
        let proxy = f.registry.lookup(DEFAULT_LOOKUP_NAME).unwrap();
        assert_eq!(proxy.replicas(), &[reference(3)]);
    }

    #[tokio::test]
    async fn test_leave_without_pruning() {
        let sender = Arc::new(CapturingSender::default());
        let directory = Arc::new(ReferenceDirectory::new());
        let config = DiscoveryConfig {
            authorized: true,
            prune_on_leave: false,
            ..Default::default()
        };
        let coordinator = DiscoveryCoordinator::new(
            reference(1),
            config,
            sender,
            directory.clone(),
            Arc::new(InMemoryRegistry::new()),
        );
        directory.add_reference(pid(2), reference(2));

        coordinator
            .on_membership_event(MembershipEvent::left(pid(2)))
            .await;
        assert!(directory.contains(&pid(2)));
    }

    #[tokio::test]
    async fn test_shutdown_releases_export() {
        let f = fixture(true);
        f.coordinator.on_reference_announcement(pid(1), reference(1)).await;
        assert_eq!(f.registry.live_exports(), 1);

        f.coordinator.shutdown().await;
        assert_eq!(f.registry.live_exports(), 0);
    }
}
