//! Simulated group run over the in-memory network.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use group_core::{
    Application, DiscoveryConfig, EventBus, GroupEvent, GroupNode, InMemoryRegistry,
    MembershipEvent, MemoryNetwork, NodeConfig, ProcessId, ServiceReference, Subscription,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::SimConfig;

/// Counts application deliveries per process.
#[derive(Default)]
struct DeliveryLog {
    counts: Mutex<BTreeMap<ProcessId, usize>>,
}

struct DeliveryCounter {
    process: ProcessId,
    log: Arc<DeliveryLog>,
}

#[async_trait]
impl Application for DeliveryCounter {
    async fn on_message(&self, sender: ProcessId, data: Vec<u8>) {
        debug!(
            process = %self.process,
            sender = %sender,
            message = %String::from_utf8_lossy(&data),
            "Application received message"
        );
        *self
            .log
            .counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(self.process)
            .or_default() += 1;
    }
}

/// Protocol counters collected from the event bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    pub forwarded: usize,
    pub duplicates_dropped: usize,
    pub send_failures: usize,
    pub malformed: usize,
    pub proxy_rebuilds: usize,
}

impl EventCounts {
    fn record(&mut self, event: &GroupEvent) {
        match event {
            GroupEvent::MessageForwarded { .. } => self.forwarded += 1,
            GroupEvent::DuplicateDropped { .. } => self.duplicates_dropped += 1,
            GroupEvent::SendFailed { .. } => self.send_failures += 1,
            GroupEvent::MalformedMessage { .. } => self.malformed += 1,
            GroupEvent::ProxyRebuilt { .. } => self.proxy_rebuilds += 1,
            _ => {}
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    /// Application messages multicast
    pub multicasts: usize,
    /// Application messages delivered, per process
    pub deliveries: BTreeMap<ProcessId, usize>,
    /// Known references, per process
    pub directories: BTreeMap<ProcessId, usize>,
    /// Replicas behind the proxy bound at the lookup name
    pub exported_replicas: Option<usize>,
    /// Replica a client call would be routed to
    pub routed: Option<ServiceReference>,
    /// Exports still live after every process shut down
    pub leaked_exports: usize,
    pub events: EventCounts,
}

impl SimReport {
    /// Whether every process delivered every multicast exactly once.
    pub fn is_uniform(&self) -> bool {
        self.deliveries.values().all(|n| *n == self.multicasts)
    }
}

impl Display for SimReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "multicasts: {}", self.multicasts)?;
        for (process, delivered) in &self.deliveries {
            let known = self.directories.get(process).copied().unwrap_or_default();
            writeln!(
                f,
                "  {process}: delivered {delivered}, knows {known} reference(s)"
            )?;
        }
        match (&self.exported_replicas, &self.routed) {
            (Some(replicas), Some(routed)) => {
                writeln!(f, "proxy: {replicas} replica(s), routed to {routed}")?
            }
            (Some(replicas), None) => writeln!(f, "proxy: {replicas} replica(s)")?,
            _ => writeln!(f, "proxy: not exported")?,
        }
        writeln!(
            f,
            "forwarded: {}, duplicates dropped: {}, send failures: {}, proxy rebuilds: {}",
            self.events.forwarded,
            self.events.duplicates_dropped,
            self.events.send_failures,
            self.events.proxy_rebuilds
        )?;
        write!(f, "leaked exports: {}", self.leaked_exports)
    }
}

/// A process group living in one address space.
pub struct Simulation {
    config: SimConfig,
    network: Arc<MemoryNetwork>,
    registry: Arc<InMemoryRegistry>,
    events: Arc<EventBus>,
    deliveries: Arc<DeliveryLog>,
    counts: Arc<Mutex<EventCounts>>,
    nodes: BTreeMap<ProcessId, Arc<GroupNode>>,
    _subscription: Subscription,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate().context("Invalid simulation config")?;

        let events = Arc::new(EventBus::new());
        let counts = Arc::new(Mutex::new(EventCounts::default()));
        let sink = counts.clone();
        let subscription = events.subscribe(move |event| {
            sink.lock().unwrap_or_else(|e| e.into_inner()).record(&event);
        });

        Ok(Self {
            config,
            network: MemoryNetwork::new(),
            registry: Arc::new(InMemoryRegistry::new()),
            events,
            deliveries: Arc::new(DeliveryLog::default()),
            counts,
            nodes: BTreeMap::new(),
            _subscription: subscription,
        })
    }

    /// Run the configured scenario to completion.
    pub async fn run(mut self) -> Result<SimReport> {
        let last = self.config.processes;
        let founders = if self.config.join { last - 1 } else { last };

        let members: Vec<ProcessId> = (1..=founders).map(ProcessId::from).collect();
        for n in 1..=founders {
            self.spawn(n, members.clone());
        }
        for cut in &self.config.fail_links {
            let to = ProcessId::from(cut.to);
            match cut.from {
                Some(from) => self.network.cut_link(ProcessId::from(from), to),
                None => self.network.cut_to(to),
            }
        }
        info!(processes = founders, "Group started");

        for node in self.nodes.values() {
            node.announce().await;
        }

        if self.config.join {
            self.join(last).await;
        }

        let senders: Vec<Arc<GroupNode>> = self.nodes.values().cloned().collect();
        for i in 0..self.config.messages {
            let sender = &senders[i % senders.len()];
            let report = sender
                .multicast(format!("message {i} from {}", sender.local_id()))
                .await
                .context("Multicast failed")?;
            debug!(
                sender = %sender.local_id(),
                sent = report.sent.len(),
                failed = report.failed.len(),
                "Multicast finished"
            );
        }

        let report = self.report().await;
        info!(uniform = report.is_uniform(), "Simulation finished");
        Ok(report)
    }

    fn spawn(&mut self, n: u64, members: Vec<ProcessId>) -> Arc<GroupNode> {
        let id = ProcessId::from(n);
        let config = NodeConfig {
            broadcast: self.config.broadcast.clone(),
            discovery: DiscoveryConfig {
                authorized: self.config.is_authorized(n),
                lookup_name: self.config.lookup_name.clone(),
                ..Default::default()
            },
        };
        let node = GroupNode::with_events(
            ServiceReference::new(id, format!("sim://process-{n}")),
            config,
            Arc::new(self.network.transport_for(id)),
            members,
            self.registry.clone(),
            Arc::new(DeliveryCounter {
                process: id,
                log: self.deliveries.clone(),
            }),
            self.events.clone(),
        );
        self.network.register(id, node.clone());
        self.nodes.insert(id, node.clone());
        node
    }

    /// Start process `n` with the full view, then report its join to everyone.
    async fn join(&mut self, n: u64) {
        let id = ProcessId::from(n);
        let everyone: Vec<ProcessId> = (1..=n).map(ProcessId::from).collect();
        let newcomer = self.spawn(n, everyone);
        newcomer.announce().await;
        info!(process = %id, "Process joining");

        for node in self.nodes.values() {
            let event = if node.local_id() == id {
                MembershipEvent::joined(id).from_self()
            } else {
                MembershipEvent::joined(id)
            };
            node.on_membership_event(event).await;
        }
    }

    async fn report(&self) -> SimReport {
        let lookup = self.registry.lookup(&self.config.lookup_name);
        let exported_replicas = lookup.as_ref().map(|proxy| proxy.len());
        let routed = lookup.as_ref().and_then(|proxy| proxy.route().cloned());

        let delivered = self
            .deliveries
            .counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let deliveries = self
            .nodes
            .keys()
            .map(|id| (*id, delivered.get(id).copied().unwrap_or_default()))
            .collect();
        let directories = self
            .nodes
            .iter()
            .map(|(id, node)| (*id, node.directory().len()))
            .collect();

        for node in self.nodes.values() {
            node.shutdown().await;
        }

        SimReport {
            multicasts: self.config.messages,
            deliveries,
            directories,
            exported_replicas,
            routed,
            leaked_exports: self.registry.live_exports(),
            events: self.counts.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }
}
