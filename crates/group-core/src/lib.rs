//! group-core: group communication over an unreliable point-to-point transport.
//!
//! This crate provides:
//! - Uniform broadcast by flooding (forward to every peer, then deliver once)
//! - A concurrent dedup store keyed by message identity
//! - Membership-driven discovery of service references
//! - A reference directory that rebuilds a routable proxy on change
//! - Transport, Process and Publisher trait abstractions with in-memory implementations

pub mod broadcast;
pub mod dedup;
pub mod discovery;
pub mod events;
pub mod membership;
pub mod message;
pub mod node;
pub mod process;
pub mod process_id;
pub mod protocol;
pub mod proxy;
pub mod reference;
pub mod transport;

pub use broadcast::{
    BroadcastConfig, BroadcastError, FanOutReport, GroupReceiver, GroupSender, UniformBroadcaster,
};
pub use dedup::DedupStore;
pub use discovery::{DiscoveryConfig, DiscoveryCoordinator};
pub use events::{EventBus, GroupEvent, Subscription};
pub use membership::{MembershipEvent, MembershipView};
pub use message::{DeliveryGuarantee, Message, MessageId, MessageIdentity};
pub use node::{Application, GroupNode, NodeConfig};
pub use process::Process;
pub use process_id::{ProcessId, ProcessIdError};
pub use protocol::{GroupPayload, ProtocolError};
pub use proxy::{
    ExportHandle, InMemoryRegistry, ProxyError, ProxyExport, PublishError, Publisher, ServiceProxy,
};
pub use reference::{ReferenceDirectory, ServiceReference};
pub use transport::{MemoryNetwork, MemoryTransport, SendRecord, Transport, TransportError};
