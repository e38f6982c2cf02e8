//! Transport trait for point-to-point sends between group members.
//!
//! Implementations:
//! - `MemoryNetwork` / `MemoryTransport` - in-process network for tests and simulation,
//!   with per-link failure injection and a send log

use crate::{GroupReceiver, Message, MessageIdentity, ProcessId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Process unreachable: {0}")]
    Unreachable(ProcessId),

    /// The destination was registered once and has since left
    #[error("Process closed: {0}")]
    Closed(ProcessId),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Unreliable point-to-point transport.
///
/// A failed send is a signal about one destination, not a fatal error.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a single destination
    async fn unicast(&self, message: &Message, destination: ProcessId) -> Result<()>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn unicast(&self, message: &Message, destination: ProcessId) -> Result<()> {
        (**self).unicast(message, destination).await
    }
}

/// One attempted send recorded by the in-memory network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRecord {
    pub from: ProcessId,
    pub to: ProcessId,
    pub message: Message,
    pub succeeded: bool,
}

impl SendRecord {
    pub fn identity(&self) -> MessageIdentity {
        self.message.identity()
    }
}

/// In-process network connecting group members by direct calls.
///
/// Each registered receiver gets messages synchronously inside the sender's
/// `unicast` call. Links can be cut in either direction to simulate
/// unreachable peers.
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<ProcessId, Arc<dyn GroupReceiver>>>,
    /// Cut links as (from, to); `None` source means every sender
    cut: RwLock<HashSet<(Option<ProcessId>, ProcessId)>>,
    closed: RwLock<HashSet<ProcessId>>,
    log: Mutex<Vec<SendRecord>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a receiver for the given process.
    pub fn register(&self, id: ProcessId, receiver: Arc<dyn GroupReceiver>) {
        self.endpoints
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, receiver);
        self.closed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Detach a process. Later sends to it fail as closed.
    pub fn unregister(&self, id: ProcessId) -> bool {
        let removed = self
            .endpoints
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            self.closed
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id);
        }
        removed
    }

    /// Create the transport a given process uses to send.
    pub fn transport_for(self: &Arc<Self>, local: ProcessId) -> MemoryTransport {
        MemoryTransport {
            network: Arc::clone(self),
            local,
        }
    }

    /// Make every send to `to` fail.
    pub fn cut_to(&self, to: ProcessId) {
        self.cut
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((None, to));
    }

    /// Make sends from `from` to `to` fail.
    pub fn cut_link(&self, from: ProcessId, to: ProcessId) {
        self.cut
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((Some(from), to));
    }

    /// Restore all cut links.
    pub fn heal(&self) {
        self.cut.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// All sends attempted so far, in order.
    pub fn sent(&self) -> Vec<SendRecord> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn is_cut(&self, from: ProcessId, to: ProcessId) -> bool {
        let cut = self.cut.read().unwrap_or_else(|e| e.into_inner());
        cut.contains(&(None, to)) || cut.contains(&(Some(from), to))
    }

    fn is_closed(&self, id: ProcessId) -> bool {
        self.closed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }

    fn endpoint(&self, id: ProcessId) -> Option<Arc<dyn GroupReceiver>> {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn record(&self, from: ProcessId, to: ProcessId, message: &Message, succeeded: bool) {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SendRecord {
                from,
                to,
                message: message.clone(),
                succeeded,
            });
    }
}

/// A process's handle onto a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: ProcessId,
}

impl MemoryTransport {
    pub fn local_id(&self) -> ProcessId {
        self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn unicast(&self, message: &Message, destination: ProcessId) -> Result<()> {
        let endpoint = if self.network.is_cut(self.local, destination) {
            None
        } else {
            self.network.endpoint(destination)
        };

        let Some(receiver) = endpoint else {
            self.network.record(self.local, destination, message, false);
            if self.network.is_closed(destination) {
                return Err(TransportError::Closed(destination));
            }
            return Err(TransportError::Unreachable(destination));
        };

        self.network.record(self.local, destination, message, true);
        receiver.receive(message.clone(), self.local).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Inbox {
        received: Mutex<Vec<(Message, ProcessId)>>,
    }

    #[async_trait]
    impl GroupReceiver for Inbox {
        async fn receive(&self, message: Message, from: ProcessId) {
            self.received.lock().unwrap().push((message, from));
        }
    }

    fn pid(n: u64) -> ProcessId {
        ProcessId::from(n)
    }

    #[tokio::test]
    async fn test_unicast_reaches_registered_receiver() {
        let network = MemoryNetwork::new();
        let inbox = Arc::new(Inbox::default());
        network.register(pid(2), inbox.clone());

        let transport = network.transport_for(pid(1));
        let msg = Message::new(1, pid(1), b"hi".to_vec());
        transport.unicast(&msg, pid(2)).await.unwrap();

        let received = inbox.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, msg);
        assert_eq!(received[0].1, pid(1));
    }

    #[tokio::test]
    async fn test_unicast_to_unknown_process_fails() {
        let network = MemoryNetwork::new();
        let transport = network.transport_for(pid(1));

        let msg = Message::new(1, pid(1), vec![]);
        let result = transport.unicast(&msg, pid(9)).await;

        assert!(matches!(result, Err(TransportError::Unreachable(id)) if id == pid(9)));
        assert!(!network.sent()[0].succeeded);
    }

    #[tokio::test]
    async fn test_cut_link_is_directional() {
        let network = MemoryNetwork::new();
        let inbox = Arc::new(Inbox::default());
        network.register(pid(3), inbox.clone());
        network.cut_link(pid(1), pid(3));

        let msg = Message::new(1, pid(1), vec![]);
        assert!(network.transport_for(pid(1)).unicast(&msg, pid(3)).await.is_err());
        assert!(network.transport_for(pid(2)).unicast(&msg, pid(3)).await.is_ok());

        network.heal();
        assert!(network.transport_for(pid(1)).unicast(&msg, pid(3)).await.is_ok());
        assert_eq!(inbox.received.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unregistered_process_is_closed() {
        let network = MemoryNetwork::new();
        network.register(pid(2), Arc::new(Inbox::default()));
        assert!(network.unregister(pid(2)));
        assert!(!network.unregister(pid(2)));

        let transport = network.transport_for(pid(1));
        let msg = Message::new(1, pid(1), vec![]);
        let result = transport.unicast(&msg, pid(2)).await;
        assert!(matches!(result, Err(TransportError::Closed(id)) if id == pid(2)));

        // Coming back reopens it
        network.register(pid(2), Arc::new(Inbox::default()));
        assert!(transport.unicast(&msg, pid(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_log_keeps_message() {
        let network = MemoryNetwork::new();
        network.register(pid(2), Arc::new(Inbox::default()));

        let msg = Message::new(4, pid(1), b"payload".to_vec());
        network.transport_for(pid(1)).unicast(&msg, pid(2)).await.unwrap();

        let sent = network.sent();
        assert_eq!(sent[0].message, msg);
        assert_eq!(sent[0].identity(), msg.identity());
    }
}
