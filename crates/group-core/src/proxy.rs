//! Routable proxy over the known replicas, and its export at a well-known name.
//!
//! The export runtime is abstracted as a [`Publisher`]: `publish` binds a proxy
//! under a lookup name and returns a handle, `unpublish` releases the handle.
//! [`ProxyExport`] owns the current handle and guarantees the previous export
//! is released whenever it is replaced.
//!
//! Implementations:
//! - `InMemoryRegistry` - lookup registry for tests and simulation

use crate::{ProcessId, ServiceReference};
use async_trait::async_trait;
use futures::lock::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("No replicas known")]
    NoReplicas,

    #[error("Replica unreachable: {0}")]
    Unreachable(ProcessId),

    #[error("Remote call failed: {0}")]
    Remote(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Export not found: {0}")]
    NotFound(Uuid),

    #[error("Publish rejected: {0}")]
    Rejected(String),
}

/// Callable handle that forwards client operations to one of the known replicas.
///
/// Immutable: a directory change produces a new proxy rather than mutating this one.
#[derive(Debug, Clone, Default)]
pub struct ServiceProxy {
    replicas: Vec<ServiceReference>,
}

impl ServiceProxy {
    pub fn new(replicas: Vec<ServiceReference>) -> Self {
        Self { replicas }
    }

    pub fn replicas(&self) -> &[ServiceReference] {
        &self.replicas
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Pick a replica for the next call. Any entry will do: replicas are
    /// assumed to converge through the broadcaster.
    pub fn route(&self) -> Option<&ServiceReference> {
        use rand::seq::IndexedRandom;

        self.replicas.choose(&mut rand::rng())
    }

    /// Forward one client operation.
    ///
    /// Replicas are tried in random order. An `Unreachable` failure moves on to
    /// the next replica; any other result is returned as is. If every replica is
    /// unreachable, the last error is returned.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, ProxyError>
    where
        F: FnMut(ServiceReference) -> Fut,
        Fut: Future<Output = Result<T, ProxyError>>,
    {
        use rand::seq::SliceRandom;

        let mut order = self.replicas.clone();
        order.shuffle(&mut rand::rng());

        let mut last_error = ProxyError::NoReplicas;
        for replica in order {
            let owner = replica.owner;
            match op(replica).await {
                Err(ProxyError::Unreachable(id)) => {
                    debug!(replica = %owner, "Replica unreachable, trying next");
                    last_error = ProxyError::Unreachable(id);
                }
                result => return result,
            }
        }
        Err(last_error)
    }
}

/// Handle on one published proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportHandle {
    pub id: Uuid,
    pub name: String,
}

/// Export runtime that makes a proxy reachable under a lookup name.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Bind `proxy` under `name`, replacing whatever was bound there.
    async fn publish(
        &self,
        name: &str,
        proxy: Arc<ServiceProxy>,
    ) -> Result<ExportHandle, PublishError>;

    /// Release an export. The name stays bound if a newer export replaced it.
    async fn unpublish(&self, handle: &ExportHandle) -> Result<(), PublishError>;
}

/// In-process lookup registry.
///
/// Several processes may publish under one name. The newest live export is
/// the one bound; releasing it falls back to the next newest still live.
#[derive(Default)]
pub struct InMemoryRegistry {
    /// name -> live exports, oldest first
    bindings: RwLock<HashMap<String, Vec<(Uuid, Arc<ServiceProxy>)>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the proxy currently bound under `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<ServiceProxy>> {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .and_then(|exports| exports.last())
            .map(|(_, proxy)| Arc::clone(proxy))
    }

    /// Number of exports not yet released, across all names.
    pub fn live_exports(&self) -> usize {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl Publisher for InMemoryRegistry {
    async fn publish(
        &self,
        name: &str,
        proxy: Arc<ServiceProxy>,
    ) -> Result<ExportHandle, PublishError> {
        if name.is_empty() {
            return Err(PublishError::Rejected("empty lookup name".to_string()));
        }

        let id = Uuid::new_v4();
        self.bindings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .push((id, proxy));

        Ok(ExportHandle {
            id,
            name: name.to_string(),
        })
    }

    async fn unpublish(&self, handle: &ExportHandle) -> Result<(), PublishError> {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        let exports = bindings
            .get_mut(&handle.name)
            .ok_or(PublishError::NotFound(handle.id))?;
        let position = exports
            .iter()
            .position(|(id, _)| *id == handle.id)
            .ok_or(PublishError::NotFound(handle.id))?;

        exports.remove(position);
        if exports.is_empty() {
            bindings.remove(&handle.name);
        }
        Ok(())
    }
}

/// The current export of this process's proxy.
///
/// Replacement publishes the new proxy first, so the lookup name never
/// resolves to nothing, then releases the old export.
pub struct ProxyExport {
    publisher: Arc<dyn Publisher>,
    name: String,
    current: Mutex<Option<ExportHandle>>,
}

impl ProxyExport {
    pub fn new(publisher: Arc<dyn Publisher>, name: impl Into<String>) -> Self {
        Self {
            publisher,
            name: name.into(),
            current: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle of the live export, if any.
    pub async fn current(&self) -> Option<ExportHandle> {
        self.current.lock().await.clone()
    }

    /// Export `proxy` and release the previous export.
    pub async fn replace(&self, proxy: Arc<ServiceProxy>) -> Result<ExportHandle, PublishError> {
        let mut current = self.current.lock().await;

        let replicas = proxy.len();
        let handle = self.publisher.publish(&self.name, proxy).await?;
        info!(name = %self.name, export = %handle.id, replicas, "Proxy exported");

        if let Some(previous) = current.replace(handle.clone())
            && let Err(e) = self.publisher.unpublish(&previous).await
        {
            warn!(export = %previous.id, error = %e, "Failed to release previous export");
        }
        Ok(handle)
    }

    /// Release the live export, if any.
    pub async fn release(&self) -> Result<(), PublishError> {
        let mut current = self.current.lock().await;
        if let Some(handle) = current.take() {
            self.publisher.unpublish(&handle).await?;
            info!(name = %self.name, export = %handle.id, "Proxy export released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u64) -> ProcessId {
        ProcessId::from(n)
    }

    fn proxy_of(ids: &[u64]) -> Arc<ServiceProxy> {
        Arc::new(ServiceProxy::new(
            ids.iter()
                .map(|n| ServiceReference::new(pid(*n), format!("rpc://server-{n}")))
                .collect(),
        ))
    }

    #[test]
    fn test_route_picks_a_known_replica() {
        let proxy = proxy_of(&[1, 2, 3]);
        for _ in 0..20 {
            let routed = proxy.route().unwrap();
            assert!(proxy.replicas().contains(routed));
        }
        assert!(ServiceProxy::default().route().is_none());
    }

    #[tokio::test]
    async fn test_call_skips_unreachable_replicas() {
        let proxy = proxy_of(&[1, 2, 3]);

        let result = proxy
            .call(|replica| async move {
                if replica.owner == pid(2) {
                    Ok(replica.endpoint)
                } else {
                    Err(ProxyError::Unreachable(replica.owner))
                }
            })
            .await;

        assert_eq!(result.unwrap(), "rpc://server-2");
    }

    #[tokio::test]
    async fn test_call_returns_remote_errors_without_retry() {
        let proxy = proxy_of(&[1, 2]);
        let mut attempts = 0;

        let result: Result<(), _> = proxy
            .call(|_| {
                attempts += 1;
                async { Err(ProxyError::Remote("game not found".into())) }
            })
            .await;

        assert!(matches!(result, Err(ProxyError::Remote(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_call_with_no_replicas() {
        let result: Result<(), _> = ServiceProxy::default().call(|_| async { Ok(()) }).await;
        assert!(matches!(result, Err(ProxyError::NoReplicas)));
    }

    #[tokio::test]
    async fn test_call_all_unreachable() {
        let proxy = proxy_of(&[1, 2]);
        let result: Result<(), _> = proxy
            .call(|r| async move { Err(ProxyError::Unreachable(r.owner)) })
            .await;
        assert!(matches!(result, Err(ProxyError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_registry_publish_and_lookup() {
        let registry = InMemoryRegistry::new();
        let handle = registry.publish("lobby", proxy_of(&[1])).await.unwrap();

        assert_eq!(handle.name, "lobby");
        assert_eq!(registry.lookup("lobby").unwrap().len(), 1);
        assert!(registry.lookup("other").is_none());

        registry.unpublish(&handle).await.unwrap();
        assert!(registry.lookup("lobby").is_none());
        assert!(matches!(
            registry.unpublish(&handle).await,
            Err(PublishError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_rejects_empty_name() {
        let registry = InMemoryRegistry::new();
        assert!(registry.publish("", proxy_of(&[1])).await.is_err());
    }

    #[tokio::test]
    async fn test_unpublishing_stale_export_keeps_newer_binding() {
        let registry = InMemoryRegistry::new();
        let old = registry.publish("lobby", proxy_of(&[1])).await.unwrap();
        let _new = registry.publish("lobby", proxy_of(&[1, 2])).await.unwrap();

        registry.unpublish(&old).await.unwrap();
        assert_eq!(registry.lookup("lobby").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_releasing_newest_export_falls_back_to_older_one() {
        let registry = InMemoryRegistry::new();
        let older = registry.publish("lobby", proxy_of(&[1])).await.unwrap();
        let newer = registry.publish("lobby", proxy_of(&[1, 2])).await.unwrap();

        registry.unpublish(&newer).await.unwrap();
        assert_eq!(registry.lookup("lobby").unwrap().len(), 1);
        assert_eq!(registry.live_exports(), 1);

        registry.unpublish(&older).await.unwrap();
        assert!(registry.lookup("lobby").is_none());
    }

    #[tokio::test]
    async fn test_export_replace_releases_previous() {
        let registry = Arc::new(InMemoryRegistry::new());
        let export = ProxyExport::new(registry.clone(), "lobby");

        let first = export.replace(proxy_of(&[1])).await.unwrap();
        let second = export.replace(proxy_of(&[1, 2])).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(registry.live_exports(), 1);
        assert_eq!(registry.lookup("lobby").unwrap().len(), 2);
        assert_eq!(export.current().await, Some(second));
    }

    #[tokio::test]
    async fn test_export_release() {
        let registry = Arc::new(InMemoryRegistry::new());
        let export = ProxyExport::new(registry.clone(), "lobby");

        export.replace(proxy_of(&[1])).await.unwrap();
        export.release().await.unwrap();
        export.release().await.unwrap();

        assert_eq!(registry.live_exports(), 0);
        assert!(registry.lookup("lobby").is_none());
        assert!(export.current().await.is_none());
    }
}
