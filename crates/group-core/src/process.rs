//! Process port: the local application endpoint the broadcaster delivers into.

use crate::{Message, ProcessId};
use async_trait::async_trait;
use std::sync::Arc;

/// The local process as seen by the broadcaster.
#[async_trait]
pub trait Process: Send + Sync {
    /// Identifier of this process within the group
    fn local_id(&self) -> ProcessId;

    /// Hand a message to the application. Called at most once per message identity.
    async fn deliver(&self, message: Message);
}

#[async_trait]
impl<T: Process + ?Sized> Process for Arc<T> {
    fn local_id(&self) -> ProcessId {
        (**self).local_id()
    }

    async fn deliver(&self, message: Message) {
        (**self).deliver(message).await
    }
}
