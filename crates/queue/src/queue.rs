use std::{path::Path, sync::Arc};

use {
    serde::{Deserialize, Serialize},
    tracing::trace,
};

use crate::{
    backend::{MemoryBackend, QueueBackend},
    durable::SledBackend,
    error::{QueueError, Result},
};

/// A pending history sync payload. The payload bytes are never inspected by
/// the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySyncItem {
    pub instance_id: String,
    pub payload: Vec<u8>,
}

impl HistorySyncItem {
    pub fn new(instance_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            instance_id: instance_id.into(),
            payload,
        }
    }
}

/// The named history sync channel.
#[derive(Clone)]
pub struct HistorySyncQueue {
    name: String,
    backend: Arc<dyn QueueBackend>,
}

impl HistorySyncQueue {
    pub fn new(name: impl Into<String>, backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    /// Durable queue stored in the sled database at `path`.
    pub fn open(path: &Path, name: &str) -> Result<Self> {
        Ok(Self::new(name, Arc::new(SledBackend::open(path, name)?)))
    }

    pub fn in_memory(name: &str) -> Self {
        Self::new(name, Arc::new(MemoryBackend::new()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an item to the tail.
    pub async fn push(&self, item: &HistorySyncItem) -> Result<()> {
        let bytes = postcard::to_allocvec(item).map_err(QueueError::Encode)?;
        trace!(
            queue = %self.name,
            instance_id = %item.instance_id,
            bytes = bytes.len(),
            "enqueue history sync item"
        );
        self.backend.push(bytes).await
    }

    /// Remove and return the oldest item, or `None` when the queue is empty.
    pub async fn pop(&self) -> Result<Option<HistorySyncItem>> {
        let Some(bytes) = self.backend.pop().await? else {
            return Ok(None);
        };
        postcard::from_bytes(&bytes)
            .map(Some)
            .map_err(QueueError::Corrupt)
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.backend.is_empty().await
    }
}
