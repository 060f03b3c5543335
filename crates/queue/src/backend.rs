use std::collections::VecDeque;

use {async_trait::async_trait, tokio::sync::Mutex};

use crate::error::Result;

/// A list-like store holding opaque encoded items.
///
/// `pop` must remove and return the oldest item atomically: once it returns
/// an item no other caller can observe it.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push(&self, item: Vec<u8>) -> Result<()>;

    async fn pop(&self) -> Result<Option<Vec<u8>>>;

    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Process-local backend, used in tests and single-binary development runs.
#[derive(Default)]
pub struct MemoryBackend {
    items: Mutex<VecDeque<Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push(&self, item: Vec<u8>) -> Result<()> {
        self.items.lock().await.push_back(item);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.items.lock().await.pop_front())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.items.lock().await.len())
    }
}
