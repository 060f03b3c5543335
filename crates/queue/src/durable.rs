//! sled-backed queue channel.
//!
//! Each channel is a sled tree keyed by big-endian ids from the database's
//! monotonic id generator, so key order is insertion order and `pop_min`
//! yields the oldest item.

use std::path::Path;

use {async_trait::async_trait, tracing::debug};

use crate::{backend::QueueBackend, error::Result};

pub struct SledBackend {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledBackend {
    /// Open (or create) the database at `path` and the channel `name` in it.
    pub fn open(path: &Path, name: &str) -> Result<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(name)?;
        debug!(path = %path.display(), channel = name, pending = tree.len(), "opened queue");
        Ok(Self { db, tree })
    }

    /// A throwaway database removed when dropped.
    pub fn temporary(name: &str) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree(name)?;
        Ok(Self { db, tree })
    }
}

#[async_trait]
impl QueueBackend for SledBackend {
    async fn push(&self, item: Vec<u8>) -> Result<()> {
        let id = self.db.generate_id()?;
        self.tree.insert(id.to_be_bytes(), item)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Vec<u8>>> {
        let Some((_, value)) = self.tree.pop_min()? else {
            return Ok(None);
        };
        self.tree.flush_async().await?;
        Ok(Some(value.to_vec()))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.tree.len())
    }
}
