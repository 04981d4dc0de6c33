//! Unique-name allocator.
//!
//! Ids are handed out per key: allocating the same key again returns the id
//! it already holds. The store-backed implementation persists pool state so
//! tunnel names stay stable across restarts.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::{Datastore, StoreError, Transaction};
use crate::tables::{id_pool_entry_path, id_pool_path};

#[derive(Debug, Clone, Error)]
pub enum IdAllocError {
    #[error("id pool '{pool}' does not exist")]
    PoolNotFound { pool: String },

    #[error("id pool '{pool}' exhausted (range {low}..={high})")]
    PoolExhausted { pool: String, low: u32, high: u32 },

    #[error("invalid id range {low}..={high}")]
    InvalidRange { low: u32, high: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait IdAllocator: Send + Sync {
    /// Returns the id held by `key`, allocating one if needed.
    async fn allocate(&self, pool: &str, key: &str) -> Result<u32, IdAllocError>;

    /// Returns the id held by `key` to the pool. Unknown keys are ignored.
    async fn release(&self, pool: &str, key: &str) -> Result<(), IdAllocError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct IdPoolState {
    low: u32,
    high: u32,
    next: u32,
    #[serde(default)]
    released: BTreeSet<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct IdPoolEntry {
    id: u32,
}

/// Allocator persisting pools in `ID_POOL` and key bindings in
/// `ID_POOL_ENTRY`.
///
/// Each allocation or release is its own commit, serialized by a local
/// lock.
pub struct StoreIdAllocator {
    store: Arc<dyn Datastore>,
    lock: Mutex<()>,
}

impl StoreIdAllocator {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Creates `pool` with ids `low..=high` unless it already exists.
    pub async fn create_pool(&self, pool: &str, low: u32, high: u32) -> Result<(), IdAllocError> {
        if low == 0 || low > high {
            return Err(IdAllocError::InvalidRange { low, high });
        }

        let _guard = self.lock.lock().await;
        let path = id_pool_path(pool);
        let mut txn = Transaction::new(self.store.clone());

        if let Some(existing) = txn.read::<IdPoolState>(&path).await? {
            if existing.low != low || existing.high != high {
                warn!(
                    pool,
                    existing_low = existing.low,
                    existing_high = existing.high,
                    "id pool exists with a different range, keeping it"
                );
            }
            return Ok(());
        }

        txn.merge(
            path,
            &IdPoolState {
                low,
                high,
                next: low,
                released: BTreeSet::new(),
            },
        )?;
        txn.submit().await?;
        info!(pool, low, high, "created id pool");
        Ok(())
    }
}

#[async_trait]
impl IdAllocator for StoreIdAllocator {
    async fn allocate(&self, pool: &str, key: &str) -> Result<u32, IdAllocError> {
        let _guard = self.lock.lock().await;
        let entry_path = id_pool_entry_path(pool, key);
        let mut txn = Transaction::new(self.store.clone());

        if let Some(entry) = txn.read::<IdPoolEntry>(&entry_path).await? {
            return Ok(entry.id);
        }

        let pool_path = id_pool_path(pool);
        let mut state: IdPoolState =
            txn.read(&pool_path)
                .await?
                .ok_or_else(|| IdAllocError::PoolNotFound {
                    pool: pool.to_string(),
                })?;

        let id = if let Some(id) = state.released.pop_first() {
            id
        } else if state.next <= state.high {
            let id = state.next;
            state.next += 1;
            id
        } else {
            return Err(IdAllocError::PoolExhausted {
                pool: pool.to_string(),
                low: state.low,
                high: state.high,
            });
        };

        txn.merge(pool_path, &state)?;
        txn.merge(entry_path, &IdPoolEntry { id })?;
        txn.submit().await?;

        debug!(pool, key, id, "allocated id");
        Ok(id)
    }

    async fn release(&self, pool: &str, key: &str) -> Result<(), IdAllocError> {
        let _guard = self.lock.lock().await;
        let entry_path = id_pool_entry_path(pool, key);
        let mut txn = Transaction::new(self.store.clone());

        let Some(entry) = txn.read::<IdPoolEntry>(&entry_path).await? else {
            return Ok(());
        };

        let pool_path = id_pool_path(pool);
        if let Some(mut state) = txn.read::<IdPoolState>(&pool_path).await? {
            state.released.insert(entry.id);
            txn.merge(pool_path, &state)?;
        }
        txn.delete(entry_path);
        txn.submit().await?;

        debug!(pool, key, id = entry.id, "released id");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    async fn allocator(low: u32, high: u32) -> StoreIdAllocator {
        let alloc = StoreIdAllocator::new(Arc::new(MemoryStore::new()));
        alloc.create_pool("p", low, high).await.unwrap();
        alloc
    }

    #[tokio::test]
    async fn test_allocate_is_idempotent_per_key() {
        let alloc = allocator(1, 100).await;

        let a = alloc.allocate("p", "a").await.unwrap();
        let b = alloc.allocate("p", "b").await.unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(alloc.allocate("p", "a").await.unwrap(), a);
    }

    #[tokio::test]
    async fn test_release_and_reuse() {
        let alloc = allocator(1, 2).await;

        let a = alloc.allocate("p", "a").await.unwrap();
        alloc.allocate("p", "b").await.unwrap();
        assert!(matches!(
            alloc.allocate("p", "c").await,
            Err(IdAllocError::PoolExhausted { .. })
        ));

        alloc.release("p", "a").await.unwrap();
        // releasing twice is harmless
        alloc.release("p", "a").await.unwrap();
        assert_eq!(alloc.allocate("p", "c").await.unwrap(), a);
    }

    #[tokio::test]
    async fn test_unknown_pool_and_bad_range() {
        let alloc = StoreIdAllocator::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            alloc.allocate("missing", "a").await,
            Err(IdAllocError::PoolNotFound { .. })
        ));
        assert!(alloc.create_pool("p", 10, 1).await.is_err());
        assert!(alloc.create_pool("p", 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_pool_survives_new_allocator() {
        let store: Arc<dyn Datastore> = Arc::new(MemoryStore::new());
        let first = StoreIdAllocator::new(store.clone());
        first.create_pool("p", 1, 10).await.unwrap();
        let id = first.allocate("p", "a").await.unwrap();

        let second = StoreIdAllocator::new(store);
        second.create_pool("p", 1, 10).await.unwrap();
        assert_eq!(second.allocate("p", "a").await.unwrap(), id);
        assert_eq!(second.allocate("p", "b").await.unwrap(), id + 1);
    }
}
