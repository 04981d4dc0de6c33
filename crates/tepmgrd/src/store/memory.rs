use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

use super::{
    encode, CommitId, Datastore, ReadGuard, Record, StagedOp, StoreError, StorePath, StoreResult,
};

/// In-process store used in standalone mode and by tests.
///
/// A commit holds the write lock while it checks its guards and applies the
/// batch, so it is atomic with respect to concurrent readers and committers.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<StorePath, Record>>,
    commits: AtomicU64,
    fail_next_commit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a record directly, bypassing transactions (seeding).
    pub fn put<T: Serialize>(&self, path: &StorePath, value: &T) -> StoreResult<()> {
        let record = encode(path, value)?;
        self.data.write().insert(path.clone(), record);
        Ok(())
    }

    pub fn get(&self, path: &StorePath) -> Option<Record> {
        self.data.read().get(path).cloned()
    }

    pub fn remove(&self, path: &StorePath) -> Option<Record> {
        self.data.write().remove(path)
    }

    /// Keys of one table, in order.
    pub fn keys(&self, table: &str) -> Vec<String> {
        self.data
            .read()
            .keys()
            .filter(|path| path.table() == table)
            .map(|path| path.key().to_string())
            .collect()
    }

    /// Copy of the whole store, for state comparisons.
    pub fn snapshot(&self) -> BTreeMap<StorePath, Record> {
        self.data.read().clone()
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Makes the next commit fail without applying anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn read(&self, path: &StorePath) -> StoreResult<Option<Record>> {
        Ok(self.get(path))
    }

    async fn scan(&self, table: &str) -> StoreResult<Vec<(StorePath, Record)>> {
        Ok(self
            .data
            .read()
            .iter()
            .filter(|(path, _)| path.table() == table)
            .map(|(path, record)| (path.clone(), record.clone()))
            .collect())
    }

    async fn commit(
        &self,
        guards: Vec<ReadGuard>,
        ops: Vec<(StorePath, StagedOp)>,
    ) -> StoreResult<CommitId> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::commit_failed("injected commit failure"));
        }

        let mut data = self.data.write();
        if let Some(stale) = guards.iter().find(|g| !g.holds(data.get(&g.path))) {
            return Err(StoreError::conflict(format!(
                "{} changed since it was read",
                stale.path
            )));
        }
        for (path, op) in ops {
            if let Some(record) = op.apply(data.remove(&path)) {
                data.insert(path, record);
            }
        }
        let id = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CommitId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_commit_applies_all_ops() {
        let store = MemoryStore::new();
        let a = StorePath::new("T", "a");
        let b = StorePath::new("T", "b");
        store.put(&b, &json!({"v": 0})).unwrap();

        let id = store
            .commit(
                Vec::new(),
                vec![
                    (a.clone(), StagedOp::Merge(json!({"v": 1}))),
                    (b.clone(), StagedOp::Delete),
                    (StorePath::new("T", "missing"), StagedOp::Delete),
                ],
            )
            .await
            .unwrap();

        assert_eq!(id, CommitId(1));
        assert_eq!(store.get(&a), Some(json!({"v": 1})));
        assert_eq!(store.get(&b), None);
        assert_eq!(store.scan("T").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_applies_nothing() {
        let store = MemoryStore::new();
        let a = StorePath::new("T", "a");

        store.fail_next_commit();
        let result = store
            .commit(Vec::new(), vec![(a.clone(), StagedOp::Merge(json!({"v": 1})))])
            .await;
        assert!(matches!(result, Err(StoreError::CommitFailed { .. })));
        assert_eq!(store.get(&a), None);
        assert_eq!(store.commit_count(), 0);

        // only the next commit fails
        store
            .commit(Vec::new(), vec![(a.clone(), StagedOp::Merge(json!({"v": 1})))])
            .await
            .unwrap();
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_guard_applies_nothing() {
        let store = MemoryStore::new();
        let a = StorePath::new("T", "a");
        store.put(&a, &json!({"v": 1})).unwrap();

        let stale = ReadGuard {
            path: a.clone(),
            expected: None,
        };
        let result = store
            .commit(
                vec![stale],
                vec![(StorePath::new("T", "b"), StagedOp::Merge(json!({"v": 1})))],
            )
            .await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
        assert_eq!(store.keys("T"), vec!["a".to_string()]);

        let current = ReadGuard {
            path: a.clone(),
            expected: Some(json!({"v": 1})),
        };
        store
            .commit(vec![current], vec![(a.clone(), StagedOp::Delete)])
            .await
            .unwrap();
        assert!(store.get(&a).is_none());
    }
}
