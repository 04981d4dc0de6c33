use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{
    decode, encode, merge_records, CommitId, Datastore, ReadGuard, Record, StagedOp, StorePath,
    StoreResult,
};

/// Write batch for one pass.
///
/// Reads go through the staged operations first, so a record deleted or
/// merged earlier in the pass is seen in its staged state. Nothing reaches
/// the store until [`Transaction::submit`], which issues exactly one commit.
///
/// The first value read from the store at each path is remembered and sent
/// with the commit as a [`ReadGuard`]; later reads of that path return the
/// remembered value.
pub struct Transaction {
    store: Arc<dyn Datastore>,
    staged: BTreeMap<StorePath, StagedOp>,
    observed: BTreeMap<StorePath, Option<Record>>,
}

impl Transaction {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self {
            store,
            staged: BTreeMap::new(),
            observed: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn staged(&self, path: &StorePath) -> Option<&StagedOp> {
        self.staged.get(path)
    }

    /// Number of store values this pass depends on.
    pub fn guard_count(&self) -> usize {
        self.observed.len()
    }

    pub async fn read_raw(&mut self, path: &StorePath) -> StoreResult<Option<Record>> {
        match self.staged.get(path) {
            Some(StagedOp::Delete) => return Ok(None),
            Some(StagedOp::Replace(record)) => return Ok(Some(record.clone())),
            _ => {}
        }
        let base = self.observe(path).await?;
        Ok(match self.staged.get(path) {
            Some(op) => op.apply(base),
            None => base,
        })
    }

    async fn observe(&mut self, path: &StorePath) -> StoreResult<Option<Record>> {
        if let Some(seen) = self.observed.get(path) {
            return Ok(seen.clone());
        }
        let current = self.store.read(path).await?;
        self.observed.insert(path.clone(), current.clone());
        Ok(current)
    }

    pub async fn read<T: DeserializeOwned>(&mut self, path: &StorePath) -> StoreResult<Option<T>> {
        self.read_raw(path)
            .await?
            .map(|record| decode(path, record))
            .transpose()
    }

    /// Stages a merge of `value` into `path`.
    ///
    /// A merge after a staged delete becomes a replace, so fields of the
    /// deleted record do not resurface.
    pub fn merge<T: Serialize>(&mut self, path: StorePath, value: &T) -> StoreResult<()> {
        let update = encode(&path, value)?;
        let op = match self.staged.remove(&path) {
            None => StagedOp::Merge(update),
            Some(StagedOp::Delete) => StagedOp::Replace(update),
            Some(StagedOp::Merge(prev)) => StagedOp::Merge(merge_records(Some(prev), &update)),
            Some(StagedOp::Replace(prev)) => StagedOp::Replace(merge_records(Some(prev), &update)),
        };
        self.staged.insert(path, op);
        Ok(())
    }

    pub fn delete(&mut self, path: StorePath) {
        self.staged.insert(path, StagedOp::Delete);
    }

    pub async fn submit(self) -> StoreResult<CommitId> {
        let guards: Vec<ReadGuard> = self
            .observed
            .into_iter()
            .map(|(path, expected)| ReadGuard { path, expected })
            .collect();
        let ops: Vec<(StorePath, StagedOp)> = self.staged.into_iter().collect();
        debug!(
            operations = ops.len(),
            guards = guards.len(),
            "submitting transaction"
        );
        self.store.commit(guards, ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn path(key: &str) -> StorePath {
        StorePath::new("T", key)
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let store = Arc::new(MemoryStore::new());
        store.put(&path("a"), &json!({"x": 1, "y": 1})).unwrap();

        let mut txn = Transaction::new(store.clone());
        txn.merge(path("a"), &json!({"y": 2})).unwrap();
        assert_eq!(
            txn.read_raw(&path("a")).await.unwrap(),
            Some(json!({"x": 1, "y": 2}))
        );

        txn.delete(path("a"));
        assert_eq!(txn.read_raw(&path("a")).await.unwrap(), None);

        // store untouched until submit
        assert_eq!(store.get(&path("a")), Some(json!({"x": 1, "y": 1})));
    }

    #[tokio::test]
    async fn test_merge_after_delete_replaces() {
        let store = Arc::new(MemoryStore::new());
        store.put(&path("a"), &json!({"old": true})).unwrap();

        let mut txn = Transaction::new(store.clone());
        txn.delete(path("a"));
        txn.merge(path("a"), &json!({"new": true})).unwrap();
        assert!(matches!(txn.staged(&path("a")), Some(StagedOp::Replace(_))));

        txn.submit().await.unwrap();
        assert_eq!(store.get(&path("a")), Some(json!({"new": true})));
    }

    #[tokio::test]
    async fn test_changed_read_rejects_commit() {
        let store = Arc::new(MemoryStore::new());
        store.put(&path("a"), &json!({"v": 1})).unwrap();

        let mut first = Transaction::new(store.clone());
        let mut second = Transaction::new(store.clone());
        assert!(first.read_raw(&path("a")).await.unwrap().is_some());
        assert!(second.read_raw(&path("a")).await.unwrap().is_some());
        // never read, so not guarded
        first.merge(path("b"), &json!({"v": 1})).unwrap();
        first.merge(path("a"), &json!({"v": 2})).unwrap();
        second.merge(path("a"), &json!({"v": 3})).unwrap();
        assert_eq!(second.guard_count(), 1);

        first.submit().await.unwrap();
        let result = second.submit().await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
        assert_eq!(store.get(&path("a")), Some(json!({"v": 2})));
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_read_returns_first_value() {
        let store = Arc::new(MemoryStore::new());
        let mut txn = Transaction::new(store.clone());
        assert_eq!(txn.read_raw(&path("a")).await.unwrap(), None);

        store.put(&path("a"), &json!({"v": 1})).unwrap();
        assert_eq!(txn.read_raw(&path("a")).await.unwrap(), None);
        assert!(matches!(txn.submit().await, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_single_commit() {
        let store = Arc::new(MemoryStore::new());
        let mut txn = Transaction::new(store.clone());
        txn.merge(path("a"), &json!({"v": 1})).unwrap();
        txn.merge(path("b"), &json!({"v": 2})).unwrap();
        txn.delete(path("c"));
        assert_eq!(txn.len(), 3);

        txn.submit().await.unwrap();
        assert_eq!(store.commit_count(), 1);
        assert_eq!(store.keys("T"), vec!["a".to_string(), "b".to_string()]);
    }
}
