//! Transactional key-value store abstraction.
//!
//! Records are JSON objects addressed by `TABLE|key` paths. A commit applies
//! a batch of staged operations atomically: every operation lands or none
//! does. Concurrency between passes is optimistic: a commit carries the
//! values its pass read, and the store refuses it with
//! [`StoreError::Conflict`] if any of them changed in the meantime.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;
mod transaction;

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tables::KEY_SEPARATOR;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use transaction::Transaction;

/// A stored record.
pub type Record = serde_json::Value;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    table: String,
    key: String,
}

impl StorePath {
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Parses `TABLE|key`; the key may itself contain separators.
    pub fn parse(raw: &str) -> Option<Self> {
        let (table, key) = raw.split_once(KEY_SEPARATOR)?;
        if table.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(table, key))
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.table, KEY_SEPARATOR, self.key)
    }
}

/// Operation staged against one path.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedOp {
    /// Shallow-merge object fields into the existing record, creating it if
    /// absent.
    Merge(Record),
    /// Overwrite the record.
    Replace(Record),
    /// Remove the record; no-op when absent.
    Delete,
}

impl StagedOp {
    /// Applies this operation on top of `existing`.
    pub fn apply(&self, existing: Option<Record>) -> Option<Record> {
        match self {
            StagedOp::Merge(update) => Some(merge_records(existing, update)),
            StagedOp::Replace(record) => Some(record.clone()),
            StagedOp::Delete => None,
        }
    }
}

/// Shallow JSON object merge: top-level fields of `update` overwrite those
/// of `base`. Non-object values are replaced outright.
pub fn merge_records(base: Option<Record>, update: &Record) -> Record {
    match (base, update) {
        (Some(Record::Object(mut fields)), Record::Object(updates)) => {
            for (field, value) in updates {
                fields.insert(field.clone(), value.clone());
            }
            Record::Object(fields)
        }
        _ => update.clone(),
    }
}

/// Value observed at `path` while a pass was staged. `None` means the
/// record was absent.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadGuard {
    pub path: StorePath,
    pub expected: Option<Record>,
}

impl ReadGuard {
    /// True when `current` still matches what the pass read.
    pub fn holds(&self, current: Option<&Record>) -> bool {
        self.expected.as_ref() == current
    }
}

/// Monotonic identifier of a successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(pub u64);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// The store rejected the batch; nothing was applied.
    #[error("Commit failed: {message}")]
    CommitFailed { message: String },

    /// A record read by the pass changed before its commit; nothing was
    /// applied.
    #[error("Concurrent update: {message}")]
    Conflict { message: String },

    #[error("Malformed record at {path}: {message}")]
    Serialization { path: String, message: String },

    #[error("Store operation {operation} failed: {message}")]
    Backend { operation: String, message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn commit_failed(message: impl Into<String>) -> Self {
        Self::CommitFailed {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn serialization(path: &StorePath, message: impl fmt::Display) -> Self {
        Self::Serialization {
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    pub fn backend(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Connectivity problems and lost races are worth resubmitting
    /// unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Conflict { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Backing store used by the orchestrator, the id allocator and the
/// monitoring installer.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn read(&self, path: &StorePath) -> StoreResult<Option<Record>>;

    /// Returns every record of a table, ordered by path.
    async fn scan(&self, table: &str) -> StoreResult<Vec<(StorePath, Record)>>;

    /// Applies all operations atomically, provided every guard still holds.
    async fn commit(
        &self,
        guards: Vec<ReadGuard>,
        ops: Vec<(StorePath, StagedOp)>,
    ) -> StoreResult<CommitId>;
}

pub fn decode<T: DeserializeOwned>(path: &StorePath, record: Record) -> StoreResult<T> {
    serde_json::from_value(record).map_err(|e| StoreError::serialization(path, e))
}

pub fn encode<T: Serialize>(path: &StorePath, value: &T) -> StoreResult<Record> {
    serde_json::to_value(value).map_err(|e| StoreError::serialization(path, e))
}

/// Reads and decodes every record of a table.
pub async fn scan_as<T: DeserializeOwned>(
    store: &dyn Datastore,
    table: &str,
) -> StoreResult<Vec<T>> {
    store
        .scan(table)
        .await?
        .into_iter()
        .map(|(path, record)| decode(&path, record))
        .collect()
}

pub async fn read_as<T: DeserializeOwned>(
    store: &dyn Datastore,
    path: &StorePath,
) -> StoreResult<Option<T>> {
    store
        .read(path)
        .await?
        .map(|record| decode(path, record))
        .transpose()
}
