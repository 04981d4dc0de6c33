//! Redis-backed store and change feed.
//!
//! Each record is a hash under `TABLE|key` whose fields hold JSON-encoded
//! values, so a merge is a plain `HSET` of the updated fields. A commit
//! WATCHes the paths its pass read, re-checks them, then applies the batch
//! in one MULTI/EXEC; an aborted EXEC is reported as a conflict.
//! Change-feed entries are JSON arrays `[key, op, field, value, ...]` pushed
//! onto `<TABLE>:QUEUE` lists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::{AsyncCommands, RedisError};
use sonic_orch_common::{KeyOpFieldsValues, TaskError};
use tracing::{debug, info, warn};

use super::{
    CommitId, Datastore, ReadGuard, Record, StagedOp, StoreError, StorePath, StoreResult,
};

/// Keys fetched per SCAN round trip.
const SCAN_COUNT: usize = 256;

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        {
            StoreError::unavailable(e.to_string())
        } else {
            StoreError::backend(e.category(), e.to_string())
        }
    }
}

fn commit_error(e: RedisError) -> StoreError {
    match StoreError::from(e) {
        retry @ StoreError::Unavailable { .. } => retry,
        other => StoreError::commit_failed(other.to_string()),
    }
}

/// Hash fields of a record; every top-level value is stored as JSON text.
pub fn record_fields(path: &StorePath, record: &Record) -> StoreResult<Vec<(String, String)>> {
    let Record::Object(fields) = record else {
        return Err(StoreError::serialization(path, "record is not a JSON object"));
    };
    Ok(fields
        .iter()
        .map(|(field, value)| (field.clone(), value.to_string()))
        .collect())
}

/// Rebuilds a record from its hash; an empty hash is an absent record.
pub fn record_from_fields(
    path: &StorePath,
    fields: HashMap<String, String>,
) -> StoreResult<Option<Record>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let mut record = serde_json::Map::new();
    for (field, raw) in fields {
        let value = serde_json::from_str(&raw).map_err(|e| StoreError::serialization(path, e))?;
        record.insert(field, value);
    }
    Ok(Some(Record::Object(record)))
}

pub struct RedisStore {
    client: redis::Client,
    connection: ConnectionManager,
    commits: AtomicU64,
}

impl RedisStore {
    pub async fn connect(host: &str, port: u16, db: u32) -> StoreResult<Self> {
        let uri = format!("redis://{}:{}/{}", host, port, db);

        let client = redis::Client::open(uri.as_str())
            .map_err(|e| StoreError::unavailable(format!("{}: {}", uri, e)))?;
        let connection = client.get_connection_manager().await.map_err(|e| {
            StoreError::unavailable(format!("failed to create connection manager: {}", e))
        })?;

        info!("Connected to Redis: {}:{} (db={})", host, port, db);

        Ok(Self {
            client,
            connection,
            commits: AtomicU64::new(0),
        })
    }

    async fn get<C>(con: &mut C, path: &StorePath) -> StoreResult<Option<Record>>
    where
        C: ConnectionLike + Send + Sync,
    {
        let fields: HashMap<String, String> = con.hgetall(path.to_string()).await?;
        record_from_fields(path, fields)
    }

    /// Pops up to `batch_size` change-feed entries for `table`.
    ///
    /// Blocks for at most `timeout_secs` waiting for the first entry, then
    /// drains whatever else is queued without blocking.
    pub async fn pop_changes(
        &self,
        table: &str,
        batch_size: usize,
        timeout_secs: f64,
    ) -> StoreResult<Vec<KeyOpFieldsValues>> {
        let queue = change_queue_key(table);
        let mut con = self.connection.clone();
        let mut entries = Vec::new();

        let first: Option<(String, String)> = con.blpop(&queue, timeout_secs).await?;
        let Some((_, raw)) = first else {
            return Ok(entries);
        };
        push_change(&mut entries, table, &raw);

        while entries.len() < batch_size {
            let next: Option<String> = con.lpop(&queue, None).await?;
            match next {
                Some(raw) => push_change(&mut entries, table, &raw),
                None => break,
            }
        }

        debug!("Polled {} entries from {}", entries.len(), table);
        Ok(entries)
    }
}

fn push_change(entries: &mut Vec<KeyOpFieldsValues>, table: &str, raw: &str) {
    match parse_change(raw) {
        Ok(entry) => entries.push(entry),
        Err(e) => warn!(table, error = %e, "dropping malformed change-feed entry"),
    }
}

pub fn change_queue_key(table: &str) -> String {
    format!("{}:QUEUE", table)
}

/// Decodes one change-feed list element.
pub fn parse_change(raw: &str) -> Result<KeyOpFieldsValues, TaskError> {
    let data: Vec<String> = serde_json::from_str(raw)
        .map_err(|e| TaskError::invalid_entry(format!("not a JSON string array: {}", e)))?;
    KeyOpFieldsValues::from_wire(&data)
}

#[async_trait]
impl Datastore for RedisStore {
    async fn read(&self, path: &StorePath) -> StoreResult<Option<Record>> {
        let mut con = self.connection.clone();
        Self::get(&mut con, path).await
    }

    async fn scan(&self, table: &str) -> StoreResult<Vec<(StorePath, Record)>> {
        let mut con = self.connection.clone();
        let pattern = format!("{}|*", table);

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut con)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(path) = StorePath::parse(&key) else {
                continue;
            };
            if let Some(record) = Self::get(&mut con, &path).await? {
                records.push((path, record));
            }
        }
        Ok(records)
    }

    async fn commit(
        &self,
        guards: Vec<ReadGuard>,
        ops: Vec<(StorePath, StagedOp)>,
    ) -> StoreResult<CommitId> {
        // WATCH state is per connection, so the shared manager cannot be used.
        let mut con = self.client.get_multiplexed_async_connection().await?;

        if !guards.is_empty() {
            let keys: Vec<String> = guards.iter().map(|g| g.path.to_string()).collect();
            let _: () = redis::cmd("WATCH").arg(&keys).query_async(&mut con).await?;
            for guard in &guards {
                let current = Self::get(&mut con, &guard.path).await?;
                if !guard.holds(current.as_ref()) {
                    let _: () = redis::cmd("UNWATCH").query_async(&mut con).await?;
                    return Err(StoreError::conflict(format!(
                        "{} changed since it was read",
                        guard.path
                    )));
                }
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (path, op) in &ops {
            let key = path.to_string();
            match op {
                StagedOp::Merge(update) => {
                    let fields = record_fields(path, update)?;
                    if !fields.is_empty() {
                        pipe.hset_multiple(&key, fields.as_slice()).ignore();
                    }
                }
                StagedOp::Replace(record) => {
                    let fields = record_fields(path, record)?;
                    pipe.del(&key).ignore();
                    if !fields.is_empty() {
                        pipe.hset_multiple(&key, fields.as_slice()).ignore();
                    }
                }
                StagedOp::Delete => {
                    pipe.del(&key).ignore();
                }
            }
        }

        let applied: Option<()> = pipe.query_async(&mut con).await.map_err(commit_error)?;
        if applied.is_none() {
            return Err(StoreError::conflict("a watched record changed before EXEC"));
        }

        let id = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            commit = id,
            operations = ops.len(),
            guards = guards.len(),
            "redis commit applied"
        );
        Ok(CommitId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use sonic_orch_common::Operation;

    #[test]
    fn test_parse_change_set() {
        let entry =
            parse_change(r#"["1|10.0.0.1","SET","zone","Z1","subnet","10.0.0.0/24"]"#).unwrap();
        assert_eq!(entry.key, "1|10.0.0.1");
        assert_eq!(entry.op, Operation::Set);
        assert_eq!(entry.get_field("subnet"), Some("10.0.0.0/24"));
    }

    #[test]
    fn test_parse_change_invalid() {
        assert!(parse_change(r#"["1|10.0.0.1"]"#).is_err());
        assert!(parse_change("not json").is_err());
    }

    #[test]
    fn test_change_queue_key() {
        assert_eq!(change_queue_key("TEP_TABLE"), "TEP_TABLE:QUEUE");
    }

    #[test]
    fn test_record_hash_layout() {
        let path = StorePath::new("TUNNEL_INTERFACE", "tun00000001");
        let record = json!({"name": "tun00000001", "gateway_ip": null, "vlan_id": 0});

        let mut fields = record_fields(&path, &record).unwrap();
        fields.sort();
        assert_eq!(
            fields,
            vec![
                ("gateway_ip".to_string(), "null".to_string()),
                ("name".to_string(), "\"tun00000001\"".to_string()),
                ("vlan_id".to_string(), "0".to_string()),
            ]
        );

        let back = record_from_fields(&path, fields.into_iter().collect()).unwrap();
        assert_eq!(back, Some(record));
        assert_eq!(record_from_fields(&path, HashMap::new()).unwrap(), None);

        assert!(record_fields(&path, &json!([1, 2])).is_err());
    }
}
