//! Change-feed consumer with per-key de-duplication.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::TaskError;

/// Operation carried by a change-feed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Add or update
    Set,
    /// Delete
    Del,
}

impl Operation {
    pub fn is_set(&self) -> bool {
        matches!(self, Operation::Set)
    }

    pub fn is_del(&self) -> bool {
        matches!(self, Operation::Del)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Set => "SET",
            Operation::Del => "DEL",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SET" => Ok(Operation::Set),
            "DEL" => Ok(Operation::Del),
            unknown => Err(TaskError::invalid_entry(format!(
                "unknown operation: {}",
                unknown
            ))),
        }
    }
}

/// A field-value pair of a change-feed entry.
pub type FieldValue = (String, String);

/// Key, operation, and field-values tuple.
///
/// This is the fundamental unit of data consumed from a change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOpFieldsValues {
    /// The key (e.g., "1|10.0.0.1" for a node endpoint)
    pub key: String,
    pub op: Operation,
    /// Field-value pairs (empty for Del operations)
    pub fvs: Vec<FieldValue>,
}

impl KeyOpFieldsValues {
    pub fn new(key: impl Into<String>, op: Operation, fvs: Vec<FieldValue>) -> Self {
        Self {
            key: key.into(),
            op,
            fvs,
        }
    }

    pub fn set(key: impl Into<String>, fvs: Vec<FieldValue>) -> Self {
        Self::new(key, Operation::Set, fvs)
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::new(key, Operation::Del, vec![])
    }

    /// Parses the list encoding `[key, op, field1, value1, ...]`.
    ///
    /// A trailing field without a value is ignored.
    pub fn from_wire(data: &[String]) -> Result<Self, TaskError> {
        let [key, op, rest @ ..] = data else {
            return Err(TaskError::invalid_entry(
                "entry must have at least key and operation",
            ));
        };

        let op: Operation = op.parse()?;
        let fvs = rest
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        Ok(Self::new(key.clone(), op, fvs))
    }

    /// Returns the value for a field, if present.
    pub fn get_field(&self, field: &str) -> Option<&str> {
        self.fvs
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fvs.iter().any(|(f, _)| f == field)
    }
}

/// Configuration for a Consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Change-feed table name (e.g., "TEP_TABLE")
    pub table_name: String,
    /// Pop batch size
    pub batch_size: usize,
}

impl ConsumerConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            batch_size: 128,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Queue of pending change-feed entries for one table.
///
/// When multiple operations arrive for the same key:
/// - DEL: drops whatever is pending for the key and keeps only the DEL
/// - SET after SET: field-values are merged (newer overwrites older)
/// - SET after DEL: both are kept, in order
pub struct Consumer {
    config: ConsumerConfig,
    to_sync: BTreeMap<String, VecDeque<KeyOpFieldsValues>>,
    pending_count: usize,
}

impl Consumer {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            to_sync: BTreeMap::new(),
            pending_count: 0,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.config.table_name
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count > 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    /// Adds entries to the sync queue with de-duplication.
    pub fn add_to_sync(&mut self, entries: Vec<KeyOpFieldsValues>) {
        for entry in entries {
            self.add_single_entry(entry);
        }
    }

    fn add_single_entry(&mut self, entry: KeyOpFieldsValues) {
        let queue = self.to_sync.entry(entry.key.clone()).or_default();

        match entry.op {
            Operation::Del => {
                self.pending_count -= queue.len();
                queue.clear();
                queue.push_back(entry);
                self.pending_count += 1;
            }
            Operation::Set => {
                if let Some(last) = queue.back_mut() {
                    if last.op == Operation::Set {
                        for (field, value) in entry.fvs {
                            if let Some(existing) = last.fvs.iter_mut().find(|(f, _)| *f == field)
                            {
                                existing.1 = value;
                            } else {
                                last.fvs.push((field, value));
                            }
                        }
                        return;
                    }
                }
                queue.push_back(entry);
                self.pending_count += 1;
            }
        }
    }

    /// Drains all pending entries, ordered by key then arrival.
    pub fn drain(&mut self) -> Vec<KeyOpFieldsValues> {
        let mut result = Vec::with_capacity(self.pending_count);

        for (_key, queue) in std::mem::take(&mut self.to_sync) {
            result.extend(queue);
        }

        self.pending_count = 0;
        result
    }

    /// Puts a failed entry back at the front of its key's queue.
    ///
    /// A newer entry for the same key that arrived in the meantime stays
    /// behind it, so ordering per key is preserved.
    pub fn retry(&mut self, entry: KeyOpFieldsValues) {
        debug!(table = %self.config.table_name, key = %entry.key, op = %entry.op, "re-queued entry");
        let queue = self.to_sync.entry(entry.key.clone()).or_default();
        queue.push_front(entry);
        self.pending_count += 1;
    }

    /// Dumps pending entries for debugging.
    pub fn dump(&self) -> Vec<String> {
        let table = self.table_name();
        self.to_sync
            .iter()
            .flat_map(|(key, queue)| {
                queue
                    .iter()
                    .map(move |e| format!("{}:{}: {} {:?}", table, key, e.op, e.fvs))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fv(field: &str, value: &str) -> FieldValue {
        (field.to_string(), value.to_string())
    }

    #[test]
    fn test_key_op_fields_values() {
        let entry = KeyOpFieldsValues::set("1|10.0.0.1", vec![fv("zone", "Z1")]);

        assert_eq!(entry.key, "1|10.0.0.1");
        assert!(entry.op.is_set());
        assert_eq!(entry.get_field("zone"), Some("Z1"));
        assert!(entry.has_field("zone"));
        assert!(!entry.has_field("subnet"));
    }

    #[test]
    fn test_from_wire() {
        let data: Vec<String> = ["1|10.0.0.1", "SET", "zone", "Z1", "vlan_id", "0", "dangling"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let entry = KeyOpFieldsValues::from_wire(&data).unwrap();
        assert_eq!(entry.op, Operation::Set);
        assert_eq!(entry.fvs, vec![fv("zone", "Z1"), fv("vlan_id", "0")]);

        let del = KeyOpFieldsValues::from_wire(&["k".to_string(), "DEL".to_string()]).unwrap();
        assert!(del.op.is_del());
        assert!(del.fvs.is_empty());

        assert!(KeyOpFieldsValues::from_wire(&["k".to_string()]).is_err());
        assert!(KeyOpFieldsValues::from_wire(&["k".to_string(), "PUT".to_string()]).is_err());
    }

    #[test]
    fn test_consumer_set_merge() {
        let mut consumer = Consumer::new(ConsumerConfig::new("TEP_TABLE"));

        consumer.add_to_sync(vec![KeyOpFieldsValues::set(
            "1|10.0.0.1",
            vec![fv("zone", "Z1")],
        )]);
        consumer.add_to_sync(vec![KeyOpFieldsValues::set(
            "1|10.0.0.1",
            vec![fv("zone", "Z2"), fv("subnet", "10.0.0.0/24")],
        )]);

        assert_eq!(consumer.pending_count(), 1);

        let entries = consumer.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].get_field("zone"), Some("Z2"));
        assert_eq!(entries[0].get_field("subnet"), Some("10.0.0.0/24"));
        assert!(!consumer.has_pending());
    }

    #[test]
    fn test_consumer_del_clears_set() {
        let mut consumer = Consumer::new(ConsumerConfig::new("TEP_TABLE"));

        consumer.add_to_sync(vec![
            KeyOpFieldsValues::set("1|10.0.0.1", vec![fv("zone", "Z1")]),
            KeyOpFieldsValues::del("1|10.0.0.1"),
        ]);

        assert_eq!(consumer.pending_count(), 1);
        let entries = consumer.drain();
        assert!(entries[0].op.is_del());
    }

    #[test]
    fn test_consumer_del_then_set() {
        let mut consumer = Consumer::new(ConsumerConfig::new("TEP_TABLE"));

        consumer.add_to_sync(vec![
            KeyOpFieldsValues::del("1|10.0.0.1"),
            KeyOpFieldsValues::set("1|10.0.0.1", vec![fv("zone", "Z1")]),
        ]);

        assert_eq!(consumer.pending_count(), 2);
        let entries = consumer.drain();
        assert!(entries[0].op.is_del());
        assert!(entries[1].op.is_set());
    }

    #[test]
    fn test_consumer_retry_goes_first() {
        let mut consumer = Consumer::new(ConsumerConfig::new("TEP_TABLE").with_batch_size(16));
        assert_eq!(consumer.batch_size(), 16);

        consumer.add_to_sync(vec![KeyOpFieldsValues::del("1|10.0.0.1")]);
        consumer.retry(KeyOpFieldsValues::set("1|10.0.0.1", vec![]));

        assert_eq!(consumer.pending_count(), 2);
        assert_eq!(consumer.dump().len(), 2);
        let entries = consumer.drain();
        assert!(entries[0].op.is_set());
        assert!(entries[1].op.is_del());
    }
}
