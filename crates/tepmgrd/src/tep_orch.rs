//! Change-feed front end of the orchestrator.
//!
//! `TEP_TABLE` and `DEVICE_VTEP_TABLE` entries are turned into build and
//! teardown requests, one pair per transport zone, and run through the
//! [`JobCoordinator`]. Within a zone the teardown is queued before the
//! build, so a DEL followed by a SET of the same key re-creates the
//! endpoint.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use sonic_orch_common::{
    Consumer, ConsumerConfig, KeyOpFieldsValues, Operation, Orch, TaskError, TaskResult,
    TaskStatus,
};
use sonic_types::{IpPrefix, TunnelType, VlanId};
use tracing::{debug, info, warn};

use crate::error::{TepMgrError, TepMgrResult};
use crate::job::{JobCoordinator, PassHandle};
use crate::tables::{device_vtep_fields, tep_fields, DEVICE_VTEP_TABLE, KEY_SEPARATOR, TEP_TABLE};
use crate::tep_mgr::{EndpointBatch, PassReport, TepMgr};
use crate::types::{HardwareEndpoint, NodeEndpoint, NodeId, TunnelEndpoint, DEFAULT_PORT_NAME};

/// Status of one change-feed entry after a `do_task` round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOutcome {
    pub table: &'static str,
    pub key: String,
    pub op: Operation,
    pub status: TaskStatus,
}

#[derive(Debug, Clone)]
enum Change {
    Endpoint(NodeEndpoint),
    Device(HardwareEndpoint),
}

impl Change {
    fn zone(&self) -> &str {
        match self {
            Change::Endpoint(ne) => &ne.endpoint.zone,
            Change::Device(d) => &d.zone,
        }
    }
}

/// A resolved entry waiting for its pass.
#[derive(Debug, Clone)]
struct Pending {
    table: &'static str,
    entry: KeyOpFieldsValues,
    change: Change,
}

fn batch_of(pending: &[Pending]) -> EndpointBatch {
    let mut batch = EndpointBatch::new();
    for p in pending {
        match &p.change {
            Change::Endpoint(ne) => batch.endpoints.push(ne.clone()),
            Change::Device(d) => batch.devices.push(d.clone()),
        }
    }
    batch
}

fn required<'a>(entry: &'a KeyOpFieldsValues, field: &str) -> TaskResult<&'a str> {
    match entry.get_field(field) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim()),
        _ => Err(TaskError::invalid_entry(format!(
            "{}: missing field '{}'",
            entry.key, field
        ))),
    }
}

fn parse_ip(raw: &str) -> TaskResult<IpAddr> {
    raw.parse()
        .map_err(|_| TaskError::invalid_entry(format!("invalid IP address: {}", raw)))
}

fn parse_subnet(entry: &KeyOpFieldsValues, field: &str) -> TaskResult<IpPrefix> {
    required(entry, field)?
        .parse()
        .map_err(|e| TaskError::invalid_entry(format!("{}: {}", entry.key, e)))
}

/// Empty and unspecified gateways mean "none".
fn parse_gateway(entry: &KeyOpFieldsValues, field: &str) -> TaskResult<Option<IpAddr>> {
    match entry.get_field(field).map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => {
            let ip = parse_ip(raw)?;
            Ok((!ip.is_unspecified()).then_some(ip))
        }
    }
}

fn parse_tunnel_type(entry: &KeyOpFieldsValues, field: &str) -> TaskResult<TunnelType> {
    match entry.get_field(field).map(str::trim) {
        None | Some("") => Ok(TunnelType::default()),
        Some(raw) => raw
            .parse()
            .map_err(|e| TaskError::invalid_entry(format!("{}: {}", entry.key, e))),
    }
}

/// `<node_id>|<ip>`
fn parse_tep_key(key: &str) -> TaskResult<(NodeId, IpAddr)> {
    let (node, ip) = key
        .split_once(KEY_SEPARATOR)
        .ok_or_else(|| TaskError::invalid_entry(format!("invalid TEP key: {}", key)))?;
    let node_id = node
        .parse()
        .map_err(|_| TaskError::invalid_entry(format!("invalid node id in key: {}", key)))?;
    Ok((node_id, parse_ip(ip)?))
}

/// `<topology_id>|<node_id>|<ip>`; the node id may itself contain `/`.
fn parse_device_key(key: &str) -> TaskResult<(String, String, IpAddr)> {
    let invalid = || TaskError::invalid_entry(format!("invalid device key: {}", key));
    let (rest, ip) = key.rsplit_once(KEY_SEPARATOR).ok_or_else(invalid)?;
    let (topology, node) = rest.split_once(KEY_SEPARATOR).ok_or_else(invalid)?;
    if topology.is_empty() || node.is_empty() {
        return Err(invalid());
    }
    Ok((topology.to_string(), node.to_string(), parse_ip(ip)?))
}

fn parse_tep_entry(entry: &KeyOpFieldsValues) -> TaskResult<NodeEndpoint> {
    let (node_id, ip) = parse_tep_key(&entry.key)?;

    let vlan_id = match entry.get_field(tep_fields::VLAN_ID).map(str::trim) {
        None | Some("") => VlanId::UNTAGGED,
        Some(raw) => raw
            .parse()
            .map_err(|e| TaskError::invalid_entry(format!("{}: {}", entry.key, e)))?,
    };
    let port_name = entry
        .get_field(tep_fields::PORT_NAME)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_PORT_NAME);

    let endpoint = TunnelEndpoint {
        ip,
        port_name: port_name.to_string(),
        vlan_id,
        subnet: parse_subnet(entry, tep_fields::SUBNET)?,
        gateway: parse_gateway(entry, tep_fields::GATEWAY)?,
        zone: required(entry, tep_fields::ZONE)?.to_string(),
        tunnel_type: parse_tunnel_type(entry, tep_fields::TUNNEL_TYPE)?,
    };
    Ok(NodeEndpoint::new(node_id, endpoint))
}

fn parse_device_entry(entry: &KeyOpFieldsValues) -> TaskResult<HardwareEndpoint> {
    let (topology_id, node_id, ip) = parse_device_key(&entry.key)?;
    Ok(HardwareEndpoint {
        topology_id,
        node_id,
        ip,
        zone: required(entry, device_vtep_fields::ZONE)?.to_string(),
        tunnel_type: parse_tunnel_type(entry, device_vtep_fields::TUNNEL_TYPE)?,
        gateway: parse_gateway(entry, device_vtep_fields::GATEWAY)?,
        subnet: parse_subnet(entry, device_vtep_fields::SUBNET)?,
    })
}

/// Orch feeding the tunnel mesh from the change feed.
pub struct TepOrch {
    mgr: Arc<TepMgr>,
    jobs: Arc<JobCoordinator>,
    tep_consumer: Consumer,
    device_consumer: Consumer,
}

impl TepOrch {
    pub fn new(mgr: Arc<TepMgr>, jobs: Arc<JobCoordinator>, batch_size: usize) -> Self {
        Self {
            mgr,
            jobs,
            tep_consumer: Consumer::new(
                ConsumerConfig::new(TEP_TABLE).with_batch_size(batch_size),
            ),
            device_consumer: Consumer::new(
                ConsumerConfig::new(DEVICE_VTEP_TABLE).with_batch_size(batch_size),
            ),
        }
    }

    pub fn table_names(&self) -> [&str; 2] {
        [
            self.tep_consumer.table_name(),
            self.device_consumer.table_name(),
        ]
    }

    pub fn batch_size(&self) -> usize {
        self.tep_consumer.batch_size()
    }

    /// Queues change-feed entries for `table`. Returns false for tables
    /// this orch does not consume.
    pub fn add_entries(&mut self, table: &str, entries: Vec<KeyOpFieldsValues>) -> bool {
        match table {
            TEP_TABLE => self.tep_consumer.add_to_sync(entries),
            DEVICE_VTEP_TABLE => self.device_consumer.add_to_sync(entries),
            other => {
                warn!(table = %other, "ignoring entries for unknown table");
                return false;
            }
        }
        true
    }

    fn consumer_mut(&mut self, table: &str) -> &mut Consumer {
        if table == DEVICE_VTEP_TABLE {
            &mut self.device_consumer
        } else {
            &mut self.tep_consumer
        }
    }

    /// Turns an entry into a change, looking up DEL targets in the store.
    async fn resolve(
        &self,
        table: &'static str,
        entry: &KeyOpFieldsValues,
    ) -> TepMgrResult<Option<Change>> {
        let change = match (table, entry.op) {
            (TEP_TABLE, Operation::Set) => parse_tep_entry(entry).map(Change::Endpoint),
            (TEP_TABLE, Operation::Del) => {
                let (node_id, ip) = match parse_tep_key(&entry.key) {
                    Ok(parsed) => parsed,
                    Err(e) => return Err(TepMgrError::validation("key", e.to_string())),
                };
                return Ok(self
                    .mgr
                    .find_endpoint(node_id, &ip)
                    .await?
                    .map(|ep| Change::Endpoint(NodeEndpoint::new(node_id, ep))));
            }
            (_, Operation::Set) => parse_device_entry(entry).map(Change::Device),
            (_, Operation::Del) => {
                let ip = match parse_device_key(&entry.key) {
                    Ok((_, _, ip)) => ip,
                    Err(e) => return Err(TepMgrError::validation("key", e.to_string())),
                };
                return Ok(self.mgr.find_device(&ip).await?.map(Change::Device));
            }
        };
        change
            .map(Some)
            .map_err(|e| TepMgrError::validation("entry", e.to_string()))
    }

    /// Drains both consumers, runs the resulting passes and reports the
    /// status of every drained entry.
    pub async fn process_pending(&mut self) -> Vec<EntryOutcome> {
        let mut outcomes = Vec::new();
        let mut builds: BTreeMap<String, Vec<Pending>> = BTreeMap::new();
        let mut teardowns: BTreeMap<String, Vec<Pending>> = BTreeMap::new();

        let drained: Vec<(&'static str, KeyOpFieldsValues)> = self
            .tep_consumer
            .drain()
            .into_iter()
            .map(|e| (TEP_TABLE, e))
            .chain(
                self.device_consumer
                    .drain()
                    .into_iter()
                    .map(|e| (DEVICE_VTEP_TABLE, e)),
            )
            .collect();

        for (table, entry) in drained {
            match self.resolve(table, &entry).await {
                Ok(Some(change)) => {
                    let queue = if entry.op.is_del() {
                        &mut teardowns
                    } else {
                        &mut builds
                    };
                    queue.entry(change.zone().to_string()).or_default().push(Pending {
                        table,
                        entry,
                        change,
                    });
                }
                Ok(None) => {
                    debug!(table, key = %entry.key, "delete of unknown entry ignored");
                    outcomes.push(outcome(table, &entry, TaskStatus::Ignore));
                }
                Err(e) => {
                    let status = self.settle(table, entry.clone(), status_of(e));
                    outcomes.push(outcome(table, &entry, status));
                }
            }
        }

        let mut handles: Vec<(Vec<Pending>, bool, PassHandle<PassReport>)> = Vec::new();
        let zones: Vec<String> = teardowns.keys().chain(builds.keys()).cloned().collect();
        for zone in zones {
            if let Some(pending) = teardowns.remove(&zone) {
                let handle = self.submit(&zone, batch_of(&pending), false);
                handles.push((pending, false, handle));
            }
            if let Some(pending) = builds.remove(&zone) {
                let handle = self.submit(&zone, batch_of(&pending), true);
                handles.push((pending, true, handle));
            }
        }

        for (pending, build, handle) in handles {
            let zone = handle.key().to_string();
            match handle.wait().await {
                Ok(report) => {
                    if !report.is_complete() {
                        warn!(
                            zone = %zone,
                            failures = report.failures.len(),
                            "pass committed with a partial mesh"
                        );
                    }
                    for p in &pending {
                        outcomes.push(outcome(p.table, &p.entry, TaskStatus::Success));
                    }
                }
                Err(e) if e.is_rejection() && pending.len() > 1 => {
                    // find the offending entries by running them one by one
                    warn!(zone = %zone, error = %e, "batch rejected, retrying entries individually");
                    for p in pending {
                        let single = self.submit(&zone, batch_of(std::slice::from_ref(&p)), build);
                        let status = match single.wait().await {
                            Ok(_) => TaskStatus::Success,
                            Err(e) => self.settle(p.table, p.entry.clone(), status_of(e)),
                        };
                        outcomes.push(outcome(p.table, &p.entry, status));
                    }
                }
                Err(e) => {
                    warn!(zone = %zone, error = %e, "pass failed");
                    let status = status_of(e);
                    for p in pending {
                        let status = self.settle(p.table, p.entry.clone(), status);
                        outcomes.push(outcome(p.table, &p.entry, status));
                    }
                }
            }
        }

        outcomes
    }

    fn submit(&self, zone: &str, batch: EndpointBatch, build: bool) -> PassHandle<PassReport> {
        let mgr = self.mgr.clone();
        if build {
            self.jobs.enqueue(zone, async move { mgr.build(batch).await })
        } else {
            self.jobs.enqueue(zone, async move { mgr.teardown(batch).await })
        }
    }

    /// Re-queues retryable entries and logs dropped ones.
    fn settle(
        &mut self,
        table: &'static str,
        entry: KeyOpFieldsValues,
        status: TaskStatus,
    ) -> TaskStatus {
        match status {
            TaskStatus::NeedRetry => self.consumer_mut(table).retry(entry),
            TaskStatus::InvalidEntry => {
                warn!(table, key = %entry.key, op = %entry.op, "dropping invalid entry");
            }
            _ => {
                warn!(table, key = %entry.key, op = %entry.op, status = ?status, "entry failed");
            }
        }
        status
    }
}

fn status_of(err: TepMgrError) -> TaskStatus {
    TaskError::from(err).to_status()
}

fn outcome(
    table: &'static str,
    entry: &KeyOpFieldsValues,
    status: TaskStatus,
) -> EntryOutcome {
    EntryOutcome {
        table,
        key: entry.key.clone(),
        op: entry.op,
        status,
    }
}

#[async_trait]
impl Orch for TepOrch {
    fn name(&self) -> &str {
        "TepOrch"
    }

    async fn do_task(&mut self) {
        if !self.has_pending_tasks() {
            return;
        }
        let outcomes = self.process_pending().await;
        let succeeded = outcomes.iter().filter(|o| o.status.is_success()).count();
        let retried = outcomes
            .iter()
            .filter(|o| o.status.is_retryable())
            .count();
        info!(
            entries = outcomes.len(),
            succeeded,
            retried,
            "processed tunnel endpoint changes"
        );
    }

    fn priority(&self) -> i32 {
        25
    }

    fn has_pending_tasks(&self) -> bool {
        self.tep_consumer.has_pending() || self.device_consumer.has_pending()
    }

    fn dump_pending_tasks(&self) -> Vec<String> {
        let mut tasks = self.tep_consumer.dump();
        tasks.extend(self.device_consumer.dump());
        tasks
    }
}
