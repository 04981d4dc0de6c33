//! Shared fixtures and store verification for tepmgrd integration tests

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use sonic_tepmgrd::store::{
    CommitId, Datastore, ReadGuard, Record, StagedOp, StorePath, StoreResult,
};
use sonic_tepmgrd::tables::{
    dpn_endpoints_path, teps_in_zone_path, transport_zone_path, EXTERNAL_TUNNEL_TABLE,
    INTERNAL_TUNNEL_TABLE, TUNNEL_INTERFACE_TABLE,
};
use sonic_tepmgrd::types::{
    InternalTunnel, MonitorSettings, NodeEndpoints, TransportZone, TunnelInterface, ZoneMembers,
};
use sonic_tepmgrd::{
    HardwareEndpoint, MemoryStore, MonitorTableInstaller, NodeId, StoreIdAllocator,
    TepMgr, TepMgrResult, TepMgrSettings, TunnelEndpoint,
};
use sonic_types::TunnelType;

pub const POOL: &str = "test-pool";

/// Records monitoring calls instead of writing TUNNEL_MONITOR.
#[derive(Default)]
pub struct RecordingMonitor {
    calls: Mutex<Vec<(NodeId, bool)>>,
}

impl RecordingMonitor {
    pub fn calls(&self) -> Vec<(NodeId, bool)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl MonitorTableInstaller for RecordingMonitor {
    async fn set_monitoring_table(&self, node_id: NodeId, enabled: bool) -> TepMgrResult<()> {
        self.calls.lock().push((node_id, enabled));
        Ok(())
    }
}

/// Holds every commit back for a while before applying it, so that
/// passes running side by side read the same snapshot.
pub struct SlowCommitStore {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

impl SlowCommitStore {
    pub fn new(inner: Arc<MemoryStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl Datastore for SlowCommitStore {
    async fn read(&self, path: &StorePath) -> StoreResult<Option<Record>> {
        self.inner.read(path).await
    }

    async fn scan(&self, table: &str) -> StoreResult<Vec<(StorePath, Record)>> {
        self.inner.scan(table).await
    }

    async fn commit(
        &self,
        guards: Vec<ReadGuard>,
        ops: Vec<(StorePath, StagedOp)>,
    ) -> StoreResult<CommitId> {
        tokio::time::sleep(self.delay).await;
        self.inner.commit(guards, ops).await
    }
}

/// Orchestrator wired to an in-memory store.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub allocator: Arc<StoreIdAllocator>,
    pub monitor: Arc<RecordingMonitor>,
    pub mgr: Arc<TepMgr>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_pool(1, 4096).await
    }

    pub async fn with_pool(low: u32, high: u32) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::assemble(store.clone(), store, low, high).await
    }

    /// Pass commits go through a [`SlowCommitStore`] delaying each by `delay`.
    pub async fn with_commit_delay(delay: Duration) -> Self {
        let store = Arc::new(MemoryStore::new());
        let slow = Arc::new(SlowCommitStore::new(store.clone(), delay));
        Self::assemble(store, slow, 1, 4096).await
    }

    async fn assemble(
        store: Arc<MemoryStore>,
        pass_store: Arc<dyn Datastore>,
        low: u32,
        high: u32,
    ) -> Self {
        let allocator = Arc::new(StoreIdAllocator::new(store.clone()));
        allocator
            .create_pool(POOL, low, high)
            .await
            .expect("create id pool");
        let monitor = Arc::new(RecordingMonitor::default());

        let mgr = Arc::new(TepMgr::new(
            pass_store,
            allocator.clone(),
            monitor.clone(),
            TepMgrSettings {
                id_pool: POOL.to_string(),
                monitor: MonitorSettings::default(),
            },
        ));

        Self {
            store,
            allocator,
            monitor,
            mgr,
        }
    }

    pub fn verifier(&self) -> StoreVerifier<'_> {
        StoreVerifier { store: &self.store }
    }

    /// Declares a transport zone.
    pub fn seed_zone(&self, zone: &TransportZone) {
        self.store
            .put(&transport_zone_path(&zone.name), zone)
            .expect("seed zone");
    }
}

pub fn ip(raw: &str) -> IpAddr {
    raw.parse().expect("valid IP")
}

/// VXLAN endpoint on the default port.
pub fn endpoint(addr: &str, subnet: &str, zone: &str) -> TunnelEndpoint {
    TunnelEndpoint::new(ip(addr), subnet.parse().expect("valid prefix"), zone)
}

/// Hardware device `tor<name>` with the physical-switch qualifier.
pub fn device(name: &str, addr: &str, subnet: &str, zone: &str) -> HardwareEndpoint {
    HardwareEndpoint {
        topology_id: "hwvtep:1".to_string(),
        node_id: format!("hwvtep://uuid/{}/physicalswitch/tor{}", name, name),
        ip: ip(addr),
        zone: zone.to_string(),
        tunnel_type: TunnelType::Vxlan,
        gateway: None,
        subnet: subnet.parse().expect("valid prefix"),
    }
}

/// Assertion helpers over the persisted records.
pub struct StoreVerifier<'a> {
    store: &'a MemoryStore,
}

impl StoreVerifier<'_> {
    fn record<T: DeserializeOwned>(&self, path: &StorePath) -> Option<T> {
        self.store
            .get(path)
            .map(|record| serde_json::from_value(record).expect("decode record"))
    }

    fn table<T: DeserializeOwned>(&self, table: &str) -> Vec<T> {
        self.store
            .keys(table)
            .into_iter()
            .filter_map(|key| self.record(&StorePath::new(table, key)))
            .collect()
    }

    pub fn interfaces(&self) -> Vec<TunnelInterface> {
        self.table(TUNNEL_INTERFACE_TABLE)
    }

    pub fn interface_count(&self) -> usize {
        self.store.keys(TUNNEL_INTERFACE_TABLE).len()
    }

    /// The interface from `source` to `destination`.
    pub fn interface_between(&self, source: &str, destination: &str) -> Option<TunnelInterface> {
        let (source, destination) = (ip(source), ip(destination));
        self.interfaces()
            .into_iter()
            .find(|i| i.source_ip == source && i.destination_ip == destination)
    }

    pub fn internal_records(&self) -> Vec<InternalTunnel> {
        self.table(INTERNAL_TUNNEL_TABLE)
    }

    pub fn internal_record_count(&self) -> usize {
        self.store.keys(INTERNAL_TUNNEL_TABLE).len()
    }

    pub fn external_record_keys(&self) -> Vec<String> {
        self.store.keys(EXTERNAL_TUNNEL_TABLE)
    }

    pub fn node_container(&self, node_id: NodeId) -> Option<NodeEndpoints> {
        self.record(&dpn_endpoints_path(node_id))
    }

    pub fn zone_members(&self, zone: &str) -> Option<ZoneMembers> {
        self.record(&teps_in_zone_path(zone))
    }

    /// Every interface has exactly one record pointing at it and vice versa.
    pub fn assert_records_consistent(&self) {
        let mut named: Vec<String> = self
            .internal_records()
            .into_iter()
            .map(|r| r.interface_name)
            .chain(
                self.table::<sonic_tepmgrd::types::ExternalTunnel>(EXTERNAL_TUNNEL_TABLE)
                    .into_iter()
                    .map(|r| r.interface_name),
            )
            .collect();
        named.sort();
        let mut interfaces: Vec<String> = self.interfaces().into_iter().map(|i| i.name).collect();
        interfaces.sort();
        assert_eq!(named, interfaces, "tunnel records and interfaces disagree");
    }
}
