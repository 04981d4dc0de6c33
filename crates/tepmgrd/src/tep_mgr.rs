//! Tunnel mesh orchestrator.
//!
//! [`TepMgr`] runs build and teardown passes. A pass reads the meshed set
//! once, rejects invalid input before staging anything, stages every tunnel
//! operation into one [`Transaction`] and commits it once. Individual wire
//! failures are logged and collected in the [`PassReport`]; only a failed
//! commit fails the pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::{TepMgrError, TepMgrResult};
use crate::external::{external_link, external_links, load_gateways};
use crate::hw_vtep::{hardware_links, load_devices, SubnetView, ZoneIndex};
use crate::id_alloc::IdAllocator;
use crate::mesh::{compute_departures, compute_mesh, MeshedSet, WirePair};
use crate::monitor::MonitorTableInstaller;
use crate::store::{read_as, scan_as, CommitId, Datastore, StoreResult, Transaction};
use crate::tables::{
    dc_gateway_path, device_endpoint_path, dpn_endpoints_path, teps_in_zone_path,
    DPN_ENDPOINTS_TABLE,
};
use crate::teardown::{cascade_endpoint_removal, remove_tunnel, Removal};
use crate::types::{
    ExternalGateway, HardwareEndpoint, MonitorSettings, NodeEndpoint, NodeEndpoints, NodeId,
    TunnelEndpoint, ZoneMembers,
};
use crate::wire::{record_path, tunnel_name_key, Link, TunnelBuilder, TunnelTerminus};
use sonic_types::TunnelType;

/// Runs of one pass before a lost race is reported to the caller.
pub const MAX_PASS_ATTEMPTS: usize = 5;

/// Endpoints and devices changed by one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointBatch {
    pub endpoints: Vec<NodeEndpoint>,
    pub devices: Vec<HardwareEndpoint>,
}

pub type BuildRequest = EndpointBatch;
pub type TeardownRequest = EndpointBatch;

impl EndpointBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, node_id: NodeId, endpoint: TunnelEndpoint) -> Self {
        self.endpoints.push(NodeEndpoint::new(node_id, endpoint));
        self
    }

    pub fn with_device(mut self, device: HardwareEndpoint) -> Self {
        self.devices.push(device);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty() && self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len() + self.devices.len()
    }

    /// Zones touched by the batch.
    pub fn zones(&self) -> BTreeSet<String> {
        self.endpoints
            .iter()
            .map(|ne| ne.endpoint.zone.clone())
            .chain(self.devices.iter().map(|d| d.zone.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Build,
    Teardown,
    AddExternalGateway,
    RemoveExternalGateway,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PassKind::Build => "build",
            PassKind::Teardown => "teardown",
            PassKind::AddExternalGateway => "add-external-gateway",
            PassKind::RemoveExternalGateway => "remove-external-gateway",
        };
        write!(f, "{}", s)
    }
}

/// One tunnel direction that could not be built or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFailure {
    pub source: String,
    pub destination: String,
    pub reason: String,
}

/// Result of a committed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub kind: PassKind,
    pub commit: CommitId,
    /// Interfaces that did not exist before the pass.
    pub created: Vec<String>,
    /// Interfaces that already existed and were merged again.
    pub refreshed: usize,
    pub removed: Vec<String>,
    pub already_removed: usize,
    pub failures: Vec<WireFailure>,
    /// Nodes that entered the meshed set.
    pub joined: Vec<NodeId>,
    /// Nodes whose endpoint container was removed.
    pub departed: Vec<NodeId>,
}

impl PassReport {
    /// True when every attempted direction succeeded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TepMgrSettings {
    pub id_pool: String,
    pub monitor: MonitorSettings,
}

impl Default for TepMgrSettings {
    fn default() -> Self {
        Self {
            id_pool: "tunnel-name-pool".to_string(),
            monitor: MonitorSettings::default(),
        }
    }
}

/// State of a pass between its first staged operation and its commit.
struct Pass<'a> {
    kind: PassKind,
    txn: Transaction,
    builder: TunnelBuilder<'a>,
    allocator: &'a dyn IdAllocator,
    pool: &'a str,
    wired: BTreeSet<String>,
    unwired: BTreeSet<String>,
    /// Allocator keys of interfaces staged in this pass.
    named: BTreeSet<String>,
    /// Allocator keys to release once the commit went through.
    releases: Vec<String>,
    created: Vec<String>,
    refreshed: usize,
    removed: Vec<String>,
    already_removed: usize,
    failures: Vec<WireFailure>,
}

impl<'a> Pass<'a> {
    fn failure(&mut self, source: &TunnelTerminus, destination: &TunnelTerminus, reason: String) {
        self.failures.push(WireFailure {
            source: source.to_string(),
            destination: destination.to_string(),
            reason,
        });
    }

    /// Builds every direction of `link`. Each direction is attempted even
    /// if the other failed.
    async fn wire_link(&mut self, link: &Link) {
        for (source, destination) in link.directions() {
            let path = record_path(&source.owner, &destination.owner);
            if !self.wired.insert(path.to_string()) {
                continue;
            }
            let existed = matches!(self.txn.read_raw(&path).await, Ok(Some(_)));

            match self.builder.stage(&mut self.txn, source, destination).await {
                Ok(name) => {
                    self.named.insert(tunnel_name_key(source, &destination.ip));
                    if existed {
                        self.refreshed += 1;
                    } else {
                        self.created.push(name);
                    }
                }
                Err(e) => {
                    warn!(
                        source = %source,
                        destination = %destination,
                        error = %e,
                        "failed to wire tunnel"
                    );
                    self.failure(source, destination, e.to_string());
                }
            }
        }
    }

    async fn unwire_link(&mut self, link: &Link) {
        for (source, destination) in link.directions() {
            let path = record_path(&source.owner, &destination.owner);
            if !self.unwired.insert(path.to_string()) {
                continue;
            }

            match remove_tunnel(&mut self.txn, source, destination).await {
                Ok(Removal::Removed { name, key }) => {
                    self.removed.push(name);
                    self.releases.push(key);
                }
                Ok(Removal::AlreadyRemoved) => self.already_removed += 1,
                Err(e) => {
                    warn!(
                        source = %source,
                        destination = %destination,
                        error = %e,
                        "failed to remove tunnel"
                    );
                    self.failure(source, destination, e.to_string());
                }
            }
        }
    }

    async fn wire_pairs(&mut self, pairs: &[WirePair]) {
        for link in pairs.iter().map(pair_link) {
            self.wire_link(&link).await;
        }
    }

    async fn unwire_pairs(&mut self, pairs: &[WirePair]) {
        for link in pairs.iter().map(pair_link) {
            self.unwire_link(&link).await;
        }
    }

    /// Commits the pass, then releases the names of removed tunnels.
    async fn finish(self, joined: Vec<NodeId>, departed: Vec<NodeId>) -> TepMgrResult<PassReport> {
        let kind = self.kind;
        let staged = self.txn.len();
        let commit = match self.txn.submit().await {
            Ok(commit) => commit,
            Err(e) if e.is_conflict() => {
                debug!(kind = %kind, operations = staged, error = %e, "pass lost a race");
                return Err(e.into());
            }
            Err(e) => {
                error!(kind = %kind, operations = staged, error = %e, "pass commit failed");
                return Err(e.into());
            }
        };

        for key in self.releases.iter().filter(|k| !self.named.contains(*k)) {
            if let Err(e) = self.allocator.release(self.pool, key).await {
                warn!(key = %key, error = %e, "failed to release tunnel name");
            }
        }

        info!(
            kind = %kind,
            commit = %commit,
            created = self.created.len(),
            refreshed = self.refreshed,
            removed = self.removed.len(),
            already_removed = self.already_removed,
            failures = self.failures.len(),
            "pass committed"
        );

        Ok(PassReport {
            kind,
            commit,
            created: self.created,
            refreshed: self.refreshed,
            removed: self.removed,
            already_removed: self.already_removed,
            failures: self.failures,
            joined,
            departed,
        })
    }
}

/// True when `result` lost a race with a concurrent pass and the pass may
/// run again from a fresh snapshot.
fn rerun(kind: PassKind, attempt: usize, result: &TepMgrResult<PassReport>) -> bool {
    match result {
        Err(e) if e.is_conflict() && attempt < MAX_PASS_ATTEMPTS => {
            warn!(kind = %kind, attempt, error = %e, "concurrent update, rerunning pass");
            true
        }
        _ => false,
    }
}

fn pair_link(pair: &WirePair) -> Link {
    Link::both(
        TunnelTerminus::from_node(pair.source.node_id, &pair.source.endpoint),
        TunnelTerminus::from_node(pair.destination.node_id, &pair.destination.endpoint),
    )
}

/// Tunnel mesh orchestrator.
pub struct TepMgr {
    store: Arc<dyn Datastore>,
    allocator: Arc<dyn IdAllocator>,
    monitor: Arc<dyn MonitorTableInstaller>,
    settings: TepMgrSettings,
}

impl TepMgr {
    pub fn new(
        store: Arc<dyn Datastore>,
        allocator: Arc<dyn IdAllocator>,
        monitor: Arc<dyn MonitorTableInstaller>,
        settings: TepMgrSettings,
    ) -> Self {
        Self {
            store,
            allocator,
            monitor,
            settings,
        }
    }

    pub fn settings(&self) -> &TepMgrSettings {
        &self.settings
    }

    fn begin(&self, kind: PassKind) -> Pass<'_> {
        Pass {
            kind,
            txn: Transaction::new(self.store.clone()),
            builder: TunnelBuilder::new(
                self.allocator.as_ref(),
                &self.settings.id_pool,
                self.settings.monitor,
            ),
            allocator: self.allocator.as_ref(),
            pool: &self.settings.id_pool,
            wired: BTreeSet::new(),
            unwired: BTreeSet::new(),
            named: BTreeSet::new(),
            releases: Vec::new(),
            created: Vec::new(),
            refreshed: 0,
            removed: Vec::new(),
            already_removed: 0,
            failures: Vec::new(),
        }
    }

    /// Read-once snapshot of the nodes taking part in the mesh.
    pub async fn meshed_set(&self) -> TepMgrResult<MeshedSet> {
        let containers =
            scan_as::<NodeEndpoints>(self.store.as_ref(), DPN_ENDPOINTS_TABLE).await?;
        Ok(MeshedSet::from_containers(containers))
    }

    /// Endpoint of `node_id` at `ip`, from the meshed set or the zone
    /// declarations.
    pub async fn find_endpoint(
        &self,
        node_id: NodeId,
        ip: &IpAddr,
    ) -> TepMgrResult<Option<TunnelEndpoint>> {
        let container: Option<NodeEndpoints> =
            read_as(self.store.as_ref(), &dpn_endpoints_path(node_id)).await?;
        if let Some(endpoint) = container
            .and_then(|c| c.endpoints.into_iter().find(|ep| ep.ip == *ip))
        {
            return Ok(Some(endpoint));
        }
        let zones = ZoneIndex::load(self.store.as_ref()).await?;
        Ok(zones.find_vtep(node_id, ip))
    }

    /// Hardware device at `ip`, registered or declared in a zone.
    pub async fn find_device(&self, ip: &IpAddr) -> TepMgrResult<Option<HardwareEndpoint>> {
        let registered: Option<HardwareEndpoint> =
            read_as(self.store.as_ref(), &device_endpoint_path(ip)).await?;
        if registered.is_some() {
            return Ok(registered);
        }
        let zones = ZoneIndex::load(self.store.as_ref()).await?;
        Ok(zones.find_device(ip))
    }

    /// Adds endpoints and devices to the mesh.
    ///
    /// A pass that lost a race with a concurrent pass is rerun, up to
    /// [`MAX_PASS_ATTEMPTS`] times in all.
    pub async fn build(&self, request: BuildRequest) -> TepMgrResult<PassReport> {
        let mut attempt = 1;
        loop {
            let result = self.build_once(&request).await;
            if !rerun(PassKind::Build, attempt, &result) {
                return result;
            }
            attempt += 1;
        }
    }

    async fn build_once(&self, request: &BuildRequest) -> TepMgrResult<PassReport> {
        let store = self.store.as_ref();
        let meshed = self.meshed_set().await?;
        let zones = ZoneIndex::load(store).await?;
        let registered = load_devices(store).await?;

        info!(
            endpoints = request.endpoints.len(),
            devices = request.devices.len(),
            meshed = meshed.len(),
            "starting build pass"
        );
        for zone in request.zones() {
            if zones.zone(&zone).is_none() {
                debug!(zone = %zone, "zone is not declared in TRANSPORT_ZONE");
            }
        }

        validate_build(request, &meshed, &registered)?;
        let plan = compute_mesh(&request.endpoints, &meshed)?;

        let mut pass = self.begin(PassKind::Build);
        pass.wire_pairs(&plan.pairs).await;

        let view = SubnetView::new(&zones, &plan.meshed, &registered, &request.devices);
        for link in hardware_links(&request.endpoints, &request.devices, &view) {
            pass.wire_link(&link).await;
        }

        register_endpoints(&mut pass.txn, &request.endpoints).await?;
        for device in &request.devices {
            pass.txn.merge(device_endpoint_path(&device.ip), device)?;
        }

        let gateways = load_gateways(store).await?;
        for link in external_links(&plan.meshed, plan.joined.iter().copied(), &gateways) {
            pass.wire_link(&link).await;
        }

        let report = pass.finish(plan.joined, Vec::new()).await?;
        self.notify_monitoring(&report.joined, true).await;
        Ok(report)
    }

    /// Removes endpoints and devices from the mesh.
    pub async fn teardown(&self, request: TeardownRequest) -> TepMgrResult<PassReport> {
        let request = validate_teardown(request)?;
        let mut attempt = 1;
        loop {
            let result = self.teardown_once(&request).await;
            if !rerun(PassKind::Teardown, attempt, &result) {
                return result;
            }
            attempt += 1;
        }
    }

    async fn teardown_once(&self, request: &TeardownRequest) -> TepMgrResult<PassReport> {
        let store = self.store.as_ref();
        let meshed = self.meshed_set().await?;
        let zones = ZoneIndex::load(store).await?;
        let registered = load_devices(store).await?;

        info!(
            endpoints = request.endpoints.len(),
            devices = request.devices.len(),
            meshed = meshed.len(),
            "starting teardown pass"
        );

        let plan = compute_departures(&request.endpoints, &meshed);

        let mut pass = self.begin(PassKind::Teardown);
        pass.unwire_pairs(&plan.pairs).await;

        let view = SubnetView::new(&zones, &meshed, &registered, &request.devices);
        for link in hardware_links(&request.endpoints, &request.devices, &view) {
            pass.unwire_link(&link).await;
        }

        // External tunnels follow a node's first endpoint.
        let gateways = load_gateways(store).await?;
        let nodes: BTreeSet<NodeId> = request.endpoints.iter().map(|ne| ne.node_id).collect();
        for node_id in nodes {
            let before = meshed.first_endpoint(node_id);
            let after = plan.meshed.first_endpoint(node_id);
            if before.map(|ep| ep.ip) == after.map(|ep| ep.ip) {
                continue;
            }
            if let Some(old) = before {
                for link in gateways.iter().filter_map(|gw| external_link(node_id, old, gw)) {
                    pass.unwire_link(&link).await;
                }
            }
            if let Some(new) = after {
                debug!(node_id, endpoint = %new.ip, "moving external tunnels to next endpoint");
                for link in gateways.iter().filter_map(|gw| external_link(node_id, new, gw)) {
                    pass.wire_link(&link).await;
                }
            }
        }

        let departed = cascade_endpoint_removal(&mut pass.txn, &request.endpoints).await?;
        for device in &request.devices {
            pass.txn.delete(device_endpoint_path(&device.ip));
        }

        let report = pass.finish(Vec::new(), departed).await?;
        self.notify_monitoring(&report.departed, false).await;
        Ok(report)
    }

    /// Persists an external peer and wires every meshed node to it.
    pub async fn add_external_gateway(&self, gateway: ExternalGateway) -> TepMgrResult<PassReport> {
        if gateway.ip.is_unspecified() || gateway.ip.is_multicast() {
            return Err(TepMgrError::validation(
                "ip",
                format!("{} is not a usable gateway address", gateway.ip),
            ));
        }

        let mut attempt = 1;
        loop {
            let result = self.add_external_gateway_once(&gateway).await;
            if !rerun(PassKind::AddExternalGateway, attempt, &result) {
                return result;
            }
            attempt += 1;
        }
    }

    async fn add_external_gateway_once(&self, gateway: &ExternalGateway) -> TepMgrResult<PassReport> {
        let meshed = self.meshed_set().await?;
        info!(gateway = %gateway.ip, meshed = meshed.len(), "adding external gateway");

        let mut pass = self.begin(PassKind::AddExternalGateway);
        pass.txn.merge(dc_gateway_path(&gateway.ip), gateway)?;
        for link in external_links(&meshed, meshed.node_ids(), std::slice::from_ref(gateway)) {
            pass.wire_link(&link).await;
        }
        pass.finish(Vec::new(), Vec::new()).await
    }

    /// Removes the tunnels towards an external peer and forgets the peer.
    pub async fn remove_external_gateway(&self, ip: IpAddr) -> TepMgrResult<PassReport> {
        let mut attempt = 1;
        loop {
            let result = self.remove_external_gateway_once(ip).await;
            if !rerun(PassKind::RemoveExternalGateway, attempt, &result) {
                return result;
            }
            attempt += 1;
        }
    }

    async fn remove_external_gateway_once(&self, ip: IpAddr) -> TepMgrResult<PassReport> {
        let path = dc_gateway_path(&ip);
        let gateway = read_as::<ExternalGateway>(self.store.as_ref(), &path)
            .await?
            .unwrap_or_else(|| ExternalGateway::new(ip, TunnelType::default()));

        let meshed = self.meshed_set().await?;
        info!(gateway = %ip, meshed = meshed.len(), "removing external gateway");

        let mut pass = self.begin(PassKind::RemoveExternalGateway);
        for link in external_links(&meshed, meshed.node_ids(), std::slice::from_ref(&gateway)) {
            pass.unwire_link(&link).await;
        }
        pass.txn.delete(path);
        pass.finish(Vec::new(), Vec::new()).await
    }

    async fn notify_monitoring(&self, nodes: &[NodeId], enabled: bool) {
        for node_id in nodes {
            if let Err(e) = self.monitor.set_monitoring_table(*node_id, enabled).await {
                warn!(node_id, enabled, error = %e, "failed to update monitoring table");
            }
        }
    }
}

/// Adds each endpoint to its node's container and the node to its zone.
async fn register_endpoints(txn: &mut Transaction, endpoints: &[NodeEndpoint]) -> StoreResult<()> {
    for ne in endpoints {
        let node_path = dpn_endpoints_path(ne.node_id);
        let mut container = txn
            .read::<NodeEndpoints>(&node_path)
            .await?
            .unwrap_or(NodeEndpoints {
                node_id: ne.node_id,
                endpoints: Vec::new(),
            });
        match container
            .endpoints
            .iter_mut()
            .find(|ep| ep.ip == ne.endpoint.ip)
        {
            Some(existing) => *existing = ne.endpoint.clone(),
            None => container.endpoints.push(ne.endpoint.clone()),
        }
        txn.merge(node_path, &container)?;

        let zone_path = teps_in_zone_path(&ne.endpoint.zone);
        let mut members = txn
            .read::<ZoneMembers>(&zone_path)
            .await?
            .unwrap_or_else(|| ZoneMembers {
                zone: ne.endpoint.zone.clone(),
                nodes: BTreeSet::new(),
            });
        if members.nodes.insert(ne.node_id) {
            txn.merge(zone_path, &members)?;
        }
    }
    Ok(())
}

/// Rejects a build request before anything is staged.
fn validate_build(
    request: &BuildRequest,
    meshed: &MeshedSet,
    registered: &[HardwareEndpoint],
) -> TepMgrResult<()> {
    let device_ips: BTreeSet<IpAddr> = registered
        .iter()
        .chain(request.devices.iter())
        .map(|d| d.ip)
        .collect();

    let mut owners: BTreeMap<IpAddr, NodeId> = BTreeMap::new();
    let mut per_zone: BTreeMap<(NodeId, &str), &TunnelEndpoint> = BTreeMap::new();

    for ne in &request.endpoints {
        let ep = &ne.endpoint;
        ep.validate()?;

        if let Some(owner) = owners.insert(ep.ip, ne.node_id) {
            let message = if owner == ne.node_id {
                "repeated within the request".to_string()
            } else {
                format!("also claimed by node {} in the request", owner)
            };
            return Err(TepMgrError::duplicate(ne.node_id, ep.ip, message));
        }
        if let Some((owner, _)) = meshed.find_by_ip(&ep.ip) {
            if owner != ne.node_id {
                return Err(TepMgrError::duplicate(
                    ne.node_id,
                    ep.ip,
                    format!("already owned by node {}", owner),
                ));
            }
        }
        if device_ips.contains(&ep.ip) {
            return Err(TepMgrError::duplicate(
                ne.node_id,
                ep.ip,
                "address belongs to a hardware device",
            ));
        }

        let key = (ne.node_id, ep.zone.as_str());
        let existing = per_zone
            .get(&key)
            .copied()
            .or_else(|| meshed.zone_endpoint(ne.node_id, &ep.zone));
        match existing {
            Some(other) if other.ip != ep.ip => {
                if other.tunnel_type.is_gre() || ep.tunnel_type.is_gre() {
                    return Err(TepMgrError::validation(
                        "tunnel_type",
                        format!(
                            "node {} already has endpoint {} in zone {}; only one GRE tunnel endpoint per node per zone",
                            ne.node_id, other.ip, ep.zone
                        ),
                    ));
                }
                return Err(TepMgrError::validation(
                    "zone",
                    format!(
                        "node {} already has endpoint {} in zone {}",
                        ne.node_id, other.ip, ep.zone
                    ),
                ));
            }
            _ => {
                per_zone.insert(key, ep);
            }
        }
    }

    let mut seen_devices = BTreeSet::new();
    for device in &request.devices {
        device.validate()?;
        if !seen_devices.insert(device.ip) {
            return Err(TepMgrError::validation(
                "ip",
                format!("device address {} repeated within the request", device.ip),
            ));
        }
        if let Some((owner, _)) = meshed.find_by_ip(&device.ip) {
            return Err(TepMgrError::validation(
                "ip",
                format!("device address {} is owned by node {}", device.ip, owner),
            ));
        }
        if let Some(other) = registered.iter().find(|r| r.ip == device.ip) {
            if other.normalized_node_id() != device.normalized_node_id() {
                return Err(TepMgrError::validation(
                    "ip",
                    format!(
                        "device address {} is registered to {}",
                        device.ip,
                        other.normalized_node_id()
                    ),
                ));
            }
        }
    }

    Ok(())
}

/// Checks addressing and drops repeated entries of a teardown request.
fn validate_teardown(mut request: TeardownRequest) -> TepMgrResult<TeardownRequest> {
    for ne in &request.endpoints {
        ne.endpoint.validate()?;
    }
    for device in &request.devices {
        device.validate()?;
    }

    let mut seen = BTreeSet::new();
    request
        .endpoints
        .retain(|ne| seen.insert((ne.node_id, ne.endpoint.ip)));
    let mut seen = BTreeSet::new();
    request.devices.retain(|d| seen.insert(d.ip));
    Ok(request)
}
