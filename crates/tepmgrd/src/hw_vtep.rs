//! Hardware gateway (TOR) wiring.
//!
//! Devices are wired per subnet of a zone. A node endpoint is joined to
//! every device in its subnet; a device is joined to every other device
//! and every node endpoint in its subnet. All links are bidirectional and
//! each unordered pair of addresses is emitted once.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use sonic_types::IpPrefix;

use crate::mesh::MeshedSet;
use crate::store::{scan_as, Datastore, StoreResult};
use crate::tables::{DEVICE_ENDPOINTS_TABLE, TRANSPORT_ZONE_TABLE};
use crate::types::{HardwareEndpoint, NodeEndpoint, NodeId, TransportZone, TunnelEndpoint};
use crate::wire::{Link, TunnelTerminus};

/// Read-once view of the `TRANSPORT_ZONE` table.
#[derive(Debug, Clone, Default)]
pub struct ZoneIndex {
    zones: BTreeMap<String, TransportZone>,
}

impl ZoneIndex {
    pub async fn load(store: &dyn Datastore) -> StoreResult<Self> {
        let zones = scan_as::<TransportZone>(store, TRANSPORT_ZONE_TABLE).await?;
        Ok(Self::from_zones(zones))
    }

    pub fn from_zones(zones: impl IntoIterator<Item = TransportZone>) -> Self {
        Self {
            zones: zones.into_iter().map(|z| (z.name.clone(), z)).collect(),
        }
    }

    pub fn zone(&self, name: &str) -> Option<&TransportZone> {
        self.zones.get(name)
    }

    /// Devices declared in zone subnets, with subnet addressing filled in.
    pub fn devices(&self) -> Vec<HardwareEndpoint> {
        let mut out = Vec::new();
        for zone in self.zones.values() {
            for subnet in &zone.subnets {
                for dv in &subnet.device_vteps {
                    out.push(HardwareEndpoint {
                        topology_id: dv.topology_id.clone(),
                        node_id: dv.node_id.clone(),
                        ip: dv.ip,
                        zone: zone.name.clone(),
                        tunnel_type: zone.tunnel_type,
                        gateway: subnet.gateway,
                        subnet: subnet.prefix,
                    });
                }
            }
        }
        out
    }

    pub fn find_device(&self, ip: &IpAddr) -> Option<HardwareEndpoint> {
        self.devices().into_iter().find(|d| d.ip == *ip)
    }

    /// Node endpoint declared in a zone subnet.
    pub fn find_vtep(&self, node_id: NodeId, ip: &IpAddr) -> Option<TunnelEndpoint> {
        self.zones.values().find_map(|zone| {
            zone.subnets.iter().find_map(|subnet| {
                subnet
                    .vteps
                    .iter()
                    .find(|v| v.node_id == node_id && v.ip == *ip)
                    .map(|v| TunnelEndpoint {
                        ip: v.ip,
                        port_name: v.port_name.clone(),
                        vlan_id: subnet.vlan_id,
                        subnet: subnet.prefix,
                        gateway: subnet.gateway,
                        zone: zone.name.clone(),
                        tunnel_type: zone.tunnel_type,
                    })
            })
        })
    }
}

/// Devices registered by earlier passes (`DEVICE_ENDPOINTS`).
pub async fn load_devices(store: &dyn Datastore) -> StoreResult<Vec<HardwareEndpoint>> {
    scan_as(store, DEVICE_ENDPOINTS_TABLE).await
}

/// Subnet membership used to decide hardware links.
#[derive(Debug, Clone, Default)]
pub struct SubnetView {
    nodes: Vec<NodeEndpoint>,
    devices: Vec<HardwareEndpoint>,
}

impl SubnetView {
    /// Devices are de-duplicated by IP; `requested` wins over `registered`,
    /// which wins over zone declarations.
    pub fn new(
        zones: &ZoneIndex,
        meshed: &MeshedSet,
        registered: &[HardwareEndpoint],
        requested: &[HardwareEndpoint],
    ) -> Self {
        let nodes = meshed
            .iter()
            .map(|(id, ep)| NodeEndpoint::new(id, ep.clone()))
            .collect();

        let mut seen = BTreeSet::new();
        let devices = requested
            .iter()
            .cloned()
            .chain(registered.iter().cloned())
            .chain(zones.devices())
            .filter(|d| seen.insert(d.ip))
            .collect();

        Self { nodes, devices }
    }

    pub fn nodes_in<'a>(
        &'a self,
        zone: &'a str,
        prefix: &'a IpPrefix,
    ) -> impl Iterator<Item = &'a NodeEndpoint> + 'a {
        self.nodes
            .iter()
            .filter(move |n| n.endpoint.zone == zone && n.endpoint.subnet == *prefix)
    }

    pub fn devices_in<'a>(
        &'a self,
        zone: &'a str,
        prefix: &'a IpPrefix,
    ) -> impl Iterator<Item = &'a HardwareEndpoint> + 'a {
        self.devices
            .iter()
            .filter(move |d| d.zone == zone && d.subnet == *prefix)
    }
}

/// Unordered address pair, so each link is emitted once.
fn pair_key(a: IpAddr, b: IpAddr) -> (IpAddr, IpAddr) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Links between the changed endpoints/devices and the hardware devices
/// sharing their subnets.
pub fn hardware_links(
    nodes: &[NodeEndpoint],
    devices: &[HardwareEndpoint],
    view: &SubnetView,
) -> Vec<Link> {
    let mut seen = BTreeSet::new();
    let mut links = Vec::new();

    for node in nodes {
        let ep = &node.endpoint;
        for device in view.devices_in(&ep.zone, &ep.subnet) {
            if device.ip == ep.ip || !seen.insert(pair_key(ep.ip, device.ip)) {
                continue;
            }
            links.push(Link::both(
                TunnelTerminus::from_node(node.node_id, ep),
                TunnelTerminus::from_hardware(device),
            ));
        }
    }

    for device in devices {
        for other in view.devices_in(&device.zone, &device.subnet) {
            // IP, not node id, identifies a device here
            if other.ip == device.ip || !seen.insert(pair_key(device.ip, other.ip)) {
                continue;
            }
            links.push(Link::both(
                TunnelTerminus::from_hardware(device),
                TunnelTerminus::from_hardware(other),
            ));
        }

        for node in view.nodes_in(&device.zone, &device.subnet) {
            let ep = &node.endpoint;
            if ep.ip == device.ip || !seen.insert(pair_key(device.ip, ep.ip)) {
                continue;
            }
            links.push(Link::both(
                TunnelTerminus::from_hardware(device),
                TunnelTerminus::from_node(node.node_id, ep),
            ));
        }
    }

    links
}
