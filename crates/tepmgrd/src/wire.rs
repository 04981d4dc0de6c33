//! Tunnel interface builder.
//!
//! Every wiring decision, whatever kind of endpoints it joins, ends up here
//! as a (source, destination) pair of [`TunnelTerminus`] values. The owner
//! variant decides how the interface is named and which record table it is
//! registered in; the rest of the construction is shared.

use std::fmt;
use std::net::IpAddr;

use sonic_types::{IpPrefix, TunnelType, VlanId};
use thiserror::Error;
use tracing::debug;

use crate::id_alloc::{IdAllocError, IdAllocator};
use crate::store::{StoreError, StorePath, Transaction};
use crate::tables::{external_tunnel_path, internal_tunnel_path, tunnel_interface_path};
use crate::types::{
    normalize_hw_node_id, ExternalGateway, ExternalTunnel, HardwareEndpoint, InternalTunnel,
    MonitorSettings, NodeId, TunnelEndpoint, TunnelInterface,
};

/// Prefix of generated interface names.
pub const TUNNEL_NAME_PREFIX: &str = "tun";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("address family mismatch between {source_ip} and {destination_ip}")]
    FamilyMismatch {
        source_ip: IpAddr,
        destination_ip: IpAddr,
    },

    #[error("cannot name tunnel: {0}")]
    Naming(#[from] IdAllocError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Who owns one end of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Owner {
    Node(NodeId),
    Hardware { topology_id: String, node_id: String },
    External(IpAddr),
}

impl Owner {
    /// Identity used in tunnel record keys; hardware ids are normalized.
    pub fn record_key(&self) -> String {
        match self {
            Owner::Node(id) => id.to_string(),
            Owner::Hardware { node_id, .. } => normalize_hw_node_id(node_id).to_string(),
            Owner::External(ip) => ip.to_string(),
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Owner::Node(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Node(id) => write!(f, "node {}", id),
            Owner::Hardware { topology_id, node_id } => {
                write!(f, "device {}/{}", topology_id, node_id)
            }
            Owner::External(ip) => write!(f, "external {}", ip),
        }
    }
}

/// One end of a tunnel, with everything needed to build it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTerminus {
    pub owner: Owner,
    pub ip: IpAddr,
    /// Unknown for external peers.
    pub subnet: Option<IpPrefix>,
    pub gateway: Option<IpAddr>,
    pub vlan_id: VlanId,
    pub port_name: String,
    pub tunnel_type: TunnelType,
}

impl TunnelTerminus {
    pub fn from_node(node_id: NodeId, endpoint: &TunnelEndpoint) -> Self {
        Self {
            owner: Owner::Node(node_id),
            ip: endpoint.ip,
            subnet: Some(endpoint.subnet),
            gateway: endpoint.gateway,
            vlan_id: endpoint.vlan_id,
            port_name: endpoint.port_name.clone(),
            tunnel_type: endpoint.tunnel_type,
        }
    }

    pub fn from_hardware(device: &HardwareEndpoint) -> Self {
        Self {
            owner: Owner::Hardware {
                topology_id: device.topology_id.clone(),
                node_id: device.node_id.clone(),
            },
            ip: device.ip,
            subnet: Some(device.subnet),
            gateway: device.gateway,
            vlan_id: VlanId::UNTAGGED,
            port_name: String::new(),
            tunnel_type: device.tunnel_type,
        }
    }

    pub fn external(gateway: &ExternalGateway) -> Self {
        Self {
            owner: Owner::External(gateway.ip),
            ip: gateway.ip,
            subnet: None,
            gateway: None,
            vlan_id: VlanId::UNTAGGED,
            port_name: String::new(),
            tunnel_type: gateway.tunnel_type,
        }
    }

    /// Owning-port identifier used as the first naming input.
    ///
    /// Nodes name through port and VLAN, hardware devices through topology
    /// and normalized node id.
    pub fn parent_port(&self) -> String {
        match &self.owner {
            Owner::Node(_) => format!("{}:{}", self.port_name, self.vlan_id),
            Owner::Hardware { topology_id, node_id } => {
                format!("{}:{}", topology_id, normalize_hw_node_id(node_id))
            }
            Owner::External(ip) => ip.to_string(),
        }
    }
}

impl fmt::Display for TunnelTerminus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.owner, self.ip)
    }
}

/// A wiring decision: build `source -> destination`, and the reverse too
/// when `bidirectional`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub source: TunnelTerminus,
    pub destination: TunnelTerminus,
    pub bidirectional: bool,
}

impl Link {
    pub fn both(source: TunnelTerminus, destination: TunnelTerminus) -> Self {
        Self {
            source,
            destination,
            bidirectional: true,
        }
    }

    pub fn one_way(source: TunnelTerminus, destination: TunnelTerminus) -> Self {
        Self {
            source,
            destination,
            bidirectional: false,
        }
    }

    /// Forward first, then reverse.
    pub fn directions(&self) -> Vec<(&TunnelTerminus, &TunnelTerminus)> {
        let mut out = vec![(&self.source, &self.destination)];
        if self.bidirectional {
            out.push((&self.destination, &self.source));
        }
        out
    }
}

/// Allocator key of the interface from `source` to `destination_ip`.
pub fn tunnel_name_key(source: &TunnelTerminus, destination_ip: &IpAddr) -> String {
    format!("{}:{}:{}", source.parent_port(), source.ip, destination_ip)
}

/// Interface name for an allocated id; always 11 characters.
pub fn tunnel_name(id: u32) -> String {
    format!("{}{:08x}", TUNNEL_NAME_PREFIX, id)
}

/// Gateway of the `source -> destination` interface.
///
/// None when both ends share a subnet. When the destination subnet is
/// unknown (external peer) the source subnet's containment decides.
pub fn resolve_gateway(source: &TunnelTerminus, destination: &TunnelTerminus) -> Option<IpAddr> {
    let same_subnet = match (source.subnet, destination.subnet) {
        (Some(src), Some(dst)) => src == dst,
        (Some(src), None) => src.contains(&destination.ip),
        (None, _) => false,
    };
    if same_subnet {
        None
    } else {
        source.gateway
    }
}

fn ensure_same_family(
    source: &TunnelTerminus,
    destination: &TunnelTerminus,
) -> Result<(), WireError> {
    if source.ip.is_ipv4() != destination.ip.is_ipv4() {
        return Err(WireError::FamilyMismatch {
            source_ip: source.ip,
            destination_ip: destination.ip,
        });
    }
    Ok(())
}

/// Record registering an interface under its owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelRecord {
    Internal(InternalTunnel),
    External(ExternalTunnel),
}

impl TunnelRecord {
    pub fn interface_name(&self) -> &str {
        match self {
            TunnelRecord::Internal(r) => &r.interface_name,
            TunnelRecord::External(r) => &r.interface_name,
        }
    }
}

/// Record path of the `source -> destination` tunnel.
///
/// Tunnels towards an external peer are keyed by the peer address first.
pub fn record_path(source: &Owner, destination: &Owner) -> StorePath {
    match (source, destination) {
        (Owner::Node(src), Owner::Node(dst)) => internal_tunnel_path(*src, *dst),
        (_, Owner::External(_)) => {
            external_tunnel_path(&destination.record_key(), &source.record_key())
        }
        _ => external_tunnel_path(&source.record_key(), &destination.record_key()),
    }
}

/// Everything staged for one tunnel direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPlan {
    pub interface: TunnelInterface,
    pub record_path: StorePath,
    pub record: TunnelRecord,
}

/// Builds tunnel objects and stages them into a pass transaction.
pub struct TunnelBuilder<'a> {
    allocator: &'a dyn IdAllocator,
    pool: &'a str,
    monitor: MonitorSettings,
}

impl<'a> TunnelBuilder<'a> {
    pub fn new(allocator: &'a dyn IdAllocator, pool: &'a str, monitor: MonitorSettings) -> Self {
        Self {
            allocator,
            pool,
            monitor,
        }
    }

    pub fn pool(&self) -> &str {
        self.pool
    }

    /// Allocates (or looks up) the interface name for a direction.
    pub async fn tunnel_name(
        &self,
        source: &TunnelTerminus,
        destination_ip: &IpAddr,
    ) -> Result<String, WireError> {
        let key = tunnel_name_key(source, destination_ip);
        let id = self.allocator.allocate(self.pool, &key).await?;
        Ok(tunnel_name(id))
    }

    /// Builds the interface and its record without touching the store.
    pub fn describe(
        &self,
        name: &str,
        source: &TunnelTerminus,
        destination: &TunnelTerminus,
    ) -> Result<TunnelPlan, WireError> {
        ensure_same_family(source, destination)?;

        let name_key = tunnel_name_key(source, &destination.ip);
        let internal = matches!(
            (&source.owner, &destination.owner),
            (Owner::Node(_), Owner::Node(_))
        );

        let interface = TunnelInterface {
            name: name.to_string(),
            tunnel_type: source.tunnel_type,
            source_ip: source.ip,
            destination_ip: destination.ip,
            gateway_ip: resolve_gateway(source, destination),
            vlan_id: source.vlan_id,
            monitor: self.monitor,
            enabled: true,
            parent_port: source.parent_port(),
            internal,
        };

        let record = match (&source.owner, &destination.owner) {
            (Owner::Node(src), Owner::Node(dst)) => TunnelRecord::Internal(InternalTunnel {
                source_node: *src,
                destination_node: *dst,
                tunnel_type: source.tunnel_type,
                interface_name: name.to_string(),
                name_key,
            }),
            _ => TunnelRecord::External(ExternalTunnel {
                source_device: source.owner.record_key(),
                destination_device: destination.owner.record_key(),
                tunnel_type: source.tunnel_type,
                interface_name: name.to_string(),
                name_key,
            }),
        };

        Ok(TunnelPlan {
            interface,
            record_path: record_path(&source.owner, &destination.owner),
            record,
        })
    }

    /// Stages one merge of the interface and one of its record. Returns the
    /// interface name.
    pub async fn stage(
        &self,
        txn: &mut Transaction,
        source: &TunnelTerminus,
        destination: &TunnelTerminus,
    ) -> Result<String, WireError> {
        ensure_same_family(source, destination)?;
        let name = self.tunnel_name(source, &destination.ip).await?;
        let plan = self.describe(&name, source, destination)?;

        txn.merge(tunnel_interface_path(&name), &plan.interface)?;
        match &plan.record {
            TunnelRecord::Internal(r) => txn.merge(plan.record_path.clone(), r)?,
            TunnelRecord::External(r) => txn.merge(plan.record_path.clone(), r)?,
        }

        debug!(
            source = %source,
            destination = %destination,
            interface = %name,
            gateway = ?plan.interface.gateway_ip,
            "staged tunnel"
        );
        Ok(name)
    }
}
