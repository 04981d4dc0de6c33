//! Table and field name constants for tepmgrd

use std::net::IpAddr;

use crate::store::StorePath;
use crate::types::NodeId;

// Configuration owned by the ingestion layer (read-only here)
pub const TRANSPORT_ZONE_TABLE: &str = "TRANSPORT_ZONE";
pub const DC_GATEWAY_TABLE: &str = "DC_GATEWAY";

// Mesh state owned by tepmgrd
pub const DPN_ENDPOINTS_TABLE: &str = "DPN_ENDPOINTS";
pub const DEVICE_ENDPOINTS_TABLE: &str = "DEVICE_ENDPOINTS";
pub const TEPS_IN_ZONE_TABLE: &str = "TEPS_IN_ZONE";
pub const TUNNEL_INTERFACE_TABLE: &str = "TUNNEL_INTERFACE";
pub const INTERNAL_TUNNEL_TABLE: &str = "INTERNAL_TUNNEL";
pub const EXTERNAL_TUNNEL_TABLE: &str = "EXTERNAL_TUNNEL";
pub const TUNNEL_MONITOR_TABLE: &str = "TUNNEL_MONITOR";

// Unique-name allocator state
pub const ID_POOL_TABLE: &str = "ID_POOL";
pub const ID_POOL_ENTRY_TABLE: &str = "ID_POOL_ENTRY";

// Change feed (consumer)
pub const TEP_TABLE: &str = "TEP_TABLE";
pub const DEVICE_VTEP_TABLE: &str = "DEVICE_VTEP_TABLE";

/// Separator between table name and key parts.
pub const KEY_SEPARATOR: char = '|';

/// TEP_TABLE fields (key: `<node_id>|<ip>`)
pub mod tep_fields {
    pub const ZONE: &str = "zone";
    pub const SUBNET: &str = "subnet";
    pub const GATEWAY: &str = "gateway";
    pub const VLAN_ID: &str = "vlan_id";
    pub const TUNNEL_TYPE: &str = "tunnel_type";
    pub const PORT_NAME: &str = "port_name";
}

/// DEVICE_VTEP_TABLE fields (key: `<topology_id>|<node_id>|<ip>`)
pub mod device_vtep_fields {
    pub const ZONE: &str = "zone";
    pub const SUBNET: &str = "subnet";
    pub const GATEWAY: &str = "gateway";
    pub const TUNNEL_TYPE: &str = "tunnel_type";
}

pub fn transport_zone_path(zone: &str) -> StorePath {
    StorePath::new(TRANSPORT_ZONE_TABLE, zone)
}

pub fn dc_gateway_path(ip: &IpAddr) -> StorePath {
    StorePath::new(DC_GATEWAY_TABLE, ip.to_string())
}

pub fn dpn_endpoints_path(node_id: NodeId) -> StorePath {
    StorePath::new(DPN_ENDPOINTS_TABLE, node_id.to_string())
}

pub fn device_endpoint_path(ip: &IpAddr) -> StorePath {
    StorePath::new(DEVICE_ENDPOINTS_TABLE, ip.to_string())
}

pub fn teps_in_zone_path(zone: &str) -> StorePath {
    StorePath::new(TEPS_IN_ZONE_TABLE, zone)
}

pub fn tunnel_interface_path(name: &str) -> StorePath {
    StorePath::new(TUNNEL_INTERFACE_TABLE, name)
}

pub fn internal_tunnel_path(source: NodeId, destination: NodeId) -> StorePath {
    StorePath::new(
        INTERNAL_TUNNEL_TABLE,
        format!("{}{}{}", source, KEY_SEPARATOR, destination),
    )
}

pub fn external_tunnel_path(source: &str, destination: &str) -> StorePath {
    StorePath::new(
        EXTERNAL_TUNNEL_TABLE,
        format!("{}{}{}", source, KEY_SEPARATOR, destination),
    )
}

pub fn tunnel_monitor_path(node_id: NodeId) -> StorePath {
    StorePath::new(TUNNEL_MONITOR_TABLE, node_id.to_string())
}

pub fn id_pool_path(pool: &str) -> StorePath {
    StorePath::new(ID_POOL_TABLE, pool)
}

pub fn id_pool_entry_path(pool: &str, key: &str) -> StorePath {
    StorePath::new(
        ID_POOL_ENTRY_TABLE,
        format!("{}{}{}", pool, KEY_SEPARATOR, key),
    )
}
