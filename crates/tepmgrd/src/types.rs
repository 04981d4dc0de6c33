//! Endpoint, zone and tunnel record definitions

use std::collections::BTreeSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sonic_types::{IpPrefix, MonitorProtocol, TunnelType, VlanId};

use crate::error::{TepMgrError, TepMgrResult};

/// Numeric identifier of a data-plane node.
pub type NodeId = u64;

/// Port name used when the change feed does not carry one.
pub const DEFAULT_PORT_NAME: &str = "tunnel_port";

/// Marker that starts the device qualifier of a hardware node id.
pub const PHYSICAL_SWITCH_MARKER: &str = "/physicalswitch";

/// Strips the device qualifier from a hardware node id.
///
/// `hwvtep://uuid/42/physicalswitch/tor1` becomes `hwvtep://uuid/42`.
pub fn normalize_hw_node_id(node_id: &str) -> &str {
    match node_id.find(PHYSICAL_SWITCH_MARKER) {
        Some(pos) => &node_id[..pos],
        None => node_id,
    }
}

/// Where a node accepts encapsulated traffic for one transport zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub ip: IpAddr,
    #[serde(default = "default_port_name")]
    pub port_name: String,
    #[serde(default)]
    pub vlan_id: VlanId,
    pub subnet: IpPrefix,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    pub zone: String,
    #[serde(default)]
    pub tunnel_type: TunnelType,
}

fn default_port_name() -> String {
    DEFAULT_PORT_NAME.to_string()
}

impl TunnelEndpoint {
    /// Create an untagged VXLAN endpoint on the default port
    pub fn new(ip: IpAddr, subnet: IpPrefix, zone: impl Into<String>) -> Self {
        Self {
            ip,
            port_name: default_port_name(),
            vlan_id: VlanId::UNTAGGED,
            subnet,
            gateway: None,
            zone: zone.into(),
            tunnel_type: TunnelType::Vxlan,
        }
    }

    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_vlan(mut self, vlan_id: VlanId) -> Self {
        self.vlan_id = vlan_id;
        self
    }

    pub fn with_port(mut self, port_name: impl Into<String>) -> Self {
        self.port_name = port_name.into();
        self
    }

    pub fn with_tunnel_type(mut self, tunnel_type: TunnelType) -> Self {
        self.tunnel_type = tunnel_type;
        self
    }

    /// Checks address/subnet/gateway consistency.
    pub fn validate(&self) -> TepMgrResult<()> {
        validate_addressing(&self.zone, &self.ip, &self.subnet, self.gateway.as_ref())?;
        if self.port_name.is_empty() {
            return Err(TepMgrError::validation("port_name", "port name is empty"));
        }
        Ok(())
    }
}

fn validate_addressing(
    zone: &str,
    ip: &IpAddr,
    subnet: &IpPrefix,
    gateway: Option<&IpAddr>,
) -> TepMgrResult<()> {
    if zone.trim().is_empty() {
        return Err(TepMgrError::validation("zone", "transport zone name is empty"));
    }
    if ip.is_unspecified() || ip.is_multicast() {
        return Err(TepMgrError::validation(
            "ip",
            format!("{} is not a usable unicast address", ip),
        ));
    }
    if !subnet.same_family(ip) {
        return Err(TepMgrError::validation(
            "subnet",
            format!("{} and {} are of different address families", ip, subnet),
        ));
    }
    if !subnet.contains(ip) {
        return Err(TepMgrError::validation(
            "subnet",
            format!("{} is outside {}", ip, subnet),
        ));
    }
    if let Some(gateway) = gateway {
        if !subnet.same_family(gateway) {
            return Err(TepMgrError::validation(
                "gateway",
                format!("{} and {} are of different address families", gateway, subnet),
            ));
        }
    }
    Ok(())
}

/// One endpoint together with its owning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub node_id: NodeId,
    pub endpoint: TunnelEndpoint,
}

impl NodeEndpoint {
    pub fn new(node_id: NodeId, endpoint: TunnelEndpoint) -> Self {
        Self { node_id, endpoint }
    }
}

/// Per-node endpoint container (one DPN_ENDPOINTS record).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoints {
    pub node_id: NodeId,
    #[serde(default)]
    pub endpoints: Vec<TunnelEndpoint>,
}

/// Hardware gateway device (TOR) terminating tunnels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareEndpoint {
    pub topology_id: String,
    pub node_id: String,
    pub ip: IpAddr,
    pub zone: String,
    #[serde(default)]
    pub tunnel_type: TunnelType,
    /// Written as an explicit null so a merge clears an earlier gateway.
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    pub subnet: IpPrefix,
}

impl HardwareEndpoint {
    pub fn normalized_node_id(&self) -> &str {
        normalize_hw_node_id(&self.node_id)
    }

    pub fn validate(&self) -> TepMgrResult<()> {
        if self.topology_id.is_empty() || self.node_id.is_empty() {
            return Err(TepMgrError::validation(
                "node_id",
                "hardware endpoint needs topology and node ids",
            ));
        }
        validate_addressing(&self.zone, &self.ip, &self.subnet, self.gateway.as_ref())
    }
}

/// Node endpoint declared inside a subnet of a transport zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vtep {
    pub node_id: NodeId,
    #[serde(default = "default_port_name")]
    pub port_name: String,
    pub ip: IpAddr,
}

/// Hardware device declared inside a subnet of a transport zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceVtep {
    pub topology_id: String,
    pub node_id: String,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub prefix: IpPrefix,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub vlan_id: VlanId,
    #[serde(default)]
    pub vteps: Vec<Vtep>,
    #[serde(default)]
    pub device_vteps: Vec<DeviceVtep>,
}

impl Subnet {
    pub fn new(prefix: IpPrefix) -> Self {
        Self {
            prefix,
            gateway: None,
            vlan_id: VlanId::UNTAGGED,
            vteps: Vec::new(),
            device_vteps: Vec::new(),
        }
    }
}

/// Administrative grouping of endpoints that are fully meshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportZone {
    pub name: String,
    #[serde(default)]
    pub tunnel_type: TunnelType,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

/// Monitoring parameters stamped onto every tunnel interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub enabled: bool,
    pub protocol: MonitorProtocol,
    pub interval_ms: u64,
}

/// Logical point-to-point tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInterface {
    pub name: String,
    pub tunnel_type: TunnelType,
    pub source_ip: IpAddr,
    pub destination_ip: IpAddr,
    /// Null when both ends share a subnet. Always serialized so that a
    /// merge over an older interface clears its gateway.
    #[serde(default)]
    pub gateway_ip: Option<IpAddr>,
    #[serde(default)]
    pub vlan_id: VlanId,
    pub monitor: MonitorSettings,
    pub enabled: bool,
    /// Port (node) or topology:device (hardware) that owns the interface.
    pub parent_port: String,
    /// True for node-to-node tunnels.
    pub internal: bool,
}

/// INTERNAL_TUNNEL record: node to node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalTunnel {
    pub source_node: NodeId,
    pub destination_node: NodeId,
    pub tunnel_type: TunnelType,
    pub interface_name: String,
    /// Allocator key the interface name was drawn from.
    pub name_key: String,
}

/// EXTERNAL_TUNNEL record: any tunnel with a hardware or external end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTunnel {
    pub source_device: String,
    pub destination_device: String,
    pub tunnel_type: TunnelType,
    pub interface_name: String,
    /// Allocator key the interface name was drawn from.
    pub name_key: String,
}

/// Zone-level membership container (one TEPS_IN_ZONE record).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneMembers {
    pub zone: String,
    #[serde(default)]
    pub nodes: BTreeSet<NodeId>,
}

/// External peer every node is wired to (e.g. a DC gateway).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalGateway {
    pub ip: IpAddr,
    #[serde(default)]
    pub tunnel_type: TunnelType,
}

impl ExternalGateway {
    pub fn new(ip: IpAddr, tunnel_type: TunnelType) -> Self {
        Self { ip, tunnel_type }
    }
}

/// TUNNEL_MONITOR record written by the monitoring installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMonitorEntry {
    pub node_id: NodeId,
    pub enabled: bool,
    pub protocol: MonitorProtocol,
    pub interval_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ep(ip: &str, subnet: &str) -> TunnelEndpoint {
        TunnelEndpoint::new(ip.parse().unwrap(), subnet.parse().unwrap(), "Z1")
    }

    #[test]
    fn test_normalize_hw_node_id() {
        assert_eq!(
            normalize_hw_node_id("hwvtep://uuid/42/physicalswitch/tor1"),
            "hwvtep://uuid/42"
        );
        assert_eq!(normalize_hw_node_id("hwvtep://uuid/42"), "hwvtep://uuid/42");
    }

    #[test]
    fn test_endpoint_validate() {
        assert!(ep("10.0.0.1", "10.0.0.0/24").validate().is_ok());
        assert!(ep("10.0.1.1", "10.0.0.0/24").validate().is_err());
        assert!(ep("2001:db8::1", "10.0.0.0/24").validate().is_err());
        assert!(ep("0.0.0.0", "0.0.0.0/0").validate().is_err());

        let bad_gw = ep("10.0.0.1", "10.0.0.0/24").with_gateway("2001:db8::1".parse().unwrap());
        assert!(bad_gw.validate().is_err());

        let mut no_zone = ep("10.0.0.1", "10.0.0.0/24");
        no_zone.zone = " ".to_string();
        assert!(no_zone.validate().is_err());
    }

    #[test]
    fn test_endpoint_serde_defaults() {
        let json = r#"{"ip":"10.0.0.1","subnet":"10.0.0.0/24","zone":"Z1"}"#;
        let endpoint: TunnelEndpoint = serde_json::from_str(json).unwrap();
        assert_eq!(endpoint, ep("10.0.0.1", "10.0.0.0/24"));
        assert_eq!(endpoint.port_name, DEFAULT_PORT_NAME);
        assert_eq!(endpoint.tunnel_type, TunnelType::Vxlan);
    }

    #[test]
    fn test_hardware_endpoint() {
        let hw = HardwareEndpoint {
            topology_id: "hwvtep:1".to_string(),
            node_id: "hwvtep://uuid/7/physicalswitch/tor7".to_string(),
            ip: "20.0.0.1".parse().unwrap(),
            zone: "Z1".to_string(),
            tunnel_type: TunnelType::Vxlan,
            gateway: None,
            subnet: "20.0.0.0/24".parse().unwrap(),
        };
        assert_eq!(hw.normalized_node_id(), "hwvtep://uuid/7");
        assert!(hw.validate().is_ok());

        let record = serde_json::to_value(&hw).unwrap();
        assert_eq!(record.get("gateway"), Some(&serde_json::Value::Null));
    }
}
