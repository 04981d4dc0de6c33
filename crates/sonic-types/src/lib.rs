//! Common SONiC types for overlay tunnel orchestration.
//!
//! This crate provides type-safe representations of the network primitives
//! shared by the tunnel endpoint manager and its tests:
//!
//! - [`IpPrefix`]: IP subnets in CIDR notation with containment checks
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers (0 means untagged)
//! - [`TunnelType`]: overlay encapsulation (VXLAN, GRE)
//! - [`MonitorProtocol`]: tunnel liveness monitoring protocol

mod ip;
mod tunnel;
mod vlan;

pub use ip::IpPrefix;
pub use tunnel::{MonitorProtocol, TunnelType};
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid VLAN ID: {0} (must be 0-4094)")]
    InvalidVlanId(u16),

    #[error("invalid tunnel type: {0}")]
    InvalidTunnelType(String),

    #[error("invalid monitor protocol: {0}")]
    InvalidMonitorProtocol(String),
}
