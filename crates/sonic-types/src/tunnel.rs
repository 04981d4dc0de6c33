//! Overlay encapsulation and monitoring enums.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tunnel encapsulation type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TunnelType {
    #[default]
    #[serde(rename = "VXLAN")]
    Vxlan,
    #[serde(rename = "GRE")]
    Gre,
}

impl TunnelType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Vxlan => "VXLAN",
            TunnelType::Gre => "GRE",
        }
    }

    pub const fn is_gre(&self) -> bool {
        matches!(self, TunnelType::Gre)
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "VXLAN" => Ok(TunnelType::Vxlan),
            "GRE" | "MPLSOVERGRE" => Ok(TunnelType::Gre),
            _ => Err(ParseError::InvalidTunnelType(s.to_string())),
        }
    }
}

/// Liveness monitoring protocol configured on tunnel interfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorProtocol {
    #[default]
    Bfd,
    Lldp,
}

impl fmt::Display for MonitorProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorProtocol::Bfd => f.write_str("bfd"),
            MonitorProtocol::Lldp => f.write_str("lldp"),
        }
    }
}

impl FromStr for MonitorProtocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bfd" => Ok(MonitorProtocol::Bfd),
            "lldp" => Ok(MonitorProtocol::Lldp),
            _ => Err(ParseError::InvalidMonitorProtocol(s.to_string())),
        }
    }
}
