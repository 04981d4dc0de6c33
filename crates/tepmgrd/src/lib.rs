//! Tunnel Endpoint Manager Daemon - overlay tunnel mesh orchestrator
//!
//! tepmgrd keeps a full mesh of point-to-point tunnels between the tunnel
//! endpoints (TEPs) of a transport zone, handling:
//! - Internal tunnels between every pair of meshed nodes
//! - Hardware VTEP tunnels between nodes and devices sharing a subnet
//! - One-way tunnels from every node towards external gateways
//! - Existence-checked teardown with container cleanup
//! - Per-zone serialization of build and teardown passes
//!
//! Each pass stages its writes into one [`store::Transaction`] and commits
//! them atomically.

pub mod config;
pub mod error;
pub mod external;
pub mod hw_vtep;
pub mod id_alloc;
pub mod job;
pub mod mesh;
pub mod monitor;
pub mod store;
pub mod tables;
pub mod teardown;
pub mod tep_mgr;
pub mod tep_orch;
pub mod types;
pub mod wire;

pub use config::TepMgrConfig;
pub use error::{TepMgrError, TepMgrResult};
pub use id_alloc::{IdAllocator, StoreIdAllocator};
pub use job::{JobCoordinator, PassHandle};
pub use mesh::MeshedSet;
pub use monitor::{MonitorTableInstaller, StoreMonitorInstaller};
pub use store::{Datastore, MemoryStore, Transaction};
pub use tep_mgr::{BuildRequest, EndpointBatch, PassReport, TeardownRequest, TepMgr, TepMgrSettings};
pub use tep_orch::TepOrch;
pub use types::{ExternalGateway, HardwareEndpoint, NodeEndpoint, NodeId, TunnelEndpoint};
