//! Teardown and reconciliation.
//!
//! Removal is existence-checked: a direction whose record is gone is
//! reported as already removed rather than failing, so repeating a
//! teardown is harmless. Once the tunnels are staged for deletion the
//! endpoint containers are cleaned up, cascading to the zone container.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::store::{StoreResult, Transaction};
use crate::tables::{dpn_endpoints_path, teps_in_zone_path, tunnel_interface_path};
use crate::types::{NodeEndpoint, NodeEndpoints, NodeId, ZoneMembers};
use crate::wire::{record_path, tunnel_name_key, TunnelTerminus, WireError};

/// Outcome of removing one tunnel direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Interface and record staged for deletion; holds the interface name
    /// and the allocator key to release after commit.
    Removed { name: String, key: String },
    AlreadyRemoved,
}

/// Both record kinds carry the interface name and its allocator key.
#[derive(Debug, Deserialize)]
struct RecordName {
    interface_name: String,
    /// Empty for records written before the key was stored.
    #[serde(default)]
    name_key: String,
}

/// Stages deletion of the `source -> destination` interface and record.
///
/// The interface and allocator key come from the stored record, not from
/// the naming inputs of `source`, so a teardown whose port or VLAN differs
/// from the build still frees the id the interface was named from. Nothing
/// is allocated.
pub async fn remove_tunnel(
    txn: &mut Transaction,
    source: &TunnelTerminus,
    destination: &TunnelTerminus,
) -> Result<Removal, WireError> {
    let path = record_path(&source.owner, &destination.owner);
    let Some(record) = txn.read::<RecordName>(&path).await? else {
        debug!(
            source = %source,
            destination = %destination,
            "tunnel already removed"
        );
        return Ok(Removal::AlreadyRemoved);
    };

    let derived = tunnel_name_key(source, &destination.ip);
    let key = if record.name_key.is_empty() {
        derived
    } else {
        if derived != record.name_key {
            warn!(
                record = %path,
                recorded = %record.name_key,
                derived = %derived,
                "naming inputs changed since the tunnel was built, releasing recorded key"
            );
        }
        record.name_key
    };

    txn.delete(tunnel_interface_path(&record.interface_name));
    txn.delete(path);

    debug!(
        source = %source,
        destination = %destination,
        interface = %record.interface_name,
        "staged tunnel removal"
    );
    Ok(Removal::Removed {
        name: record.interface_name,
        key,
    })
}

/// Removes each endpoint from its node's container, dropping empty node
/// and zone containers. Returns the nodes whose container was deleted.
pub async fn cascade_endpoint_removal(
    txn: &mut Transaction,
    removed: &[NodeEndpoint],
) -> StoreResult<Vec<NodeId>> {
    let mut departed = Vec::new();

    for leaving in removed {
        let node_path = dpn_endpoints_path(leaving.node_id);
        let Some(mut container) = txn.read::<NodeEndpoints>(&node_path).await? else {
            continue;
        };

        let before = container.endpoints.len();
        container.endpoints.retain(|ep| ep.ip != leaving.endpoint.ip);
        if container.endpoints.len() == before {
            continue;
        }

        if container.endpoints.is_empty() {
            txn.delete(node_path);
            departed.push(leaving.node_id);
        } else {
            txn.merge(node_path, &container)?;
        }

        let zone = &leaving.endpoint.zone;
        if container.endpoints.iter().any(|ep| &ep.zone == zone) {
            continue;
        }

        let zone_path = teps_in_zone_path(zone);
        if let Some(mut members) = txn.read::<ZoneMembers>(&zone_path).await? {
            members.nodes.remove(&leaving.node_id);
            if members.nodes.is_empty() {
                debug!(zone = %zone, "zone has no nodes left, removing container");
                txn.delete(zone_path);
            } else {
                txn.merge(zone_path, &members)?;
            }
        }
    }

    Ok(departed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_alloc::{IdAllocator, StoreIdAllocator};
    use crate::store::MemoryStore;
    use crate::types::{MonitorSettings, TunnelEndpoint};
    use crate::wire::TunnelBuilder;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn ne(node_id: NodeId, ip: &str, zone: &str) -> NodeEndpoint {
        NodeEndpoint::new(
            node_id,
            TunnelEndpoint::new(ip.parse().unwrap(), "10.0.0.0/16".parse().unwrap(), zone),
        )
    }

    #[tokio::test]
    async fn test_remove_tunnel_existence_checked() {
        let store = Arc::new(MemoryStore::new());
        let alloc = StoreIdAllocator::new(store.clone());
        alloc.create_pool("p", 1, 10).await.unwrap();
        let builder = TunnelBuilder::new(&alloc, "p", MonitorSettings::default());

        let a = TunnelTerminus::from_node(1, &ne(1, "10.0.0.1", "Z1").endpoint);
        let b = TunnelTerminus::from_node(2, &ne(2, "10.0.0.2", "Z1").endpoint);

        let mut txn = Transaction::new(store.clone());
        let name = builder.stage(&mut txn, &a, &b).await.unwrap();
        txn.submit().await.unwrap();

        let mut txn = Transaction::new(store.clone());
        let first = remove_tunnel(&mut txn, &a, &b).await.unwrap();
        assert_eq!(
            first,
            Removal::Removed {
                name: name.clone(),
                key: tunnel_name_key(&a, &b.ip),
            }
        );
        // staged delete is visible to the rest of the pass
        let again = remove_tunnel(&mut txn, &a, &b).await.unwrap();
        assert_eq!(again, Removal::AlreadyRemoved);
        txn.submit().await.unwrap();

        assert!(store.get(&tunnel_interface_path(&name)).is_none());
        assert!(store.keys("INTERNAL_TUNNEL").is_empty());

        // the reverse direction never existed
        let mut txn = Transaction::new(store.clone());
        let reverse = remove_tunnel(&mut txn, &b, &a).await.unwrap();
        assert_eq!(reverse, Removal::AlreadyRemoved);
        assert!(txn.is_empty());
    }

    #[tokio::test]
    async fn test_remove_tunnel_uses_recorded_key() {
        let store = Arc::new(MemoryStore::new());
        let alloc = StoreIdAllocator::new(store.clone());
        alloc.create_pool("p", 1, 1).await.unwrap();
        let builder = TunnelBuilder::new(&alloc, "p", MonitorSettings::default());

        let built = ne(1, "10.0.0.1", "Z1").endpoint.with_port("eth1");
        let a = TunnelTerminus::from_node(1, &built);
        let b = TunnelTerminus::from_node(2, &ne(2, "10.0.0.2", "Z1").endpoint);

        let mut txn = Transaction::new(store.clone());
        let name = builder.stage(&mut txn, &a, &b).await.unwrap();
        txn.submit().await.unwrap();

        // same endpoint reported on another port; the pool is already full
        let moved = TunnelTerminus::from_node(1, &built.clone().with_port("eth9"));
        let mut txn = Transaction::new(store.clone());
        let removal = remove_tunnel(&mut txn, &moved, &b).await.unwrap();
        assert_eq!(
            removal,
            Removal::Removed {
                name,
                key: tunnel_name_key(&a, &b.ip),
            }
        );
        assert_eq!(store.keys("ID_POOL_ENTRY").len(), 1);

        alloc.release("p", &tunnel_name_key(&a, &b.ip)).await.unwrap();
        assert!(store.keys("ID_POOL_ENTRY").is_empty());
        assert_eq!(alloc.allocate("p", "next").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_record_without_key_falls_back_to_derived() {
        let store = Arc::new(MemoryStore::new());
        let a = TunnelTerminus::from_node(1, &ne(1, "10.0.0.1", "Z1").endpoint);
        let b = TunnelTerminus::from_node(2, &ne(2, "10.0.0.2", "Z1").endpoint);
        store
            .put(
                &record_path(&a.owner, &b.owner),
                &serde_json::json!({"interface_name": "tun00000001"}),
            )
            .unwrap();

        let mut txn = Transaction::new(store.clone());
        let removal = remove_tunnel(&mut txn, &a, &b).await.unwrap();
        assert_eq!(
            removal,
            Removal::Removed {
                name: "tun00000001".to_string(),
                key: tunnel_name_key(&a, &b.ip),
            }
        );
    }

    #[tokio::test]
    async fn test_cascade() {
        let store = Arc::new(MemoryStore::new());
        let one = ne(1, "10.0.0.1", "Z1");
        let two_a = ne(2, "10.0.0.2", "Z1");
        let two_b = ne(2, "10.0.1.2", "Z2");

        store
            .put(
                &dpn_endpoints_path(1),
                &NodeEndpoints {
                    node_id: 1,
                    endpoints: vec![one.endpoint.clone()],
                },
            )
            .unwrap();
        store
            .put(
                &dpn_endpoints_path(2),
                &NodeEndpoints {
                    node_id: 2,
                    endpoints: vec![two_a.endpoint.clone(), two_b.endpoint.clone()],
                },
            )
            .unwrap();
        store
            .put(
                &teps_in_zone_path("Z1"),
                &ZoneMembers {
                    zone: "Z1".to_string(),
                    nodes: BTreeSet::from([1, 2]),
                },
            )
            .unwrap();
        store
            .put(
                &teps_in_zone_path("Z2"),
                &ZoneMembers {
                    zone: "Z2".to_string(),
                    nodes: BTreeSet::from([2]),
                },
            )
            .unwrap();

        let mut txn = Transaction::new(store.clone());
        let departed = cascade_endpoint_removal(&mut txn, &[two_a.clone()])
            .await
            .unwrap();
        txn.submit().await.unwrap();
        assert!(departed.is_empty());

        let members: ZoneMembers =
            serde_json::from_value(store.get(&teps_in_zone_path("Z1")).unwrap()).unwrap();
        assert_eq!(members.nodes, BTreeSet::from([1]));

        let mut txn = Transaction::new(store.clone());
        let departed = cascade_endpoint_removal(&mut txn, &[two_b, two_a])
            .await
            .unwrap();
        txn.submit().await.unwrap();
        assert_eq!(departed, vec![2]);
        assert!(store.get(&dpn_endpoints_path(2)).is_none());
        assert!(store.get(&teps_in_zone_path("Z2")).is_none());
        assert!(store.get(&dpn_endpoints_path(1)).is_some());
        assert!(store.get(&teps_in_zone_path("Z1")).is_some());
    }
}
