//! Mesh computation engine.
//!
//! Pure functions over an immutable [`MeshedSet`] snapshot. A build plan
//! lists the node pairs to wire and the meshed set that results once the
//! added endpoints are in; a departure plan does the same for removals.

use std::collections::BTreeMap;
use std::net::IpAddr;

use thiserror::Error;

use crate::types::{NodeEndpoint, NodeEndpoints, NodeId, TunnelEndpoint};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    /// A node would hold two different endpoints in one zone.
    #[error("node {node_id} already has endpoint {existing} in zone {zone}; second endpoint {candidate} is not supported")]
    SecondZoneMatch {
        node_id: NodeId,
        zone: String,
        existing: IpAddr,
        candidate: IpAddr,
    },
}

/// Nodes already taking part in the mesh, with their endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshedSet {
    nodes: BTreeMap<NodeId, Vec<TunnelEndpoint>>,
}

impl MeshedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_containers(containers: impl IntoIterator<Item = NodeEndpoints>) -> Self {
        let nodes = containers
            .into_iter()
            .filter(|c| !c.endpoints.is_empty())
            .map(|c| (c.node_id, c.endpoints))
            .collect();
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn endpoints(&self, node_id: NodeId) -> &[TunnelEndpoint] {
        self.nodes.get(&node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Endpoint a node's external tunnels are built from.
    pub fn first_endpoint(&self, node_id: NodeId) -> Option<&TunnelEndpoint> {
        self.endpoints(node_id).first()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &TunnelEndpoint)> {
        self.nodes
            .iter()
            .flat_map(|(id, eps)| eps.iter().map(move |ep| (*id, ep)))
    }

    pub fn find_by_ip(&self, ip: &IpAddr) -> Option<(NodeId, &TunnelEndpoint)> {
        self.iter().find(|(_, ep)| ep.ip == *ip)
    }

    pub fn zone_endpoint(&self, node_id: NodeId, zone: &str) -> Option<&TunnelEndpoint> {
        self.endpoints(node_id).iter().find(|ep| ep.zone == zone)
    }

    fn insert(&mut self, node_id: NodeId, endpoint: TunnelEndpoint) {
        let eps = self.nodes.entry(node_id).or_default();
        match eps.iter_mut().find(|ep| ep.ip == endpoint.ip) {
            Some(existing) => *existing = endpoint,
            None => eps.push(endpoint),
        }
    }

    /// Returns true if the node's last endpoint went away.
    fn remove(&mut self, node_id: NodeId, ip: &IpAddr) -> bool {
        let Some(eps) = self.nodes.get_mut(&node_id) else {
            return false;
        };
        eps.retain(|ep| ep.ip != *ip);
        if eps.is_empty() {
            self.nodes.remove(&node_id);
            return true;
        }
        false
    }
}

/// Two node endpoints to be joined in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePair {
    pub source: NodeEndpoint,
    pub destination: NodeEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshPlan {
    pub pairs: Vec<WirePair>,
    pub meshed: MeshedSet,
    /// Nodes that were not meshed before this plan.
    pub joined: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeparturePlan {
    pub pairs: Vec<WirePair>,
    pub meshed: MeshedSet,
    /// Nodes whose last endpoint was removed.
    pub departed: Vec<NodeId>,
}

/// Same-zone endpoint of `node_id`, failing if there is more than one.
fn single_zone_match(
    meshed: &MeshedSet,
    node_id: NodeId,
    zone: &str,
) -> Result<Option<TunnelEndpoint>, MeshError> {
    let mut matches = meshed.endpoints(node_id).iter().filter(|ep| ep.zone == zone);
    let first = matches.next();
    if let (Some(first), Some(second)) = (first, matches.next()) {
        return Err(MeshError::SecondZoneMatch {
            node_id,
            zone: zone.to_string(),
            existing: first.ip,
            candidate: second.ip,
        });
    }
    Ok(first.cloned())
}

/// Incremental full mesh.
///
/// Each added endpoint is paired with the same-zone endpoint of every other
/// node in the working set, then its node joins the working set, so later
/// endpoints of the same batch see it.
pub fn compute_mesh(added: &[NodeEndpoint], meshed: &MeshedSet) -> Result<MeshPlan, MeshError> {
    let mut working = meshed.clone();
    let mut pairs = Vec::new();
    let mut joined = Vec::new();

    for candidate in added {
        let zone = &candidate.endpoint.zone;

        if let Some(own) = working.zone_endpoint(candidate.node_id, zone) {
            if own.ip != candidate.endpoint.ip {
                return Err(MeshError::SecondZoneMatch {
                    node_id: candidate.node_id,
                    zone: zone.clone(),
                    existing: own.ip,
                    candidate: candidate.endpoint.ip,
                });
            }
        }

        let others: Vec<NodeId> = working
            .node_ids()
            .filter(|id| *id != candidate.node_id)
            .collect();
        for other in others {
            if let Some(peer) = single_zone_match(&working, other, zone)? {
                pairs.push(WirePair {
                    source: candidate.clone(),
                    destination: NodeEndpoint::new(other, peer),
                });
            }
        }

        if !working.contains(candidate.node_id) {
            joined.push(candidate.node_id);
        }
        working.insert(candidate.node_id, candidate.endpoint.clone());
    }

    Ok(MeshPlan {
        pairs,
        meshed: working,
        joined,
    })
}

/// Pairs touching each removed endpoint, and the set left afterwards.
///
/// Endpoints that are not in the set still produce their pairs so that
/// teardown can confirm the tunnels are gone.
pub fn compute_departures(removed: &[NodeEndpoint], meshed: &MeshedSet) -> DeparturePlan {
    let mut working = meshed.clone();
    let mut pairs = Vec::new();
    let mut departed = Vec::new();

    for leaving in removed {
        let zone = &leaving.endpoint.zone;
        let others: Vec<NodeId> = working
            .node_ids()
            .filter(|id| *id != leaving.node_id)
            .collect();
        for other in others {
            if let Some(peer) = working.zone_endpoint(other, zone) {
                pairs.push(WirePair {
                    source: leaving.clone(),
                    destination: NodeEndpoint::new(other, peer.clone()),
                });
            }
        }

        if working.remove(leaving.node_id, &leaving.endpoint.ip) {
            departed.push(leaving.node_id);
        }
    }

    DeparturePlan {
        pairs,
        meshed: working,
        departed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ne(node_id: NodeId, ip: &str, zone: &str) -> NodeEndpoint {
        let subnet = format!("{}/24", ip);
        NodeEndpoint::new(
            node_id,
            TunnelEndpoint::new(ip.parse().unwrap(), subnet.parse().unwrap(), zone),
        )
    }

    fn pair_ids(pairs: &[WirePair]) -> Vec<(NodeId, NodeId)> {
        pairs
            .iter()
            .map(|p| (p.source.node_id, p.destination.node_id))
            .collect()
    }

    #[test]
    fn test_empty_meshed_set_wires_nothing() {
        let plan = compute_mesh(&[ne(1, "10.0.0.1", "Z1")], &MeshedSet::new()).unwrap();
        assert!(plan.pairs.is_empty());
        assert_eq!(plan.joined, vec![1]);
        assert!(plan.meshed.contains(1));
    }

    #[test]
    fn test_batch_builds_full_mesh() {
        let added = vec![
            ne(1, "10.0.0.1", "Z1"),
            ne(2, "10.0.0.2", "Z1"),
            ne(3, "10.0.0.3", "Z1"),
        ];
        let plan = compute_mesh(&added, &MeshedSet::new()).unwrap();
        assert_eq!(pair_ids(&plan.pairs), vec![(2, 1), (3, 1), (3, 2)]);
        assert_eq!(plan.joined, vec![1, 2, 3]);
        assert_eq!(plan.meshed.len(), 3);
    }

    #[test]
    fn test_zone_isolation() {
        let meshed = compute_mesh(&[ne(1, "10.0.0.1", "Z1")], &MeshedSet::new())
            .unwrap()
            .meshed;
        let plan = compute_mesh(&[ne(2, "10.0.0.2", "Z2")], &meshed).unwrap();
        assert!(plan.pairs.is_empty());
    }

    #[test]
    fn test_input_snapshot_untouched() {
        let meshed = compute_mesh(&[ne(1, "10.0.0.1", "Z1")], &MeshedSet::new())
            .unwrap()
            .meshed;
        let before = meshed.clone();
        compute_mesh(&[ne(2, "10.0.0.2", "Z1")], &meshed).unwrap();
        assert_eq!(meshed, before);
    }

    #[test]
    fn test_resubmitted_endpoint_is_rewired_not_rejected() {
        let meshed = compute_mesh(
            &[ne(1, "10.0.0.1", "Z1"), ne(2, "10.0.0.2", "Z1")],
            &MeshedSet::new(),
        )
        .unwrap()
        .meshed;

        let plan = compute_mesh(&[ne(2, "10.0.0.2", "Z1")], &meshed).unwrap();
        assert_eq!(pair_ids(&plan.pairs), vec![(2, 1)]);
        assert!(plan.joined.is_empty());
        assert_eq!(plan.meshed, meshed);
    }

    #[test]
    fn test_second_same_zone_endpoint_rejected() {
        let meshed = compute_mesh(&[ne(1, "10.0.0.1", "Z1")], &MeshedSet::new())
            .unwrap()
            .meshed;
        let err = compute_mesh(&[ne(1, "10.0.0.9", "Z1")], &meshed).unwrap_err();
        assert!(matches!(err, MeshError::SecondZoneMatch { node_id: 1, .. }));

        // different zone on the same node is fine
        assert!(compute_mesh(&[ne(1, "10.0.5.1", "Z2")], &meshed).is_ok());
    }

    #[test]
    fn test_departures() {
        let meshed = compute_mesh(
            &[
                ne(1, "10.0.0.1", "Z1"),
                ne(2, "10.0.0.2", "Z1"),
                ne(2, "10.0.1.2", "Z2"),
            ],
            &MeshedSet::new(),
        )
        .unwrap()
        .meshed;

        let plan = compute_departures(&[ne(2, "10.0.0.2", "Z1")], &meshed);
        assert_eq!(pair_ids(&plan.pairs), vec![(2, 1)]);
        assert!(plan.departed.is_empty());
        assert_eq!(plan.meshed.endpoints(2).len(), 1);

        let plan = compute_departures(&[ne(1, "10.0.0.1", "Z1")], &meshed);
        assert_eq!(plan.departed, vec![1]);
        assert!(!plan.meshed.contains(1));

        // unknown endpoint: pairs still computed, nothing departs
        let plan = compute_departures(&[ne(3, "10.0.0.3", "Z1")], &meshed);
        assert_eq!(pair_ids(&plan.pairs), vec![(3, 1), (3, 2)]);
        assert!(plan.departed.is_empty());
    }
}
