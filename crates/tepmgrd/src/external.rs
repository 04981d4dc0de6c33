//! External gateway wiring.
//!
//! Every meshed node gets one tunnel towards each external peer, built from
//! the node's first endpoint. The peer side is not managed here, so the
//! links are one-way.

use tracing::debug;

use crate::mesh::MeshedSet;
use crate::store::{scan_as, Datastore, StoreResult};
use crate::tables::DC_GATEWAY_TABLE;
use crate::types::{ExternalGateway, NodeId, TunnelEndpoint};
use crate::wire::{Link, TunnelTerminus};

pub async fn load_gateways(store: &dyn Datastore) -> StoreResult<Vec<ExternalGateway>> {
    scan_as(store, DC_GATEWAY_TABLE).await
}

/// Link from one node endpoint to an external peer, if the address
/// families agree.
pub fn external_link(
    node_id: NodeId,
    endpoint: &TunnelEndpoint,
    gateway: &ExternalGateway,
) -> Option<Link> {
    if endpoint.ip.is_ipv4() != gateway.ip.is_ipv4() {
        debug!(
            node_id,
            endpoint = %endpoint.ip,
            gateway = %gateway.ip,
            "skipping external gateway of another address family"
        );
        return None;
    }
    Some(Link::one_way(
        TunnelTerminus::from_node(node_id, endpoint),
        TunnelTerminus::external(gateway),
    ))
}

/// Links from the first endpoint of each listed node to every gateway.
pub fn external_links(
    meshed: &MeshedSet,
    nodes: impl IntoIterator<Item = NodeId>,
    gateways: &[ExternalGateway],
) -> Vec<Link> {
    let mut links = Vec::new();
    for node_id in nodes {
        let Some(endpoint) = meshed.first_endpoint(node_id) else {
            continue;
        };
        links.extend(
            gateways
                .iter()
                .filter_map(|gw| external_link(node_id, endpoint, gw)),
        );
    }
    links
}
