//! Turns per-edge commodity flows into concrete switch paths for every granted layer.

use rustc_hash::FxHashMap;

use crate::{
    allocate::FlowSolution,
    demand::ClientDemand,
    network::{types::NodeId, Commodity, Network, Scope},
    select::AssignmentSolution,
    solve::EPS,
};

/// The switches one granted layer traverses, from the server's switch to the client's.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ForwardingPath {
    pub client: NodeId,
    pub layer: usize,
    pub server: NodeId,
    pub commodity: Commodity,
    pub switches: Vec<NodeId>,
    /// Whether the walk reached the client-side switch.
    pub complete: bool,
}

impl ForwardingPath {
    /// Every `(switch, next node)` hop, ending with the hop from the client-side switch to the
    /// client. Empty for incomplete paths.
    pub fn hops(&self) -> Vec<(NodeId, NodeId)> {
        if !self.complete {
            return Vec::new();
        }
        self.switches
            .windows(2)
            .map(|w| (w[0], w[1]))
            .chain(self.switches.last().map(|&sw| (sw, self.client)))
            .collect()
    }
}

/// Walks the flow of every commodity to route the layers `assignment` grants.
///
/// Per client-side switch, commodities are visited in ascending rate order; within one, layers
/// are visited before clients. Each layer consumes its demand from the first neighboring edge
/// with enough remaining flow. Walks give up after as many hops as there are switches.
pub fn extract(
    network: &Network,
    solution: &FlowSolution,
    assignment: &AssignmentSolution,
    demands: &[ClientDemand],
) -> Vec<ForwardingPath> {
    let by_client = demands
        .iter()
        .map(|d| (d.client, d))
        .collect::<FxHashMap<_, _>>();
    let nr_layers = demands.iter().map(|d| d.layers.len()).max().unwrap_or(0);
    let mut paths = Vec::new();
    for &sink in network.client_side() {
        let mut commodities = network
            .server_side()
            .iter()
            .map(|&source| Commodity::new(source, sink))
            .map(|c| (c, solution.rates().get(c)))
            .filter(|&(_, rate)| rate > 0.0)
            .collect::<Vec<_>>();
        commodities.sort_by(|(a, ra), (b, rb)| ra.total_cmp(rb).then(a.cmp(b)));
        for (commodity, _) in commodities {
            let mut remaining = solution.flows_of(commodity).collect::<FxHashMap<_, _>>();
            for layer in 0..nr_layers {
                for &client in network.clients_at(sink) {
                    let Some(server) = assignment.server_for(client, layer) else {
                        continue;
                    };
                    if network.attachment(server) != Some(commodity.source) {
                        continue;
                    }
                    let Some(need) = by_client.get(&client).and_then(|d| d.layer(layer)) else {
                        continue;
                    };
                    let path = walk(network, commodity, need.into_f64(), &mut remaining);
                    let complete = path.last() == Some(&sink);
                    if !complete {
                        log::warn!(
                            "layer {layer} of client {client} has no complete path over {commodity}"
                        );
                    }
                    paths.push(ForwardingPath {
                        client,
                        layer,
                        server,
                        commodity,
                        switches: path,
                        complete,
                    });
                }
            }
        }
    }
    paths
}

fn walk(
    network: &Network,
    commodity: Commodity,
    need: f64,
    remaining: &mut FxHashMap<(NodeId, NodeId), f64>,
) -> Vec<NodeId> {
    let mut path = vec![commodity.source];
    let mut cur = commodity.source;
    let mut hops = 0;
    while cur != commodity.sink {
        let next = network
            .connections(cur, Scope::Fabric)
            .iter()
            .copied()
            .find(|&n| remaining.get(&(cur, n)).is_some_and(|&f| f - need >= -EPS));
        let Some(next) = next else {
            break;
        };
        if let Some(f) = remaining.get_mut(&(cur, next)) {
            *f -= need;
        }
        path.push(next);
        cur = next;
        hops += 1;
        if hops >= network.nr_switches() {
            break;
        }
    }
    path
}
