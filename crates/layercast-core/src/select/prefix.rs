//! Pre-fixes assignment variables from the flow allocation so the integer program only has to
//! search over one server-side switch per client-side switch.

use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    allocate::RateTable,
    demand::ClientDemand,
    network::{types::NodeId, Commodity, Network},
    solve::EPS,
};

/// One assignment variable: whether `server` delivers `layer` to `client`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_new::new, serde::Serialize,
)]
pub struct SlotKey {
    pub client: NodeId,
    pub layer: usize,
    pub server: NodeId,
}

/// A linear cap `Σ demand · w ≤ rate` over the free slots of one commodity.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RateCap {
    pub commodity: Commodity,
    pub rate: f64,
    pub slots: Vec<(SlotKey, f64)>,
}

/// Fixed assignment variables and the caps that bound the remaining free ones.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Prefix {
    fixed: BTreeMap<SlotKey, bool>,
    caps: Vec<RateCap>,
}

impl Prefix {
    /// The value `key` is fixed to, if any.
    pub fn get(&self, key: SlotKey) -> Option<bool> {
        self.fixed.get(&key).copied()
    }

    pub fn caps(&self) -> &[RateCap] {
        &self.caps
    }

    pub fn nr_fixed(&self) -> usize {
        self.fixed.len()
    }

    fn fix(&mut self, key: SlotKey, value: bool) {
        self.fixed.insert(key, value);
    }
}

/// Computes the pre-fixed variables for one cycle.
///
/// Layers missing from the catalog are fixed to 0 everywhere. Then, per client-side switch,
/// server-side switches are visited by ascending rate, all but the last:
///
/// - a switch with no rate has all its slots fixed to 0;
/// - otherwise layers are walked before clients, adding each layer's demand to a running
///   total. A layer is fixed to 1 on the switch's first server while the total fits in the
///   rate and its lower layer is already granted, and to 0 on the switch otherwise.
///
/// The last switch keeps its slots free under a [`RateCap`].
pub fn prefix(network: &Network, rates: &RateTable, demands: &[ClientDemand]) -> Prefix {
    let by_client = demands
        .iter()
        .map(|d| (d.client, d))
        .collect::<FxHashMap<_, _>>();
    let need = |client: NodeId, layer: usize| by_client.get(&client).and_then(|d| d.layer(layer));
    let nr_layers = demands.iter().map(|d| d.layers.len()).max().unwrap_or(0);

    let mut p = Prefix::default();
    for &client in network.clients() {
        for layer in 0..nr_layers {
            if need(client, layer).is_none() {
                for &server in network.servers() {
                    p.fix(SlotKey::new(client, layer, server), false);
                }
            }
        }
    }

    let mut granted = FxHashSet::default();
    for &sink in network.client_side() {
        let clients = network.clients_at(sink);
        let mut order = network
            .server_side()
            .iter()
            .map(|&source| Commodity::new(source, sink))
            .collect::<Vec<_>>();
        order.sort_by_key(|&c| (OrderedFloat(rates.get(c)), c.source));
        let Some((&largest, rest)) = order.split_last() else {
            continue;
        };
        for &commodity in rest {
            let rate = rates.get(commodity);
            let servers = network.servers_at(commodity.source);
            if rate <= EPS {
                for &client in clients {
                    for layer in 0..nr_layers {
                        for &server in servers {
                            p.fix(SlotKey::new(client, layer, server), false);
                        }
                    }
                }
                continue;
            }
            let Some(&first) = servers.first() else {
                continue;
            };
            let mut running = 0.0;
            for layer in 0..nr_layers {
                for &client in clients {
                    let Some(d) = need(client, layer) else {
                        continue;
                    };
                    if granted.contains(&(client, layer)) {
                        continue;
                    }
                    let below_granted = layer == 0 || granted.contains(&(client, layer - 1));
                    if below_granted {
                        running += d.into_f64();
                    }
                    if below_granted && running <= rate + EPS {
                        granted.insert((client, layer));
                        for &server in network.servers() {
                            p.fix(SlotKey::new(client, layer, server), server == first);
                        }
                    } else {
                        for &server in servers {
                            p.fix(SlotKey::new(client, layer, server), false);
                        }
                    }
                }
            }
        }
        let mut slots = Vec::new();
        for layer in 0..nr_layers {
            for &client in clients {
                let Some(d) = need(client, layer) else {
                    continue;
                };
                for &server in network.servers_at(largest.source) {
                    let key = SlotKey::new(client, layer, server);
                    if p.get(key).is_none() {
                        slots.push((key, d.into_f64()));
                    }
                }
            }
        }
        p.caps.push(RateCap {
            commodity: largest,
            rate: rates.get(largest),
            slots,
        });
    }
    p
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;
    use crate::{
        network::{Link, Node},
        units::BytesPerSec,
    };

    /// Two server-side switches (1 and 3, serving servers 0 and 2) both linked to client-side
    /// switch 4, which serves clients 5 and 6.
    fn two_source_network() -> anyhow::Result<Network> {
        let nodes = vec![
            Node::new_server(NodeId::new(0)),
            Node::new_switch(NodeId::new(1)),
            Node::new_server(NodeId::new(2)),
            Node::new_switch(NodeId::new(3)),
            Node::new_switch(NodeId::new(4)),
            Node::new_client(NodeId::new(5)),
            Node::new_client(NodeId::new(6)),
        ];
        let link = |a, b| Link::new(NodeId::new(a), NodeId::new(b), 1000);
        let links = vec![
            link(0, 1),
            link(2, 3),
            link(1, 4),
            link(3, 4),
            link(4, 5),
            link(4, 6),
        ];
        Network::new(&nodes, &links).context("failed to create topology")
    }

    fn demands(layers: &[Option<u64>]) -> Vec<ClientDemand> {
        [5, 6]
            .into_iter()
            .map(|c| ClientDemand {
                client: NodeId::new(c),
                layers: layers.iter().map(|l| l.map(BytesPerSec::new)).collect(),
            })
            .collect()
    }

    fn key(client: usize, layer: usize, server: usize) -> SlotKey {
        SlotKey::new(NodeId::new(client), layer, NodeId::new(server))
    }

    fn rates(small: f64, large: f64) -> RateTable {
        [
            (Commodity::new(NodeId::new(1), NodeId::new(4)), small),
            (Commodity::new(NodeId::new(3), NodeId::new(4)), large),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn capped_switch_denies_a_client() -> anyhow::Result<()> {
        let network = two_source_network()?;
        let p = prefix(&network, &rates(1000.0, 5000.0), &demands(&[Some(600)]));
        // The smaller switch fits one 600-unit layer in 1000
        assert_eq!(p.get(key(5, 0, 0)), Some(true));
        assert_eq!(p.get(key(5, 0, 2)), Some(false));
        assert_eq!(p.get(key(6, 0, 0)), Some(false));
        // The largest switch stays free for the denied client only
        assert_eq!(p.caps().len(), 1);
        let cap = &p.caps()[0];
        assert_eq!(cap.commodity.source, NodeId::new(3));
        assert_eq!(cap.rate, 5000.0);
        assert_eq!(cap.slots, vec![(key(6, 0, 2), 600.0)]);
        Ok(())
    }

    #[test]
    fn zero_rate_switch_is_closed() -> anyhow::Result<()> {
        let network = two_source_network()?;
        let p = prefix(&network, &rates(0.0, 5000.0), &demands(&[Some(100), Some(100)]));
        for client in [5, 6] {
            for layer in 0..2 {
                assert_eq!(p.get(key(client, layer, 0)), Some(false));
                assert_eq!(p.get(key(client, layer, 2)), None);
            }
        }
        assert_eq!(p.caps()[0].slots.len(), 4);
        Ok(())
    }

    #[test]
    fn walk_is_layer_major_and_monotone() -> anyhow::Result<()> {
        let network = two_source_network()?;
        // Base layers of both clients fit, then only one enhancement layer
        let p = prefix(&network, &rates(350.0, 5000.0), &demands(&[Some(100), Some(100)]));
        insta::assert_yaml_snapshot!(
            [key(5, 0, 0), key(6, 0, 0), key(5, 1, 0), key(6, 1, 0)].map(|k| p.get(k)),
            @r###"
        - true
        - true
        - true
        - false
        "###
        );
        Ok(())
    }

    #[test]
    fn unavailable_layers_are_never_free() -> anyhow::Result<()> {
        let network = two_source_network()?;
        let p = prefix(&network, &rates(0.0, 5000.0), &demands(&[Some(100), None]));
        for client in [5, 6] {
            for server in [0, 2] {
                assert_eq!(p.get(key(client, 1, server)), Some(false));
            }
        }
        assert!(p.caps()[0].slots.iter().all(|(k, _)| k.layer == 0));
        Ok(())
    }
}
