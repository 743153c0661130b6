//! The static delivery network. A [`Network`] is built once from a list of nodes and links and
//! never changes afterwards; the per-cycle view of spare capacity lives in [`Residuals`].

mod residual;
pub(crate) mod topology;
pub mod types;

use std::net::Ipv4Addr;

use rustc_hash::FxHashMap;

pub use residual::Residuals;
pub use topology::TopologyError;
pub use types::*;

use crate::{units::BytesPerSec, utils};

use self::topology::Topology;

/// A validated delivery network with its switches classified.
#[derive(Debug, Clone)]
pub struct Network {
    topology: Topology,
    classes: FxHashMap<NodeId, SwitchClass>,
    // Leaf -> the switch it hangs off
    attachments: FxHashMap<NodeId, NodeId>,
    servers: Vec<NodeId>,
    clients: Vec<NodeId>,
    switches: Vec<NodeId>,
    server_side: Vec<NodeId>,
    client_side: Vec<NodeId>,
    interior: Vec<NodeId>,
    servers_at: FxHashMap<NodeId, Vec<NodeId>>,
    clients_at: FxHashMap<NodeId, Vec<NodeId>>,
    connections: FxHashMap<(NodeId, Scope), Vec<NodeId>>,
}

impl Network {
    /// Builds a network, validating it as described in [`TopologyError`].
    pub fn new(nodes: &[Node], links: &[Link]) -> Result<Self, TopologyError> {
        let topology = Topology::new(nodes, links)?;

        let mut ids = topology.graph.node_weights().map(|n| n.id).collect::<Vec<_>>();
        ids.sort();
        let of_kind = |kind| {
            ids.iter()
                .copied()
                .filter(|&id| topology.node(id).map(|n| n.kind) == Some(kind))
                .collect::<Vec<_>>()
        };
        let servers = of_kind(NodeKind::Server);
        let clients = of_kind(NodeKind::Client);
        let switches = of_kind(NodeKind::Switch);

        let mut attachments = FxHashMap::default();
        let mut servers_at: FxHashMap<_, Vec<_>> = FxHashMap::default();
        let mut clients_at: FxHashMap<_, Vec<_>> = FxHashMap::default();
        for &leaf in servers.iter().chain(&clients) {
            // Validation guarantees exactly one switch neighbor.
            let Some(&sw) = topology.neighbors(leaf).first() else {
                continue;
            };
            attachments.insert(leaf, sw);
            match topology.node(leaf).map(|n| n.kind) {
                Some(NodeKind::Server) => servers_at.entry(sw).or_default().push(leaf),
                _ => clients_at.entry(sw).or_default().push(leaf),
            }
        }

        let classes = switches
            .iter()
            .map(|&sw| {
                let class = if servers_at.contains_key(&sw) {
                    SwitchClass::ServerSide
                } else if clients_at.contains_key(&sw) {
                    SwitchClass::ClientSide
                } else {
                    SwitchClass::Interior
                };
                (sw, class)
            })
            .collect::<FxHashMap<_, _>>();
        let with_class = |class| {
            switches
                .iter()
                .copied()
                .filter(|sw| classes.get(sw) == Some(&class))
                .collect::<Vec<_>>()
        };
        let server_side = with_class(SwitchClass::ServerSide);
        let client_side = with_class(SwitchClass::ClientSide);
        let interior = with_class(SwitchClass::Interior);

        let mut connections = FxHashMap::default();
        for &sw in &switches {
            let fabric = topology
                .neighbors(sw)
                .into_iter()
                .filter(|n| classes.contains_key(n))
                .collect::<Vec<_>>();
            for scope in Scope::ALL {
                let admitted = fabric
                    .iter()
                    .copied()
                    .filter(|n| scope.admits(classes[n]))
                    .collect();
                connections.insert((sw, scope), admitted);
            }
        }

        Ok(Self {
            topology,
            classes,
            attachments,
            servers,
            clients,
            switches,
            server_side,
            client_side,
            interior,
            servers_at,
            clients_at,
            connections,
        })
    }

    /// All neighbors of `id`, including leaves, in link declaration order.
    pub fn neighbors(&self, id: NodeId) -> Vec<NodeId> {
        self.topology.neighbors(id)
    }

    /// The switch neighbors of `id` admitted by `scope`. Empty for leaves and unknown nodes.
    pub fn connections(&self, id: NodeId, scope: Scope) -> &[NodeId] {
        self.connections
            .get(&(id, scope))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.topology.node(id)
    }

    pub fn class_of(&self, id: NodeId) -> Option<SwitchClass> {
        self.classes.get(&id).copied()
    }

    /// The switch a server or client is attached to.
    pub fn attachment(&self, leaf: NodeId) -> Option<NodeId> {
        self.attachments.get(&leaf).copied()
    }

    pub fn servers(&self) -> &[NodeId] {
        &self.servers
    }

    pub fn clients(&self) -> &[NodeId] {
        &self.clients
    }

    pub fn switches(&self) -> &[NodeId] {
        &self.switches
    }

    pub fn server_side(&self) -> &[NodeId] {
        &self.server_side
    }

    pub fn client_side(&self) -> &[NodeId] {
        &self.client_side
    }

    pub fn interior(&self) -> &[NodeId] {
        &self.interior
    }

    /// Servers attached to switch `sw`, in ascending ID order.
    pub fn servers_at(&self, sw: NodeId) -> &[NodeId] {
        self.servers_at
            .get(&sw)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Clients attached to switch `sw`, in ascending ID order.
    pub fn clients_at(&self, sw: NodeId) -> &[NodeId] {
        self.clients_at
            .get(&sw)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every (server-side switch, client-side switch) pair.
    pub fn commodities(&self) -> impl Iterator<Item = Commodity> + '_ {
        self.server_side.iter().flat_map(move |&source| {
            self.client_side
                .iter()
                .map(move |&sink| Commodity::new(source, sink))
        })
    }

    pub fn channel(&self, src: NodeId, dst: NodeId) -> Option<&Channel> {
        self.topology
            .find_edge(src, dst)
            .map(|e| &self.topology.graph[e])
    }

    pub fn capacity(&self, src: NodeId, dst: NodeId) -> Option<BytesPerSec> {
        self.channel(src, dst).map(|c| c.capacity)
    }

    /// The output port on `src` facing `dst`.
    pub fn port(&self, src: NodeId, dst: NodeId) -> Option<u32> {
        self.channel(src, dst).map(|c| c.port)
    }

    /// Channels whose endpoints are both switches.
    pub fn fabric_channels(&self) -> impl Iterator<Item = &Channel> {
        self.topology.graph.edge_weights().filter(|c| {
            self.classes.contains_key(&c.src) && self.classes.contains_key(&c.dst)
        })
    }

    /// The IPv4 address of a node, derived from its ID when none was configured.
    pub fn addr_of(&self, id: NodeId) -> Ipv4Addr {
        self.node(id)
            .and_then(|n| n.addr)
            .unwrap_or_else(|| utils::node_id_to_ip(id.inner()))
    }

    /// The controller device ID of a switch.
    pub fn device_id(&self, sw: NodeId) -> String {
        format!("of:{:016x}", sw.inner())
    }

    delegate::delegate! {
        to self.topology.graph {
            #[call(node_weights)]
            pub fn nodes(&self) -> impl Iterator<Item = &Node>;
        }

        to self.topology.links {
            #[call(iter)]
            pub fn links(&self) -> impl Iterator<Item = &Link>;
        }

        to self.switches {
            #[call(len)]
            pub fn nr_switches(&self) -> usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;
    use crate::testing;

    fn ids(v: &[usize]) -> Vec<NodeId> {
        v.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn switches_are_classified() -> anyhow::Result<()> {
        let (nodes, links) = testing::diamond_config();
        let network = Network::new(&nodes, &links).context("failed to create topology")?;
        assert_eq!(network.server_side(), ids(&[2, 5]));
        assert_eq!(network.interior(), ids(&[3, 4]));
        assert_eq!(network.client_side(), ids(&[6]));
        assert_eq!(network.servers_at(NodeId::new(5)), ids(&[1]));
        assert_eq!(network.clients_at(NodeId::new(6)), ids(&[7, 8]));
        assert_eq!(network.attachment(NodeId::new(8)), Some(NodeId::new(6)));
        Ok(())
    }

    #[test]
    fn connections_respect_scope() -> anyhow::Result<()> {
        let (nodes, links) = testing::diamond_config();
        let network = Network::new(&nodes, &links).context("failed to create topology")?;
        let sw = NodeId::new(3);
        assert_eq!(network.connections(sw, Scope::Fabric), ids(&[2, 5, 6]));
        assert_eq!(network.connections(sw, Scope::NoServerSide), ids(&[6]));
        assert_eq!(network.connections(sw, Scope::NoClientSide), ids(&[2, 5]));
        assert!(network.connections(sw, Scope::Interior).is_empty());
        assert_eq!(
            network.connections(NodeId::new(2), Scope::Interior),
            ids(&[3, 4])
        );
        // Leaves have no fabric connections
        assert!(network.connections(NodeId::new(0), Scope::Fabric).is_empty());
        Ok(())
    }

    #[test]
    fn neighbors_include_leaves() -> anyhow::Result<()> {
        let (nodes, links) = testing::diamond_config();
        let network = Network::new(&nodes, &links).context("failed to create topology")?;
        assert_eq!(network.neighbors(NodeId::new(6)), ids(&[3, 4, 7, 8]));
        assert_eq!(network.neighbors(NodeId::new(7)), ids(&[6]));
        Ok(())
    }

    #[test]
    fn fabric_channels_exclude_leaf_links() -> anyhow::Result<()> {
        let (nodes, links) = testing::diamond_config();
        let network = Network::new(&nodes, &links).context("failed to create topology")?;
        // Six switch-to-switch links, two channels each
        assert_eq!(network.fabric_channels().count(), 12);
        Ok(())
    }

    #[test]
    fn commodities_pair_edges() -> anyhow::Result<()> {
        let (nodes, links) = testing::diamond_config();
        let network = Network::new(&nodes, &links).context("failed to create topology")?;
        let commodities = network
            .commodities()
            .map(|c| c.to_string())
            .collect::<Vec<_>>();
        insta::assert_yaml_snapshot!(commodities, @r###"
        - 2->6
        - 5->6
        "###);
        Ok(())
    }

    #[test]
    fn configured_addresses_win() -> anyhow::Result<()> {
        let (mut nodes, links) = testing::two_switch_config();
        nodes[0] = Node::new_server(NodeId::new(0)).with_addr(Ipv4Addr::new(10, 0, 0, 1));
        let network = Network::new(&nodes, &links).context("failed to create topology")?;
        assert_eq!(network.addr_of(NodeId::new(0)), Ipv4Addr::new(10, 0, 0, 1));
        assert_ne!(network.addr_of(NodeId::new(3)), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(network.device_id(NodeId::new(26)), "of:000000000000001a");
        Ok(())
    }
}
