use petgraph::{
    graph::{DiGraph, EdgeIndex, NodeIndex},
    visit::Bfs,
};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::network::types::{Channel, Link, Node, NodeId, NodeKind};

#[derive(Debug, Clone)]
pub(crate) struct Topology {
    pub(crate) graph: DiGraph<Node, Channel>,
    pub(crate) links: Vec<Link>,
    id2idx: FxHashMap<NodeId, NodeIndex>,
}

impl Topology {
    /// Creates a network topology from a list of nodes and links. This function returns an error if
    /// the given specification fails to produce a valid delivery network.
    ///
    /// Correctness properties:
    ///
    /// - Every node must have a unique ID.
    /// - Every link must have distinct endpoints in `nodes` and a positive capacity.
    /// - For any two nodes, there must be at most one link between them.
    /// - Every node must be referenced by some link.
    /// - Every server and client must have exactly one link, and it must lead to a switch.
    /// - No switch may be adjacent to both servers and clients.
    /// - There must be at least one server and one client.
    /// - Every client must be reachable from some server.
    pub(crate) fn new(nodes: &[Node], links: &[Link]) -> Result<Self, TopologyError> {
        let mut g = DiGraph::new();
        let mut id2idx = FxHashMap::default();
        for n @ Node { id, .. } in nodes.iter().cloned() {
            let idx = g.add_node(n);
            if id2idx.insert(id, idx).is_some() {
                // CORRECTNESS: Every node must have a unique ID.
                return Err(TopologyError::DuplicateNodeId(id));
            }
        }
        let mut referenced_nodes = FxHashSet::default();
        // Ports are numbered per node in link declaration order, starting at 1.
        let mut next_port: FxHashMap<NodeId, u32> = FxHashMap::default();
        for &Link { a, b, capacity } in links {
            // CORRECTNESS: Every link must have distinct endpoints in `nodes`.
            if a == b {
                return Err(TopologyError::NodeAdjacentSelf(a));
            }
            let ia = *id2idx.get(&a).ok_or(TopologyError::UndeclaredNode(a))?;
            let ib = *id2idx.get(&b).ok_or(TopologyError::UndeclaredNode(b))?;
            // CORRECTNESS: Every link must carry some capacity.
            if capacity.into_u64() == 0 {
                return Err(TopologyError::ZeroCapacity { a, b });
            }
            // CORRECTNESS: For any two nodes, there must be at most one link between them.
            if g.find_edge(ia, ib).is_some() {
                return Err(TopologyError::DuplicateLink { n1: a, n2: b });
            }
            referenced_nodes.insert(a);
            referenced_nodes.insert(b);
            let pa = bump(&mut next_port, a);
            let pb = bump(&mut next_port, b);
            // Channels are unidirectional
            g.add_edge(ia, ib, Channel::new(a, b, capacity, pa));
            g.add_edge(ib, ia, Channel::new(b, a, capacity, pb));
        }
        // CORRECTNESS: Every node must be referenced by some link.
        for n in g.node_weights() {
            if !referenced_nodes.contains(&n.id) {
                return Err(TopologyError::IsolatedNode(n.id));
            }
        }
        for idx in g.node_indices() {
            let Node { id, kind, .. } = g[idx];
            match kind {
                NodeKind::Server | NodeKind::Client => {
                    // CORRECTNESS: Every leaf must have exactly one link, to a switch.
                    let nr_links = g.edges(idx).count();
                    if nr_links > 1 {
                        return Err(TopologyError::TooManyLeafLinks { id, n: nr_links });
                    }
                    if let Some(peer) = g.neighbors(idx).find(|&n| g[n].kind != NodeKind::Switch) {
                        return Err(TopologyError::LeafNotOnSwitch {
                            id,
                            peer: g[peer].id,
                        });
                    }
                }
                NodeKind::Switch => {
                    // CORRECTNESS: A switch cannot be both server-side and client-side.
                    let has = |kind| g.neighbors(idx).any(|n| g[n].kind == kind);
                    if has(NodeKind::Server) && has(NodeKind::Client) {
                        return Err(TopologyError::AmbiguousSwitch(id));
                    }
                }
            }
        }
        let servers = indices_of(&g, NodeKind::Server);
        let clients = indices_of(&g, NodeKind::Client);
        if servers.is_empty() {
            return Err(TopologyError::NoServers);
        }
        if clients.is_empty() {
            return Err(TopologyError::NoClients);
        }
        // CORRECTNESS: Every client must be reachable from some server.
        let mut reachable = FxHashSet::default();
        for &s in &servers {
            let mut bfs = Bfs::new(&g, s);
            while let Some(n) = bfs.next(&g) {
                reachable.insert(n);
            }
        }
        if let Some(&c) = clients.iter().find(|c| !reachable.contains(c)) {
            return Err(TopologyError::UnreachableClient(g[c].id));
        }
        Ok(Self {
            graph: g,
            links: links.to_vec(),
            id2idx,
        })
    }

    pub(crate) fn idx_of(&self, id: &NodeId) -> Option<&NodeIndex> {
        self.id2idx.get(id)
    }

    pub(crate) fn find_edge(&self, src: NodeId, dst: NodeId) -> Option<EdgeIndex> {
        let a = *self.idx_of(&src)?;
        let b = *self.idx_of(&dst)?;
        self.graph.find_edge(a, b)
    }

    pub(crate) fn node(&self, id: NodeId) -> Option<&Node> {
        self.idx_of(&id).map(|&idx| &self.graph[idx])
    }

    /// Neighbors of `id` in link declaration order.
    pub(crate) fn neighbors(&self, id: NodeId) -> Vec<NodeId> {
        let Some(&idx) = self.idx_of(&id) else {
            return Vec::new();
        };
        let mut out = self
            .graph
            .edges(idx)
            .map(|e| (e.weight().port, e.weight().dst))
            .collect::<Vec<_>>();
        out.sort();
        out.into_iter().map(|(_, dst)| dst).collect()
    }
}

fn bump(counters: &mut FxHashMap<NodeId, u32>, id: NodeId) -> u32 {
    let port = counters.entry(id).or_insert(0);
    *port += 1;
    *port
}

fn indices_of(g: &DiGraph<Node, Channel>, kind: NodeKind) -> Vec<NodeIndex> {
    g.node_indices().filter(|&i| g[i].kind == kind).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Duplicate node ID {0}")]
    DuplicateNodeId(NodeId),

    #[error("Node {0} is connected to itself")]
    NodeAdjacentSelf(NodeId),

    #[error("Node {0} is not declared")]
    UndeclaredNode(NodeId),

    #[error("Link between {a} and {b} has zero capacity")]
    ZeroCapacity { a: NodeId, b: NodeId },

    #[error("Duplicate links between {n1} and {n2}")]
    DuplicateLink { n1: NodeId, n2: NodeId },

    #[error("Node {0} is not connected to any other node")]
    IsolatedNode(NodeId),

    #[error("Leaf {id} has too many links (expected 1, got {n})")]
    TooManyLeafLinks { id: NodeId, n: usize },

    #[error("Leaf {id} is attached to {peer}, which is not a switch")]
    LeafNotOnSwitch { id: NodeId, peer: NodeId },

    #[error("Switch {0} is adjacent to both servers and clients")]
    AmbiguousSwitch(NodeId),

    #[error("Topology has no servers")]
    NoServers,

    #[error("Topology has no clients")]
    NoClients,

    #[error("Client {0} is not reachable from any server")]
    UnreachableClient(NodeId),
}
