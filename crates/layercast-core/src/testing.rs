use crate::{
    demand::MemoryCatalog,
    network::types::{Link, Node, NodeId},
    units::Bytes,
};

fn link(a: usize, b: usize, capacity: u64) -> Link {
    Link::new(NodeId::new(a), NodeId::new(b), capacity)
}

/// Server 0 behind switch 1, linked directly to switch 2 which serves client 3.
pub(crate) fn two_switch_config() -> (Vec<Node>, Vec<Link>) {
    let nodes = vec![
        Node::new_server(NodeId::new(0)),
        Node::new_switch(NodeId::new(1)),
        Node::new_switch(NodeId::new(2)),
        Node::new_client(NodeId::new(3)),
    ];
    let links = vec![link(0, 1, 1000), link(1, 2, 1000), link(2, 3, 1000)];
    (nodes, links)
}

/// Like [`two_switch_config`], but with clients 3 and 4 sharing switch 2.
pub(crate) fn shared_edge_config() -> (Vec<Node>, Vec<Link>) {
    let nodes = vec![
        Node::new_server(NodeId::new(0)),
        Node::new_switch(NodeId::new(1)),
        Node::new_switch(NodeId::new(2)),
        Node::new_client(NodeId::new(3)),
        Node::new_client(NodeId::new(4)),
    ];
    let links = vec![
        link(0, 1, 10_000),
        link(1, 2, 1000),
        link(2, 3, 10_000),
        link(2, 4, 10_000),
    ];
    (nodes, links)
}

/// Two servers (0, 1) behind server-side switches 2 and 5, two interior switches (3, 4), and
/// one client-side switch 6 serving clients 7 and 8. Every server-side switch reaches the
/// client-side switch over two disjoint paths.
pub(crate) fn diamond_config() -> (Vec<Node>, Vec<Link>) {
    let servers = (0..=1).map(|i| Node::new_server(NodeId::new(i)));
    let switches = (2..=6).map(|i| Node::new_switch(NodeId::new(i)));
    let clients = (7..=8).map(|i| Node::new_client(NodeId::new(i)));
    let nodes = servers.chain(switches).chain(clients).collect::<Vec<_>>();
    let links = vec![
        link(0, 2, 10_000),
        link(2, 3, 1000),
        link(2, 4, 1000),
        link(1, 5, 10_000),
        link(5, 3, 1000),
        link(5, 4, 1000),
        link(3, 6, 1000),
        link(4, 6, 1000),
        link(6, 7, 10_000),
        link(6, 8, 10_000),
    ];
    (nodes, links)
}

/// A catalog of `nr_segments` segments whose layers all have the given sizes.
pub(crate) fn uniform_catalog(nr_segments: usize, sizes: &[Option<u64>]) -> MemoryCatalog {
    let segment = sizes
        .iter()
        .map(|s| s.map(Bytes::new))
        .collect::<Vec<_>>();
    MemoryCatalog::new(vec![segment; nr_segments])
}
