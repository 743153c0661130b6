use std::net::Ipv4Addr;

use crate::units::BytesPerSec;

identifier!(NodeId, usize);

/// A vertex of the delivery network.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// The host address of a server or client. Defaults to one derived from the node ID.
    #[serde(default)]
    pub addr: Option<Ipv4Addr>,
}

impl Node {
    pub fn new_server(id: NodeId) -> Self {
        Self {
            id,
            kind: NodeKind::Server,
            addr: None,
        }
    }

    pub fn new_switch(id: NodeId) -> Self {
        Self {
            id,
            kind: NodeKind::Switch,
            addr: None,
        }
    }

    pub fn new_client(id: NodeId) -> Self {
        Self {
            id,
            kind: NodeKind::Client,
            addr: None,
        }
    }

    pub fn with_addr(mut self, addr: Ipv4Addr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self.kind, NodeKind::Switch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NodeKind {
    Server,
    Switch,
    Client,
}

/// The role of a switch, derived from what it is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SwitchClass {
    /// Directly attached to at least one server.
    ServerSide,
    /// Attached to neither servers nor clients.
    Interior,
    /// Directly attached to at least one client.
    ClientSide,
}

/// A bidirectional link. Each direction gets the full capacity.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct Link {
    pub a: NodeId,
    pub b: NodeId,
    pub capacity: BytesPerSec,
}

impl Link {
    pub fn new(a: NodeId, b: NodeId, capacity: impl Into<BytesPerSec>) -> Self {
        Self {
            a,
            b,
            capacity: capacity.into(),
        }
    }

    pub fn connects(&self, x: NodeId, y: NodeId) -> bool {
        self.a == x && self.b == y || self.a == y && self.b == x
    }
}

/// One direction of a link.
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new, serde::Serialize)]
pub struct Channel {
    pub(crate) src: NodeId,
    pub(crate) dst: NodeId,
    pub(crate) capacity: BytesPerSec,
    /// The port on `src` that faces `dst`.
    pub(crate) port: u32,
}

impl Channel {
    pub fn src(&self) -> NodeId {
        self.src
    }

    pub fn dst(&self) -> NodeId {
        self.dst
    }

    pub fn capacity(&self) -> BytesPerSec {
        self.capacity
    }

    pub fn port(&self) -> u32 {
        self.port
    }
}

/// Restricts the switch neighbors returned by
/// [`Network::connections`](crate::network::Network::connections).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Every neighboring switch.
    Fabric,
    /// Neighboring switches that are not client-side.
    NoClientSide,
    /// Neighboring switches that are not server-side.
    NoServerSide,
    /// Neighboring switches that are neither server-side nor client-side.
    Interior,
}

impl Scope {
    pub(crate) const ALL: [Scope; 4] = [
        Scope::Fabric,
        Scope::NoClientSide,
        Scope::NoServerSide,
        Scope::Interior,
    ];

    pub(crate) fn admits(self, class: SwitchClass) -> bool {
        match self {
            Scope::Fabric => true,
            Scope::NoClientSide => class != SwitchClass::ClientSide,
            Scope::NoServerSide => class != SwitchClass::ServerSide,
            Scope::Interior => class == SwitchClass::Interior,
        }
    }
}

/// A single source-to-sink flow demand: traffic from a server-side switch to a client-side
/// switch.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_new::new,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Commodity {
    pub source: NodeId,
    pub sink: NodeId,
}

impl std::fmt::Display for Commodity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.source, self.sink)
    }
}
