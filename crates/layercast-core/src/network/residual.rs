use rustc_hash::FxHashMap;

use crate::{
    network::{types::NodeId, Network},
    units::BytesPerSec,
};

/// Spare capacity per directed channel, as seen at the start of a cycle. A residual never
/// exceeds its channel's capacity.
#[derive(Debug, Clone, Default)]
pub struct Residuals {
    inner: FxHashMap<(NodeId, NodeId), Entry>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    capacity: BytesPerSec,
    residual: BytesPerSec,
}

impl Residuals {
    /// A snapshot where every channel is fully available.
    pub fn new(network: &Network) -> Self {
        let inner = network
            .links()
            .flat_map(|l| [(l.a, l.b), (l.b, l.a)].map(|k| (k, l.capacity)))
            .map(|(k, capacity)| {
                let entry = Entry {
                    capacity,
                    residual: capacity,
                };
                (k, entry)
            })
            .collect();
        Self { inner }
    }

    pub fn get(&self, src: NodeId, dst: NodeId) -> Option<BytesPerSec> {
        self.inner.get(&(src, dst)).map(|e| e.residual)
    }

    /// Sets the residual of a channel, clamped to its capacity. Returns the stored value, or
    /// `None` if there is no such channel.
    pub fn set(&mut self, src: NodeId, dst: NodeId, value: BytesPerSec) -> Option<BytesPerSec> {
        self.inner.get_mut(&(src, dst)).map(|e| {
            e.residual = value.min(e.capacity);
            e.residual
        })
    }

    /// Restores every channel to full capacity.
    pub fn reset(&mut self) {
        for e in self.inner.values_mut() {
            e.residual = e.capacity;
        }
    }
}
