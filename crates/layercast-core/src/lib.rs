#![warn(unreachable_pub, missing_debug_implementations)]

//! The core Layercast library. An [`Orchestrator`] turns a [`Network`], a [`Catalog`] of
//! layered segments, and per-client fairness history into client notifications and switch
//! forwarding rules, one cycle per segment.

#[macro_use]
mod ident;

pub mod allocate;
pub mod cycle;
pub mod demand;
pub mod fairness;
pub mod message;
pub mod network;
pub mod select;
pub mod solve;
pub mod units;

pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use allocate::{AllocError, AllocatorOpts, FlowAllocator, FlowSolution};
pub use cycle::{CycleError, CycleOpts, CycleReport, Orchestrator, Outcome};
pub use demand::{Catalog, ClientDemand, DemandModel, MemoryCatalog};
pub use fairness::{FairnessRecord, FairnessState};
pub use message::{ClientNotification, ForwardingRule};
pub use network::{Link, Network, Node, NodeId, NodeKind, Residuals, TopologyError};
pub use select::{AssignmentSolution, QualitySelector, SelectError, SelectorOpts};
pub use units::{Bytes, BytesPerSec};
