//! Stage one: decides how much traffic each server-side switch sends to each client-side
//! switch, and over which fabric edges, by solving a multi-commodity flow LP.
//!
//! The LP maximizes `rate_weight · Σ r − Σ cost · f + margin_weight · Σ g`, where `r` is the
//! rate of a commodity, `f` its flow on a fabric edge, and `g` the burst margin left free on
//! a fabric edge. Flow costs and margin weights are divided by the number of switches, so
//! even the longest simple path costs less per unit than the rate it carries.

pub mod paths;

use std::{collections::BTreeMap, time::Duration};

use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;

use crate::{
    network::{types::NodeId, Commodity, Network, Residuals, Scope},
    solve::{self, Cmp, Program, Sense, SolveError, EPS},
    units::BytesPerSec,
    utils,
};

/// Options for the flow allocator.
#[derive(Debug, Clone, typed_builder::TypedBuilder, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AllocatorOpts {
    /// Objective weight of delivered rate.
    #[builder(default = 10.0)]
    pub rate_weight: f64,
    /// Objective cost of one unit of flow across every switch of the fabric, charged per edge
    /// as `flow_weight / nr_switches`.
    #[builder(default = 1.0)]
    pub flow_weight: f64,
    /// Objective weight of reserved burst margin, divided by the number of switches like the
    /// flow cost.
    #[builder(default = 1.0)]
    pub margin_weight: f64,
    /// Largest share of an edge's capacity that can be reserved as margin.
    #[builder(default = 0.1)]
    pub margin_fraction: f64,
    /// Number of solves before a starved client-side switch is reported.
    #[builder(default = 3)]
    pub max_attempts: usize,
    /// Relative amplitude of the random flow cost perturbation used on retries. Costs are
    /// scaled by a factor drawn from `[1 - jitter, 1 + jitter]`.
    #[builder(default = 1e-3)]
    pub jitter: f64,
    /// Seed for the retry perturbation.
    #[builder(default = 0)]
    pub seed: u64,
    /// Time limit of one solve.
    #[builder(default)]
    #[serde(with = "utils::opt_millis")]
    pub time_limit: Option<Duration>,
}

impl Default for AllocatorOpts {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The rate allocated to every commodity.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RateTable {
    inner: BTreeMap<Commodity, f64>,
}

impl RateTable {
    pub fn get(&self, commodity: Commodity) -> f64 {
        self.inner.get(&commodity).copied().unwrap_or(0.0)
    }

    pub fn insert(&mut self, commodity: Commodity, rate: f64) {
        self.inner.insert(commodity, rate);
    }

    /// Total rate arriving at client-side switch `sink`.
    pub fn provided(&self, sink: NodeId) -> f64 {
        self.inner
            .iter()
            .filter(|(c, _)| c.sink == sink)
            .map(|(_, &r)| r)
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Commodity, f64)> + '_ {
        self.inner.iter().map(|(&c, &r)| (c, r))
    }
}

impl FromIterator<(Commodity, f64)> for RateTable {
    fn from_iter<T: IntoIterator<Item = (Commodity, f64)>>(iter: T) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

/// The result of a successful allocation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FlowSolution {
    rates: RateTable,
    margins: BTreeMap<(NodeId, NodeId), f64>,
    flows: BTreeMap<Commodity, BTreeMap<(NodeId, NodeId), f64>>,
    attempts: usize,
}

impl FlowSolution {
    pub fn rates(&self) -> &RateTable {
        &self.rates
    }

    /// Margin reserved on the directed fabric edge `(src, dst)`.
    pub fn margin(&self, src: NodeId, dst: NodeId) -> f64 {
        self.margins.get(&(src, dst)).copied().unwrap_or(0.0)
    }

    /// Flow of `commodity` on the directed fabric edge `(src, dst)`.
    pub fn flow(&self, commodity: Commodity, src: NodeId, dst: NodeId) -> f64 {
        self.flows
            .get(&commodity)
            .and_then(|f| f.get(&(src, dst)))
            .copied()
            .unwrap_or(0.0)
    }

    /// Every positive edge flow of `commodity`.
    pub fn flows_of(
        &self,
        commodity: Commodity,
    ) -> impl Iterator<Item = ((NodeId, NodeId), f64)> + '_ {
        self.flows
            .get(&commodity)
            .into_iter()
            .flat_map(|f| f.iter().map(|(&e, &v)| (e, v)))
    }

    /// Total commodity flow on the directed fabric edge `(src, dst)`.
    pub fn load(&self, src: NodeId, dst: NodeId) -> f64 {
        self.flows
            .values()
            .filter_map(|f| f.get(&(src, dst)))
            .sum()
    }

    /// How many solves it took to reach this solution.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

/// Solves the rate/path LP.
#[derive(Debug, Clone, derive_new::new)]
pub struct FlowAllocator {
    opts: AllocatorOpts,
}

impl FlowAllocator {
    pub fn opts(&self) -> &AllocatorOpts {
        &self.opts
    }

    /// Allocates rates and flows for every commodity of `network`. `demand` is the aggregate
    /// demand of each client-side switch; a switch with positive demand that ends up with no
    /// rate triggers a re-solve with perturbed flow costs.
    pub fn allocate(
        &self,
        network: &Network,
        demand: &FxHashMap<NodeId, BytesPerSec>,
        residuals: &Residuals,
    ) -> Result<FlowSolution, AllocError> {
        let opts = &self.opts;
        let layout = Layout::new(network, residuals);
        let mut rng = StdRng::seed_from_u64(opts.seed);
        let mut starved = Vec::new();
        for attempt in 1..=opts.max_attempts.max(1) {
            let costs = flow_costs(&mut rng, layout.nr_flow_vars(), opts, attempt);
            let program = layout.program(opts, &costs);
            log::debug!(
                "flow LP attempt {attempt}: {} variables, {} rows",
                program.nr_vars(),
                program.nr_rows()
            );
            let time_limit = opts.time_limit;
            let values = solve::on_solver_thread(move || program.solve(time_limit))?;
            let solution = layout.read(&values, attempt);
            starved = network
                .client_side()
                .iter()
                .copied()
                .filter(|&sink| {
                    let wanted = demand.get(&sink).copied().unwrap_or_default();
                    wanted > BytesPerSec::ZERO && solution.rates.provided(sink) <= EPS
                })
                .collect::<Vec<_>>();
            if starved.is_empty() {
                for &sink in network.client_side() {
                    let wanted = demand.get(&sink).copied().unwrap_or_default();
                    let provided = solution.rates.provided(sink);
                    if provided + EPS < wanted.into_f64() {
                        log::warn!(
                            "switch {sink} is provided {provided:.1}B/s of {wanted} demanded"
                        );
                    }
                }
                return Ok(solution);
            }
            log::warn!("attempt {attempt}: switches {starved:?} received no rate, retrying");
        }
        Err(AllocError::Starved {
            switches: starved,
            attempts: opts.max_attempts.max(1),
        })
    }
}

/// Per-edge flow costs of one attempt, before hop scaling. The first attempt is unperturbed.
fn flow_costs(rng: &mut StdRng, n: usize, opts: &AllocatorOpts, attempt: usize) -> Vec<f64> {
    let amplitude = opts.jitter.abs();
    (0..n)
        .map(|_| {
            let noise = if attempt == 1 || amplitude == 0.0 {
                0.0
            } else {
                rng.gen_range(-amplitude..=amplitude)
            };
            opts.flow_weight * (1.0 + noise)
        })
        .collect()
}

/// Variable layout of the flow LP. Rates come first, then one margin per fabric edge, then
/// one flow per (commodity, fabric edge), commodity-major.
#[derive(Debug)]
struct Layout {
    commodities: Vec<Commodity>,
    // (src, dst, residual, capacity) of every fabric channel
    edges: Vec<(NodeId, NodeId, f64, f64)>,
    // Every switch with its outgoing and incoming edge indices
    incidence: Vec<(NodeId, Vec<usize>, Vec<usize>)>,
    // Per server-side switch, its commodity indices and its sending capacity
    sources: Vec<(Vec<usize>, f64)>,
    // Applied to flow costs and margin weights
    hop_scale: f64,
}

impl Layout {
    fn new(network: &Network, residuals: &Residuals) -> Self {
        let commodities = network.commodities().collect::<Vec<_>>();
        let residual = |src, dst| {
            residuals
                .get(src, dst)
                .or_else(|| network.capacity(src, dst))
                .unwrap_or_default()
                .into_f64()
        };
        let mut edges = network
            .fabric_channels()
            .map(|c| {
                let (a, b) = (c.src(), c.dst());
                (a, b, residual(a, b), c.capacity().into_f64())
            })
            .collect::<Vec<_>>();
        edges.sort_by_key(|&(a, b, ..)| (a, b));
        let incidence = network
            .switches()
            .iter()
            .map(|&sw| {
                let out = (0..edges.len()).filter(|&e| edges[e].0 == sw).collect();
                let inc = (0..edges.len()).filter(|&e| edges[e].1 == sw).collect();
                (sw, out, inc)
            })
            .collect();
        let sources = network
            .server_side()
            .iter()
            .map(|&s| {
                let ks = (0..commodities.len())
                    .filter(|&k| commodities[k].source == s)
                    .collect();
                let cap = network
                    .connections(s, Scope::NoServerSide)
                    .iter()
                    .map(|&j| residual(s, j))
                    .sum();
                (ks, cap)
            })
            .collect();
        Self {
            commodities,
            edges,
            incidence,
            sources,
            hop_scale: 1.0 / network.nr_switches().max(1) as f64,
        }
    }

    fn nr_flow_vars(&self) -> usize {
        self.commodities.len() * self.edges.len()
    }

    fn rate(&self, k: usize) -> usize {
        k
    }

    fn margin(&self, e: usize) -> usize {
        self.commodities.len() + e
    }

    fn flow(&self, k: usize, e: usize) -> usize {
        self.commodities.len() + self.edges.len() + k * self.edges.len() + e
    }

    fn program(&self, opts: &AllocatorOpts, costs: &[f64]) -> Program {
        let mut p = Program::new(Sense::Maximise);
        for _ in &self.commodities {
            let r = p.continuous(0.0, None);
            p.add_objective(r, opts.rate_weight);
        }
        for &(_, _, _, capacity) in &self.edges {
            let g = p.continuous(0.0, Some(opts.margin_fraction * capacity));
            p.add_objective(g, opts.margin_weight * self.hop_scale);
        }
        for &cost in costs {
            let f = p.continuous(0.0, None);
            p.add_objective(f, -cost * self.hop_scale);
        }
        // Sending capacity of every server-side switch
        for (ks, cap) in &self.sources {
            let terms = ks.iter().map(|&k| (self.rate(k), 1.0)).collect();
            p.add_row(terms, Cmp::Le, *cap);
        }
        // Conservation
        for (k, commodity) in self.commodities.iter().enumerate() {
            for (sw, out, inc) in &self.incidence {
                if *sw == commodity.sink {
                    continue;
                }
                let mut terms = out
                    .iter()
                    .map(|&e| (self.flow(k, e), 1.0))
                    .chain(inc.iter().map(|&e| (self.flow(k, e), -1.0)))
                    .collect::<Vec<_>>();
                if *sw == commodity.source {
                    terms.push((self.rate(k), -1.0));
                }
                p.add_row(terms, Cmp::Eq, 0.0);
            }
        }
        // Edge capacity
        for (e, &(_, _, residual, _)) in self.edges.iter().enumerate() {
            let terms = (0..self.commodities.len())
                .map(|k| (self.flow(k, e), 1.0))
                .chain([(self.margin(e), 1.0)])
                .collect();
            p.add_row(terms, Cmp::Le, residual);
        }
        p
    }

    fn read(&self, values: &[f64], attempts: usize) -> FlowSolution {
        let clean = |v: f64| if v <= EPS { 0.0 } else { v };
        let rates = self
            .commodities
            .iter()
            .enumerate()
            .map(|(k, &c)| (c, clean(values[self.rate(k)])))
            .collect();
        let margins = self
            .edges
            .iter()
            .enumerate()
            .map(|(e, &(a, b, ..))| ((a, b), clean(values[self.margin(e)])))
            .filter(|&(_, v)| v > 0.0)
            .collect();
        let flows = self
            .commodities
            .iter()
            .enumerate()
            .map(|(k, &c)| {
                let per_edge = self
                    .edges
                    .iter()
                    .enumerate()
                    .map(|(e, &(a, b, ..))| ((a, b), clean(values[self.flow(k, e)])))
                    .filter(|&(_, v)| v > 0.0)
                    .collect();
                (c, per_edge)
            })
            .collect();
        FlowSolution {
            rates,
            margins,
            flows,
            attempts,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("Failed to solve the flow program")]
    Solve(#[from] SolveError),

    #[error("Switches {switches:?} received no rate after {attempts} attempts")]
    Starved {
        switches: Vec<NodeId>,
        attempts: usize,
    },
}
