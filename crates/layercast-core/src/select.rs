//! Stage two: picks which layers each client receives, and from which server, by solving a
//! mixed-integer program over the slots [`prefix`](prefix::prefix) left free.

pub mod prefix;

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use crate::{
    demand::ClientDemand,
    fairness::FairnessState,
    network::{types::NodeId, Network},
    solve::{self, Cmp, Program, Sense, SolveError},
    utils,
};

use self::prefix::{Prefix, SlotKey};

/// Objective weights and limits of the quality selector.
#[derive(Debug, Clone, typed_builder::TypedBuilder, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SelectorOpts {
    /// Weight of the shared quality shortfall `Q`.
    #[builder(default = 30.0)]
    pub quality_weight: f64,
    /// Weight of the normalized oscillation terms `I_c`.
    #[builder(default = 3.0)]
    pub isolation_weight: f64,
    /// Weight of the normalized isolation count terms `N_c`.
    #[builder(default = 7.0)]
    pub isolation_count_weight: f64,
    /// Reward for each client's normalized cumulative quality `T_c`.
    #[builder(default = 1.0)]
    pub fairness_weight: f64,
    /// Weight of the long-term throughput shortfall `L`.
    #[builder(default = 0.0)]
    pub long_term_weight: f64,
    /// Time limit of the solver. The best assignment found within it is used.
    #[builder(default = Some(Duration::from_secs(1)))]
    #[serde(with = "utils::opt_millis")]
    pub time_limit: Option<Duration>,
}

impl Default for SelectorOpts {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Which server delivers each layer to each client.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AssignmentSolution {
    grants: BTreeMap<NodeId, Vec<Option<NodeId>>>,
    isolated: BTreeSet<NodeId>,
}

impl AssignmentSolution {
    /// Builds a solution from per-client, per-layer servers.
    pub fn from_grants(grants: impl IntoIterator<Item = (NodeId, Vec<Option<NodeId>>)>) -> Self {
        Self {
            grants: grants.into_iter().collect(),
            isolated: BTreeSet::new(),
        }
    }

    /// Grants layer 0 from `server_of(client)` to every client.
    pub fn base_layer_only(
        clients: impl IntoIterator<Item = NodeId>,
        mut server_of: impl FnMut(NodeId) -> NodeId,
    ) -> Self {
        Self::from_grants(clients.into_iter().map(|c| (c, vec![Some(server_of(c))])))
    }

    pub fn server_for(&self, client: NodeId, layer: usize) -> Option<NodeId> {
        self.grants.get(&client)?.get(layer).copied().flatten()
    }

    /// The number of consecutive layers delivered from layer 0 up.
    pub fn delivered_layers(&self, client: NodeId) -> usize {
        self.grants
            .get(&client)
            .map(|g| g.iter().take_while(|s| s.is_some()).count())
            .unwrap_or(0)
    }

    /// Whether the client's layer count was flagged as changed this cycle.
    pub fn isolated(&self, client: NodeId) -> bool {
        self.isolated.contains(&client)
    }

    pub fn clients(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.grants.keys().copied()
    }
}

/// Solves the layer/server assignment program.
#[derive(Debug, Clone, derive_new::new)]
pub struct QualitySelector {
    opts: SelectorOpts,
}

impl QualitySelector {
    pub fn opts(&self) -> &SelectorOpts {
        &self.opts
    }

    /// Assigns layers to every client in `demands`, honoring the fixed slots and rate caps of
    /// `prefix` and the history in `fairness`.
    pub fn select(
        &self,
        network: &Network,
        demands: &[ClientDemand],
        prefix: &Prefix,
        fairness: &FairnessState,
    ) -> Result<AssignmentSolution, SelectError> {
        let program = SelectionProgram::new(network, demands, prefix, fairness, &self.opts);
        log::debug!(
            "selection MILP: {} variables, {} rows, {} slots fixed",
            program.program.nr_vars(),
            program.program.nr_rows(),
            prefix.nr_fixed()
        );
        let SelectionProgram {
            program,
            slots,
            isolation,
            clients,
            servers,
            nr_layers,
        } = program;
        let time_limit = self.opts.time_limit;
        let values = solve::on_solver_thread(move || program.solve(time_limit))
            .map_err(SelectError::NoSolution)?;
        let is_set = |slot: &Slot| match *slot {
            Slot::Fixed(v) => v,
            Slot::Free(var) => values[var] > 0.5,
        };
        let mut grants = BTreeMap::new();
        let mut isolated = BTreeSet::new();
        for (i, &client) in clients.iter().enumerate() {
            let layers = (0..nr_layers)
                .map(|l| {
                    (0..servers.len())
                        .find(|&s| is_set(&slots[(i * nr_layers + l) * servers.len() + s]))
                        .map(|s| servers[s])
                })
                .collect();
            grants.insert(client, layers);
            if isolation[i].is_some_and(|v| values[v] > 0.5) {
                isolated.insert(client);
            }
        }
        Ok(AssignmentSolution { grants, isolated })
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Fixed(bool),
    Free(usize),
}

/// The assignment MILP in index form. Slot `(i, l, s)` lives at `(i * nr_layers + l) *
/// nr_servers + s`.
#[derive(Debug)]
struct SelectionProgram {
    program: Program,
    slots: Vec<Slot>,
    // The `v_c` variable of each client with history
    isolation: Vec<Option<usize>>,
    clients: Vec<NodeId>,
    servers: Vec<NodeId>,
    nr_layers: usize,
}

impl SelectionProgram {
    fn new(
        network: &Network,
        demands: &[ClientDemand],
        prefix: &Prefix,
        fairness: &FairnessState,
        opts: &SelectorOpts,
    ) -> Self {
        let clients = demands.iter().map(|d| d.client).collect::<Vec<_>>();
        let servers = network.servers().to_vec();
        let nr_layers = demands.iter().map(|d| d.layers.len()).max().unwrap_or(0);
        let n = clients.len().max(1) as f64;
        let m = nr_layers as f64;
        let norm = fairness.normalizers(&clients, nr_layers);

        let mut p = Program::new(Sense::Minimise);
        let mut slots = Vec::with_capacity(clients.len() * nr_layers * servers.len());
        for d in demands {
            for l in 0..nr_layers {
                for &server in &servers {
                    let key = SlotKey::new(d.client, l, server);
                    let slot = match prefix.get(key) {
                        Some(v) => Slot::Fixed(v && d.is_available(l)),
                        None if !d.is_available(l) => Slot::Fixed(false),
                        None => Slot::Free(p.binary()),
                    };
                    slots.push(slot);
                }
            }
        }
        let slot_of = |i: usize, l: usize, s: usize| slots[(i * nr_layers + l) * servers.len() + s];
        // Σ_s w[i][l][s] as (terms, constant)
        let layer_sum = |i: usize, l: usize| {
            let mut terms = Vec::new();
            let mut constant = 0.0;
            for s in 0..servers.len() {
                match slot_of(i, l, s) {
                    Slot::Fixed(v) => constant += f64::from(u8::from(v)),
                    Slot::Free(var) => terms.push((var, 1.0)),
                }
            }
            (terms, constant)
        };
        // Σ_l Σ_s w[i][l][s]
        let total = |i: usize| {
            let mut terms = Vec::new();
            let mut constant = 0.0;
            for l in 0..nr_layers {
                let (t, c) = layer_sum(i, l);
                terms.extend(t);
                constant += c;
            }
            (terms, constant)
        };
        let scaled = |terms: &[(usize, f64)], k: f64| {
            terms.iter().map(|&(v, c)| (v, c * k)).collect::<Vec<_>>()
        };

        let q = p.continuous(0.0, Some(1.0));
        let big_l = p.continuous(0.0, Some(1.0));
        p.add_objective(q, opts.quality_weight);
        p.add_objective(big_l, opts.long_term_weight);

        let mut isolation = Vec::with_capacity(clients.len());
        for (i, d) in demands.iter().enumerate() {
            let record = fairness.record_or_default(d.client);
            // 0. Base layer guarantee
            if d.is_available(0) {
                let (terms, c) = layer_sum(i, 0);
                p.add_row(terms, Cmp::Eq, 1.0 - c);
            }
            for l in 0..nr_layers {
                let (terms, c) = layer_sum(i, l);
                if d.is_available(l) {
                    // 1. At most one server per layer
                    p.add_row(terms, Cmp::Le, 1.0 - c);
                } else {
                    // 2. Missing layers are never assigned
                    p.add_row(terms, Cmp::Eq, -c);
                }
            }
            // 3. Prefix monotonicity
            for l in 1..nr_layers {
                let (upper, cu) = layer_sum(i, l);
                let (lower, cl) = layer_sum(i, l - 1);
                let terms = upper.into_iter().chain(scaled(&lower, -1.0)).collect();
                p.add_row(terms, Cmp::Le, cl - cu);
            }

            let (sum, fixed) = total(i);
            let lambda = record.cumulative_layers as f64;
            let k = 1.0 / (record.phi() as f64 * norm.t_max);
            // 4. Q + (λ + Σw) k ≥ 1
            let mut terms = scaled(&sum, k);
            terms.push((q, 1.0));
            p.add_row(terms, Cmp::Ge, 1.0 - (lambda + fixed) * k);
            // 5. T_c = (λ + Σw) k
            let t = p.continuous(0.0, Some(1.0));
            p.add_objective(t, -opts.fairness_weight / n);
            let mut terms = scaled(&sum, -k);
            terms.push((t, 1.0));
            p.add_row(terms, Cmp::Eq, (lambda + fixed) * k);
            // 8. L + (λ + Σw) k ≥ 1
            let mut terms = scaled(&sum, k);
            terms.push((big_l, 1.0));
            p.add_row(terms, Cmp::Ge, 1.0 - (lambda + fixed) * k);

            if !record.has_history() {
                isolation.push(None);
                continue;
            }
            let prev = record.previous_layers as f64;
            // |Σw − l̄| ≤ dev
            let dev = p.continuous(0.0, None);
            let mut terms = scaled(&sum, -1.0);
            terms.push((dev, 1.0));
            p.add_row(terms, Cmp::Ge, fixed - prev);
            let mut terms = sum.clone();
            terms.push((dev, 1.0));
            p.add_row(terms, Cmp::Ge, prev - fixed);
            // 6. I_max · I_c ≥ μ + dev, m · v_c ≥ dev
            let iso = p.continuous(0.0, Some(1.0));
            p.add_objective(iso, opts.isolation_weight / n);
            p.add_row(vec![(iso, norm.i_max), (dev, -1.0)], Cmp::Ge, record.oscillation as f64);
            let v = p.binary();
            p.add_row(vec![(v, m), (dev, -1.0)], Cmp::Ge, 0.0);
            // 7. N_max · N_c ≥ v̄ + v_c
            let count = p.continuous(0.0, Some(1.0));
            p.add_objective(count, opts.isolation_count_weight / n);
            p.add_row(
                vec![(count, norm.n_max), (v, -1.0)],
                Cmp::Ge,
                record.isolation_events as f64,
            );
            isolation.push(Some(v));
        }

        // Demand on every free slot of a commodity fits its rate
        let index = demands
            .iter()
            .enumerate()
            .map(|(i, d)| (d.client, i))
            .collect::<BTreeMap<_, _>>();
        let server_index = servers
            .iter()
            .enumerate()
            .map(|(s, &id)| (id, s))
            .collect::<BTreeMap<_, _>>();
        for cap in prefix.caps() {
            let mut terms = Vec::new();
            let mut fixed = 0.0;
            for &(key, need) in &cap.slots {
                let (Some(&i), Some(&s)) = (index.get(&key.client), server_index.get(&key.server))
                else {
                    continue;
                };
                match slot_of(i, key.layer, s) {
                    Slot::Fixed(v) => fixed += need * f64::from(u8::from(v)),
                    Slot::Free(var) => terms.push((var, need)),
                }
            }
            p.add_row(terms, Cmp::Le, cap.rate - fixed);
        }

        Self {
            program: p,
            slots,
            isolation,
            clients,
            servers,
            nr_layers,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("No assignment found")]
    NoSolution(#[source] SolveError),
}
