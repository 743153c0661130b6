//! This module defines the [`Orchestrator`], which runs one optimization cycle per content
//! segment: demand, flow allocation, quality selection, message emission, and fairness
//! bookkeeping.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use itertools::Itertools;
use rayon::prelude::*;

use crate::{
    allocate::{paths, AllocatorOpts, FlowAllocator},
    demand::{self, Catalog, ClientDemand, DemandError, DemandModel},
    fairness::{FairnessDelta, FairnessError, FairnessState},
    message::{ClientNotification, ForwardingRule, LayerGrant, RuleMatch, TCP},
    network::{types::NodeId, Network, Residuals},
    select::{prefix, AssignmentSolution, QualitySelector, SelectorOpts},
    utils,
};

/// Cycle cadence, message parameters, and the options of every stage.
#[derive(Debug, Clone, typed_builder::TypedBuilder, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CycleOpts {
    /// Time between the starts of consecutive cycles.
    #[builder(default = Duration::from_millis(2000))]
    #[serde(with = "utils::millis")]
    pub interval: Duration,
    /// Server used for fallback notifications. Servers are picked round-robin if unset.
    #[builder(default, setter(strip_option))]
    pub default_server: Option<NodeId>,
    /// Port of layer 0; layer `l` is served on `base_port + l`.
    #[builder(default = 8000)]
    pub base_port: u16,
    /// Priority of rules emitted for segment 0. Later segments get higher priorities.
    #[builder(default = 5000)]
    pub base_priority: u32,
    #[builder(default = Duration::from_secs(10))]
    #[serde(with = "utils::millis")]
    pub rule_timeout: Duration,
    #[builder(default = false)]
    pub permanent_rules: bool,
    /// Buffer hint sent to every client.
    #[builder(default = 0)]
    pub buffer_hint: u32,
    #[builder(default)]
    pub demand: DemandModel,
    #[builder(default)]
    pub allocator: AllocatorOpts,
    #[builder(default)]
    pub selector: SelectorOpts,
}

impl Default for CycleOpts {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// How a cycle's assignment was reached.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind")]
pub enum Outcome {
    /// Both stages solved. `attempts` counts flow solves.
    Optimized { attempts: usize },
    /// A stage failed and every client was sent the base layer.
    Fallback { reason: String },
}

/// Everything one cycle produced.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CycleReport {
    pub segment: usize,
    pub outcome: Outcome,
    pub notifications: Vec<ClientNotification>,
    pub rules: Vec<ForwardingRule>,
    pub deltas: BTreeMap<NodeId, FairnessDelta>,
    pub summary: Summary,
    #[serde(with = "utils::millis")]
    pub elapsed: Duration,
}

/// Delivered quality across clients.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Summary {
    pub min_layers: u64,
    pub max_layers: u64,
    pub mean_layers: f64,
    pub incomplete_paths: usize,
}

/// Drives the optimization pipeline over a network and a catalog.
#[derive(Debug)]
pub struct Orchestrator<C> {
    network: Network,
    catalog: C,
    opts: CycleOpts,
    allocator: FlowAllocator,
    selector: QualitySelector,
    fairness: FairnessState,
    residuals: Residuals,
}

impl<C: Catalog + Sync> Orchestrator<C> {
    /// Creates an orchestrator and admits every client of `network`.
    pub fn new(network: Network, catalog: C, opts: CycleOpts) -> Result<Self, CycleError> {
        opts.demand.validate()?;
        if let Some(server) = opts.default_server {
            if !network.servers().contains(&server) {
                return Err(CycleError::UnknownDefaultServer(server));
            }
        }
        let mut fairness = FairnessState::default();
        for &client in network.clients() {
            fairness.admit(client);
        }
        let residuals = Residuals::new(&network);
        Ok(Self {
            allocator: FlowAllocator::new(opts.allocator.clone()),
            selector: QualitySelector::new(opts.selector.clone()),
            network,
            catalog,
            opts,
            fairness,
            residuals,
        })
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn fairness(&self) -> &FairnessState {
        &self.fairness
    }

    /// Spare capacity used by the next cycle. External monitoring may lower it between cycles.
    pub fn residuals_mut(&mut self) -> &mut Residuals {
        &mut self.residuals
    }

    /// Runs one cycle for `segment`.
    pub fn run_cycle(&mut self, segment: usize) -> Result<CycleReport, CycleError> {
        let start = Instant::now();
        let clients = self.network.clients().to_vec();
        let demands = self.opts.demand.compute(&clients, &self.catalog, segment)?;

        let (assignment, outcome, paths) = match self.optimize(&demands) {
            Ok((assignment, paths, attempts)) => {
                (assignment, Outcome::Optimized { attempts }, paths)
            }
            Err(reason) => {
                log::warn!("segment {segment}: falling back to the base layer: {reason}");
                let assignment =
                    AssignmentSolution::base_layer_only(clients.iter().copied(), |c| {
                        self.fallback_server(c)
                    });
                (assignment, Outcome::Fallback { reason }, Vec::new())
            }
        };
        let fallback = matches!(outcome, Outcome::Fallback { .. });

        let notifications = clients
            .par_iter()
            .map(|&c| self.notification(segment, c, &assignment, fallback))
            .collect::<Vec<_>>();
        let priority = self.opts.base_priority.saturating_add(segment as u32);
        let rules = paths
            .par_iter()
            .filter(|p| p.complete)
            .flat_map_iter(|p| self.rules_for(p, priority))
            .collect::<Vec<_>>();
        let incomplete_paths = paths.iter().filter(|p| !p.complete).count();

        let mut deltas = BTreeMap::new();
        for &c in &clients {
            let delivered = assignment.delivered_layers(c) as u64;
            let delta = self.fairness.update(c, delivered, assignment.isolated(c))?;
            deltas.insert(c, delta);
        }
        let summary = summarize(&deltas, incomplete_paths);
        let elapsed = start.elapsed();
        log::info!(
            "segment {segment}: {} in {elapsed:?}, layers min {} mean {:.2} max {}, {} rules",
            match &outcome {
                Outcome::Optimized { .. } => "optimized",
                Outcome::Fallback { .. } => "fallback",
            },
            summary.min_layers,
            summary.mean_layers,
            summary.max_layers,
            rules.len(),
        );
        Ok(CycleReport {
            segment,
            outcome,
            notifications,
            rules,
            deltas,
            summary,
            elapsed,
        })
    }

    /// Runs one cycle per catalog segment, starting each `interval` after the previous one
    /// started, until the catalog runs out or `stop` is set. Returns the number of cycles run.
    pub fn run(
        &mut self,
        stop: &AtomicBool,
        mut on_cycle: impl FnMut(&CycleReport),
    ) -> Result<usize, CycleError> {
        let mut next = Instant::now();
        let mut nr_cycles = 0;
        for segment in 0..self.catalog.nr_segments() {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let report = self.run_cycle(segment)?;
            on_cycle(&report);
            nr_cycles += 1;
            next += self.opts.interval;
            let now = Instant::now();
            if next < now {
                log::warn!("segment {segment} overran the cycle interval by {:?}", now - next);
            }
            sleep_until(next, stop);
        }
        Ok(nr_cycles)
    }

    fn optimize(
        &self,
        demands: &[ClientDemand],
    ) -> Result<(AssignmentSolution, Vec<paths::ForwardingPath>, usize), String> {
        let aggregate = demand::aggregate(&self.network, demands);
        let flow = self
            .allocator
            .allocate(&self.network, &aggregate, &self.residuals)
            .map_err(|e| error_chain(&e))?;
        let prefix = prefix::prefix(&self.network, flow.rates(), demands);
        let assignment = self
            .selector
            .select(&self.network, demands, &prefix, &self.fairness)
            .map_err(|e| error_chain(&e))?;
        let paths = paths::extract(&self.network, &flow, &assignment, demands);
        Ok((assignment, paths, flow.attempts()))
    }

    fn fallback_server(&self, client: NodeId) -> NodeId {
        if let Some(server) = self.opts.default_server {
            return server;
        }
        let servers = self.network.servers();
        let idx = self
            .network
            .clients()
            .iter()
            .position(|&c| c == client)
            .unwrap_or(0);
        servers[idx % servers.len()]
    }

    fn notification(
        &self,
        segment: usize,
        client: NodeId,
        assignment: &AssignmentSolution,
        fallback: bool,
    ) -> ClientNotification {
        let delivered = assignment.delivered_layers(client);
        let layers = if delivered == 0 {
            vec![self.grant(0, self.fallback_server(client))]
        } else {
            (0..delivered)
                .filter_map(|l| assignment.server_for(client, l).map(|s| self.grant(l, s)))
                .collect()
        };
        ClientNotification {
            segment,
            buffer: self.opts.buffer_hint,
            client: self.network.addr_of(client),
            layers,
            fallback: fallback || delivered == 0,
        }
    }

    fn grant(&self, layer: usize, server: NodeId) -> LayerGrant {
        LayerGrant {
            layer,
            port: self.port_of(layer),
            server: self.network.addr_of(server),
        }
    }

    fn port_of(&self, layer: usize) -> u16 {
        let offset = u16::try_from(layer).unwrap_or(u16::MAX);
        self.opts.base_port.saturating_add(offset)
    }

    fn rules_for(&self, path: &paths::ForwardingPath, priority: u32) -> Vec<ForwardingRule> {
        let selector = RuleMatch {
            src: self.network.addr_of(path.server),
            dst: self.network.addr_of(path.client),
            protocol: TCP,
            src_port: self.port_of(path.layer),
        };
        path.hops()
            .into_iter()
            .filter_map(|(sw, next)| {
                let output_port = self.network.port(sw, next)?;
                Some(ForwardingRule {
                    device: self.network.device_id(sw),
                    output_port,
                    priority,
                    timeout: self.opts.rule_timeout,
                    permanent: self.opts.permanent_rules,
                    selector,
                })
            })
            .collect()
    }
}

fn summarize(deltas: &BTreeMap<NodeId, FairnessDelta>, incomplete_paths: usize) -> Summary {
    let layers = deltas.values().map(|d| d.delivered);
    let (min_layers, max_layers) = layers.clone().minmax().into_option().unwrap_or((0, 0));
    Summary {
        min_layers,
        max_layers,
        mean_layers: layers.sum::<u64>() as f64 / deltas.len().max(1) as f64,
        incomplete_paths,
    }
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}

fn sleep_until(deadline: Instant, stop: &AtomicBool) {
    const STEP: Duration = Duration::from_millis(50);
    loop {
        let now = Instant::now();
        if now >= deadline || stop.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep((deadline - now).min(STEP));
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("Invalid demand model")]
    Demand(#[from] DemandError),

    #[error("Fairness bookkeeping failed")]
    Fairness(#[from] FairnessError),

    #[error("Default server {0} is not a server")]
    UnknownDefaultServer(NodeId),
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;
    use crate::{demand::MemoryCatalog, testing};

    fn orchestrator(
        (nodes, links): (Vec<crate::network::Node>, Vec<crate::network::Link>),
        catalog: MemoryCatalog,
        opts: CycleOpts,
    ) -> anyhow::Result<Orchestrator<MemoryCatalog>> {
        let network = Network::new(&nodes, &links).context("failed to create topology")?;
        Ok(Orchestrator::new(network, catalog, opts)?)
    }

    #[test]
    fn single_client_cycle_is_optimized() -> anyhow::Result<()> {
        let catalog = testing::uniform_catalog(1, &[Some(100)]);
        let opts = CycleOpts::builder()
            .demand(DemandModel::builder().nr_layers(1).build())
            .build();
        let mut orch = orchestrator(testing::two_switch_config(), catalog, opts)?;
        let report = orch.run_cycle(0)?;
        assert_eq!(report.outcome, Outcome::Optimized { attempts: 1 });
        let client = NodeId::new(3);
        assert_eq!(report.deltas[&client].delivered, 1);
        insta::assert_yaml_snapshot!(report.rules, @r###"
        - device: "of:0000000000000001"
          output_port: 2
          priority: 5000
          timeout: 10000
          permanent: false
          selector:
            src: 11.0.0.1
            dst: 11.0.3.1
            protocol: 6
            src_port: 8000
        - device: "of:0000000000000002"
          output_port: 2
          priority: 5000
          timeout: 10000
          permanent: false
          selector:
            src: 11.0.0.1
            dst: 11.0.3.1
            protocol: 6
            src_port: 8000
        "###);
        assert_eq!(report.notifications.len(), 1);
        assert!(!report.notifications[0].fallback);
        Ok(())
    }

    #[test]
    fn oversubscribed_cycle_falls_back() -> anyhow::Result<()> {
        // Each client needs 601 units against a 1000-unit fabric
        let catalog = testing::uniform_catalog(2, &[Some(639)]);
        let opts = || {
            CycleOpts::builder()
                .demand(DemandModel::builder().nr_layers(1).build())
                .build()
        };
        let mut orch = orchestrator(testing::shared_edge_config(), catalog.clone(), opts())?;
        let report = orch.run_cycle(0)?;
        assert!(matches!(report.outcome, Outcome::Fallback { .. }));
        assert!(report.rules.is_empty());
        for n in &report.notifications {
            assert!(n.fallback);
            assert_eq!(n.layers.len(), 1);
            assert_eq!(n.layers[0].layer, 0);
            assert_eq!(n.layers[0].port, 8000);
        }
        for (&client, delta) in &report.deltas {
            assert_eq!(delta.delivered, 1);
            assert_eq!(orch.fairness().record_or_default(client).cumulative_layers, 1);
        }

        // The same inputs fall back the same way
        let mut twin = orchestrator(testing::shared_edge_config(), catalog, opts())?;
        let again = twin.run_cycle(0)?;
        assert_eq!(again.notifications, report.notifications);
        assert_eq!(again.deltas, report.deltas);
        Ok(())
    }

    #[test]
    fn selector_timeout_falls_back() -> anyhow::Result<()> {
        // The fabric carries both clients, but the selector has no time to find anything
        let catalog = testing::uniform_catalog(2, &[Some(100)]);
        let opts = CycleOpts::builder()
            .demand(DemandModel::builder().nr_layers(1).build())
            .selector(SelectorOpts::builder().time_limit(Some(Duration::ZERO)).build())
            .build();
        let mut orch = orchestrator(testing::shared_edge_config(), catalog, opts)?;
        for segment in 0..2 {
            let report = orch.run_cycle(segment)?;
            match &report.outcome {
                Outcome::Fallback { reason } => assert!(reason.contains("did not finish")),
                other => panic!("expected a fallback, got {other:?}"),
            }
            assert!(report.rules.is_empty());
            assert_eq!(report.notifications.len(), 2);
            for n in &report.notifications {
                assert!(n.fallback);
                assert_eq!(n.layers.len(), 1);
                assert_eq!(n.layers[0].layer, 0);
                assert_eq!(n.layers[0].port, 8000);
            }
            assert_eq!(report.deltas.len(), 2);
            for (&client, delta) in &report.deltas {
                assert_eq!(delta.delivered, 1);
                let record = orch.fairness().record_or_default(client);
                assert_eq!(record.cumulative_layers, segment as u64 + 1);
            }
        }
        Ok(())
    }

    #[test]
    fn fallback_uses_the_default_server() -> anyhow::Result<()> {
        let catalog = testing::uniform_catalog(1, &[Some(639)]);
        let opts = CycleOpts::builder()
            .demand(DemandModel::builder().nr_layers(1).build())
            .default_server(NodeId::new(0))
            .build();
        let mut orch = orchestrator(testing::shared_edge_config(), catalog, opts)?;
        let report = orch.run_cycle(0)?;
        let server = orch.network().addr_of(NodeId::new(0));
        assert!(report
            .notifications
            .iter()
            .all(|n| n.layers[0].server == server));
        Ok(())
    }

    #[test]
    fn missing_base_layer_gets_a_fallback_notice() -> anyhow::Result<()> {
        let catalog = testing::uniform_catalog(1, &[None, Some(100)]);
        let opts = CycleOpts::builder()
            .demand(DemandModel::builder().nr_layers(2).build())
            .build();
        let mut orch = orchestrator(testing::two_switch_config(), catalog, opts)?;
        let report = orch.run_cycle(0)?;
        assert!(matches!(report.outcome, Outcome::Optimized { .. }));
        let client = NodeId::new(3);
        assert_eq!(report.deltas[&client].delivered, 0);
        assert!(report.notifications[0].fallback);
        assert_eq!(report.notifications[0].layers[0].layer, 0);
        Ok(())
    }

    #[test]
    fn unknown_default_server_is_rejected() -> anyhow::Result<()> {
        let catalog = testing::uniform_catalog(1, &[Some(100)]);
        let opts = CycleOpts::builder().default_server(NodeId::new(3)).build();
        let res = orchestrator(testing::two_switch_config(), catalog, opts);
        let err = res.err().and_then(|e| e.downcast::<CycleError>().ok());
        assert!(matches!(err, Some(CycleError::UnknownDefaultServer(..))));
        Ok(())
    }

    #[test]
    fn run_visits_every_segment() -> anyhow::Result<()> {
        let catalog = testing::uniform_catalog(3, &[Some(100), Some(100)]);
        let opts = CycleOpts::builder()
            .interval(Duration::from_millis(1))
            .demand(DemandModel::builder().nr_layers(2).build())
            .build();
        let mut orch = orchestrator(testing::two_switch_config(), catalog, opts)?;
        let stop = AtomicBool::new(false);
        let mut segments = Vec::new();
        let n = orch.run(&stop, |r| segments.push(r.segment))?;
        assert_eq!(n, 3);
        assert_eq!(segments, [0, 1, 2]);
        let record = orch.fairness().record_or_default(NodeId::new(3));
        assert_eq!(record.cycles, 3);
        // Both layers fit every cycle
        assert_eq!(record.cumulative_layers, 6);
        Ok(())
    }

    #[test]
    fn stop_flag_ends_the_run() -> anyhow::Result<()> {
        let catalog = testing::uniform_catalog(3, &[Some(100)]);
        let mut orch = orchestrator(testing::two_switch_config(), catalog, CycleOpts::default())?;
        let stop = AtomicBool::new(true);
        assert_eq!(orch.run(&stop, |_| {})?, 0);
        Ok(())
    }
}
