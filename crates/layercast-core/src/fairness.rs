//! Long-term per-client bookkeeping that feeds the fairness constraints of the quality
//! selector. Records are written once per cycle, after the assignment is final.

use std::collections::BTreeMap;

use crate::network::types::NodeId;

/// Accumulated delivery history of one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FairnessRecord {
    /// Total layers delivered so far.
    pub cumulative_layers: u64,
    /// Layers delivered in the previous cycle.
    pub previous_layers: u64,
    /// Sum of absolute layer changes between consecutive cycles.
    pub oscillation: u64,
    /// Number of cycles whose layer count changed.
    pub isolation_events: u64,
    /// Number of cycles recorded.
    pub cycles: u64,
}

/// How one cycle changed a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FairnessDelta {
    pub delivered: u64,
    pub change: u64,
    pub isolated: bool,
}

impl FairnessRecord {
    /// Whether any cycle has been recorded. Oscillation and isolation constraints only apply
    /// to clients with history.
    pub fn has_history(&self) -> bool {
        self.cycles > 0
    }

    /// The cycle count including the one being planned.
    pub fn phi(&self) -> u64 {
        self.cycles + 1
    }

    pub fn apply(&mut self, delivered: u64, isolated: bool) -> FairnessDelta {
        let change = delivered.abs_diff(self.previous_layers);
        self.oscillation += change;
        self.isolation_events += u64::from(isolated);
        self.previous_layers = delivered;
        self.cumulative_layers += delivered;
        self.cycles += 1;
        FairnessDelta {
            delivered,
            change,
            isolated,
        }
    }
}

/// Worst-case values across the clients of a cycle, used to scale the selector's auxiliary
/// variables into `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Normalizers {
    /// `max (λ + m) / φ`
    pub t_max: f64,
    /// `max (μ + m)`
    pub i_max: f64,
    /// `max v + 1`
    pub n_max: f64,
}

/// The fairness record of every admitted client.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FairnessState {
    records: BTreeMap<NodeId, FairnessRecord>,
}

impl FairnessState {
    /// Starts tracking `client`. Returns `false` if it was already tracked.
    pub fn admit(&mut self, client: NodeId) -> bool {
        if self.records.contains_key(&client) {
            return false;
        }
        self.records.insert(client, FairnessRecord::default());
        true
    }

    /// Stops tracking `client`, returning its final record.
    pub fn retire(&mut self, client: NodeId) -> Option<FairnessRecord> {
        self.records.remove(&client)
    }

    pub fn get(&self, client: NodeId) -> Option<&FairnessRecord> {
        self.records.get(&client)
    }

    /// The record of `client`, or an empty one if it is not tracked.
    pub fn record_or_default(&self, client: NodeId) -> FairnessRecord {
        self.get(client).copied().unwrap_or_default()
    }

    pub fn update(
        &mut self,
        client: NodeId,
        delivered: u64,
        isolated: bool,
    ) -> Result<FairnessDelta, FairnessError> {
        self.records
            .get_mut(&client)
            .map(|r| r.apply(delivered, isolated))
            .ok_or(FairnessError::UnknownClient(client))
    }

    pub fn normalizers(&self, clients: &[NodeId], max_layers: usize) -> Normalizers {
        let m = max_layers as f64;
        let mut t_max = f64::MIN_POSITIVE;
        let mut i_max = m.max(1.0);
        let mut v_max = 0.0_f64;
        for &c in clients {
            let r = self.record_or_default(c);
            t_max = t_max.max((r.cumulative_layers as f64 + m) / r.phi() as f64);
            i_max = i_max.max(r.oscillation as f64 + m);
            v_max = v_max.max(r.isolation_events as f64);
        }
        Normalizers {
            t_max,
            i_max,
            n_max: v_max + 1.0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &FairnessRecord)> {
        self.records.iter().map(|(&id, r)| (id, r))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FairnessError {
    #[error("Client {0} is not tracked")]
    UnknownClient(NodeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate() -> anyhow::Result<()> {
        let mut state = FairnessState::default();
        let c = NodeId::new(7);
        assert!(state.admit(c));
        assert!(!state.admit(c));
        let mut deltas = Vec::new();
        for (delivered, isolated) in [(2, true), (2, false), (4, true), (1, true)] {
            deltas.push(state.update(c, delivered, isolated)?);
        }
        insta::assert_yaml_snapshot!(state.get(c), @r###"
        cumulative_layers: 9
        previous_layers: 1
        oscillation: 7
        isolation_events: 3
        cycles: 4
        "###);
        assert_eq!(deltas.iter().map(|d| d.change).collect::<Vec<_>>(), [2, 0, 2, 3]);
        Ok(())
    }

    #[test]
    fn accumulators_never_decrease() -> anyhow::Result<()> {
        let mut state = FairnessState::default();
        let c = NodeId::new(0);
        state.admit(c);
        let mut prev = state.record_or_default(c);
        for delivered in [3, 0, 4, 4, 1, 0, 2] {
            state.update(c, delivered, delivered % 2 == 0)?;
            let cur = state.record_or_default(c);
            assert!(cur.cumulative_layers >= prev.cumulative_layers);
            assert!(cur.oscillation >= prev.oscillation);
            assert!(cur.isolation_events >= prev.isolation_events);
            prev = cur;
        }
        Ok(())
    }

    #[test]
    fn unknown_clients_are_rejected() {
        let mut state = FairnessState::default();
        assert!(matches!(
            state.update(NodeId::new(1), 1, false),
            Err(FairnessError::UnknownClient(..))
        ));
    }

    #[test]
    fn retired_clients_are_forgotten() {
        let mut state = FairnessState::default();
        state.admit(NodeId::new(1));
        assert!(state.retire(NodeId::new(1)).is_some());
        assert!(state.is_empty());
        assert!(state.retire(NodeId::new(1)).is_none());
    }

    #[test]
    fn normalizers_take_the_worst_case() -> anyhow::Result<()> {
        let mut state = FairnessState::default();
        let (a, b) = (NodeId::new(0), NodeId::new(1));
        state.admit(a);
        state.admit(b);
        state.update(a, 4, true)?;
        state.update(b, 1, false)?;
        let n = state.normalizers(&[a, b], 4);
        // a: (4 + 4) / 2, b: (1 + 4) / 2
        assert_eq!(n.t_max, 4.0);
        // a: 4 + 4
        assert_eq!(n.i_max, 8.0);
        assert_eq!(n.n_max, 2.0);
        // Nobody has history yet
        let n = FairnessState::default().normalizers(&[a, b], 4);
        assert_eq!((n.t_max, n.i_max, n.n_max), (4.0, 4.0, 1.0));
        Ok(())
    }
}
