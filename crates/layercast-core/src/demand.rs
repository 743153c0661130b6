//! This module turns content sizes into bandwidth requirements. A [`DemandModel`] maps each
//! layer of the current segment to the rate needed to download it within the deadline.

use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::{
    network::{types::NodeId, Network},
    units::{Bytes, BytesPerSec},
    utils,
};

/// Sizes of the layers of every segment.
pub trait Catalog {
    /// The size of `layer` of `segment`, or `None` if the catalog does not have it.
    fn layer_size(&self, segment: usize, layer: usize) -> Option<Bytes>;

    /// The number of segments in the content.
    fn nr_segments(&self) -> usize;
}

/// A catalog held in memory, indexed by segment then layer.
#[derive(Debug, Clone, Default, derive_new::new, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct MemoryCatalog {
    segments: Vec<Vec<Option<Bytes>>>,
}

impl Catalog for MemoryCatalog {
    fn layer_size(&self, segment: usize, layer: usize) -> Option<Bytes> {
        self.segments.get(segment)?.get(layer).copied().flatten()
    }

    fn nr_segments(&self) -> usize {
        self.segments.len()
    }
}

impl<C: Catalog + ?Sized> Catalog for &C {
    fn layer_size(&self, segment: usize, layer: usize) -> Option<Bytes> {
        (**self).layer_size(segment, layer)
    }

    fn nr_segments(&self) -> usize {
        (**self).nr_segments()
    }
}

/// Parameters for converting layer sizes into rates.
#[derive(Debug, Clone, typed_builder::TypedBuilder, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DemandModel {
    /// Multiplier accounting for transport overhead.
    #[builder(default = 1.054)]
    pub overhead_factor: f64,
    /// Per-request header bytes added to every layer.
    #[builder(default = Bytes::new(500))]
    pub header_overhead: Bytes,
    /// Time allowed to download one segment.
    #[builder(default = Duration::from_secs(2))]
    #[serde(with = "utils::millis")]
    pub deadline: Duration,
    /// Maximum number of layers a client can receive.
    #[builder(default = 4)]
    pub nr_layers: usize,
}

impl Default for DemandModel {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The per-layer rates a client needs for one segment. `None` marks a layer that is missing
/// from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ClientDemand {
    pub client: NodeId,
    pub layers: Vec<Option<BytesPerSec>>,
}

impl ClientDemand {
    pub fn layer(&self, layer: usize) -> Option<BytesPerSec> {
        self.layers.get(layer).copied().flatten()
    }

    pub fn is_available(&self, layer: usize) -> bool {
        self.layer(layer).is_some()
    }

    /// Total rate of every available layer.
    pub fn total(&self) -> BytesPerSec {
        self.layers.iter().flatten().copied().sum()
    }
}

impl DemandModel {
    /// The rate needed to move a layer of `size` bytes before the deadline.
    pub fn rate_for(&self, size: Bytes) -> BytesPerSec {
        let bytes = self.overhead_factor * (size + self.header_overhead).into_f64();
        BytesPerSec::to_move(bytes, self.deadline)
    }

    /// Computes the demand of every client for `segment`. Layers missing from the catalog
    /// become unavailable and do not fail the computation.
    pub fn compute<C: Catalog>(
        &self,
        clients: &[NodeId],
        catalog: &C,
        segment: usize,
    ) -> Result<Vec<ClientDemand>, DemandError> {
        self.validate()?;
        let layers = (0..self.nr_layers)
            .map(|layer| match catalog.layer_size(segment, layer) {
                Some(size) => Some(self.rate_for(size)),
                None => {
                    log::debug!("segment {segment} has no layer {layer}");
                    None
                }
            })
            .collect::<Vec<_>>();
        Ok(clients
            .iter()
            .map(|&client| ClientDemand {
                client,
                layers: layers.clone(),
            })
            .collect())
    }

    pub(crate) fn validate(&self) -> Result<(), DemandError> {
        if self.deadline.is_zero() {
            return Err(DemandError::ZeroDeadline);
        }
        if self.nr_layers == 0 {
            return Err(DemandError::NoLayers);
        }
        if !(self.overhead_factor.is_finite() && self.overhead_factor > 0.0) {
            return Err(DemandError::BadOverhead(self.overhead_factor));
        }
        Ok(())
    }
}

/// Sums the demand of every client behind each client-side switch.
pub fn aggregate(network: &Network, demands: &[ClientDemand]) -> FxHashMap<NodeId, BytesPerSec> {
    let mut acc = network
        .client_side()
        .iter()
        .map(|&sw| (sw, BytesPerSec::ZERO))
        .collect::<FxHashMap<_, _>>();
    for d in demands {
        if let Some(sw) = network.attachment(d.client) {
            *acc.entry(sw).or_default() += d.total();
        }
    }
    acc
}

#[derive(Debug, thiserror::Error)]
pub enum DemandError {
    #[error("Download deadline must be positive")]
    ZeroDeadline,

    #[error("Number of layers must be positive")]
    NoLayers,

    #[error("Invalid overhead factor {0}")]
    BadOverhead(f64),
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;
    use crate::testing;

    #[test]
    fn default_model_matches_reference_rates() {
        let model = DemandModel::default();
        // 1.054 * (9500 + 500) / 2 = 5270
        assert_eq!(model.rate_for(Bytes::new(9500)), BytesPerSec::new(5270));
        // 1.054 * (1000 + 500) / 2 = 790.5, rounded up
        assert_eq!(model.rate_for(Bytes::new(1000)), BytesPerSec::new(791));
    }

    #[test]
    fn missing_layers_are_unavailable() -> anyhow::Result<()> {
        let catalog = testing::uniform_catalog(1, &[Some(9500), Some(9500), None]);
        let model = DemandModel::builder().nr_layers(4).build();
        let clients = [NodeId::new(3), NodeId::new(4)];
        let demands = model.compute(&clients, &catalog, 0)?;
        assert_eq!(demands.len(), 2);
        for d in &demands {
            assert!(d.is_available(0));
            assert!(d.is_available(1));
            assert!(!d.is_available(2));
            // Past the end of the catalog's layer list
            assert!(!d.is_available(3));
            assert_eq!(d.total(), BytesPerSec::new(2 * 5270));
        }
        // An unknown segment makes every layer unavailable
        let demands = model.compute(&clients, &catalog, 7)?;
        assert!(demands.iter().all(|d| d.total() == BytesPerSec::ZERO));
        Ok(())
    }

    #[test]
    fn bad_configuration_fails() {
        let catalog = testing::uniform_catalog(1, &[Some(100)]);
        let clients = [NodeId::new(0)];
        let model = DemandModel::builder().deadline(Duration::ZERO).build();
        assert!(matches!(
            model.compute(&clients, &catalog, 0),
            Err(DemandError::ZeroDeadline)
        ));
        let model = DemandModel::builder().nr_layers(0).build();
        assert!(matches!(
            model.compute(&clients, &catalog, 0),
            Err(DemandError::NoLayers)
        ));
    }

    #[test]
    fn aggregate_sums_per_edge_switch() -> anyhow::Result<()> {
        let (nodes, links) = testing::shared_edge_config();
        let network = Network::new(&nodes, &links).context("failed to create topology")?;
        let catalog = testing::uniform_catalog(1, &[Some(1000)]);
        let model = DemandModel::builder().nr_layers(1).build();
        let demands = model.compute(network.clients(), &catalog, 0)?;
        let agg = aggregate(&network, &demands);
        assert_eq!(agg.get(&NodeId::new(2)), Some(&BytesPerSec::new(2 * 791)));
        assert_eq!(agg.len(), 1);
        Ok(())
    }

    #[test]
    fn catalog_reads_json() -> anyhow::Result<()> {
        let catalog: MemoryCatalog = serde_json::from_str("[[100, 200, null], [300]]")?;
        assert_eq!(catalog.nr_segments(), 2);
        assert_eq!(catalog.layer_size(0, 1), Some(Bytes::new(200)));
        assert_eq!(catalog.layer_size(0, 2), None);
        assert_eq!(catalog.layer_size(1, 1), None);
        Ok(())
    }
}
