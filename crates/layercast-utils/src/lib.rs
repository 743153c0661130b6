//! Utilities for loading Layercast inputs from files.

#![warn(unreachable_pub, missing_debug_implementations, missing_docs)]

use std::path::{Path, PathBuf};

use layercast_core::{
    network::{Link, Network, Node},
    CycleOpts, MemoryCatalog,
};
use serde::de::DeserializeOwned;

/// Reads a [`Network`] from a file containing a [`TopologySpec`] in JSON or Dhall format.
pub fn read_network(topology_spec: impl AsRef<Path>) -> Result<Network, Error> {
    let spec = read_topology_spec(topology_spec)?;
    Ok(Network::new(&spec.nodes, &spec.links)?)
}

/// Reads a [`TopologySpec`] from a file in JSON or Dhall format.
pub fn read_topology_spec(path: impl AsRef<Path>) -> Result<TopologySpec, Error> {
    read_file(path)
}

/// Reads a [`MemoryCatalog`] from a file in JSON or Dhall format. The file holds one list of
/// layer sizes per segment, with `null` for missing layers.
pub fn read_catalog(path: impl AsRef<Path>) -> Result<MemoryCatalog, Error> {
    read_file(path)
}

/// Reads [`CycleOpts`] from a file in JSON or Dhall format. Missing fields take their defaults.
pub fn read_options(path: impl AsRef<Path>) -> Result<CycleOpts, Error> {
    read_file(path)
}

fn read_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, Error> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    let value = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents)?,
        Some("dhall") => serde_dhall::from_str(&contents).parse().map_err(Box::new)?,
        _ => return Err(Error::UnknownFileType(path.into())),
    };
    Ok(value)
}

/// A topology specification.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct TopologySpec {
    /// Nodes.
    pub nodes: Vec<Node>,
    /// Links.
    pub links: Vec<Link>,
}

/// Error kinds for input files.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown file type.
    #[error("unknown file type: {0}")]
    UnknownFileType(PathBuf),

    /// Error deserializing Dhall.
    #[error("Dhall error")]
    Dhall(#[from] Box<serde_dhall::Error>),

    /// Error deserializing JSON.
    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error")]
    Io(#[from] std::io::Error),

    /// Error constructing a valid topology.
    #[error("invalid topology")]
    Topology(#[from] layercast_core::TopologyError),
}
