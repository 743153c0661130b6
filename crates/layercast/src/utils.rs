//! Loading topologies, catalogs and options from JSON or Dhall files.

pub use layercast_utils::*;
