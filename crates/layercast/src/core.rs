//! Core Layercast data structures and routines. The most common entry point is the
//! [`Orchestrator`], which runs one optimization [cycle](cycle) per content segment.

pub use layercast_core::*;
