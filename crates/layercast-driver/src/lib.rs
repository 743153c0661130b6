use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use layercast_core::{CycleError, CycleOpts, MemoryCatalog, Orchestrator};

/// Builds an orchestrator from a topology file, a catalog file, and an optional options file.
pub fn orchestrator_from_files(
    topology: impl AsRef<Path>,
    catalog: impl AsRef<Path>,
    options: Option<&Path>,
) -> Result<Orchestrator<MemoryCatalog>, Error> {
    let network = layercast_utils::read_network(topology)?;
    let catalog = layercast_utils::read_catalog(catalog)?;
    let opts = match options {
        Some(path) => layercast_utils::read_options(path)?,
        None => CycleOpts::default(),
    };
    Ok(Orchestrator::new(network, catalog, opts)?)
}

/// Runs every cycle of `orchestrator` until the catalog runs out or `stop` is set, writing one
/// JSON report per line to `out`. Returns the number of cycles run.
pub fn run(
    orchestrator: &mut Orchestrator<MemoryCatalog>,
    stop: &AtomicBool,
    mut out: impl Write,
) -> Result<usize, Error> {
    let mut failure = None;
    let nr_cycles = orchestrator.run(stop, |report| {
        if failure.is_some() {
            return;
        }
        let res = serde_json::to_writer(&mut out, report)
            .map_err(Error::from)
            .and_then(|()| writeln!(out).map_err(Error::from));
        if let Err(e) = res {
            log::error!("failed to write the report of segment {}", report.segment);
            failure = Some(e);
        }
    })?;
    match failure {
        Some(e) => Err(e),
        None => {
            out.flush()?;
            Ok(nr_cycles)
        }
    }
}

/// Input files of one run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Session {
    pub topology: PathBuf,
    pub catalog: PathBuf,
    pub options: Option<PathBuf>,
}

impl Session {
    pub fn run(&self, stop: &AtomicBool, out: impl Write) -> Result<usize, Error> {
        let mut orchestrator =
            orchestrator_from_files(&self.topology, &self.catalog, self.options.as_deref())?;
        run(&mut orchestrator, stop, out)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load inputs")]
    Inputs(#[from] layercast_utils::Error),

    #[error("cycle failed")]
    Cycle(#[from] CycleError),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    #[error("IO error")]
    Io(#[from] std::io::Error),
}
