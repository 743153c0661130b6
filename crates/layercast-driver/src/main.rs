use std::{
    io::BufWriter,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use clap::Parser;
use layercast_driver::Session;

#[derive(Parser, Debug)]
struct Args {
    /// Topology file (JSON or Dhall)
    #[arg(short, long)]
    topology: PathBuf,
    /// Catalog of layer sizes per segment (JSON or Dhall)
    #[arg(short, long)]
    catalog: PathBuf,
    /// Cycle options (JSON or Dhall); defaults apply when omitted
    #[arg(short, long)]
    options: Option<PathBuf>,
    /// Where to write one JSON report per cycle; stdout when omitted
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let stop = Arc::new(AtomicBool::new(false));
    let s = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        s.store(true, Ordering::SeqCst);
    })
    .with_context(|| "failed to set interrupt handler")?;

    let session = Session {
        topology: args.topology,
        catalog: args.catalog,
        options: args.options,
    };
    let nr_cycles = match args.out {
        Some(path) => {
            let file = std::fs::File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            session.run(&stop, BufWriter::new(file))
        }
        None => session.run(&stop, std::io::stdout().lock()),
    }
    .with_context(|| "error in layercast_driver::Session::run")?;
    log::info!("ran {nr_cycles} cycles");
    Ok(())
}
