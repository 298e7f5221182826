// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — gkfusion Command Line
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! `gkfusion deck.json [--restart chk.json]` advances a simulation;
//! `--check` builds the geometry and operators without stepping.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use fusion_core::geometry::MultiblockGeometry;
use fusion_core::gkops::GkOps;
use fusion_core::simulation::Simulation;
use fusion_types::config::SimulationConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gkfusion")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multiblock gyrokinetic simulation driver", long_about = None)]
struct Cli {
    /// JSON input deck
    input: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides.
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Resume from a checkpoint written by an earlier run
    #[arg(short, long)]
    restart: Option<PathBuf>,

    /// Parse the deck and build geometry and operators, then exit
    #[arg(long, conflicts_with = "restart")]
    check: bool,
}

fn load(deck: &Path) -> Result<SimulationConfig> {
    let path = deck.to_str().context("input deck path is not valid UTF-8")?;
    SimulationConfig::from_file(path).with_context(|| format!("reading input deck {}", deck.display()))
}

fn run(input: &Path, restart: Option<&Path>) -> Result<()> {
    let config = load(input)?;
    let mut sim = match restart {
        Some(chk) => {
            info!("restarting from {}", chk.display());
            Simulation::restart(config, chk).with_context(|| format!("restart from {}", chk.display()))?
        }
        None => Simulation::new(config).context("simulation setup")?,
    };
    info!("starting at step {} time {:.6e}", sim.step(), sim.time());

    let start = Instant::now();
    let last = sim.run().context("time stepping")?;
    match last {
        Some(s) => info!(
            "finished step {} time {:.6e} dt {:.3e} Er = ({:.4e}, {:.4e}) in {:.2?}",
            s.step,
            s.time,
            s.dt,
            s.er_lo,
            s.er_hi,
            start.elapsed()
        ),
        None => info!("nothing to do: step and time limits already reached"),
    }
    Ok(())
}

fn check(input: &Path) -> Result<()> {
    let config = load(input)?;
    let geom = Arc::new(MultiblockGeometry::new(&config.geometry).context("geometry")?);
    geom.check_multiblock_mapping_consistency(geom.mapping_tolerance())
        .context("block seams")?;
    let ops = GkOps::new(&config, Arc::clone(&geom)).context("operators")?;
    let state = GkOps::initial_state(&config, &geom).context("initial state")?;
    info!(
        "{}: {} blocks, {} patches, {} kinetic species, imex = {}, stable dt = {:.4e}",
        input.display(),
        geom.blocks().len(),
        geom.layout().num_patches(),
        state.kinetic.len(),
        ops.is_imex(),
        ops.stable_dt(&state)
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    if cli.check {
        check(&cli.input)
    } else {
        run(&cli.input, cli.restart.as_deref())
    }
}
