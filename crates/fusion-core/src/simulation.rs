// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Simulation Driver
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Run loop: setup, repeated `{pre step, ARK advance, post step,
//! histories, plot, checkpoint}`, finalize. Checkpoints and plot
//! snapshots are JSON documents.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fusion_math::ark::ArkIntegrator;
use fusion_types::config::SimulationConfig;
use fusion_types::error::{FusionError, FusionResult};
use fusion_types::state::StepSummary;
use log::info;
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::block_array::{ComponentKind, LevelData};
use crate::geometry::MultiblockGeometry;
use crate::gkops::{physical_species, GkOps};
use crate::history::FieldHistories;
use crate::species::GkState;

/// Patch arrays of one evolved quantity, ghosts included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedArray {
    pub name: String,
    pub patches: Vec<Array3<f64>>,
}

impl SavedArray {
    fn capture(name: &str, data: &LevelData) -> Self {
        SavedArray {
            name: name.to_string(),
            patches: data.patches().to_vec(),
        }
    }

    fn restore_into(&self, name: &str, data: &mut LevelData) -> FusionResult<()> {
        if self.name != name || self.patches.len() != data.num_patches() {
            return Err(FusionError::GeometryMismatch(format!(
                "checkpoint array '{}' ({} patches) does not match '{}' ({} patches)",
                self.name,
                self.patches.len(),
                name,
                data.num_patches()
            )));
        }
        for (k, saved) in self.patches.iter().enumerate() {
            let target = data.patch_mut(k);
            if target.dim() != saved.dim() {
                return Err(FusionError::GeometryMismatch(format!(
                    "checkpoint array '{name}' patch {k} has shape {:?}, expected {:?}",
                    saved.dim(),
                    target.dim()
                )));
            }
            target.assign(saved);
        }
        data.mark_stale();
        Ok(())
    }
}

/// Everything needed to continue a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: usize,
    pub time: f64,
    pub dt: f64,
    pub er_lo: f64,
    pub er_hi: f64,
    pub kinetic: Vec<SavedArray>,
    pub fluids: Vec<SavedArray>,
    pub fields: Vec<SavedArray>,
    pub histories: FieldHistories,
}

impl Checkpoint {
    pub fn read(path: &Path) -> FusionResult<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn write(&self, path: &Path) -> FusionResult<()> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    fn restore_state(&self, state: &mut GkState) -> FusionResult<()> {
        if self.kinetic.len() != state.kinetic.len()
            || self.fluids.len() != state.fluids.len()
            || self.fields.len() != state.fields.len()
        {
            return Err(FusionError::ConfigError(
                "checkpoint species, fluids or fields differ from the input deck".to_string(),
            ));
        }
        for (saved, s) in self.kinetic.iter().zip(state.kinetic.iter_mut()) {
            let name = s.name().to_string();
            saved.restore_into(&name, s.dfn_mut())?;
        }
        for (saved, f) in self.fluids.iter().zip(state.fluids.iter_mut()) {
            let name = f.name().to_string();
            saved.restore_into(&name, f.data_mut())?;
        }
        for (saved, f) in self.fields.iter().zip(state.fields.iter_mut()) {
            let name = f.name().to_string();
            saved.restore_into(&name, f.data_mut())?;
        }
        Ok(())
    }
}

/// Fields and moments at one instant, for offline visualisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotSnapshot {
    pub step: usize,
    pub time: f64,
    pub potential: Vec<Array3<f64>>,
    pub efield: Vec<Array3<f64>>,
    pub densities: Vec<SavedArray>,
}

pub struct Simulation {
    config: SimulationConfig,
    ops: GkOps,
    integrator: ArkIntegrator<GkState>,
    state: GkState,
    histories: FieldHistories,
    output_dir: PathBuf,
    last_summary: Option<StepSummary>,
}

impl Simulation {
    /// Fresh run from the input deck.
    pub fn new(config: SimulationConfig) -> FusionResult<Self> {
        Self::setup(config, None)
    }

    /// Continue from the checkpoint at `path`.
    pub fn restart(config: SimulationConfig, path: &Path) -> FusionResult<Self> {
        let chk = Checkpoint::read(path)?;
        Self::setup(config, Some(chk))
    }

    fn setup(config: SimulationConfig, checkpoint: Option<Checkpoint>) -> FusionResult<Self> {
        config.validate()?;
        let geom = Arc::new(MultiblockGeometry::new(&config.geometry)?);
        let mut state = GkOps::initial_state(&config, &geom)?;
        let mut ops = GkOps::new(&config, Arc::clone(&geom))?;
        let mut histories = FieldHistories::from_config(&config.simulation)?;
        let output_dir = PathBuf::from(&config.simulation.output_dir);
        std::fs::create_dir_all(&output_dir)?;

        let (time, step, dt, er) = match checkpoint {
            Some(chk) => {
                chk.restore_state(&mut state)?;
                histories.restore(chk.histories.clone())?;
                info!("restarting from step {} at t = {:.6e}", chk.step, chk.time);
                (chk.time, chk.step, chk.dt, Some((chk.er_lo, chk.er_hi)))
            }
            None => (0.0, 0, config.simulation.fixed_dt.unwrap_or(0.0), None),
        };
        for s in state.kinetic.iter_mut() {
            s.dfn_mut().fill_internal_ghosts();
            s.dfn_mut().extrapolate_physical_ghosts();
        }
        ops.initialize_electric_field(&state, er)?;
        let mut integrator = ArkIntegrator::new(&config.ark, &state, time, dt)?;
        integrator.reset_time(time, step);

        let mut sim = Simulation {
            config,
            ops,
            integrator,
            state,
            histories,
            output_dir,
            last_summary: None,
        };
        if step == 0 {
            sim.record_histories(true)?;
        }
        Ok(sim)
    }

    pub fn state(&self) -> &GkState {
        &self.state
    }

    pub fn ops(&self) -> &GkOps {
        &self.ops
    }

    pub fn histories(&self) -> &FieldHistories {
        &self.histories
    }

    pub fn step(&self) -> usize {
        self.integrator.step()
    }

    pub fn time(&self) -> f64 {
        self.integrator.time()
    }

    pub fn last_summary(&self) -> Option<&StepSummary> {
        self.last_summary.as_ref()
    }

    pub fn not_done(&self) -> bool {
        let run = &self.config.simulation;
        self.step() < run.max_step && self.time() < run.max_time
    }

    fn record_histories(&mut self, force: bool) -> FusionResult<()> {
        let (step, time) = (self.step(), self.time());
        let (e_cell, _) = self.ops.efield();
        self.histories
            .record(step, time, self.ops.potential(), e_cell, force, &self.output_dir)
    }

    fn select_dt(&self, stable_dt: f64) -> FusionResult<f64> {
        let run = &self.config.simulation;
        let dt = match run.fixed_dt {
            Some(dt) => dt,
            None if stable_dt.is_finite() => run.cfl * stable_dt,
            None => {
                return Err(FusionError::ConfigError(
                    "no stability limit from any operator; set simulation.fixed_dt".to_string(),
                ))
            }
        };
        Ok(dt.min(run.max_time - self.time()))
    }

    /// One full time step.
    pub fn advance(&mut self) -> FusionResult<StepSummary> {
        let (step, time) = (self.step(), self.time());
        self.ops.pre_time_step(&self.state, step, time)?;
        let stable_dt = self.ops.stable_dt(&self.state);
        let dt = self.select_dt(stable_dt)?;
        self.integrator.set_dt(dt);
        let stats = self.integrator.advance(&mut self.ops, &mut self.state)?;
        self.ops.post_time_step(&mut self.state)?;
        self.record_histories(false)?;

        let (er_lo, er_hi) = self.ops.er_boundary();
        let summary = StepSummary {
            step: self.step(),
            time: self.time(),
            dt,
            stable_dt,
            er_lo,
            er_hi,
        };
        info!(
            "step {}: t = {:.6e}, dt = {:.6e} (stable {:.3e}), newton {} / gmres {}",
            summary.step, summary.time, dt, stable_dt, stats.nonlinear_iterations, stats.linear_iterations
        );

        let run = &self.config.simulation;
        if run.plot_interval > 0 && summary.step % run.plot_interval == 0 {
            self.write_plot()?;
        }
        if run.checkpoint_interval > 0 && summary.step % run.checkpoint_interval == 0 {
            self.write_checkpoint()?;
        }
        self.last_summary = Some(summary.clone());
        Ok(summary)
    }

    /// Step until the step or time budget is spent, then finalize.
    pub fn run(&mut self) -> FusionResult<Option<StepSummary>> {
        while self.not_done() {
            self.advance()?;
        }
        self.finalize()?;
        Ok(self.last_summary.clone())
    }

    /// Final plot and checkpoint unless the last step already wrote them.
    pub fn finalize(&mut self) -> FusionResult<()> {
        let run = &self.config.simulation;
        let step = self.step();
        if run.plot_interval > 0 && step % run.plot_interval != 0 {
            self.write_plot()?;
        }
        if run.checkpoint_interval > 0 && step % run.checkpoint_interval != 0 {
            self.write_checkpoint()?;
        }
        info!("finished at step {step}, t = {:.6e}", self.time());
        Ok(())
    }

    pub fn checkpoint(&self) -> Checkpoint {
        let (er_lo, er_hi) = self.ops.er_boundary();
        Checkpoint {
            step: self.step(),
            time: self.time(),
            dt: self.integrator.dt(),
            er_lo,
            er_hi,
            kinetic: self
                .state
                .kinetic
                .iter()
                .map(|s| SavedArray::capture(s.name(), s.dfn()))
                .collect(),
            fluids: self
                .state
                .fluids
                .iter()
                .map(|f| SavedArray::capture(f.name(), f.data()))
                .collect(),
            fields: self
                .state
                .fields
                .iter()
                .map(|f| SavedArray::capture(f.name(), f.data()))
                .collect(),
            histories: self.histories.clone(),
        }
    }

    pub fn write_checkpoint(&self) -> FusionResult<PathBuf> {
        let path = self.output_dir.join(format!(
            "{}.{:06}.json",
            self.config.simulation.checkpoint_prefix,
            self.step()
        ));
        self.checkpoint().write(&path)?;
        info!("checkpoint written to {}", path.display());
        Ok(path)
    }

    pub fn plot_snapshot(&self) -> FusionResult<PlotSnapshot> {
        let layout = self.ops.geometry().layout();
        let mut densities = Vec::with_capacity(self.state.kinetic.len());
        for s in &self.state.kinetic {
            let mut n = LevelData::new(layout, 1, ComponentKind::Scalar);
            physical_species(s).number_density(&mut n)?;
            densities.push(SavedArray::capture(s.name(), &n));
        }
        let (e_cell, _) = self.ops.efield();
        Ok(PlotSnapshot {
            step: self.step(),
            time: self.time(),
            potential: self.ops.potential().patches().to_vec(),
            efield: e_cell.patches().to_vec(),
            densities,
        })
    }

    pub fn write_plot(&self) -> FusionResult<PathBuf> {
        let path = self.output_dir.join(format!(
            "{}.{:06}.json",
            self.config.simulation.plot_prefix,
            self.step()
        ));
        let file = File::create(&path)?;
        serde_json::to_writer(BufWriter::new(file), &self.plot_snapshot()?)?;
        Ok(path)
    }
}
