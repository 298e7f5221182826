// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Config
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};

use crate::constants::ReferenceUnits;
use crate::error::{FusionError, FusionResult};
use crate::state::VelocityGrid;

/// Names accepted by `ark.name`.
pub const ARK_METHOD_NAMES: [&str; 9] = ["1bee", "2a", "2c", "2e", "prssp2", "3", "4", "5", "rk4"];

/// Field names accepted by a history probe.
pub const HISTORY_FIELDS: [&str; 3] = ["potential", "Efield", "efield"];

/// Top-level input deck. Each section corresponds to one namespaced
/// prefix of the legacy key-value database (`simulation.*`,
/// `gksystem.*`, `boltzmann_electron.*`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub simulation: RunConfig,
    #[serde(default)]
    pub gksystem: GkSystemConfig,
    #[serde(default)]
    pub ark: ArkConfig,
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub field_solver: FieldSolverConfig,
    #[serde(default)]
    pub units: ReferenceUnits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boltzmann_electron: Option<BoltzmannElectronConfig>,
    pub species: Vec<KineticSpeciesConfig>,
    #[serde(default)]
    pub fluids: Vec<FluidSpeciesConfig>,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    pub potential_bc: Vec<PotentialBcConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neutrals: Option<NeutralsConfig>,
}

// ── simulation.* ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub max_step: usize,
    #[serde(default = "default_max_time")]
    pub max_time: f64,
    /// Fixed step size; when absent the step is `cfl * stable_dt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_dt: Option<f64>,
    #[serde(default = "default_cfl")]
    pub cfl: f64,
    #[serde(default)]
    pub checkpoint_interval: usize,
    #[serde(default = "default_checkpoint_prefix")]
    pub checkpoint_prefix: String,
    #[serde(default)]
    pub plot_interval: usize,
    #[serde(default = "default_plot_prefix")]
    pub plot_prefix: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default)]
    pub history: bool,
    #[serde(default = "default_history_frequency")]
    pub history_frequency: usize,
    #[serde(default)]
    pub histories: Vec<HistoryConfig>,
}

fn default_max_time() -> f64 {
    f64::MAX
}
fn default_cfl() -> f64 {
    0.5
}
fn default_checkpoint_prefix() -> String {
    "chk".to_string()
}
fn default_plot_prefix() -> String {
    "plt".to_string()
}
fn default_output_dir() -> String {
    ".".to_string()
}
fn default_history_frequency() -> usize {
    1
}

/// One field probe (`simulation.N.history_indices`, `N.history_field`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub block: usize,
    pub indices: [i64; 2],
    pub field: String,
}

// ── gksystem.* ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GkSystemConfig {
    #[serde(default)]
    pub fixed_efield: bool,
    #[serde(default)]
    pub vorticity_model: bool,
    #[serde(default)]
    pub consistent_potential_bcs: bool,
    #[serde(default = "default_true")]
    pub extrapolated_sol_efield: bool,
    #[serde(default)]
    pub efield_dealignment_corrections: bool,
    #[serde(default)]
    pub ampere_law: bool,
    #[serde(default)]
    pub ampere_cold_electrons: bool,
    #[serde(default)]
    pub transport_model_on: bool,
    #[serde(default)]
    pub neutrals_model_on: bool,
    #[serde(default)]
    pub enforce_quasineutrality: bool,
    #[serde(default)]
    pub verbosity: u32,
}

fn default_true() -> bool {
    true
}

impl Default for GkSystemConfig {
    fn default() -> Self {
        GkSystemConfig {
            fixed_efield: false,
            vorticity_model: false,
            consistent_potential_bcs: false,
            extrapolated_sol_efield: true,
            efield_dealignment_corrections: false,
            ampere_law: false,
            ampere_cold_electrons: false,
            transport_model_on: false,
            neutrals_model_on: false,
            enforce_quasineutrality: false,
            verbosity: 0,
        }
    }
}

impl GkSystemConfig {
    /// Ampere's law requires the consistent boundary condition machinery.
    pub fn normalized(&self) -> Self {
        let mut out = self.clone();
        if out.ampere_law {
            out.consistent_potential_bcs = true;
        }
        out
    }
}

// ── ark.* ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArkConfig {
    #[serde(default = "default_ark_name")]
    pub name: String,
    #[serde(default)]
    pub stage_predictor: bool,
    #[serde(default = "default_jfnk_epsilon")]
    pub jfnk_epsilon: f64,
    #[serde(default)]
    pub newton: NonlinearSolverConfig,
    #[serde(default)]
    pub gmres: LinearSolverConfig,
}

fn default_ark_name() -> String {
    "4".to_string()
}
fn default_jfnk_epsilon() -> f64 {
    1e-6
}

impl Default for ArkConfig {
    fn default() -> Self {
        ArkConfig {
            name: default_ark_name(),
            stage_predictor: false,
            jfnk_epsilon: default_jfnk_epsilon(),
            newton: NonlinearSolverConfig::default(),
            gmres: LinearSolverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonlinearSolverConfig {
    #[serde(default = "default_newton_atol")]
    pub atol: f64,
    #[serde(default = "default_newton_rtol")]
    pub rtol: f64,
    #[serde(default = "default_newton_max_iter")]
    pub max_iter: usize,
}

fn default_newton_atol() -> f64 {
    1e-10
}
fn default_newton_rtol() -> f64 {
    1e-6
}
fn default_newton_max_iter() -> usize {
    20
}

impl Default for NonlinearSolverConfig {
    fn default() -> Self {
        NonlinearSolverConfig {
            atol: default_newton_atol(),
            rtol: default_newton_rtol(),
            max_iter: default_newton_max_iter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSolverConfig {
    #[serde(default = "default_gmres_restart")]
    pub restart: usize,
    #[serde(default = "default_gmres_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_gmres_tol")]
    pub tol: f64,
}

fn default_gmres_restart() -> usize {
    30
}
fn default_gmres_max_iter() -> usize {
    10
}
fn default_gmres_tol() -> f64 {
    1e-6
}

impl Default for LinearSolverConfig {
    fn default() -> Self {
        LinearSolverConfig {
            restart: default_gmres_restart(),
            max_iter: default_gmres_max_iter(),
            tol: default_gmres_tol(),
        }
    }
}

// ── geometry.* ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeometryConfig {
    Slab(SlabConfig),
    Miller(MillerConfig),
    Tabulated(TabulatedConfig),
}

impl GeometryConfig {
    pub fn discretization(&self) -> &DiscretizationConfig {
        match self {
            GeometryConfig::Slab(c) => &c.discretization,
            GeometryConfig::Miller(c) => &c.discretization,
            GeometryConfig::Tabulated(c) => &c.discretization,
        }
    }
}

/// Settings shared by every geometry kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscretizationConfig {
    /// Patches per block along (radial, poloidal).
    #[serde(default = "default_decomposition")]
    pub decomposition: [usize; 2],
    #[serde(default = "default_ghosts")]
    pub ghosts: usize,
    /// Use second-order metric quadrature and divergence.
    #[serde(default)]
    pub second_order: bool,
    /// Relative tolerance of the block-seam consistency check.
    #[serde(default = "default_mapping_tolerance")]
    pub mapping_tolerance: f64,
}

fn default_decomposition() -> [usize; 2] {
    [1, 1]
}
fn default_ghosts() -> usize {
    2
}
fn default_mapping_tolerance() -> f64 {
    1e-10
}

impl Default for DiscretizationConfig {
    fn default() -> Self {
        DiscretizationConfig {
            decomposition: default_decomposition(),
            ghosts: default_ghosts(),
            second_order: false,
            mapping_tolerance: default_mapping_tolerance(),
        }
    }
}

/// Analytic slab: rectangular mesh, field mostly along the ignorable
/// direction with an optional radial gradient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlabConfig {
    pub cells: [usize; 2],
    pub xmax: f64,
    pub ymax: f64,
    #[serde(default = "default_one")]
    pub bz_inner: f64,
    #[serde(default = "default_one")]
    pub bz_outer: f64,
    #[serde(default)]
    pub by_inner: f64,
    #[serde(default = "default_true")]
    pub periodic_poloidal: bool,
    #[serde(default)]
    pub discretization: DiscretizationConfig,
}

fn default_one() -> f64 {
    1.0
}

/// Miller shaped annulus, optionally split into several poloidal blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MillerConfig {
    pub cells: [usize; 2],
    pub inner_radial_bdry: f64,
    pub outer_radial_bdry: f64,
    #[serde(default = "default_major_radius")]
    pub major_radius: f64,
    #[serde(default = "default_one")]
    pub kappa: f64,
    /// arcsin of the triangularity.
    #[serde(default)]
    pub beta: f64,
    #[serde(default = "default_one")]
    pub dpsidr: f64,
    #[serde(default)]
    pub dr_r0: f64,
    #[serde(default)]
    pub s_kappa: f64,
    #[serde(default)]
    pub s_delta: f64,
    #[serde(default = "default_btor_scale")]
    pub btor_scale: f64,
    #[serde(default = "default_true")]
    pub axisymmetric: bool,
    #[serde(default = "default_one_usize")]
    pub poloidal_blocks: usize,
    #[serde(default)]
    pub discretization: DiscretizationConfig,
}

fn default_major_radius() -> f64 {
    1.7
}
fn default_btor_scale() -> f64 {
    3.5
}
fn default_one_usize() -> usize {
    1
}

/// Topology tag of a tabulated multiblock mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabulatedTopology {
    SingleNull,
    SnCore,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockRoleConfig {
    Core,
    Sol,
    PrivateFlux,
}

/// Multiblock mapping given by node coordinates on each block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabulatedConfig {
    pub topology: TabulatedTopology,
    pub blocks: Vec<TabulatedBlockConfig>,
    #[serde(default)]
    pub connections: Vec<BlockConnectionConfig>,
    /// Block whose poloidal cut defines the flux-surface label for the
    /// dealignment interpolation.
    #[serde(default)]
    pub reference_core_block: usize,
    #[serde(default)]
    pub axisymmetric: bool,
    #[serde(default)]
    pub discretization: DiscretizationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabulatedBlockConfig {
    pub cells: [usize; 2],
    /// Node coordinates, `(cells[0] + 1) x (cells[1] + 1)`, first physical
    /// coordinate.
    pub x0: Vec<Vec<f64>>,
    pub x1: Vec<Vec<f64>>,
    /// Poloidal flux at the nodes.
    pub psi: Vec<Vec<f64>>,
    #[serde(default = "default_one")]
    pub b_toroidal: f64,
    pub role: BlockRoleConfig,
    /// Boundary names for `[dir][side]` physical faces.
    #[serde(default)]
    pub boundary_names: [[Option<String>; 2]; 2],
}

/// Conformal seam: cell `(i, j)` of `block` beyond `(dir, side)` maps to
/// cell `sign[k] * idx[perm[k]] + offset[k]` of `neighbor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockConnectionConfig {
    pub block: usize,
    pub dir: usize,
    pub side: crate::state::Side,
    pub neighbor: usize,
    #[serde(default = "default_perm")]
    pub perm: [usize; 2],
    #[serde(default = "default_sign")]
    pub sign: [i64; 2],
    pub offset: [i64; 2],
}

fn default_perm() -> [usize; 2] {
    [0, 1]
}
fn default_sign() -> [i64; 2] {
    [1, 1]
}

// ── field_solver.* ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldModel {
    Poisson,
    GkPoisson,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSolverConfig {
    #[serde(default = "default_field_model")]
    pub model: FieldModel,
    #[serde(default = "default_field_tol")]
    pub tol: f64,
    #[serde(default = "default_field_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_field_restart")]
    pub restart: usize,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_precond_sweeps")]
    pub precond_sweeps: usize,
    #[serde(default = "default_precond_omega")]
    pub precond_omega: f64,
    #[serde(default = "default_true")]
    pub fourth_order_coefficients: bool,
    #[serde(default = "default_boltzmann_max_iter")]
    pub boltzmann_max_iter: usize,
    #[serde(default = "default_boltzmann_tol")]
    pub boltzmann_tol: f64,
}

fn default_field_model() -> FieldModel {
    FieldModel::GkPoisson
}
fn default_field_tol() -> f64 {
    1e-10
}
fn default_field_max_iter() -> usize {
    50
}
fn default_field_restart() -> usize {
    40
}
fn default_precond_sweeps() -> usize {
    3
}
fn default_precond_omega() -> f64 {
    1.2
}
fn default_boltzmann_max_iter() -> usize {
    30
}
fn default_boltzmann_tol() -> f64 {
    1e-10
}

impl Default for FieldSolverConfig {
    fn default() -> Self {
        FieldSolverConfig {
            model: default_field_model(),
            tol: default_field_tol(),
            max_iter: default_field_max_iter(),
            restart: default_field_restart(),
            verbose: false,
            precond_sweeps: default_precond_sweeps(),
            precond_omega: default_precond_omega(),
            fourth_order_coefficients: true,
            boltzmann_max_iter: default_boltzmann_max_iter(),
            boltzmann_tol: default_boltzmann_tol(),
        }
    }
}

// ── species, fluids, fields ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoltzmannElectronConfig {
    pub name: String,
    #[serde(default)]
    pub mass: Option<f64>,
    #[serde(default)]
    pub charge: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl BoltzmannElectronConfig {
    /// `(mass, charge, temperature)` when the closure is fully specified.
    pub fn active_parameters(&self) -> Option<(f64, f64, f64)> {
        if self.name != "electron" {
            return None;
        }
        match (self.mass, self.charge, self.temperature) {
            (Some(m), Some(q), Some(t)) => Some((m, q, t)),
            _ => None,
        }
    }
}

/// Analytic profile specification (`GridFunction` factory input).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GridFunctionConfig {
    Constant {
        value: f64,
    },
    /// `constant + amplitude * cos(2 pi mode . xi + phase)` on mapped
    /// coordinates normalised to the block.
    Cosine {
        constant: f64,
        amplitude: f64,
        mode: [f64; 2],
        #[serde(default)]
        phase: [f64; 2],
    },
    /// Radial tanh step between `inner_value` and `outer_value`.
    Tanh {
        inner_value: f64,
        outer_value: f64,
        center: f64,
        width: f64,
    },
    /// Gaussian bump in physical space.
    Localized {
        amplitude: f64,
        location: [f64; 2],
        width: [f64; 2],
        #[serde(default)]
        floor: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KineticSpeciesConfig {
    pub name: String,
    pub mass: f64,
    pub charge: f64,
    pub velocity: VelocityGrid,
    pub density: GridFunctionConfig,
    pub temperature: GridFunctionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collisions: Option<CollisionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum CollisionConfig {
    Krook { frequency: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluidSpeciesConfig {
    pub name: String,
    pub mass: f64,
    pub charge: f64,
    pub density: GridFunctionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    pub initial: GridFunctionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum TransportConfig {
    Anomalous { diffusivity: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum NeutralsConfig {
    FixedBackground { frequency: f64, density: f64 },
}

// ── potential BCs ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BcValueType {
    Value,
    Derivative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BcSpecConfig {
    Dirichlet { value: f64 },
    DirichletFunction { function: GridFunctionConfig },
    Neumann { value: f64 },
    Multipole,
    CoreRadial { value_type: BcValueType, value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PotentialBcConfig {
    pub boundary: String,
    #[serde(flatten)]
    pub spec: BcSpecConfig,
}

impl SimulationConfig {
    /// Load from a JSON input deck and validate it.
    pub fn from_file(path: &str) -> FusionResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> FusionResult<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory or incomplete combinations before any setup.
    pub fn validate(&self) -> FusionResult<()> {
        let gk = &self.gksystem;
        if gk.fixed_efield && gk.ampere_law {
            return Err(FusionError::ConfigError(
                "fixed_efield and ampere_law cannot both be enabled".to_string(),
            ));
        }
        if !ARK_METHOD_NAMES.contains(&self.ark.name.as_str()) {
            return Err(FusionError::ConfigError(format!(
                "unknown ARK method '{}'",
                self.ark.name
            )));
        }
        if self.species.is_empty() {
            return Err(FusionError::ConfigError(
                "at least one kinetic species is required".to_string(),
            ));
        }
        if self.simulation.cfl <= 0.0 || !self.simulation.cfl.is_finite() {
            return Err(FusionError::ConfigError(format!(
                "cfl must be finite and positive, got {}",
                self.simulation.cfl
            )));
        }
        if let Some(dt) = self.simulation.fixed_dt {
            if dt <= 0.0 || !dt.is_finite() {
                return Err(FusionError::ConfigError(format!(
                    "fixed_dt must be finite and positive, got {dt}"
                )));
            }
        }
        if self.simulation.history && self.simulation.histories.is_empty() {
            return Err(FusionError::ConfigError(
                "history requested but no history probes specified".to_string(),
            ));
        }
        for h in &self.simulation.histories {
            if !HISTORY_FIELDS.contains(&h.field.as_str()) {
                return Err(FusionError::ConfigError(format!(
                    "unknown history field '{}'",
                    h.field
                )));
            }
        }
        let boltzmann = self
            .boltzmann_electron
            .as_ref()
            .and_then(|b| b.active_parameters());
        if gk.ampere_law && !gk.ampere_cold_electrons && boltzmann.is_none() {
            return Err(FusionError::Unsupported(
                "ampere_law without cold electrons requires a Boltzmann electron".to_string(),
            ));
        }
        if gk.vorticity_model && self.fields.is_empty() {
            return Err(FusionError::ConfigError(
                "vorticity_model requires a vorticity field".to_string(),
            ));
        }
        for s in &self.species {
            if s.mass <= 0.0 || s.velocity.num_cells() == 0 {
                return Err(FusionError::ConfigError(format!(
                    "species '{}' needs positive mass and a non-empty velocity grid",
                    s.name
                )));
            }
        }
        let disc = self.geometry.discretization();
        if disc.ghosts < 2 {
            return Err(FusionError::ConfigError(format!(
                "at least 2 ghost cells are required, got {}",
                disc.ghosts
            )));
        }
        if disc.decomposition.iter().any(|&p| p == 0) {
            return Err(FusionError::ConfigError(
                "decomposition entries must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// CARGO_MANIFEST_DIR points to crates/fusion-types/, the sample decks
    /// live two levels up.
    fn input_path(name: &str) -> String {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("inputs")
            .join(name)
            .to_string_lossy()
            .into_owned()
    }

    fn minimal_json() -> String {
        r#"{
            "simulation": { "max_step": 4, "fixed_dt": 0.01 },
            "ark": { "name": "rk4" },
            "geometry": { "kind": "slab", "cells": [8, 8], "xmax": 1.0, "ymax": 1.0 },
            "species": [{
                "name": "hydrogen", "mass": 1.0, "charge": 1.0,
                "velocity": { "n_vpar": 4, "n_mu": 2, "vpar_max": 3.0, "mu_max": 2.0 },
                "density": { "type": "constant", "value": 1.0 },
                "temperature": { "type": "constant", "value": 1.0 }
            }],
            "potential_bc": [
                { "boundary": "radial_inner", "type": "dirichlet", "value": 0.0 },
                { "boundary": "radial_outer", "type": "dirichlet", "value": 0.0 }
            ]
        }"#
        .to_string()
    }

    #[test]
    fn test_minimal_deck_defaults() {
        let cfg = SimulationConfig::from_json(&minimal_json()).expect("minimal deck parses");
        assert_eq!(cfg.simulation.max_step, 4);
        assert_eq!(cfg.ark.name, "rk4");
        assert!(!cfg.gksystem.consistent_potential_bcs);
        assert!(cfg.gksystem.extrapolated_sol_efield);
        assert_eq!(cfg.ark.jfnk_epsilon, 1e-6);
        assert_eq!(cfg.field_solver.model, FieldModel::GkPoisson);
        assert_eq!(cfg.geometry.discretization().ghosts, 2);
        assert!(cfg.boltzmann_electron.is_none());
        match &cfg.geometry {
            GeometryConfig::Slab(s) => {
                assert!(s.periodic_poloidal);
                assert_eq!(s.bz_inner, 1.0);
            }
            other => panic!("expected slab geometry, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_key_is_parse_error() {
        let json = minimal_json().replace("\"max_step\": 4,", "");
        let err = SimulationConfig::from_json(&json).expect_err("missing max_step must fail");
        assert!(matches!(err, FusionError::Json(_)));
    }

    #[test]
    fn test_fixed_efield_with_ampere_rejected() {
        let mut cfg = SimulationConfig::from_json(&minimal_json()).expect("parse");
        cfg.gksystem.fixed_efield = true;
        cfg.gksystem.ampere_law = true;
        let err = cfg.validate().expect_err("contradiction must fail");
        match err {
            FusionError::ConfigError(msg) => assert!(msg.contains("ampere_law")),
            other => panic!("Unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_ampere_forces_consistent_bcs() {
        let gk = GkSystemConfig {
            ampere_law: true,
            ..GkSystemConfig::default()
        };
        assert!(gk.normalized().consistent_potential_bcs);
    }

    #[test]
    fn test_unknown_ark_name_rejected() {
        let json = minimal_json().replace("\"rk4\"", "\"7b\"");
        let err = SimulationConfig::from_json(&json).expect_err("unknown tableau");
        assert!(matches!(err, FusionError::ConfigError(_)));
    }

    #[test]
    fn test_unknown_history_field_rejected() {
        let mut cfg = SimulationConfig::from_json(&minimal_json()).expect("parse");
        cfg.simulation.histories.push(HistoryConfig {
            block: 0,
            indices: [1, 1],
            field: "density".to_string(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_boltzmann_electron_activation() {
        let mut be = BoltzmannElectronConfig {
            name: "electron".to_string(),
            mass: Some(1.0 / 1836.0),
            charge: Some(-1.0),
            temperature: None,
        };
        assert!(be.active_parameters().is_none());
        be.temperature = Some(1.0);
        assert!(be.active_parameters().is_some());
        be.name = "positron".to_string();
        assert!(be.active_parameters().is_none());
    }

    #[test]
    fn test_bc_spec_flattened_tag() {
        let bc: PotentialBcConfig = serde_json::from_str(
            r#"{ "boundary": "radial_inner", "type": "core_radial", "value_type": "derivative", "value": 0.5 }"#,
        )
        .expect("bc parses");
        assert_eq!(
            bc.spec,
            BcSpecConfig::CoreRadial {
                value_type: BcValueType::Derivative,
                value: 0.5
            }
        );
    }

    #[test]
    fn test_sample_decks_load() {
        for name in ["slab_rk4.json", "miller_imex.json"] {
            let cfg = SimulationConfig::from_file(&input_path(name))
                .unwrap_or_else(|e| panic!("{name} should load: {e}"));
            assert!(!cfg.species.is_empty());
        }
    }
}
