// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Evolved State
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Kinetic species, fluid species and auxiliary fields, and the
//! [`GkState`] collection the time integrator advances.

use std::sync::Arc;

use fusion_math::vector::OdeVector;
use fusion_types::config::{FieldConfig, FluidSpeciesConfig, KineticSpeciesConfig};
use fusion_types::error::{FusionError, FusionResult};
use ndarray::Axis;
use rayon::prelude::*;

use crate::block_array::{ComponentKind, LevelData};
use crate::geometry::MultiblockGeometry;
use crate::grid_function::GridFunction;
use crate::phase_geom::PhaseGeom;

/// Distribution function of one kinetic species, stored as `J f`.
#[derive(Debug, Clone)]
pub struct KineticSpecies {
    name: String,
    mass: f64,
    charge: f64,
    phase: Arc<PhaseGeom>,
    dfn: LevelData,
}

impl KineticSpecies {
    pub fn new(name: &str, mass: f64, charge: f64, phase: Arc<PhaseGeom>) -> FusionResult<Self> {
        if mass <= 0.0 {
            return Err(FusionError::ConfigError(format!(
                "species '{name}' needs a positive mass, got {mass}"
            )));
        }
        let dfn = phase.new_phase_data();
        Ok(KineticSpecies {
            name: name.to_string(),
            mass,
            charge,
            phase,
            dfn,
        })
    }

    /// Species with a Maxwellian initial condition from its profiles.
    pub fn from_config(cfg: &KineticSpeciesConfig, geom: &Arc<MultiblockGeometry>) -> FusionResult<Self> {
        let phase = Arc::new(PhaseGeom::new(Arc::clone(geom), cfg.velocity.clone())?);
        let mut species = Self::new(&cfg.name, cfg.mass, cfg.charge, phase)?;
        let n = GridFunction::from_config(&cfg.density)?;
        let t = GridFunction::from_config(&cfg.temperature)?;
        species.dfn = species.phase.maxwellian_dfn(&n, &t, cfg.mass)?;
        Ok(species)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_species(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn charge(&self) -> f64 {
        self.charge
    }

    pub fn phase(&self) -> &PhaseGeom {
        &self.phase
    }

    pub fn dfn(&self) -> &LevelData {
        &self.dfn
    }

    pub fn dfn_mut(&mut self) -> &mut LevelData {
        &mut self.dfn
    }

    /// Same species with `J` divided out of the distribution.
    pub fn to_physical(&self) -> KineticSpecies {
        KineticSpecies {
            dfn: self.phase.divide_j(&self.dfn),
            ..self.clone_empty()
        }
    }

    /// Metadata copy with an empty distribution of the same layout.
    pub fn clone_empty(&self) -> KineticSpecies {
        KineticSpecies {
            name: self.name.clone(),
            mass: self.mass,
            charge: self.charge,
            phase: Arc::clone(&self.phase),
            dfn: self.phase.new_phase_data(),
        }
    }

    /// Number density; `self` must hold a physical distribution.
    pub fn number_density(&self, out: &mut LevelData) -> FusionResult<()> {
        self.phase.density_moment(&self.dfn, self.mass, out)
    }

    pub fn charge_density(&self, out: &mut LevelData) -> FusionResult<()> {
        self.number_density(out)?;
        out.scale(self.charge);
        Ok(())
    }

    pub fn mass_density(&self, out: &mut LevelData) -> FusionResult<()> {
        self.number_density(out)?;
        out.scale(self.mass);
        Ok(())
    }

    /// `q ∫ v∥ f`; physical distribution.
    pub fn parallel_current_density(&self, out: &mut LevelData) -> FusionResult<()> {
        self.phase.parallel_flux_moment(&self.dfn, self.mass, out)?;
        out.scale(self.charge);
        Ok(())
    }
}

/// Configuration-space fluid density, stored as `J n`.
#[derive(Debug, Clone)]
pub struct FluidSpecies {
    name: String,
    mass: f64,
    charge: f64,
    data: LevelData,
}

impl FluidSpecies {
    pub fn from_config(cfg: &FluidSpeciesConfig, geom: &MultiblockGeometry) -> FusionResult<Self> {
        let mut data = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
        GridFunction::from_config(&cfg.density)?.assign(geom, &mut data, 0)?;
        mult_j(geom, &mut data);
        Ok(FluidSpecies {
            name: cfg.name.clone(),
            mass: cfg.mass,
            charge: cfg.charge,
            data,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn charge(&self) -> f64 {
        self.charge
    }

    pub fn data(&self) -> &LevelData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut LevelData {
        &mut self.data
    }

    /// Physical density `n = (J n) / J`.
    pub fn density(&self, geom: &MultiblockGeometry) -> LevelData {
        divide_j(geom, &self.data)
    }
}

/// Auxiliary configuration-space field (e.g. vorticity).
#[derive(Debug, Clone)]
pub struct ScalarField {
    name: String,
    data: LevelData,
}

impl ScalarField {
    pub fn from_config(cfg: &FieldConfig, geom: &MultiblockGeometry) -> FusionResult<Self> {
        let mut data = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
        GridFunction::from_config(&cfg.initial)?.assign(geom, &mut data, 0)?;
        mult_j(geom, &mut data);
        Ok(ScalarField {
            name: cfg.name.clone(),
            data,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &LevelData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut LevelData {
        &mut self.data
    }
}

fn scale_by_j(geom: &MultiblockGeometry, data: &mut LevelData, divide: bool) {
    let filled = data.require_valid_ghosts().is_ok();
    let j = geom.j_cell();
    data.patches_mut().par_iter_mut().enumerate().for_each(|(k, a)| {
        let jk = j.patch(k).index_axis(Axis(0), 0).to_owned();
        for mut lane in a.outer_iter_mut() {
            if divide {
                lane /= &jk;
            } else {
                lane *= &jk;
            }
        }
    });
    if filled {
        data.mark_ghosts_filled();
    }
}

/// `u / J` on every cell, for configuration or phase data.
pub fn divide_j(geom: &MultiblockGeometry, data: &LevelData) -> LevelData {
    let mut out = data.clone();
    scale_by_j(geom, &mut out, true);
    out
}

pub fn mult_j(geom: &MultiblockGeometry, data: &mut LevelData) {
    scale_by_j(geom, data, false);
}

/// Everything the time integrator evolves.
#[derive(Debug, Clone, Default)]
pub struct GkState {
    pub kinetic: Vec<KineticSpecies>,
    pub fluids: Vec<FluidSpecies>,
    pub fields: Vec<ScalarField>,
}

impl GkState {
    pub fn new(kinetic: Vec<KineticSpecies>, fluids: Vec<FluidSpecies>, fields: Vec<ScalarField>) -> Self {
        GkState { kinetic, fluids, fields }
    }

    pub fn find_kinetic(&self, name: &str) -> Option<&KineticSpecies> {
        self.kinetic.iter().find(|s| s.is_species(name))
    }

    fn arrays(&self) -> impl Iterator<Item = &LevelData> {
        self.kinetic
            .iter()
            .map(|s| &s.dfn)
            .chain(self.fluids.iter().map(|f| &f.data))
            .chain(self.fields.iter().map(|f| &f.data))
    }

    fn arrays_mut(&mut self) -> impl Iterator<Item = &mut LevelData> {
        self.kinetic
            .iter_mut()
            .map(|s| &mut s.dfn)
            .chain(self.fluids.iter_mut().map(|f| &mut f.data))
            .chain(self.fields.iter_mut().map(|f| &mut f.data))
    }

    /// Same structure, all data zero.
    pub fn zeroed(&self) -> GkState {
        let mut out = self.clone();
        out.set_zero();
        out
    }
}

impl OdeVector for GkState {
    fn copy_from(&mut self, other: &Self) {
        for (a, b) in self.arrays_mut().zip(other.arrays()) {
            a.copy_from(b);
        }
    }

    fn axpy(&mut self, a: f64, x: &Self) {
        for (u, v) in self.arrays_mut().zip(x.arrays()) {
            u.axpy(a, v);
        }
    }

    fn scale(&mut self, a: f64) {
        for u in self.arrays_mut() {
            u.scale(a);
        }
    }

    fn set_zero(&mut self) {
        for u in self.arrays_mut() {
            u.set_zero();
        }
    }

    fn dot(&self, other: &Self) -> f64 {
        self.arrays().zip(other.arrays()).map(|(a, b)| a.dot(b)).sum()
    }

    fn len_dof(&self) -> usize {
        self.arrays().map(|a| a.len_dof()).sum()
    }
}
