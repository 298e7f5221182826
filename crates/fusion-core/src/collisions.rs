// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Krook Collisions
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! BGK-style relaxation `C[f] = -ν (f - M[n(f), T₀])` towards the local
//! Maxwellian that carries the distribution's own density and a fixed
//! reference temperature. The operator is linear in `f` and conserves
//! particles cell by cell.

use fusion_math::vector::OdeVector;
use fusion_types::config::{CollisionConfig, KineticSpeciesConfig};
use fusion_types::error::{FusionError, FusionResult};
use ndarray::Axis;
use rayon::prelude::*;

use crate::block_array::{ComponentKind, LevelData};
use crate::geometry::MultiblockGeometry;
use crate::grid_function::GridFunction;
use crate::operators::CollisionOperator;
use crate::species::{self, KineticSpecies};

/// `rhs += -rate (dfn - J M[n(dfn/J), T])` on every cell. `M` has the
/// discrete density of `dfn`, so the tendency carries no net particles.
pub(crate) fn relax_to_local_maxwellian(
    rhs: &mut LevelData,
    species: &KineticSpecies,
    temperature: &LevelData,
    rate: f64,
) -> FusionResult<()> {
    if rate == 0.0 {
        return Ok(());
    }
    let phase = species.phase();
    let geom = phase.geometry();
    let phys = species.to_physical();
    let mut n = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
    phys.number_density(&mut n)?;
    let mut unit = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
    unit.set_val(1.0);
    // Unit-density shape scaled by n: linear in f for either sign of n.
    let mut target = phase.maxwellian(&unit, temperature, species.mass())?;
    target.patches_mut().par_iter_mut().enumerate().for_each(|(k, a)| {
        let nk = n.patch(k);
        for mut lane in a.outer_iter_mut() {
            lane.zip_mut_with(&nk.index_axis(Axis(0), 0), |v, d| {
                *v *= if d.is_finite() { *d } else { 0.0 };
            });
        }
    });
    species::mult_j(geom, &mut target);
    rhs.axpy(-rate, species.dfn());
    rhs.axpy(rate, &target);
    Ok(())
}

/// Temperature profile of a species' initial condition on every cell.
pub(crate) fn reference_temperature(cfg: &KineticSpeciesConfig, geom: &MultiblockGeometry) -> FusionResult<LevelData> {
    let mut t = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
    GridFunction::from_config(&cfg.temperature)?.assign(geom, &mut t, 0)?;
    Ok(t)
}

#[derive(Debug, Clone)]
pub struct KrookCollisions {
    frequency: f64,
    temperature: LevelData,
}

impl KrookCollisions {
    pub fn new(frequency: f64, temperature: LevelData) -> FusionResult<Self> {
        if frequency.is_nan() || frequency < 0.0 {
            return Err(FusionError::ConfigError(format!(
                "collision frequency must be non-negative, got {frequency}"
            )));
        }
        Ok(KrookCollisions { frequency, temperature })
    }

    pub fn from_config(
        cfg: &CollisionConfig,
        species: &KineticSpeciesConfig,
        geom: &MultiblockGeometry,
    ) -> FusionResult<Self> {
        match cfg {
            CollisionConfig::Krook { frequency } => Self::new(*frequency, reference_temperature(species, geom)?),
        }
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }
}

impl CollisionOperator for KrookCollisions {
    fn accumulate_rhs(&self, rhs: &mut LevelData, species: &KineticSpecies, _time: f64) -> FusionResult<()> {
        relax_to_local_maxwellian(rhs, species, &self.temperature, self.frequency)
    }

    fn compute_dt(&self, _species: &KineticSpecies) -> f64 {
        if self.frequency > 0.0 {
            1.0 / self.frequency
        } else {
            f64::INFINITY
        }
    }

    fn relaxation_rate(&self) -> f64 {
        self.frequency
    }
}
