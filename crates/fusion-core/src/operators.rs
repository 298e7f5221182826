// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Physics Operator Interfaces
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Contracts between the operator split and the physics terms.
//!
//! Every operator adds its tendency to a right-hand side in
//! computational (`J`-weighted) form and reports the largest stable
//! explicit step it allows; `f64::INFINITY` means no restriction.

use std::fmt;

use fusion_types::error::FusionResult;

use crate::block_array::{FluxData, LevelData};
use crate::geometry::MultiblockGeometry;
use crate::species::{FluidSpecies, KineticSpecies, ScalarField};

/// Electric field and potential visible to operators during one
/// evaluation. Fields are physical vectors (2 components).
#[derive(Clone, Copy)]
pub struct FieldContext<'a> {
    pub geom: &'a MultiblockGeometry,
    pub phi: &'a LevelData,
    pub e_cell: &'a LevelData,
    pub e_face: &'a FluxData,
    pub time: f64,
}

pub trait VlasovOperator: Send + Sync + fmt::Debug {
    /// `rhs += -∇·(ż J f)` for a physical distribution with filled
    /// ghosts. When given, `radial_flux` accumulates the mapped radial
    /// charge flux on radial faces.
    fn accumulate_rhs(
        &self,
        rhs: &mut LevelData,
        species: &KineticSpecies,
        fields: &FieldContext<'_>,
        radial_flux: Option<&mut FluxData>,
    ) -> FusionResult<()>;

    fn compute_dt(&self, species: &KineticSpecies, fields: &FieldContext<'_>) -> f64;
}

pub trait CollisionOperator: Send + Sync + fmt::Debug {
    /// Tendency of a computational-space distribution.
    fn accumulate_rhs(&self, rhs: &mut LevelData, species: &KineticSpecies, time: f64) -> FusionResult<()>;

    fn compute_dt(&self, species: &KineticSpecies) -> f64;

    /// Largest diagonal damping rate, used to precondition implicit
    /// stage solves.
    fn relaxation_rate(&self) -> f64;
}

pub trait TransportOperator: Send + Sync + fmt::Debug {
    /// Tendency from a physical distribution with filled ghosts.
    fn accumulate_rhs(&self, rhs: &mut LevelData, species: &KineticSpecies, time: f64) -> FusionResult<()>;

    fn compute_dt(&self, species: &KineticSpecies) -> f64;
}

pub trait NeutralsOperator: Send + Sync + fmt::Debug {
    fn accumulate_rhs(&self, rhs: &mut LevelData, species: &KineticSpecies, time: f64) -> FusionResult<()>;

    fn compute_dt(&self, species: &KineticSpecies) -> f64;
}

pub trait FluidOperator: Send + Sync + fmt::Debug {
    /// Tendency of one fluid species; kinetic species are physical.
    fn accumulate_rhs(
        &self,
        rhs: &mut LevelData,
        fluid: &FluidSpecies,
        kinetic: &[KineticSpecies],
        fields: &FieldContext<'_>,
    ) -> FusionResult<()>;

    fn compute_dt(&self, fluid: &FluidSpecies, fields: &FieldContext<'_>) -> f64;
}

pub trait FieldOperator: Send + Sync + fmt::Debug {
    fn accumulate_rhs(
        &self,
        rhs: &mut LevelData,
        field: &ScalarField,
        kinetic: &[KineticSpecies],
        fields: &FieldContext<'_>,
    ) -> FusionResult<()>;

    fn compute_dt(&self, field: &ScalarField) -> f64;
}

/// Field held at its initial value.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrozenField;

impl FieldOperator for FrozenField {
    fn accumulate_rhs(
        &self,
        _rhs: &mut LevelData,
        _field: &ScalarField,
        _kinetic: &[KineticSpecies],
        _fields: &FieldContext<'_>,
    ) -> FusionResult<()> {
        Ok(())
    }

    fn compute_dt(&self, _field: &ScalarField) -> f64 {
        f64::INFINITY
    }
}

/// `rhs[c] -= scale * div[c] / (h0 h1)` on valid cells, turning an
/// integrated mapped divergence into a `J`-weighted tendency.
pub(crate) fn subtract_mapped_divergence(geom: &MultiblockGeometry, div: &LevelData, scale: f64, rhs: &mut LevelData) {
    use rayon::prelude::*;
    let layout = geom.layout();
    rhs.patches_mut().par_iter_mut().enumerate().for_each(|(k, r)| {
        let h = geom.block(layout.tile(k).block).h;
        let w = scale / (h[0] * h[1]);
        let (lo, hi) = layout.valid_range(k);
        let d = div.patch(k);
        for c in 0..r.dim().0 {
            for li in lo[0]..hi[0] {
                for lj in lo[1]..hi[1] {
                    r[[c, li, lj]] -= w * d[[c, li, lj]];
                }
            }
        }
    });
}
