//! Anomalous radial transport of kinetic species.
//!
//! Diffusion across flux surfaces with a constant diffusivity `D`:
//!   ∂(J f)/∂t = ∂/∂ξ₀ ( D J |∇ξ₀|² ∂f/∂ξ₀ )
//! Fluxes vanish on physical radial boundaries, so particles are
//! conserved. The operator is linear and is integrated implicitly in the
//! IMEX split.

use fusion_types::config::TransportConfig;
use fusion_types::error::{FusionError, FusionResult};
use fusion_types::state::{Side, RADIAL_DIR};
use rayon::prelude::*;

use crate::block_array::{ComponentKind, FluxData, LevelData};
use crate::operators::{subtract_mapped_divergence, TransportOperator};
use crate::species::KineticSpecies;

#[derive(Debug, Clone)]
pub struct AnomalousTransport {
    diffusivity: f64,
}

impl AnomalousTransport {
    pub fn new(diffusivity: f64) -> FusionResult<Self> {
        if diffusivity.is_nan() || diffusivity < 0.0 {
            return Err(FusionError::ConfigError(format!(
                "anomalous diffusivity must be non-negative, got {diffusivity}"
            )));
        }
        Ok(AnomalousTransport { diffusivity })
    }

    pub fn from_config(cfg: &TransportConfig) -> FusionResult<Self> {
        match cfg {
            TransportConfig::Anomalous { diffusivity } => Self::new(*diffusivity),
        }
    }

    pub fn diffusivity(&self) -> f64 {
        self.diffusivity
    }
}

impl TransportOperator for AnomalousTransport {
    fn accumulate_rhs(&self, rhs: &mut LevelData, species: &KineticSpecies, _time: f64) -> FusionResult<()> {
        if self.diffusivity == 0.0 {
            return Ok(());
        }
        let f = species.dfn();
        f.require_valid_ghosts()?;
        let geom = species.phase().geometry();
        let layout = geom.layout();
        let nf = geom.n_face();
        let njf = geom.nj_inv_face();
        let d = self.diffusivity;

        let mut flux = FluxData::new(layout, f.ncomp(), ComponentKind::NormalFlux);
        flux.patches_mut().par_iter_mut().enumerate().for_each(|(k, faces)| {
            let tile = layout.tile(k);
            let h0 = geom.block(tile.block).h[RADIAL_DIR];
            let info = layout.block(tile.block);
            let closed_lo = tile.is_block_lo(RADIAL_DIR) && info.is_physical(RADIAL_DIR, Side::Lo);
            let closed_hi = tile.is_block_hi(RADIAL_DIR) && info.is_physical(RADIAL_DIR, Side::Hi);
            let (lo, hi) = layout.valid_range(k);
            let fk = f.patch(k);
            let n = nf.face(k, RADIAL_DIR);
            let m = njf.face(k, RADIAL_DIR);
            let a = &mut faces[RADIAL_DIR];
            for li in lo[0]..=hi[0] {
                if (li == lo[0] && closed_lo) || (li == hi[0] && closed_hi) {
                    continue;
                }
                for lj in lo[1]..hi[1] {
                    let k00 = n[[0, li, lj]] * m[[0, li, lj]] + n[[2, li, lj]] * m[[2, li, lj]];
                    let w = d * k00 / h0;
                    for c in 0..a.dim().0 {
                        a[[c, li, lj]] = w * (fk[[c, li, lj]] - fk[[c, li - 1, lj]]);
                    }
                }
            }
        });
        geom.average_at_block_boundaries(&mut flux);

        let mut div = LevelData::new(layout, f.ncomp(), ComponentKind::Scalar);
        geom.compute_normal_flux_divergence(&flux, &mut div)?;
        subtract_mapped_divergence(geom, &div, -1.0, rhs);
        Ok(())
    }

    fn compute_dt(&self, species: &KineticSpecies) -> f64 {
        if self.diffusivity == 0.0 {
            return f64::INFINITY;
        }
        let geom = species.phase().geometry();
        let layout = geom.layout();
        let nj = geom.nj_inv_cell();
        let rate = (0..layout.num_patches())
            .into_par_iter()
            .map(|k| {
                let h0 = geom.block(layout.tile(k).block).h[RADIAL_DIR];
                let (lo, hi) = layout.valid_range(k);
                let m = nj.patch(k);
                let mut worst = 0.0f64;
                for li in lo[0]..hi[0] {
                    for lj in lo[1]..hi[1] {
                        let g = m[[0, li, lj]].powi(2) + m[[2, li, lj]].powi(2);
                        worst = worst.max(4.0 * g / (h0 * h0));
                    }
                }
                worst
            })
            .reduce(|| 0.0, f64::max);
        if rate > 0.0 {
            1.0 / (self.diffusivity * rate)
        } else {
            f64::INFINITY
        }
    }
}
