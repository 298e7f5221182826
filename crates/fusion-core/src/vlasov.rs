// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Gyrokinetic Vlasov Operator
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Phase-space advection of `J f` in conservative mapped form.
//!
//! Configuration-space velocity (poloidal projection):
//!   ẋ = v∥ b + ρ* (E × b) / |B|
//! Parallel acceleration:
//!   v̇∥ = (q/m) b·E − (μ/m) b·∇|B|
//!
//! Face fluxes are centred averages of the adjacent cells, so the
//! operator is skew-symmetric and conserves particles up to boundary
//! fluxes.

use fusion_types::error::FusionResult;
use fusion_types::constants::ReferenceUnits;
use rayon::prelude::*;

use crate::bfield::{B_DIR, B_MAG, GRAD_B_MAG};
use crate::block_array::{ComponentKind, FluxData, LevelData};
use crate::operators::{subtract_mapped_divergence, FieldContext, VlasovOperator};
use crate::species::KineticSpecies;

/// In-plane `E × b / |B|` drift scaled by the normalised Larmor radius.
pub fn exb_drift(b_dir: [f64; 3], b_mag: f64, e: [f64; 2], larmor: f64) -> [f64; 2] {
    if b_mag <= 0.0 {
        return [0.0, 0.0];
    }
    let s = larmor / b_mag;
    [s * e[1] * b_dir[2], -s * e[0] * b_dir[2]]
}

#[derive(Debug, Clone)]
pub struct GyrokineticVlasov {
    larmor: f64,
}

impl GyrokineticVlasov {
    pub fn new(units: &ReferenceUnits) -> Self {
        Self::with_larmor(units.larmor_number())
    }

    pub fn with_larmor(larmor: f64) -> Self {
        GyrokineticVlasov { larmor }
    }

    pub fn larmor(&self) -> f64 {
        self.larmor
    }

    /// Mapped normal phase flux on every valid face.
    fn face_fluxes(&self, species: &KineticSpecies, fields: &FieldContext<'_>) -> FluxData {
        let phase = species.phase();
        let geom = fields.geom;
        let layout = geom.layout();
        let f = species.dfn();
        let nvel = phase.num_velocity_cells();
        let n_mu = phase.velocity().n_mu;
        let vpar: Vec<f64> = (0..nvel).map(|c| phase.vpar(c / n_mu)).collect();
        let nf = geom.n_face();
        let bf = geom.field_face();
        let larmor = self.larmor;

        let mut flux = FluxData::new(layout, nvel, ComponentKind::NormalFlux);
        flux.patches_mut().par_iter_mut().enumerate().for_each(|(k, faces)| {
            let (lo, hi) = layout.valid_range(k);
            let fk = f.patch(k);
            for (dir, a) in faces.iter_mut().enumerate() {
                let n = nf.face(k, dir);
                let b = bf.face(k, dir);
                let e = fields.e_face.face(k, dir);
                let ihi = if dir == 0 { hi[0] + 1 } else { hi[0] };
                let jhi = if dir == 1 { hi[1] + 1 } else { hi[1] };
                for li in lo[0]..ihi {
                    for lj in lo[1]..jhi {
                        let (pi, pj) = if dir == 0 { (li - 1, lj) } else { (li, lj - 1) };
                        let bd = [b[[B_DIR, li, lj]], b[[B_DIR + 1, li, lj]], b[[B_DIR + 2, li, lj]]];
                        let ve = exb_drift(bd, b[[B_MAG, li, lj]], [e[[0, li, lj]], e[[1, li, lj]]], larmor);
                        let mut nb = 0.0;
                        let mut ne = 0.0;
                        for r in 0..2 {
                            nb += n[[2 * r + dir, li, lj]] * bd[r];
                            ne += n[[2 * r + dir, li, lj]] * ve[r];
                        }
                        for (c, vp) in vpar.iter().enumerate() {
                            a[[c, li, lj]] = (vp * nb + ne) * 0.5 * (fk[[c, pi, pj]] + fk[[c, li, lj]]);
                        }
                    }
                }
            }
        });
        geom.average_at_block_boundaries(&mut flux);
        flux
    }

    /// `rhs -= J ∂(v̇∥ f)/∂v∥` with zero flux through the velocity ends.
    fn accumulate_parallel_acceleration(&self, rhs: &mut LevelData, species: &KineticSpecies, fields: &FieldContext<'_>) {
        let phase = species.phase();
        let geom = fields.geom;
        let layout = geom.layout();
        let vel = phase.velocity();
        let (n_vpar, n_mu) = (vel.n_vpar, vel.n_mu);
        if n_vpar < 2 {
            return;
        }
        let inv_dv = 1.0 / vel.dvpar();
        let (q, m) = (species.charge(), species.mass());
        let mu: Vec<f64> = (0..n_mu).map(|i| phase.mu(i)).collect();
        let f = species.dfn();
        let field = geom.field_cell();
        let jac = geom.j_cell();

        rhs.patches_mut().par_iter_mut().enumerate().for_each(|(k, r)| {
            let (lo, hi) = layout.valid_range(k);
            let fk = f.patch(k);
            let bk = field.patch(k);
            let ek = fields.e_cell.patch(k);
            let jk = jac.patch(k);
            for li in lo[0]..hi[0] {
                for lj in lo[1]..hi[1] {
                    let b_e = bk[[B_DIR, li, lj]] * ek[[0, li, lj]] + bk[[B_DIR + 1, li, lj]] * ek[[1, li, lj]];
                    let b_grad_b = bk[[B_DIR, li, lj]] * bk[[GRAD_B_MAG, li, lj]]
                        + bk[[B_DIR + 1, li, lj]] * bk[[GRAD_B_MAG + 1, li, lj]];
                    let w = jk[[0, li, lj]] * inv_dv;
                    for (imu, mu_v) in mu.iter().enumerate() {
                        let acc = (q * b_e - mu_v * b_grad_b) / m;
                        let mut lower = 0.0;
                        for iv in 0..n_vpar {
                            let c = iv * n_mu + imu;
                            let upper = if iv + 1 < n_vpar {
                                acc * 0.5 * (fk[[c, li, lj]] + fk[[c + n_mu, li, lj]])
                            } else {
                                0.0
                            };
                            r[[c, li, lj]] -= w * (upper - lower);
                            lower = upper;
                        }
                    }
                }
            }
        });
    }
}

impl VlasovOperator for GyrokineticVlasov {
    fn accumulate_rhs(
        &self,
        rhs: &mut LevelData,
        species: &KineticSpecies,
        fields: &FieldContext<'_>,
        radial_flux: Option<&mut FluxData>,
    ) -> FusionResult<()> {
        species.dfn().require_valid_ghosts()?;
        let geom = fields.geom;
        let flux = self.face_fluxes(species, fields);

        if let Some(out) = radial_flux {
            let layout = geom.layout();
            let w = species.charge() * species.phase().velocity_weight(species.mass());
            let bf = geom.field_face();
            out.patches_mut().par_iter_mut().enumerate().for_each(|(k, faces)| {
                let (lo, hi) = layout.valid_range(k);
                let src = flux.face(k, 0);
                let b = bf.face(k, 0);
                let a = &mut faces[0];
                for li in lo[0]..=hi[0] {
                    for lj in lo[1]..hi[1] {
                        let s: f64 = (0..src.dim().0).map(|c| src[[c, li, lj]]).sum();
                        a[[0, li, lj]] += w * b[[B_MAG, li, lj]] * s;
                    }
                }
            });
        }

        let mut div = LevelData::new(geom.layout(), flux.ncomp(), ComponentKind::Scalar);
        geom.compute_normal_flux_divergence(&flux, &mut div)?;
        subtract_mapped_divergence(geom, &div, 1.0, rhs);
        self.accumulate_parallel_acceleration(rhs, species, fields);
        Ok(())
    }

    fn compute_dt(&self, species: &KineticSpecies, fields: &FieldContext<'_>) -> f64 {
        let phase = species.phase();
        let geom = fields.geom;
        let layout = geom.layout();
        let vel = phase.velocity();
        let vmax = phase.vpar(0).abs().max(phase.vpar(vel.n_vpar - 1).abs());
        let mu_max = phase.mu(vel.n_mu - 1);
        let (q, m) = (species.charge(), species.mass());
        let inv_dv = 1.0 / vel.dvpar();
        let nj = geom.nj_inv_cell();
        let field = geom.field_cell();
        let larmor = self.larmor;

        let rate = (0..layout.num_patches())
            .into_par_iter()
            .map(|k| {
                let h = geom.block(layout.tile(k).block).h;
                let (lo, hi) = layout.valid_range(k);
                let m_k = nj.patch(k);
                let b = field.patch(k);
                let e = fields.e_cell.patch(k);
                let mut worst = 0.0f64;
                for li in lo[0]..hi[0] {
                    for lj in lo[1]..hi[1] {
                        let bd = [b[[B_DIR, li, lj]], b[[B_DIR + 1, li, lj]], b[[B_DIR + 2, li, lj]]];
                        let ev = [e[[0, li, lj]], e[[1, li, lj]]];
                        let ve = exb_drift(bd, b[[B_MAG, li, lj]], ev, larmor);
                        let mut r = 0.0;
                        for d in 0..2 {
                            let mut nb = 0.0;
                            let mut ne = 0.0;
                            for c in 0..2 {
                                nb += m_k[[2 * c + d, li, lj]] * bd[c];
                                ne += m_k[[2 * c + d, li, lj]] * ve[c];
                            }
                            r += (vmax * nb.abs() + ne.abs()) / h[d];
                        }
                        let b_e = bd[0] * ev[0] + bd[1] * ev[1];
                        let b_grad_b = bd[0] * b[[GRAD_B_MAG, li, lj]] + bd[1] * b[[GRAD_B_MAG + 1, li, lj]];
                        r += ((q * b_e).abs() + mu_max * b_grad_b.abs()) / m * inv_dv;
                        worst = worst.max(r);
                    }
                }
                worst
            })
            .reduce(|| 0.0, f64::max);
        if rate > 0.0 {
            1.0 / rate
        } else {
            f64::INFINITY
        }
    }
}
