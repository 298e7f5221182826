// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Elliptic Field Solver
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Mapped-grid solver for `-∇·(D ∇φ) = ρ`.
//!
//! The operator is discretised in flux form: on a face normal to `d`,
//! the mapped flux is `Σ_c K[d][c] ∂φ/∂ξ_c` with `K = Nᵀ D N / J`, and
//! `L(φ)` is minus its mapped divergence over the cell volume. Boundary
//! data enters through ghost cells; the linear solve works on the
//! homogeneous operator with the boundary contribution moved to the
//! right-hand side.
//!
//! Coefficient models:
//! - `Poisson`: `D = I`.
//! - `GkPoisson`: `D = ρ_L² n_m / B² (I - b bᵀ) + λ_D² I`, with `n_m` the
//!   mass density and `b` the in-plane part of the field direction.

use std::sync::Arc;

use fusion_math::gmres::{gmres, GmresConfig, GmresResult};
use fusion_math::sor::{CsrMatrix, SorPreconditioner};
use fusion_math::vector::OdeVector;
use fusion_types::config::{BcValueType, FieldModel, FieldSolverConfig};
use fusion_types::constants::ReferenceUnits;
use fusion_types::error::{FusionError, FusionResult};
use fusion_types::state::{Side, SolverStats, RADIAL_DIR};
use log::{debug, info};
use ndarray::Array3;
use rayon::prelude::*;

use crate::bfield::{B_DIR, B_MAG};
use crate::block_array::{ComponentKind, FluxData, LevelData};
use crate::geometry::{MultiblockGeometry, RadialProfile};
use crate::mpi_domain::owner_of_cell;
use crate::potential_bc::PotentialBc;

#[derive(Debug, Clone)]
pub struct FieldSolver {
    model: FieldModel,
    config: FieldSolverConfig,
    larmor2: f64,
    debye2: f64,
    fourth_order: bool,
    /// `D[r][s]` at component `2r + s`.
    d_face: FluxData,
    /// `K[d][c]` at component `2d + c`.
    coefficients: FluxData,
    preconditioner: Option<SorPreconditioner>,
    row_offsets: Vec<usize>,
    stats: SolverStats,
}

// ───── Stencils ─────

/// Mapped normal derivative at face `li` (between cells `li-1`, `li`)
/// along axis `dir` of `u`.
fn normal_derivative(u: &Array3<f64>, dir: usize, li: usize, lj: usize, h: f64, fourth: bool) -> f64 {
    let at = |o: isize| -> f64 {
        if dir == 0 {
            u[[0, (li as isize + o) as usize, lj]]
        } else {
            u[[0, li, (lj as isize + o) as usize]]
        }
    };
    if fourth {
        (27.0 * (at(0) - at(-1)) - (at(1) - at(-2))) / (24.0 * h)
    } else {
        (at(0) - at(-1)) / h
    }
}

/// Cell-centred derivative along `dir` at cell `(li, lj)`.
fn cell_derivative(u: &Array3<f64>, comp: usize, dir: usize, li: usize, lj: usize, h: f64, fourth: bool) -> f64 {
    let at = |o: isize| -> f64 {
        if dir == 0 {
            u[[comp, (li as isize + o) as usize, lj]]
        } else {
            u[[comp, li, (lj as isize + o) as usize]]
        }
    };
    if fourth {
        (8.0 * (at(1) - at(-1)) - (at(2) - at(-2))) / (12.0 * h)
    } else {
        (at(1) - at(-1)) / (2.0 * h)
    }
}

/// Cell-to-face interpolation along `dir` of a per-cell function `c`.
fn cell_to_face<F: Fn(usize, usize) -> f64>(c: F, dir: usize, li: usize, lj: usize, fourth: bool) -> f64 {
    let at = |o: isize| -> f64 {
        if dir == 0 {
            c((li as isize + o) as usize, lj)
        } else {
            c(li, (lj as isize + o) as usize)
        }
    };
    if fourth {
        (-at(-2) + 7.0 * at(-1) + 7.0 * at(0) - at(1)) / 12.0
    } else {
        0.5 * (at(-1) + at(0))
    }
}

impl FieldSolver {
    pub fn new(
        geom: &MultiblockGeometry,
        config: &FieldSolverConfig,
        units: &ReferenceUnits,
    ) -> FusionResult<Self> {
        if config.tol <= 0.0 || config.max_iter == 0 {
            return Err(FusionError::ConfigError(format!(
                "field solver needs tol > 0 and max_iter > 0, got ({}, {})",
                config.tol, config.max_iter
            )));
        }
        let layout = geom.layout();
        let mut row_offsets = Vec::with_capacity(layout.num_patches());
        let mut n = 0;
        for t in layout.patches() {
            row_offsets.push(n);
            n += t.cells.num_cells();
        }
        let mut solver = FieldSolver {
            model: config.model,
            config: config.clone(),
            larmor2: units.larmor_number().powi(2),
            debye2: units.debye_number().powi(2),
            fourth_order: !geom.second_order(),
            d_face: FluxData::new(layout, 4, ComponentKind::Scalar),
            coefficients: FluxData::new(layout, 4, ComponentKind::Scalar),
            preconditioner: None,
            row_offsets,
            stats: SolverStats::default(),
        };
        let mut unit = LevelData::new(layout, 1, ComponentKind::Scalar);
        unit.set_val(1.0);
        solver.compute_coefficients(geom, &unit)?;
        Ok(solver)
    }

    pub fn model(&self) -> FieldModel {
        self.model
    }

    pub fn second_order(&self) -> bool {
        !self.fourth_order
    }

    pub fn num_potential_ghosts(&self) -> usize {
        crate::potential_bc::NUM_POTENTIAL_GHOSTS
    }

    pub fn stats(&self) -> &SolverStats {
        &self.stats
    }

    pub fn coefficients(&self) -> &FluxData {
        &self.coefficients
    }

    pub fn set_convergence_params(&mut self, tol: f64, max_iter: usize) {
        self.config.tol = tol;
        self.config.max_iter = max_iter.max(1);
    }

    // ───── Coefficients ─────

    fn compute_coefficients(&mut self, geom: &MultiblockGeometry, mass_density: &LevelData) -> FusionResult<()> {
        mass_density.require_valid_ghosts()?;
        let fourth = self.fourth_order;
        let (model, larmor2, debye2) = (self.model, self.larmor2, self.debye2);
        let field = geom.field_face();
        self.d_face.patches_mut().par_iter_mut().enumerate().for_each(|(k, faces)| {
            let rho = mass_density.patch(k);
            for (dir, out) in faces.iter_mut().enumerate() {
                let fb = field.face(k, dir);
                let (_, a0, a1) = out.dim();
                let (n0, n1) = (rho.dim().1, rho.dim().2);
                for li in 0..a0 {
                    for lj in 0..a1 {
                        let d = match model {
                            FieldModel::Poisson => [1.0, 0.0, 0.0, 1.0],
                            FieldModel::GkPoisson => {
                                // Faces whose stencil leaves the array use the nearest cell.
                                let lo_ok = if dir == 0 { li >= 2 && li + 1 < n0 } else { lj >= 2 && lj + 1 < n1 };
                                let m = if lo_ok {
                                    cell_to_face(|a, b| rho[[0, a, b]], dir, li, lj, fourth)
                                } else {
                                    let (ci, cj) = if dir == 0 { (li.min(n0 - 1), lj) } else { (li, lj.min(n1 - 1)) };
                                    rho[[0, ci, cj]]
                                };
                                let bmag = fb[[B_MAG, li, lj]];
                                let (b0, b1) = (fb[[B_DIR, li, lj]], fb[[B_DIR + 1, li, lj]]);
                                let p = if bmag > 0.0 { larmor2 * m / (bmag * bmag) } else { 0.0 };
                                [
                                    p * (1.0 - b0 * b0) + debye2,
                                    -p * b0 * b1,
                                    -p * b1 * b0,
                                    p * (1.0 - b1 * b1) + debye2,
                                ]
                            }
                        };
                        for (c, v) in d.iter().enumerate() {
                            out[[c, li, lj]] = *v;
                        }
                    }
                }
            }
        });

        let n_face = geom.n_face();
        let nj = geom.nj_inv_face();
        let d_face = &self.d_face;
        let smooth = fourth && self.config.fourth_order_coefficients;
        self.coefficients.patches_mut().par_iter_mut().enumerate().for_each(|(k, faces)| {
            for (dir, out) in faces.iter_mut().enumerate() {
                let n = n_face.face(k, dir);
                let q = nj.face(k, dir);
                let dm = d_face.face(k, dir);
                let (_, a0, a1) = out.dim();
                for li in 0..a0 {
                    for lj in 0..a1 {
                        for p in 0..2 {
                            for c in 0..2 {
                                let mut s = 0.0;
                                for r in 0..2 {
                                    for t in 0..2 {
                                        s += n[[2 * r + p, li, lj]] * dm[[2 * r + t, li, lj]] * q[[2 * t + c, li, lj]];
                                    }
                                }
                                out[[2 * p + c, li, lj]] = s;
                            }
                        }
                    }
                }
                if smooth {
                    // Point values to face averages: c + Δ²c / 24 transversely.
                    let pointwise = out.clone();
                    for c in 0..4 {
                        for li in 0..a0 {
                            for lj in 0..a1 {
                                let (inside, lo, hi) = if dir == 0 {
                                    (lj >= 1 && lj + 1 < a1, [li, lj.wrapping_sub(1)], [li, lj + 1])
                                } else {
                                    (li >= 1 && li + 1 < a0, [li.wrapping_sub(1), lj], [li + 1, lj])
                                };
                                if inside {
                                    let mid = pointwise[[c, li, lj]];
                                    out[[c, li, lj]] = mid
                                        + (pointwise[[c, hi[0], hi[1]]] - 2.0 * mid + pointwise[[c, lo[0], lo[1]]]) / 24.0;
                                }
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Recompute `D` and `K` from the mass density (physical, ghosts
    /// filled by the caller or extrapolated here) and rebuild the
    /// preconditioner.
    pub fn set_operator_coefficients(
        &mut self,
        geom: &MultiblockGeometry,
        mass_density: &LevelData,
        bc: &PotentialBc,
    ) -> FusionResult<()> {
        let mut rho = mass_density.clone();
        rho.fill_internal_ghosts();
        rho.extrapolate_physical_ghosts();
        self.compute_coefficients(geom, &rho)?;
        self.build_preconditioner(geom, bc, None)?;
        Ok(())
    }

    /// As [`Self::set_operator_coefficients`], also returning the
    /// flux-surface averaged radial polarization response per radial face.
    pub fn set_operator_coefficients_consistent(
        &mut self,
        geom: &MultiblockGeometry,
        mass_density: &LevelData,
        bc: &PotentialBc,
    ) -> FusionResult<RadialProfile> {
        self.set_operator_coefficients(geom, mass_density, bc)?;
        self.polarization_fs_average(geom)
    }

    /// `⟨n̂ᵀ D n̂⟩` over core flux surfaces, area weighted.
    pub fn polarization_fs_average(&self, geom: &MultiblockGeometry) -> FusionResult<RadialProfile> {
        let layout = geom.layout();
        let mut weighted = FluxData::new(layout, 1, ComponentKind::NormalFlux);
        for k in 0..layout.num_patches() {
            let n = geom.n_face().face(k, RADIAL_DIR);
            let d = self.d_face.face(k, RADIAL_DIR);
            let out = weighted.face_mut(k, RADIAL_DIR);
            let (_, a0, a1) = out.dim();
            for li in 0..a0 {
                for lj in 0..a1 {
                    let (x, y) = (n[[0, li, lj]], n[[2, li, lj]]);
                    let mag = (x * x + y * y).sqrt();
                    if mag == 0.0 {
                        continue;
                    }
                    let e = [x / mag, y / mag];
                    let mut drr = 0.0;
                    for r in 0..2 {
                        for s in 0..2 {
                            drr += e[r] * d[[2 * r + s, li, lj]] * e[s];
                        }
                    }
                    out[[0, li, lj]] = drr * mag;
                }
            }
        }
        geom.compute_radial_fs_average(&weighted, 0)
    }

    // ───── Preconditioner ─────

    fn row_of(&self, geom: &MultiblockGeometry, block: usize, i: i64, j: i64) -> Option<usize> {
        let layout = geom.layout();
        let (b2, q, _) = layout.resolve(block, [2 * i + 1, 2 * j + 1])?;
        let (i2, j2) = ((q[0] - 1).div_euclid(2), (q[1] - 1).div_euclid(2));
        let k = owner_of_cell(layout.patches(), b2, i2, j2)?;
        let c = &layout.tile(k).cells;
        Some(self.row_offsets[k] + ((i2 - c.lo[0]) as usize) * c.size(1) + (j2 - c.lo[1]) as usize)
    }

    /// Five-point matrix from the diagonal coefficients `K[d][d]`, plus an
    /// optional cell shift.
    fn build_preconditioner(
        &mut self,
        geom: &MultiblockGeometry,
        bc: &PotentialBc,
        shift: Option<&LevelData>,
    ) -> FusionResult<()> {
        let layout = Arc::clone(geom.layout());
        let n: usize = layout.patches().iter().map(|t| t.cells.num_cells()).sum();
        let mut triplets = Vec::with_capacity(5 * n);
        for k in 0..layout.num_patches() {
            let tile = layout.tile(k).clone();
            let cs = geom.block(tile.block);
            let vol = geom.cell_volume().patch(k);
            for (i, j) in tile.cells.cells() {
                let [li, lj] = layout.local_index(k, i, j);
                let row = self.row_offsets[k]
                    + ((i - tile.cells.lo[0]) as usize) * tile.cells.size(1)
                    + (j - tile.cells.lo[1]) as usize;
                let v = vol[[0, li, lj]];
                let mut diag = shift.map(|s| s.patch(k)[[0, li, lj]]).unwrap_or(0.0);
                for dir in 0..2 {
                    let t = 1 - dir;
                    let kf = self.coefficients.face(k, dir);
                    for side in Side::BOTH {
                        let (fi, fj) = if dir == 0 {
                            (li + usize::from(side == Side::Hi), lj)
                        } else {
                            (li, lj + usize::from(side == Side::Hi))
                        };
                        let a = kf[[3 * dir, fi, fj]] * cs.h[t] / (cs.h[dir] * v);
                        let mut nb = [i, j];
                        nb[dir] += side.sign();
                        match self.row_of(geom, tile.block, nb[0], nb[1]) {
                            Some(col) => {
                                diag += a;
                                triplets.push((row, col, -a));
                            }
                            None => {
                                let vt = bc.spec(tile.block, dir, side)?.value_type();
                                if vt == BcValueType::Value {
                                    diag += 2.0 * a;
                                }
                            }
                        }
                    }
                }
                if diag <= 0.0 {
                    diag = 1.0 / v.max(1e-300);
                }
                triplets.push((row, row, diag));
            }
        }
        let matrix = CsrMatrix::from_triplets(n, &triplets)?;
        self.preconditioner = Some(SorPreconditioner::new(
            matrix,
            self.config.precond_sweeps,
            self.config.precond_omega,
        )?);
        Ok(())
    }

    fn to_rows(&self, geom: &MultiblockGeometry, u: &LevelData) -> Vec<f64> {
        let layout = geom.layout();
        let mut out = Vec::with_capacity(u.num_valid_cells());
        for k in 0..layout.num_patches() {
            out.extend(u.valid_view(k).index_axis(ndarray::Axis(0), 0).iter().copied());
        }
        out
    }

    fn from_rows(&self, geom: &MultiblockGeometry, rows: &[f64], u: &mut LevelData) {
        let layout = Arc::clone(geom.layout());
        for k in 0..layout.num_patches() {
            let (lo, hi) = layout.valid_range(k);
            let a = u.patch_mut(k);
            let mut r = self.row_offsets[k];
            for li in lo[0]..hi[0] {
                for lj in lo[1]..hi[1] {
                    a[[0, li, lj]] = rows[r];
                    r += 1;
                }
            }
        }
    }

    /// Approximate `A⁻¹ r` by SOR sweeps on the assembled matrix.
    pub fn pre_cond(&self, geom: &MultiblockGeometry, r: &LevelData, z: &mut LevelData) -> FusionResult<()> {
        let pc = self.preconditioner.as_ref().ok_or_else(|| {
            FusionError::ConfigError("preconditioner used before set_operator_coefficients".to_string())
        })?;
        let rr = self.to_rows(geom, r);
        let mut zz = vec![0.0; rr.len()];
        pc.apply(&rr, &mut zz);
        self.from_rows(geom, &zz, z);
        Ok(())
    }

    // ───── Operator application ─────

    /// Mapped gradient `∂φ/∂ξ` on valid faces (2 components). Ghosts of
    /// `phi` must be filled.
    pub fn compute_mapped_face_gradient(
        &self,
        geom: &MultiblockGeometry,
        phi: &LevelData,
        grad: &mut FluxData,
    ) -> FusionResult<()> {
        phi.require_valid_ghosts()?;
        let layout = Arc::clone(geom.layout());
        let fourth = self.fourth_order;
        grad.patches_mut().par_iter_mut().enumerate().for_each(|(k, faces)| {
            let u = phi.patch(k);
            let h = geom.block(layout.tile(k).block).h;
            let (lo, hi) = layout.valid_range(k);
            for (dir, out) in faces.iter_mut().enumerate() {
                let t = 1 - dir;
                let (mut ilo, mut ihi) = (lo, hi);
                ihi[dir] += 1;
                ilo[dir] = lo[dir];
                for li in ilo[0]..ihi[0] {
                    for lj in ilo[1]..ihi[1] {
                        out[[dir, li, lj]] = normal_derivative(u, dir, li, lj, h[dir], fourth);
                        out[[t, li, lj]] = cell_to_face(
                            |a, b| cell_derivative(u, 0, t, a, b, h[t], fourth),
                            dir,
                            li,
                            lj,
                            fourth,
                        );
                    }
                }
            }
        });
        Ok(())
    }

    /// `L(φ) = -(1/V) Σ faces (K ∂φ/∂ξ) h_t (+ shift φ)` on valid cells,
    /// using whatever ghost values `phi` carries.
    fn apply_raw(
        &self,
        geom: &MultiblockGeometry,
        phi: &LevelData,
        shift: Option<&LevelData>,
        out: &mut LevelData,
    ) -> FusionResult<()> {
        let layout = geom.layout();
        let mut grad = FluxData::new(layout, 2, ComponentKind::MappedVector);
        self.compute_mapped_face_gradient(geom, phi, &mut grad)?;
        let mut flux = FluxData::new(layout, 1, ComponentKind::NormalFlux);
        let coef = &self.coefficients;
        flux.patches_mut().par_iter_mut().enumerate().for_each(|(k, faces)| {
            for (dir, f) in faces.iter_mut().enumerate() {
                let g = grad.face(k, dir);
                let kk = coef.face(k, dir);
                let (_, a0, a1) = f.dim();
                for li in 0..a0 {
                    for lj in 0..a1 {
                        f[[0, li, lj]] = kk[[2 * dir, li, lj]] * g[[0, li, lj]] + kk[[2 * dir + 1, li, lj]] * g[[1, li, lj]];
                    }
                }
            }
        });
        flux.average_at_block_boundaries();
        geom.compute_normal_flux_divergence(&flux, out)?;
        geom.divide_cell_volume(out);
        out.scale(-1.0);
        if let Some(s) = shift {
            let layout = Arc::clone(layout);
            out.patches_mut().par_iter_mut().enumerate().for_each(|(k, a)| {
                let (lo, hi) = layout.valid_range(k);
                let sv = s.patch(k);
                let u = phi.patch(k);
                for li in lo[0]..hi[0] {
                    for lj in lo[1]..hi[1] {
                        a[[0, li, lj]] += sv[[0, li, lj]] * u[[0, li, lj]];
                    }
                }
            });
        }
        Ok(())
    }

    /// Homogeneous operator: boundary data set to zero.
    pub fn apply_op(
        &self,
        geom: &MultiblockGeometry,
        bc: &PotentialBc,
        x: &LevelData,
        out: &mut LevelData,
    ) -> FusionResult<()> {
        let mut tmp = x.clone();
        bc.fill_ghosts(geom, &mut tmp, true)?;
        self.apply_raw(geom, &tmp, None, out)
    }

    /// Boundary contribution `L(0)` with the actual boundary data.
    pub fn compute_bc_divergence(
        &self,
        geom: &MultiblockGeometry,
        bc: &PotentialBc,
        out: &mut LevelData,
    ) -> FusionResult<()> {
        let mut zero = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
        bc.fill_ghosts(geom, &mut zero, false)?;
        self.apply_raw(geom, &zero, None, out)
    }

    /// `rhs - L(φ)` with the actual boundary data.
    pub fn residual(
        &self,
        geom: &MultiblockGeometry,
        bc: &PotentialBc,
        phi: &LevelData,
        rhs: &LevelData,
        out: &mut LevelData,
    ) -> FusionResult<()> {
        let mut tmp = phi.clone();
        bc.fill_ghosts(geom, &mut tmp, false)?;
        self.apply_raw(geom, &tmp, None, out)?;
        out.scale(-1.0);
        out.axpy(1.0, rhs);
        Ok(())
    }

    fn gmres_config(&self) -> GmresConfig {
        GmresConfig {
            restart: self.config.restart,
            max_iter: self.config.max_iter,
            tol: self.config.tol,
            atol: 0.0,
        }
    }

    fn solve_linear(
        &mut self,
        geom: &MultiblockGeometry,
        bc: &PotentialBc,
        shift: Option<&LevelData>,
        b: &LevelData,
        x: &mut LevelData,
    ) -> FusionResult<GmresResult> {
        let cfg = self.gmres_config();
        let result = {
            let this = &*self;
            let apply = |v: &LevelData, out: &mut LevelData| -> FusionResult<()> {
                let mut tmp = v.clone();
                bc.fill_ghosts(geom, &mut tmp, true)?;
                this.apply_raw(geom, &tmp, shift, out)
            };
            let precond = |r: &LevelData, z: &mut LevelData| this.pre_cond(geom, r, z);
            gmres(apply, precond, b, x, &cfg)?
        };
        self.stats.solves += 1;
        self.stats.linear_iterations += result.iterations;
        if !result.converged {
            return Err(FusionError::SolverDiverged {
                iteration: result.iterations,
                message: format!(
                    "field solve did not converge: residual {:.3e} after {} iterations",
                    result.residual, result.iterations
                ),
            });
        }
        if self.config.verbose {
            info!(
                "field solve converged in {} iterations, residual {:.3e}",
                result.iterations, result.residual
            );
        } else {
            debug!("field solve: {} iterations", result.iterations);
        }
        Ok(result)
    }

    /// Solve `L(φ) = rhs` with the boundary data of `bc`; `phi` holds the
    /// initial guess and receives the solution with ghosts filled.
    pub fn compute_potential(
        &mut self,
        geom: &MultiblockGeometry,
        bc: &PotentialBc,
        phi: &mut LevelData,
        rhs: &LevelData,
    ) -> FusionResult<GmresResult> {
        if self.preconditioner.is_none() {
            self.build_preconditioner(geom, bc, None)?;
        }
        let mut b = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
        self.compute_bc_divergence(geom, bc, &mut b)?;
        b.scale(-1.0);
        b.axpy(1.0, rhs);
        let result = self.solve_linear(geom, bc, None, &b, phi)?;
        bc.fill_ghosts(geom, phi, false)?;
        Ok(result)
    }

    // ───── Boltzmann electrons ─────

    /// Flux-surface average broadcast back to cells; cells outside the
    /// core keep their own value.
    pub fn flux_surface_broadcast(geom: &MultiblockGeometry, data: &LevelData) -> FusionResult<LevelData> {
        let profile = geom.compute_radial_cell_average(data, 0)?;
        let layout = Arc::clone(geom.layout());
        let mut out = data.clone();
        for k in 0..layout.num_patches() {
            let tile = layout.tile(k).clone();
            if geom.block(tile.block).role != crate::coord_sys::BlockRole::Core {
                continue;
            }
            let a = out.patch_mut(k);
            for (i, j) in tile.cells.cells() {
                let [li, lj] = layout.local_index(k, i, j);
                a[[0, li, lj]] = profile[i as usize];
            }
        }
        Ok(out)
    }

    /// Solve `L(φ) = Z n_i - n_e(φ)` with `n_e = n_0 exp(φ / T_e)` and
    /// `n_0` the flux-surface average of `Z n_i`, by Newton iteration on
    /// `(L + n_e / T_e) δ = -R`. `ne` receives the electron density.
    pub fn compute_potential_and_electron_density(
        &mut self,
        geom: &MultiblockGeometry,
        bc: &PotentialBc,
        phi: &mut LevelData,
        ion_charge_density: &LevelData,
        te: f64,
        ne: &mut LevelData,
    ) -> FusionResult<()> {
        if te <= 0.0 {
            return Err(FusionError::PhysicsViolation(format!(
                "electron temperature must be positive, got {te}"
            )));
        }
        let layout = Arc::clone(geom.layout());
        let n0 = Self::flux_surface_broadcast(geom, ion_charge_density)?;
        let scale = ion_charge_density.norm().max(1e-300);
        let mut residual = LevelData::new(&layout, 1, ComponentKind::Scalar);
        let mut shift = LevelData::new(&layout, 1, ComponentKind::Scalar);
        let mut delta = LevelData::new(&layout, 1, ComponentKind::Scalar);

        let update_ne = |phi: &LevelData, ne: &mut LevelData| {
            for k in 0..layout.num_patches() {
                let (lo, hi) = layout.valid_range(k);
                let p = phi.patch(k);
                let base = n0.patch(k);
                let a = ne.patch_mut(k);
                for li in lo[0]..hi[0] {
                    for lj in lo[1]..hi[1] {
                        a[[0, li, lj]] = base[[0, li, lj]] * (p[[0, li, lj]] / te).exp();
                    }
                }
            }
        };

        for it in 0..self.config.boltzmann_max_iter.max(1) {
            update_ne(phi, ne);
            // R = L(φ) - Z n_i + n_e
            let mut tmp = phi.clone();
            bc.fill_ghosts(geom, &mut tmp, false)?;
            self.apply_raw(geom, &tmp, None, &mut residual)?;
            residual.axpy(-1.0, ion_charge_density);
            residual.axpy(1.0, ne);
            let rnorm = residual.norm();
            debug!("Boltzmann iteration {it}: |R| = {rnorm:.3e}");
            if rnorm <= self.config.boltzmann_tol * scale {
                self.stats.nonlinear_iterations += it;
                bc.fill_ghosts(geom, phi, false)?;
                self.build_preconditioner(geom, bc, None)?;
                return Ok(());
            }
            shift.copy_from(ne);
            shift.scale(1.0 / te);
            self.build_preconditioner(geom, bc, Some(&shift))?;
            residual.scale(-1.0);
            delta.set_zero();
            self.solve_linear(geom, bc, Some(&shift), &residual, &mut delta)?;
            phi.axpy(1.0, &delta);
        }
        Err(FusionError::SolverDiverged {
            iteration: self.config.boltzmann_max_iter,
            message: "Boltzmann electron iteration did not converge".to_string(),
        })
    }

    /// Poloidally varying potential `T_e ln(Z n_i / ⟨Z n_i⟩)`.
    pub fn get_phi_tilde(
        geom: &MultiblockGeometry,
        ion_charge_density: &LevelData,
        te: f64,
    ) -> FusionResult<LevelData> {
        let avg = Self::flux_surface_broadcast(geom, ion_charge_density)?;
        let layout = Arc::clone(geom.layout());
        let mut out = LevelData::new(&layout, 1, ComponentKind::Scalar);
        for k in 0..layout.num_patches() {
            let (lo, hi) = layout.valid_range(k);
            let n = ion_charge_density.patch(k);
            let m = avg.patch(k);
            let a = out.patch_mut(k);
            for li in lo[0]..hi[0] {
                for lj in lo[1]..hi[1] {
                    let (x, y) = (n[[0, li, lj]], m[[0, li, lj]]);
                    if x <= 0.0 || y <= 0.0 {
                        return Err(FusionError::PhysicsViolation(format!(
                            "non-positive charge density {x} in patch {k}"
                        )));
                    }
                    a[[0, li, lj]] = te * (x / y).ln();
                }
            }
        }
        out.fill_internal_ghosts();
        out.extrapolate_physical_ghosts();
        Ok(out)
    }

    // ───── Electric field ─────

    /// `-∂φ/∂ξ` on cells (2 components, ghosts exchanged) and valid faces.
    pub fn compute_mapped_field(
        &self,
        geom: &MultiblockGeometry,
        phi: &LevelData,
        cell: &mut LevelData,
        face: &mut FluxData,
    ) -> FusionResult<()> {
        phi.require_valid_ghosts()?;
        self.compute_mapped_face_gradient(geom, phi, face)?;
        face.scale(-1.0);
        let layout = Arc::clone(geom.layout());
        let fourth = self.fourth_order;
        cell.patches_mut().par_iter_mut().enumerate().for_each(|(k, out)| {
            let u = phi.patch(k);
            let h = geom.block(layout.tile(k).block).h;
            let (lo, hi) = layout.valid_range(k);
            for li in lo[0]..hi[0] {
                for lj in lo[1]..hi[1] {
                    for d in 0..2 {
                        out[[d, li, lj]] = -cell_derivative(u, 0, d, li, lj, h[d], fourth);
                    }
                }
            }
        });
        cell.fill_internal_ghosts();
        cell.extrapolate_physical_ghosts();
        Ok(())
    }

    /// Physical field `E = -∇φ` on cells and faces.
    pub fn compute_field(
        &self,
        geom: &MultiblockGeometry,
        phi: &LevelData,
        cell: &mut LevelData,
        face: &mut FluxData,
    ) -> FusionResult<()> {
        let layout = geom.layout();
        let mut mcell = LevelData::new(layout, 2, ComponentKind::MappedVector);
        let mut mface = FluxData::new(layout, 2, ComponentKind::MappedVector);
        self.compute_mapped_field(geom, phi, &mut mcell, &mut mface)?;
        geom.unmap_gradient(&mcell, cell)?;
        geom.unmap_face_gradient(&mface, face);
        Ok(())
    }

    /// Physical normal component `n̂_d · E` on faces normal to `d`.
    pub fn extract_normal_component(&self, geom: &MultiblockGeometry, face: &FluxData, out: &mut FluxData) {
        let n_face = geom.n_face();
        out.patches_mut().par_iter_mut().enumerate().for_each(|(k, faces)| {
            for (dir, o) in faces.iter_mut().enumerate() {
                let n = n_face.face(k, dir);
                let e = face.face(k, dir);
                let (_, a0, a1) = o.dim();
                for li in 0..a0 {
                    for lj in 0..a1 {
                        let (x, y) = (n[[dir, li, lj]], n[[2 + dir, li, lj]]);
                        let m = (x * x + y * y).sqrt();
                        o[[0, li, lj]] = if m > 0.0 {
                            (x * e[[0, li, lj]] + y * e[[1, li, lj]]) / m
                        } else {
                            0.0
                        };
                    }
                }
            }
        });
    }

    /// Physical divergence of face-normal fluxes.
    pub fn compute_flux_divergence(
        &self,
        geom: &MultiblockGeometry,
        normal: &FluxData,
        out: &mut LevelData,
    ) -> FusionResult<()> {
        geom.compute_normal_flux_divergence(normal, out)?;
        geom.divide_cell_volume(out);
        Ok(())
    }

    pub fn compute_radial_fs_average(
        &self,
        geom: &MultiblockGeometry,
        normal: &FluxData,
        comp: usize,
    ) -> FusionResult<RadialProfile> {
        geom.compute_radial_fs_average(normal, comp)
    }

    pub fn fill_internal_ghosts(&self, phi: &mut LevelData) {
        phi.fill_internal_ghosts();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_types::config::{
        BcSpecConfig, DiscretizationConfig, GeometryConfig, MillerConfig, PotentialBcConfig, SlabConfig,
    };

    fn slab(second_order: bool, dec: [usize; 2]) -> MultiblockGeometry {
        MultiblockGeometry::new(&GeometryConfig::Slab(SlabConfig {
            cells: [16, 8],
            xmax: 1.0,
            ymax: 1.0,
            bz_inner: 3.0,
            bz_outer: 3.0,
            by_inner: 0.0,
            periodic_poloidal: true,
            discretization: DiscretizationConfig {
                decomposition: dec,
                second_order,
                ..DiscretizationConfig::default()
            },
        }))
        .expect("slab")
    }

    fn dirichlet(geom: &MultiblockGeometry, lo: f64, hi: f64) -> PotentialBc {
        PotentialBc::from_config(
            &[
                PotentialBcConfig {
                    boundary: "radial_inner".to_string(),
                    spec: BcSpecConfig::Dirichlet { value: lo },
                },
                PotentialBcConfig {
                    boundary: "radial_outer".to_string(),
                    spec: BcSpecConfig::Dirichlet { value: hi },
                },
            ],
            geom,
        )
        .expect("bc")
    }

    fn poisson_config() -> FieldSolverConfig {
        FieldSolverConfig {
            model: FieldModel::Poisson,
            tol: 1e-12,
            max_iter: 50,
            ..FieldSolverConfig::default()
        }
    }

    #[test]
    fn test_zero_source_zero_bc_gives_zero() {
        let g = slab(false, [2, 2]);
        let bc = dirichlet(&g, 0.0, 0.0);
        let mut fs = FieldSolver::new(&g, &poisson_config(), &ReferenceUnits::default()).expect("solver");
        let rho = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        let mut phi = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        fs.compute_potential(&g, &bc, &mut phi, &rho).expect("solve");
        assert!(phi.max_abs() < 1e-14);
    }

    #[test]
    fn test_linear_potential_from_boundary_values() {
        let g = slab(false, [2, 1]);
        let bc = dirichlet(&g, 0.0, 2.0);
        let mut fs = FieldSolver::new(&g, &poisson_config(), &ReferenceUnits::default()).expect("solver");
        let rho = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        let mut phi = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        fs.compute_potential(&g, &bc, &mut phi, &rho).expect("solve");
        for (i, j) in g.block(0).domain.cells() {
            let x = (i as f64 + 0.5) / 16.0;
            assert!((phi.get(0, i, j, 0).expect("get") - 2.0 * x).abs() < 1e-9);
        }
        // E = -dφ/dx = -2 everywhere.
        let mut ec = LevelData::new(g.layout(), 2, ComponentKind::Scalar);
        let mut ef = FluxData::new(g.layout(), 2, ComponentKind::Scalar);
        fs.compute_field(&g, &phi, &mut ec, &mut ef).expect("field");
        let (lo, _) = g.layout().valid_range(0);
        assert!((ec.patch(0)[[0, lo[0] + 3, lo[1]]] + 2.0).abs() < 1e-8);
        assert!(ec.patch(0)[[1, lo[0] + 3, lo[1]]].abs() < 1e-8);
        assert!(fs.stats().solves >= 1);
    }

    #[test]
    fn test_manufactured_solution_fourth_order() {
        // φ = sin(πx) cos(2πy): -∇²φ = 5π² φ.
        let errors: Vec<f64> = [8usize, 16]
            .iter()
            .map(|&n| {
                let g = MultiblockGeometry::new(&GeometryConfig::Slab(SlabConfig {
                    cells: [n, n],
                    xmax: 1.0,
                    ymax: 1.0,
                    bz_inner: 3.0,
                    bz_outer: 3.0,
                    by_inner: 0.0,
                    periodic_poloidal: true,
                    discretization: DiscretizationConfig::default(),
                }))
                .expect("slab");
                let bc = dirichlet(&g, 0.0, 0.0);
                let mut fs = FieldSolver::new(&g, &poisson_config(), &ReferenceUnits::default()).expect("solver");
                let pi = std::f64::consts::PI;
                let exact = |x: f64, y: f64| (pi * x).sin() * (2.0 * pi * y).cos();
                let mut rhs = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
                for (i, j) in g.block(0).domain.cells() {
                    let (x, y) = ((i as f64 + 0.5) / n as f64, (j as f64 + 0.5) / n as f64);
                    rhs.set(0, i, j, 0, 5.0 * pi * pi * exact(x, y)).expect("set");
                }
                let mut phi = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
                fs.compute_potential(&g, &bc, &mut phi, &rhs).expect("solve");
                let mut err = 0.0f64;
                for (i, j) in g.block(0).domain.cells() {
                    let (x, y) = ((i as f64 + 0.5) / n as f64, (j as f64 + 0.5) / n as f64);
                    err = err.max((phi.get(0, i, j, 0).expect("get") - exact(x, y)).abs());
                }
                err
            })
            .collect();
        // Point values vs. cell averages limit the observed rate.
        assert!(errors[1] < errors[0] / 2.5, "errors {errors:?}");
        assert!(errors[1] < 0.05, "errors {errors:?}");
    }

    #[test]
    fn test_non_convergence_is_fatal() {
        let g = slab(false, [1, 1]);
        let bc = dirichlet(&g, 0.0, 1.0);
        let cfg = FieldSolverConfig {
            restart: 2,
            max_iter: 1,
            precond_sweeps: 1,
            ..poisson_config()
        };
        let mut fs = FieldSolver::new(&g, &cfg, &ReferenceUnits::default()).expect("solver");
        let mut rhs = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        rhs.set(0, 3, 3, 0, 100.0).expect("set");
        let mut phi = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        let err = fs.compute_potential(&g, &bc, &mut phi, &rhs).expect_err("must fail");
        assert!(matches!(err, FusionError::SolverDiverged { .. }));
    }

    #[test]
    fn test_boltzmann_uniform_density_gives_zero_potential() {
        let g = slab(true, [1, 1]);
        let bc = dirichlet(&g, 0.0, 0.0);
        let cfg = FieldSolverConfig {
            boltzmann_tol: 1e-10,
            ..poisson_config()
        };
        let mut fs = FieldSolver::new(&g, &cfg, &ReferenceUnits::default()).expect("solver");
        let mut ni = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        ni.set_val(1.0);
        fs.set_operator_coefficients(&g, &ni, &bc).expect("coefficients");
        let mut phi = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        let mut ne = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        fs.compute_potential_and_electron_density(&g, &bc, &mut phi, &ni, 1.0, &mut ne)
            .expect("boltzmann");
        assert!(phi.max_abs() < 1e-10);
        assert!((ne.get(0, 4, 4, 0).expect("get") - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_boltzmann_responds_to_poloidal_perturbation() {
        let g = slab(true, [1, 1]);
        let bc = dirichlet(&g, 0.0, 0.0);
        let cfg = FieldSolverConfig {
            boltzmann_tol: 1e-9,
            ..poisson_config()
        };
        let mut fs = FieldSolver::new(&g, &cfg, &ReferenceUnits::default()).expect("solver");
        let mut ni = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        for (i, j) in g.block(0).domain.cells() {
            let y = (j as f64 + 0.5) / 8.0;
            ni.set(0, i, j, 0, 1.0 + 0.01 * (std::f64::consts::TAU * y).cos()).expect("set");
        }
        let mut phi = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        let mut ne = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        fs.compute_potential_and_electron_density(&g, &bc, &mut phi, &ni, 1.0, &mut ne)
            .expect("boltzmann");
        // Potential follows the ion density: high where n_i is high.
        assert!(phi.get(0, 8, 0, 0).expect("get") > phi.get(0, 8, 4, 0).expect("get"));
        let tilde = FieldSolver::get_phi_tilde(&g, &ni, 1.0).expect("phi tilde");
        assert!(tilde.get(0, 8, 0, 0).expect("get") > 0.0);
        assert!(tilde.get(0, 8, 4, 0).expect("get") < 0.0);
    }

    #[test]
    fn test_polarization_average_on_miller() {
        let g = MultiblockGeometry::new(&GeometryConfig::Miller(MillerConfig {
            cells: [8, 16],
            inner_radial_bdry: 0.3,
            outer_radial_bdry: 0.4,
            major_radius: 1.7,
            kappa: 1.0,
            beta: 0.0,
            dpsidr: 1.7,
            dr_r0: 0.0,
            s_kappa: 0.0,
            s_delta: 0.0,
            btor_scale: 3.5,
            axisymmetric: false,
            poloidal_blocks: 2,
            discretization: DiscretizationConfig::default(),
        }))
        .expect("miller");
        let cfg = FieldSolverConfig {
            model: FieldModel::GkPoisson,
            ..poisson_config()
        };
        let units = ReferenceUnits::default();
        let mut fs = FieldSolver::new(&g, &cfg, &units).expect("solver");
        let bc = PotentialBc::from_config(
            &[
                PotentialBcConfig {
                    boundary: "radial_inner".to_string(),
                    spec: BcSpecConfig::Dirichlet { value: 0.0 },
                },
                PotentialBcConfig {
                    boundary: "radial_outer".to_string(),
                    spec: BcSpecConfig::Dirichlet { value: 0.0 },
                },
            ],
            &g,
        )
        .expect("bc");
        let mut mass = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        mass.set_val(1.0);
        let p = fs.set_operator_coefficients_consistent(&g, &mass, &bc).expect("coefficients");
        assert_eq!(p.len(), 9);
        // Radial direction is perpendicular to b: D_rr = ρ_L²/B² + λ_D².
        let b2_min = (3.5f64 / 2.1).powi(2);
        assert!(p.lo() > 0.0);
        assert!(p.values.iter().all(|v| *v <= units.larmor_number().powi(2) / b2_min + units.debye_number().powi(2) + 1e-12));
    }
}
