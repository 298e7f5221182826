// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Phase-Space Geometry
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Configuration space times a uniform `(v∥, μ)` grid.
//!
//! Phase-space data is a [`LevelData`] on the configuration layout whose
//! components are the velocity cells. Distribution functions are stored
//! as `J f` with `J` the configuration Jacobian; velocity integrals carry
//! the gyrokinetic measure `2π B / m dv∥ dμ`.

use std::sync::Arc;

use fusion_types::constants::TWO_PI;
use fusion_types::error::{FusionError, FusionResult};
use fusion_types::state::VelocityGrid;
use ndarray::{Array1, Axis};
use rayon::prelude::*;

use crate::bfield::B_MAG;
use crate::block_array::{ComponentKind, LevelData};
use crate::geometry::MultiblockGeometry;
use crate::grid_function::GridFunction;
use crate::species;

#[derive(Debug, Clone)]
pub struct PhaseGeom {
    geom: Arc<MultiblockGeometry>,
    velocity: VelocityGrid,
    vpar: Array1<f64>,
    mu: Array1<f64>,
}

impl PhaseGeom {
    pub fn new(geom: Arc<MultiblockGeometry>, velocity: VelocityGrid) -> FusionResult<Self> {
        if velocity.n_vpar == 0 || velocity.n_mu == 0 {
            return Err(FusionError::ConfigError(format!(
                "velocity grid needs at least one cell per direction, got {}x{}",
                velocity.n_vpar, velocity.n_mu
            )));
        }
        if velocity.vpar_max <= 0.0 || velocity.mu_max <= 0.0 {
            return Err(FusionError::ConfigError(format!(
                "velocity grid extents must be positive, got vpar_max={} mu_max={}",
                velocity.vpar_max, velocity.mu_max
            )));
        }
        Ok(PhaseGeom {
            vpar: velocity.vpar_centers(),
            mu: velocity.mu_centers(),
            geom,
            velocity,
        })
    }

    pub fn geometry(&self) -> &MultiblockGeometry {
        &self.geom
    }

    pub fn geometry_arc(&self) -> &Arc<MultiblockGeometry> {
        &self.geom
    }

    pub fn velocity(&self) -> &VelocityGrid {
        &self.velocity
    }

    pub fn num_velocity_cells(&self) -> usize {
        self.velocity.num_cells()
    }

    pub fn vpar(&self, iv: usize) -> f64 {
        self.vpar[iv]
    }

    pub fn mu(&self, imu: usize) -> f64 {
        self.mu[imu]
    }

    /// Zeroed phase-space data.
    pub fn new_phase_data(&self) -> LevelData {
        LevelData::new(self.geom.layout(), self.num_velocity_cells(), ComponentKind::Scalar)
    }

    /// `2π/m dv∥ dμ`; multiply by the local `|B|`.
    pub fn velocity_weight(&self, mass: f64) -> f64 {
        TWO_PI / mass * self.velocity.dvpar() * self.velocity.dmu()
    }

    /// Broadcast component `comp` of configuration data to every velocity
    /// cell. Ghost values are copied too.
    pub fn inject_configuration_to_phase(&self, cfg: &LevelData, comp: usize) -> FusionResult<LevelData> {
        if comp >= cfg.ncomp() {
            return Err(FusionError::ConfigError(format!(
                "component {comp} out of range for {} components",
                cfg.ncomp()
            )));
        }
        let mut out = self.new_phase_data();
        out.patches_mut().par_iter_mut().enumerate().for_each(|(k, a)| {
            let src = cfg.patch(k).index_axis(Axis(0), comp);
            for mut lane in a.outer_iter_mut() {
                lane.assign(&src);
            }
        });
        if cfg.require_valid_ghosts().is_ok() {
            out.mark_ghosts_filled();
        }
        Ok(out)
    }

    /// Inverse of [`Self::inject_configuration_to_phase`]: velocity cell
    /// `vcomp` copied to component `comp` of `out`.
    pub fn project_phase_to_configuration(
        &self,
        phase: &LevelData,
        vcomp: usize,
        out: &mut LevelData,
        comp: usize,
    ) -> FusionResult<()> {
        if vcomp >= phase.ncomp() || comp >= out.ncomp() {
            return Err(FusionError::ConfigError(format!(
                "projection of component {vcomp} into {comp} out of range"
            )));
        }
        out.patches_mut().par_iter_mut().enumerate().for_each(|(k, a)| {
            a.index_axis_mut(Axis(0), comp)
                .assign(&phase.patch(k).index_axis(Axis(0), vcomp));
        });
        Ok(())
    }

    fn moment<F>(&self, f: &LevelData, mass: f64, out: &mut LevelData, kernel: F) -> FusionResult<()>
    where
        F: Fn(usize) -> f64 + Sync,
    {
        if f.ncomp() != self.num_velocity_cells() {
            return Err(FusionError::GeometryMismatch(format!(
                "phase data has {} components, velocity grid {}",
                f.ncomp(),
                self.num_velocity_cells()
            )));
        }
        let w = self.velocity_weight(mass);
        let field = self.geom.field_cell();
        out.patches_mut().par_iter_mut().enumerate().for_each(|(k, a)| {
            let fk = f.patch(k);
            let bk = field.patch(k);
            let (_, n0, n1) = a.dim();
            for li in 0..n0 {
                for lj in 0..n1 {
                    let mut s = 0.0;
                    for c in 0..fk.dim().0 {
                        s += fk[[c, li, lj]] * kernel(c);
                    }
                    a[[0, li, lj]] = s * w * bk[[B_MAG, li, lj]];
                }
            }
        });
        if f.require_valid_ghosts().is_ok() {
            out.mark_ghosts_filled();
        } else {
            out.mark_stale();
        }
        Ok(())
    }

    /// Number density `∫ f 2πB/m dv∥ dμ` of a physical (`J`-divided)
    /// distribution.
    pub fn density_moment(&self, f: &LevelData, mass: f64, out: &mut LevelData) -> FusionResult<()> {
        self.moment(f, mass, out, |_| 1.0)
    }

    /// Parallel particle flux `∫ v∥ f 2πB/m dv∥ dμ`.
    pub fn parallel_flux_moment(&self, f: &LevelData, mass: f64, out: &mut LevelData) -> FusionResult<()> {
        let n_mu = self.velocity.n_mu;
        let vpar = &self.vpar;
        self.moment(f, mass, out, |c| vpar[c / n_mu])
    }

    /// Local Maxwellian with the given density and temperature profiles,
    /// normalised so that its discrete density moment reproduces the
    /// density exactly. Physical values, every cell including ghosts.
    pub fn maxwellian(&self, density: &LevelData, temperature: &LevelData, mass: f64) -> FusionResult<LevelData> {
        let mut out = self.new_phase_data();
        let w = self.velocity_weight(mass);
        let field = self.geom.field_cell();
        let n_mu = self.velocity.n_mu;
        let (vpar, mu) = (&self.vpar, &self.mu);
        let bad: Vec<usize> = out
            .patches_mut()
            .par_iter_mut()
            .enumerate()
            .filter_map(|(k, a)| {
                let n = density.patch(k);
                let t = temperature.patch(k);
                let bk = field.patch(k);
                let (nc, n0, n1) = a.dim();
                for li in 0..n0 {
                    for lj in 0..n1 {
                        let (nv, tv, b) = (n[[0, li, lj]], t[[0, li, lj]], bk[[B_MAG, li, lj]]);
                        if tv <= 0.0 || nv < 0.0 {
                            return Some(k);
                        }
                        let mut sum = 0.0;
                        for c in 0..nc {
                            let (iv, imu) = (c / n_mu, c % n_mu);
                            let e = (0.5 * mass * vpar[iv] * vpar[iv] + mu[imu] * b) / tv;
                            let v = (-e).exp();
                            a[[c, li, lj]] = v;
                            sum += v;
                        }
                        let norm = if sum > 0.0 { nv / (sum * w * b) } else { 0.0 };
                        for c in 0..nc {
                            a[[c, li, lj]] *= norm;
                        }
                    }
                }
                None
            })
            .collect();
        if let Some(k) = bad.first() {
            return Err(FusionError::PhysicsViolation(format!(
                "Maxwellian needs T > 0 and n >= 0 (patch {k})"
            )));
        }
        out.mark_ghosts_filled();
        Ok(out)
    }

    /// Maxwellian from analytic profiles, stored as `J f`.
    pub fn maxwellian_dfn(
        &self,
        density: &GridFunction,
        temperature: &GridFunction,
        mass: f64,
    ) -> FusionResult<LevelData> {
        let layout = self.geom.layout();
        let mut n = LevelData::new(layout, 1, ComponentKind::Scalar);
        let mut t = LevelData::new(layout, 1, ComponentKind::Scalar);
        density.assign(&self.geom, &mut n, 0)?;
        temperature.assign(&self.geom, &mut t, 0)?;
        let mut f = self.maxwellian(&n, &t, mass)?;
        self.mult_j(&mut f);
        Ok(f)
    }

    /// `f = dfn / J` on every cell; ghost state is preserved.
    pub fn divide_j(&self, dfn: &LevelData) -> LevelData {
        species::divide_j(&self.geom, dfn)
    }

    /// `dfn = J f` in place.
    pub fn mult_j(&self, f: &mut LevelData) {
        species::mult_j(&self.geom, f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_types::config::{DiscretizationConfig, GeometryConfig, GridFunctionConfig, MillerConfig};

    fn miller() -> Arc<MultiblockGeometry> {
        Arc::new(
            MultiblockGeometry::new(&GeometryConfig::Miller(MillerConfig {
                cells: [4, 8],
                inner_radial_bdry: 0.3,
                outer_radial_bdry: 0.5,
                major_radius: 1.7,
                kappa: 1.2,
                beta: 0.0,
                dpsidr: 1.7,
                dr_r0: 0.0,
                s_kappa: 0.0,
                s_delta: 0.0,
                btor_scale: 3.5,
                axisymmetric: true,
                poloidal_blocks: 1,
                discretization: DiscretizationConfig::default(),
            }))
            .expect("miller"),
        )
    }

    fn grid() -> VelocityGrid {
        VelocityGrid {
            n_vpar: 12,
            n_mu: 6,
            vpar_max: 4.0,
            mu_max: 3.0,
        }
    }

    #[test]
    fn test_maxwellian_density_is_exact() {
        let phase = PhaseGeom::new(miller(), grid()).expect("phase");
        let n = GridFunction::from_config(&GridFunctionConfig::Tanh {
            inner_value: 1.0,
            outer_value: 0.5,
            center: 0.4,
            width: 0.05,
        })
        .expect("n");
        let t = GridFunction::Constant(1.0);
        let dfn = phase.maxwellian_dfn(&n, &t, 2.0).expect("maxwellian");
        let f = phase.divide_j(&dfn);
        let mut dens = LevelData::new(phase.geometry().layout(), 1, ComponentKind::Scalar);
        phase.density_moment(&f, 2.0, &mut dens).expect("moment");
        let cs = phase.geometry().block(0);
        for (i, j) in [(0i64, 0i64), (3, 5)] {
            let expect = n.evaluate(cs, cs.cell_center(i, j)).expect("eval");
            assert!((dens.get(0, i, j, 0).expect("get") - expect).abs() < 1e-12);
        }
        // Symmetric in v∥: no parallel flow.
        let mut flow = LevelData::new(phase.geometry().layout(), 1, ComponentKind::Scalar);
        phase.parallel_flux_moment(&f, 2.0, &mut flow).expect("moment");
        assert!(flow.max_abs() < 1e-12);
    }

    #[test]
    fn test_inject_and_project() {
        let phase = PhaseGeom::new(miller(), grid()).expect("phase");
        let layout = phase.geometry().layout();
        let mut cfg = LevelData::new(layout, 2, ComponentKind::Scalar);
        cfg.set(0, 2, 3, 1, 4.25).expect("set");
        let injected = phase.inject_configuration_to_phase(&cfg, 1).expect("inject");
        assert_eq!(injected.ncomp(), 72);
        assert_eq!(injected.get(0, 2, 3, 71).expect("get"), 4.25);
        let mut back = LevelData::new(layout, 1, ComponentKind::Scalar);
        phase.project_phase_to_configuration(&injected, 17, &mut back, 0).expect("project");
        assert_eq!(back.get(0, 2, 3, 0).expect("get"), 4.25);
    }

    #[test]
    fn test_divide_then_multiply_restores() {
        let phase = PhaseGeom::new(miller(), grid()).expect("phase");
        let mut dfn = phase.new_phase_data();
        dfn.set_val(3.0);
        let mut f = phase.divide_j(&dfn);
        assert!(f.get(0, 1, 1, 0).expect("get") != 3.0);
        phase.mult_j(&mut f);
        assert!((f.get(0, 1, 1, 5).expect("get") - 3.0).abs() < 1e-12);
        assert!(f.require_valid_ghosts().is_ok());
    }

    #[test]
    fn test_rejects_empty_grid() {
        let err = PhaseGeom::new(
            miller(),
            VelocityGrid {
                n_vpar: 0,
                ..grid()
            },
        )
        .expect_err("empty grid");
        assert!(matches!(err, FusionError::ConfigError(_)));
    }
}
