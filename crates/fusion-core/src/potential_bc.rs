// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Potential Boundary Conditions
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Boundary conditions of the electrostatic potential.
//!
//! Boundaries are named by the block coordinate systems
//! (`radial_inner`, `radial_outer`, `radial_core`, `radial_sol`,
//! `radial_pf`, `poloidal_inner_div`, ...). Each name may cover several
//! block faces; each physical face ends up with exactly one condition.
//!
//! Derivative values are outward normal physical derivatives.

use std::collections::HashMap;
use std::sync::Arc;

use fusion_types::config::{BcSpecConfig, BcValueType, PotentialBcConfig};
use fusion_types::constants::TWO_PI;
use fusion_types::error::{FusionError, FusionResult};
use fusion_types::state::Side;
use log::debug;

use crate::block_array::LevelData;
use crate::coord_sys::R_SAFE_MIN;
use crate::geometry::MultiblockGeometry;
use crate::grid_function::GridFunction;

/// Ghost layers filled by [`PotentialBc::fill_ghosts`].
pub const NUM_POTENTIAL_GHOSTS: usize = 2;

#[derive(Debug, Clone)]
pub enum BcSpec {
    DirichletValue(f64),
    DirichletFunction(GridFunction),
    Neumann(f64),
    Multipole,
    CoreRadial { value_type: BcValueType, value: f64 },
}

impl BcSpec {
    pub fn from_config(cfg: &BcSpecConfig) -> FusionResult<Self> {
        Ok(match cfg {
            BcSpecConfig::Dirichlet { value } => BcSpec::DirichletValue(*value),
            BcSpecConfig::DirichletFunction { function } => {
                BcSpec::DirichletFunction(GridFunction::from_config(function)?)
            }
            BcSpecConfig::Neumann { value } => BcSpec::Neumann(*value),
            BcSpecConfig::Multipole => BcSpec::Multipole,
            BcSpecConfig::CoreRadial { value_type, value } => BcSpec::CoreRadial {
                value_type: *value_type,
                value: *value,
            },
        })
    }

    pub fn value_type(&self) -> BcValueType {
        match self {
            BcSpec::Neumann(_) => BcValueType::Derivative,
            BcSpec::CoreRadial { value_type, .. } => *value_type,
            _ => BcValueType::Value,
        }
    }
}

/// Ghost extrapolation across one boundary face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryStencil {
    pub value_type: BcValueType,
    pub dir: usize,
    pub side: Side,
    pub order: usize,
}

impl BoundaryStencil {
    /// Ghost values `[g1, g2]` (nearest first) from the interior values
    /// `u = [u0, u1, u2]` (nearest first). `bv` is the boundary value or
    /// the mapped derivative `∂φ/∂ξ_dir` at the face; `h` the mapped
    /// spacing.
    pub fn ghost_values(&self, u: [f64; 3], bv: f64, h: f64) -> [f64; 2] {
        let [u0, u1, u2] = u;
        // Outward-pointing derivative on the high side.
        let hg = match self.side {
            Side::Lo => h * bv,
            Side::Hi => -h * bv,
        };
        match (self.value_type, self.order) {
            (BcValueType::Value, 4) => [
                (16.0 * bv - 15.0 * u0 + 5.0 * u1 - u2) / 5.0,
                12.8 * bv - 18.0 * u0 + 8.0 * u1 - 1.8 * u2,
            ],
            (BcValueType::Derivative, 4) => [
                (21.0 * u0 + 3.0 * u1 - u2 - 24.0 * hg) / 23.0,
                (-54.0 * u0 + 104.0 * u1 - 27.0 * u2 - 96.0 * hg) / 23.0,
            ],
            (BcValueType::Value, _) => [2.0 * bv - u0, 4.0 * bv - 3.0 * u0],
            (BcValueType::Derivative, _) => [u0 - hg, u0 - 2.0 * hg],
        }
    }
}

/// Condition attached to one physical block face.
#[derive(Debug, Clone)]
pub struct FaceBc {
    pub name: String,
    pub block: usize,
    pub dir: usize,
    pub side: Side,
    pub spec: BcSpec,
}

#[derive(Debug, Clone)]
pub struct PotentialBc {
    faces: Vec<FaceBc>,
    order: usize,
    /// Multipole boundary values per face, indexed by transverse cell.
    multipole_values: HashMap<usize, Vec<f64>>,
}

impl PotentialBc {
    /// Resolve the named boundary conditions onto block faces and check
    /// that every physical face is covered exactly once.
    pub fn from_config(cfgs: &[PotentialBcConfig], geom: &MultiblockGeometry) -> FusionResult<Self> {
        let mut faces = Vec::new();
        for cfg in cfgs {
            let targets = geom.boundary_faces(&cfg.boundary);
            if targets.is_empty() {
                return Err(FusionError::ConfigError(format!(
                    "potential BC names unknown boundary '{}'",
                    cfg.boundary
                )));
            }
            let spec = BcSpec::from_config(&cfg.spec)?;
            for (block, dir, side) in targets {
                faces.push(FaceBc {
                    name: cfg.boundary.clone(),
                    block,
                    dir,
                    side,
                    spec: spec.clone(),
                });
            }
        }
        let bc = PotentialBc {
            faces,
            order: if geom.second_order() { 2 } else { 4 },
            multipole_values: HashMap::new(),
        };
        bc.validate(geom)?;
        Ok(bc)
    }

    /// Every physical face has exactly one condition and no condition
    /// sits on a block seam.
    pub fn validate(&self, geom: &MultiblockGeometry) -> FusionResult<()> {
        let layout = geom.layout();
        for f in &self.faces {
            if !layout.block(f.block).is_physical(f.dir, f.side) {
                return Err(FusionError::ConfigError(format!(
                    "boundary '{}' lies on a block seam (block {}, dir {}, {:?})",
                    f.name, f.block, f.dir, f.side
                )));
            }
        }
        for b in 0..layout.num_blocks() {
            for dir in 0..2 {
                for side in Side::BOTH {
                    if !layout.block(b).is_physical(dir, side) {
                        continue;
                    }
                    let count = self
                        .faces
                        .iter()
                        .filter(|f| f.block == b && f.dir == dir && f.side == side)
                        .count();
                    if count != 1 {
                        return Err(FusionError::ConfigError(format!(
                            "block {b} dir {dir} {side:?} has {count} potential BCs, expected exactly one"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn faces(&self) -> &[FaceBc] {
        &self.faces
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn num_potential_ghosts(&self) -> usize {
        NUM_POTENTIAL_GHOSTS
    }

    fn face_index(&self, block: usize, dir: usize, side: Side) -> FusionResult<usize> {
        self.faces
            .iter()
            .position(|f| f.block == block && f.dir == dir && f.side == side)
            .ok_or_else(|| {
                FusionError::ConfigError(format!("no potential BC on block {block} dir {dir} {side:?}"))
            })
    }

    pub fn spec(&self, block: usize, dir: usize, side: Side) -> FusionResult<&BcSpec> {
        Ok(&self.faces[self.face_index(block, dir, side)?].spec)
    }

    /// Replace the scalar value of the condition on one face.
    pub fn set_bc_value(&mut self, block: usize, dir: usize, side: Side, v: f64) -> FusionResult<()> {
        let idx = self.face_index(block, dir, side)?;
        match &mut self.faces[idx].spec {
            BcSpec::DirichletValue(x) | BcSpec::Neumann(x) => *x = v,
            BcSpec::CoreRadial { value, .. } => *value = v,
            other => {
                return Err(FusionError::Unsupported(format!(
                    "cannot set a scalar value on {other:?} boundary"
                )))
            }
        }
        Ok(())
    }

    pub fn has_multipole(&self) -> bool {
        self.faces.iter().any(|f| matches!(f.spec, BcSpec::Multipole))
    }

    /// Free-space potential of the charge density `rho` on multipole faces:
    /// `Σ ρ A (-1/2π) ln|x - y|` over all valid cells, with `A` the
    /// poloidal-plane cell area.
    pub fn set_multipole_values(&mut self, geom: &MultiblockGeometry, rho: &LevelData) -> FusionResult<()> {
        let layout = Arc::clone(geom.layout());
        let mut sources = Vec::new();
        for k in 0..layout.num_patches() {
            let tile = layout.tile(k);
            let cs = geom.block(tile.block);
            for (i, j) in tile.cells.cells() {
                let [li, lj] = layout.local_index(k, i, j);
                let x = [geom.x_cell().patch(k)[[0, li, lj]], geom.x_cell().patch(k)[[1, li, lj]]];
                let mut area = geom.cell_volume().patch(k)[[0, li, lj]];
                if cs.axisymmetric {
                    area /= TWO_PI * x[0].max(R_SAFE_MIN);
                }
                sources.push((x, rho.patch(k)[[0, li, lj]] * area));
            }
        }
        for (idx, f) in self.faces.iter().enumerate() {
            if !matches!(f.spec, BcSpec::Multipole) {
                continue;
            }
            let cs = geom.block(f.block);
            let t = 1 - f.dir;
            let a = match f.side {
                Side::Lo => cs.domain.lo[f.dir],
                Side::Hi => cs.domain.hi[f.dir],
            };
            let values = (cs.domain.lo[t]..cs.domain.hi[t])
                .map(|m| {
                    let mut idx2 = [0i64; 2];
                    idx2[f.dir] = a;
                    idx2[t] = m;
                    let y = cs.real_coord(cs.face_center(f.dir, idx2[0], idx2[1]));
                    sources
                        .iter()
                        .map(|(x, q)| {
                            let d = ((x[0] - y[0]).powi(2) + (x[1] - y[1]).powi(2)).sqrt().max(1e-300);
                            -q * d.ln() / TWO_PI
                        })
                        .sum()
                })
                .collect();
            self.multipole_values.insert(idx, values);
        }
        Ok(())
    }

    /// Boundary value (or mapped derivative) on face `idx` at transverse
    /// cell `m`, for patch `k` local face position `(li, lj)`.
    fn boundary_datum(
        &self,
        geom: &MultiblockGeometry,
        idx: usize,
        m: i64,
        k: usize,
        face_local: [usize; 2],
        homogeneous: bool,
    ) -> FusionResult<f64> {
        let f = &self.faces[idx];
        let cs = geom.block(f.block);
        let derivative_scale = || {
            // |∇ξ_d| = |N_d| / J
            let nj = geom.nj_inv_face().face(k, f.dir);
            let (li, lj) = (face_local[0], face_local[1]);
            let g = (nj[[f.dir, li, lj]].powi(2) + nj[[2 + f.dir, li, lj]].powi(2)).sqrt();
            f.side.sign() as f64 / g.max(1e-300)
        };
        if homogeneous {
            return Ok(0.0);
        }
        Ok(match &f.spec {
            BcSpec::DirichletValue(v) => *v,
            BcSpec::DirichletFunction(func) => {
                let t = 1 - f.dir;
                let mut p = [0i64; 2];
                p[f.dir] = match f.side {
                    Side::Lo => cs.domain.lo[f.dir],
                    Side::Hi => cs.domain.hi[f.dir],
                };
                p[t] = m;
                func.evaluate(cs, cs.face_center(f.dir, p[0], p[1]))?
            }
            BcSpec::Neumann(v) => v * derivative_scale(),
            BcSpec::Multipole => {
                let vals = self.multipole_values.get(&idx).ok_or_else(|| {
                    FusionError::ConfigError(format!(
                        "multipole boundary '{}' used before its values were computed",
                        f.name
                    ))
                })?;
                let t = 1 - f.dir;
                let mm = m.clamp(cs.domain.lo[t], cs.domain.hi[t] - 1) - cs.domain.lo[t];
                vals[mm as usize]
            }
            BcSpec::CoreRadial { value_type, value } => match value_type {
                BcValueType::Value => *value,
                BcValueType::Derivative => value * derivative_scale(),
            },
        })
    }

    /// Fill the potential ghosts: seam ghosts from neighbouring blocks,
    /// then physical ghosts by boundary extrapolation, radial faces over
    /// the transversely grown range first, poloidal faces last.
    /// `homogeneous` zeroes all boundary data.
    pub fn fill_ghosts(&self, geom: &MultiblockGeometry, phi: &mut LevelData, homogeneous: bool) -> FusionResult<()> {
        phi.fill_internal_ghosts();
        phi.extrapolate_physical_ghosts();
        let layout = Arc::clone(geom.layout());
        let g = layout.ghosts() as i64;
        for dir in 0..2 {
            for (idx, f) in self.faces.iter().enumerate() {
                if f.dir != dir {
                    continue;
                }
                let cs = geom.block(f.block);
                let stencil = BoundaryStencil {
                    value_type: f.spec.value_type(),
                    dir,
                    side: f.side,
                    order: self.order,
                };
                let t = 1 - dir;
                let edge = match f.side {
                    Side::Lo => cs.domain.lo[dir],
                    Side::Hi => cs.domain.hi[dir],
                };
                for k in 0..layout.num_patches() {
                    let tile = layout.tile(k).clone();
                    if tile.block != f.block {
                        continue;
                    }
                    let on_edge = match f.side {
                        Side::Lo => tile.cells.lo[dir] == edge,
                        Side::Hi => tile.cells.hi[dir] == edge,
                    };
                    if !on_edge {
                        continue;
                    }
                    for m in (tile.cells.lo[t] - g)..(tile.cells.hi[t] + g) {
                        let at = |a: i64| {
                            let mut p = [0i64; 2];
                            p[dir] = a;
                            p[t] = m;
                            layout.local_index(k, p[0], p[1])
                        };
                        // Interior cells nearest first, then ghosts nearest first.
                        let (inner, ghosts) = match f.side {
                            Side::Lo => ([edge, edge + 1, edge + 2], [edge - 1, edge - 2]),
                            Side::Hi => ([edge - 1, edge - 2, edge - 3], [edge, edge + 1]),
                        };
                        let bv = self.boundary_datum(geom, idx, m, k, at(edge), homogeneous)?;
                        let a = phi.patch(k);
                        let u = inner.map(|c| {
                            let [li, lj] = at(c);
                            a[[0, li, lj]]
                        });
                        let gv = stencil.ghost_values(u, bv, cs.h[dir]);
                        let a = phi.patch_mut(k);
                        for (c, v) in ghosts.iter().zip(gv.iter()) {
                            let [li, lj] = at(*c);
                            a[[0, li, lj]] = *v;
                        }
                    }
                }
            }
        }
        phi.mark_ghosts_filled();
        debug!("potential ghosts filled (homogeneous = {homogeneous})");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_array::ComponentKind;
    use fusion_types::config::{DiscretizationConfig, GeometryConfig, SlabConfig};

    fn slab(second_order: bool) -> MultiblockGeometry {
        MultiblockGeometry::new(&GeometryConfig::Slab(SlabConfig {
            cells: [8, 8],
            xmax: 1.0,
            ymax: 1.0,
            bz_inner: 3.0,
            bz_outer: 3.0,
            by_inner: 0.0,
            periodic_poloidal: true,
            discretization: DiscretizationConfig {
                second_order,
                decomposition: [2, 1],
                ..DiscretizationConfig::default()
            },
        }))
        .expect("slab")
    }

    fn bc(name: &str, spec: BcSpecConfig) -> PotentialBcConfig {
        PotentialBcConfig {
            boundary: name.to_string(),
            spec,
        }
    }

    #[test]
    fn test_stencils_exact_for_cubics() {
        // u(x) = 1 + 2x - x² + 0.5x³ sampled at cell centres, h = 1.
        let u = |x: f64| 1.0 + 2.0 * x - x * x + 0.5 * x.powi(3);
        let du = |x: f64| 2.0 - 2.0 * x + 1.5 * x * x;
        let interior = [u(0.5), u(1.5), u(2.5)];
        let value = BoundaryStencil {
            value_type: BcValueType::Value,
            dir: 0,
            side: Side::Lo,
            order: 4,
        };
        let g = value.ghost_values(interior, u(0.0), 1.0);
        assert!((g[0] - u(-0.5)).abs() < 1e-12 && (g[1] - u(-1.5)).abs() < 1e-12);

        let deriv = BoundaryStencil {
            value_type: BcValueType::Derivative,
            ..value
        };
        let g = deriv.ghost_values(interior, du(0.0), 1.0);
        assert!((g[0] - u(-0.5)).abs() < 1e-12, "{} vs {}", g[0], u(-0.5));
        assert!((g[1] - u(-1.5)).abs() < 1e-12);
    }

    #[test]
    fn test_high_side_mirrors_low_side() {
        let lo = BoundaryStencil {
            value_type: BcValueType::Derivative,
            dir: 0,
            side: Side::Lo,
            order: 2,
        };
        let hi = BoundaryStencil { side: Side::Hi, ..lo };
        // Linear u = x with slope 1: low side ghosts continue the line.
        let g = lo.ghost_values([0.5, 1.5, 2.5], 1.0, 1.0);
        assert_eq!(g, [-0.5, -1.5]);
        // Same line seen from x = 3 with interior 2.5, 1.5, 0.5.
        let g = hi.ghost_values([2.5, 1.5, 0.5], 1.0, 1.0);
        assert_eq!(g, [3.5, 4.5]);
    }

    #[test]
    fn test_validate_requires_every_physical_face() {
        let g = slab(false);
        let err = PotentialBc::from_config(&[bc("radial_inner", BcSpecConfig::Dirichlet { value: 0.0 })], &g)
            .expect_err("outer face missing");
        match err {
            FusionError::ConfigError(msg) => assert!(msg.contains("expected exactly one")),
            other => panic!("Unexpected error: {other:?}"),
        }
        let err = PotentialBc::from_config(&[bc("nowhere", BcSpecConfig::Dirichlet { value: 0.0 })], &g)
            .expect_err("unknown name");
        assert!(matches!(err, FusionError::ConfigError(_)));
    }

    #[test]
    fn test_dirichlet_ghosts_reproduce_linear_profile() {
        let g = slab(false);
        let mut pbc = PotentialBc::from_config(
            &[
                bc("radial_inner", BcSpecConfig::Dirichlet { value: 0.0 }),
                bc("radial_outer", BcSpecConfig::Dirichlet { value: 1.0 }),
            ],
            &g,
        )
        .expect("bc");
        let mut phi = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        for (i, j) in g.block(0).domain.cells() {
            phi.set(0, i, j, 0, (i as f64 + 0.5) / 8.0).expect("set");
        }
        pbc.fill_ghosts(&g, &mut phi, false).expect("fill");
        let [li, lj] = g.layout().local_index(0, -2, 3);
        assert!((phi.patch(0)[[0, li, lj]] + 1.5 / 8.0).abs() < 1e-12);
        let k = g.layout().num_patches() - 1;
        let [li, lj] = g.layout().local_index(k, 9, -1);
        assert!((phi.patch(k)[[0, li, lj]] - 9.5 / 8.0).abs() < 1e-12);

        pbc.set_bc_value(0, 0, Side::Hi, 2.0).expect("set value");
        assert!(matches!(pbc.spec(0, 0, Side::Hi).expect("spec"), BcSpec::DirichletValue(v) if *v == 2.0));
    }

    #[test]
    fn test_neumann_uses_outward_derivative() {
        let g = slab(true);
        let pbc = PotentialBc::from_config(
            &[
                bc("radial_inner", BcSpecConfig::Neumann { value: -1.0 }),
                bc("radial_outer", BcSpecConfig::Neumann { value: 1.0 }),
            ],
            &g,
        )
        .expect("bc");
        // φ = x has outward derivative -1 at x = 0 and +1 at x = 1.
        let mut phi = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        for (i, j) in g.block(0).domain.cells() {
            phi.set(0, i, j, 0, (i as f64 + 0.5) / 8.0).expect("set");
        }
        pbc.fill_ghosts(&g, &mut phi, false).expect("fill");
        let [li, lj] = g.layout().local_index(0, -1, 0);
        assert!((phi.patch(0)[[0, li, lj]] + 0.5 / 8.0).abs() < 1e-12);
        let k = g.layout().num_patches() - 1;
        let [li, lj] = g.layout().local_index(k, 8, 0);
        assert!((phi.patch(k)[[0, li, lj]] - 8.5 / 8.0).abs() < 1e-12);
    }

    #[test]
    fn test_multipole_of_zero_charge_is_zero() {
        let g = slab(false);
        let mut pbc = PotentialBc::from_config(
            &[
                bc("radial_inner", BcSpecConfig::Multipole),
                bc("radial_outer", BcSpecConfig::Dirichlet { value: 0.0 }),
            ],
            &g,
        )
        .expect("bc");
        assert!(pbc.has_multipole());
        let mut phi = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        assert!(pbc.fill_ghosts(&g, &mut phi, false).is_err());
        let rho = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        pbc.set_multipole_values(&g, &rho).expect("multipole");
        pbc.fill_ghosts(&g, &mut phi, false).expect("fill");
        assert_eq!(phi.patch(0).iter().fold(0.0f64, |m, v| m.max(v.abs())), 0.0);
        assert!(pbc.set_bc_value(0, 0, Side::Lo, 1.0).is_err());
    }
}
