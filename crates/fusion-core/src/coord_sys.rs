// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Block Coordinate Systems
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Logical ↔ physical mappings of single blocks.
//!
//! Each block maps mapped coordinates `ξ = (ξ0, ξ1)` (radial, poloidal)
//! to physical `x = (x0, x1)`: Cartesian `(x, y)` for slabs, `(R, Z)` for
//! axisymmetric tokamak geometries. The mapping kinds are a closed set
//! dispatched through [`BlockMapping`].

use fusion_math::interp::bilinear_unit;
use fusion_types::config::{BlockRoleConfig, MillerConfig, SlabConfig, TabulatedBlockConfig};
use fusion_types::constants::TWO_PI;
use fusion_types::error::{FusionError, FusionResult};
use fusion_types::state::{IndexBox, Side};
use ndarray::Array2;

/// Minimum R value to avoid division by zero on degenerate mappings.
pub const R_SAFE_MIN: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    Core,
    Sol,
    PrivateFlux,
}

impl From<BlockRoleConfig> for BlockRole {
    fn from(r: BlockRoleConfig) -> Self {
        match r {
            BlockRoleConfig::Core => BlockRole::Core,
            BlockRoleConfig::Sol => BlockRole::Sol,
            BlockRoleConfig::PrivateFlux => BlockRole::PrivateFlux,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlabParams {
    pub xmax: f64,
    pub ymax: f64,
    pub bz_inner: f64,
    pub bz_outer: f64,
    pub by_inner: f64,
}

#[derive(Debug, Clone)]
pub struct MillerParams {
    pub major_radius: f64,
    pub average_radius: f64,
    pub kappa: f64,
    pub beta: f64,
    pub dpsidr: f64,
    pub dr_r0: f64,
    pub s_kappa: f64,
    pub s_delta: f64,
    pub btor_scale: f64,
}

/// Node tables on the block's unit square.
#[derive(Debug, Clone)]
pub struct TabulatedMap {
    pub x0: Array2<f64>,
    pub x1: Array2<f64>,
    pub psi: Array2<f64>,
    pub b_toroidal: f64,
}

#[derive(Debug, Clone)]
pub enum BlockMapping {
    Slab(SlabParams),
    Miller(MillerParams),
    Tabulated(TabulatedMap),
}

/// One block: mapping, index domain and mapped cell spacing.
#[derive(Debug, Clone)]
pub struct BlockCoordSys {
    pub block: usize,
    pub mapping: BlockMapping,
    pub domain: IndexBox,
    /// Mapped coordinate of the low corner of the domain.
    pub xi_lo: [f64; 2],
    pub h: [f64; 2],
    pub role: BlockRole,
    /// Physical coordinates are `(R, Z)` and volumes carry `2πR`.
    pub axisymmetric: bool,
    /// Names of physical boundaries, `[dir][side]`.
    pub boundary_names: [[Option<String>; 2]; 2],
}

fn nested_to_array(rows: &[Vec<f64>], shape: (usize, usize), what: &str) -> FusionResult<Array2<f64>> {
    if rows.len() != shape.0 || rows.iter().any(|r| r.len() != shape.1) {
        return Err(FusionError::ConfigError(format!(
            "{what} node table must be {}×{}",
            shape.0, shape.1
        )));
    }
    Ok(Array2::from_shape_fn(shape, |(i, j)| rows[i][j]))
}

/// Evaluate a node table with linear continuation outside the unit square.
fn table_eval(nodes: &Array2<f64>, s: [f64; 2]) -> (f64, [f64; 2]) {
    let c0 = s[0].clamp(0.0, 1.0);
    let c1 = s[1].clamp(0.0, 1.0);
    let (v, d) = bilinear_unit(nodes, c0, c1);
    (v + d[0] * (s[0] - c0) + d[1] * (s[1] - c1), d)
}

impl BlockCoordSys {
    pub fn slab(cfg: &SlabConfig) -> FusionResult<Self> {
        if cfg.xmax <= 0.0 || cfg.ymax <= 0.0 {
            return Err(FusionError::ConfigError(format!(
                "slab extents must be positive, got ({}, {})",
                cfg.xmax, cfg.ymax
            )));
        }
        // |B| is held constant across the slab; By absorbs the Bz gradient.
        let b2 = cfg.by_inner * cfg.by_inner + cfg.bz_inner * cfg.bz_inner;
        let worst = cfg.bz_inner.abs().max(cfg.bz_outer.abs());
        if b2 - worst * worst < -1e-14 {
            return Err(FusionError::ConfigError(format!(
                "slab field: |Bz| = {worst} exceeds |B| = {}",
                b2.sqrt()
            )));
        }
        let [n0, n1] = cfg.cells;
        let mut names = [[None, None], [None, None]];
        names[0][0] = Some("radial_inner".to_string());
        names[0][1] = Some("radial_outer".to_string());
        if !cfg.periodic_poloidal {
            names[1][0] = Some("poloidal_lower".to_string());
            names[1][1] = Some("poloidal_upper".to_string());
        }
        Ok(BlockCoordSys {
            block: 0,
            mapping: BlockMapping::Slab(SlabParams {
                xmax: cfg.xmax,
                ymax: cfg.ymax,
                bz_inner: cfg.bz_inner,
                bz_outer: cfg.bz_outer,
                by_inner: cfg.by_inner,
            }),
            domain: IndexBox::from_size(n0, n1),
            xi_lo: [0.0, 0.0],
            h: [1.0 / n0 as f64, 1.0 / n1 as f64],
            role: BlockRole::Core,
            axisymmetric: false,
            boundary_names: names,
        })
    }

    /// Poloidal block `block` of a Miller annulus split into
    /// `cfg.poloidal_blocks` equal sectors.
    pub fn miller(cfg: &MillerConfig, block: usize) -> FusionResult<Self> {
        let nb = cfg.poloidal_blocks.max(1);
        let [n0, n1] = cfg.cells;
        if n1 % nb != 0 {
            return Err(FusionError::ConfigError(format!(
                "{n1} poloidal cells cannot be split into {nb} blocks"
            )));
        }
        if cfg.inner_radial_bdry <= 0.0 || cfg.outer_radial_bdry <= cfg.inner_radial_bdry {
            return Err(FusionError::ConfigError(format!(
                "Miller radial bounds must satisfy 0 < inner < outer, got ({}, {})",
                cfg.inner_radial_bdry, cfg.outer_radial_bdry
            )));
        }
        let nb1 = n1 / nb;
        let dtheta = TWO_PI / nb as f64;
        let mut names = [[None, None], [None, None]];
        names[0][0] = Some("radial_inner".to_string());
        names[0][1] = Some("radial_outer".to_string());
        Ok(BlockCoordSys {
            block,
            mapping: BlockMapping::Miller(MillerParams {
                major_radius: cfg.major_radius,
                average_radius: 0.5 * (cfg.inner_radial_bdry + cfg.outer_radial_bdry),
                kappa: cfg.kappa,
                beta: cfg.beta,
                dpsidr: cfg.dpsidr,
                dr_r0: cfg.dr_r0,
                s_kappa: cfg.s_kappa,
                s_delta: cfg.s_delta,
                btor_scale: cfg.btor_scale,
            }),
            domain: IndexBox::from_size(n0, nb1),
            xi_lo: [cfg.inner_radial_bdry, block as f64 * dtheta],
            h: [
                (cfg.outer_radial_bdry - cfg.inner_radial_bdry) / n0 as f64,
                dtheta / nb1 as f64,
            ],
            role: BlockRole::Core,
            axisymmetric: cfg.axisymmetric,
            boundary_names: names,
        })
    }

    pub fn tabulated(cfg: &TabulatedBlockConfig, block: usize, axisymmetric: bool) -> FusionResult<Self> {
        let [n0, n1] = cfg.cells;
        if n0 == 0 || n1 == 0 {
            return Err(FusionError::ConfigError(format!("block {block} has no cells")));
        }
        let shape = (n0 + 1, n1 + 1);
        Ok(BlockCoordSys {
            block,
            mapping: BlockMapping::Tabulated(TabulatedMap {
                x0: nested_to_array(&cfg.x0, shape, "x0")?,
                x1: nested_to_array(&cfg.x1, shape, "x1")?,
                psi: nested_to_array(&cfg.psi, shape, "psi")?,
                b_toroidal: cfg.b_toroidal,
            }),
            domain: IndexBox::from_size(n0, n1),
            xi_lo: [0.0, 0.0],
            h: [1.0 / n0 as f64, 1.0 / n1 as f64],
            role: cfg.role.into(),
            axisymmetric,
            boundary_names: cfg.boundary_names.clone(),
        })
    }

    pub fn boundary_name(&self, dir: usize, side: Side) -> Option<&str> {
        self.boundary_names[dir][side.index()].as_deref()
    }

    // ───── index → mapped coordinates ─────

    pub fn cell_center(&self, i: i64, j: i64) -> [f64; 2] {
        [
            self.xi_lo[0] + (i as f64 + 0.5) * self.h[0],
            self.xi_lo[1] + (j as f64 + 0.5) * self.h[1],
        ]
    }

    /// Centre of face `(i, j)` normal to `dir`.
    pub fn face_center(&self, dir: usize, i: i64, j: i64) -> [f64; 2] {
        let mut xi = self.cell_center(i, j);
        xi[dir] -= 0.5 * self.h[dir];
        xi
    }

    pub fn node(&self, i: i64, j: i64) -> [f64; 2] {
        [
            self.xi_lo[0] + i as f64 * self.h[0],
            self.xi_lo[1] + j as f64 * self.h[1],
        ]
    }

    /// Mapped coordinates scaled to `[0, 1]` over the block.
    pub fn normalized(&self, xi: [f64; 2]) -> [f64; 2] {
        [
            (xi[0] - self.xi_lo[0]) / (self.h[0] * self.domain.size(0) as f64),
            (xi[1] - self.xi_lo[1]) / (self.h[1] * self.domain.size(1) as f64),
        ]
    }

    fn unit(&self, xi: [f64; 2]) -> [f64; 2] {
        self.normalized(xi)
    }

    // ───── mapping ─────

    pub fn real_coord(&self, xi: [f64; 2]) -> [f64; 2] {
        match &self.mapping {
            BlockMapping::Slab(p) => [xi[0] * p.xmax, xi[1] * p.ymax],
            BlockMapping::Miller(p) => {
                let (r, th) = (xi[0], xi[1]);
                let dr = (r - p.average_radius) / p.average_radius;
                let beta = p.beta * (1.0 + p.s_delta * dr);
                let kappa = p.kappa * (1.0 + p.s_kappa * dr);
                [
                    p.major_radius + p.dr_r0 * (r - p.average_radius) + r * (th + beta * th.sin()).cos(),
                    kappa * r * th.sin(),
                ]
            }
            BlockMapping::Tabulated(t) => {
                let s = self.unit(xi);
                [table_eval(&t.x0, s).0, table_eval(&t.x1, s).0]
            }
        }
    }

    /// `A[r][d] = ∂x_r / ∂ξ_d`.
    pub fn dx_dxi(&self, xi: [f64; 2]) -> [[f64; 2]; 2] {
        match &self.mapping {
            BlockMapping::Slab(p) => [[p.xmax, 0.0], [0.0, p.ymax]],
            BlockMapping::Miller(p) => {
                let (r, th) = (xi[0], xi[1]);
                let rb = p.average_radius;
                let dr = (r - rb) / rb;
                let beta = p.beta * (1.0 + p.s_delta * dr);
                let dbeta = p.beta * p.s_delta / rb;
                let kappa = p.kappa * (1.0 + p.s_kappa * dr);
                let dkappa = p.kappa * p.s_kappa / rb;
                let arg = th + beta * th.sin();
                [
                    [
                        p.dr_r0 + arg.cos() - r * arg.sin() * dbeta * th.sin(),
                        -r * arg.sin() * (1.0 + beta * th.cos()),
                    ],
                    [(kappa + dkappa * r) * th.sin(), kappa * r * th.cos()],
                ]
            }
            BlockMapping::Tabulated(t) => {
                let s = self.unit(xi);
                let l0 = self.h[0] * self.domain.size(0) as f64;
                let l1 = self.h[1] * self.domain.size(1) as f64;
                let (_, d0) = table_eval(&t.x0, s);
                let (_, d1) = table_eval(&t.x1, s);
                [[d0[0] / l0, d0[1] / l1], [d1[0] / l0, d1[1] / l1]]
            }
        }
    }

    /// Major radius when axisymmetric, 1 otherwise.
    pub fn radial_weight(&self, xi: [f64; 2]) -> f64 {
        if self.axisymmetric {
            self.real_coord(xi)[0].max(R_SAFE_MIN)
        } else {
            1.0
        }
    }

    /// Pointwise Jacobian, including `2πR` for axisymmetric blocks.
    pub fn jacobian(&self, xi: [f64; 2]) -> f64 {
        let a = self.dx_dxi(xi);
        let det = a[0][0] * a[1][1] - a[0][1] * a[1][0];
        if self.axisymmetric {
            det * TWO_PI * self.radial_weight(xi)
        } else {
            det
        }
    }

    /// Pointwise cofactor matrix `N = J A^{-T}`; column `d` is the
    /// area-weighted normal of a face of constant `ξ_d`.
    pub fn metric_n(&self, xi: [f64; 2]) -> [[f64; 2]; 2] {
        let a = self.dx_dxi(xi);
        let w = if self.axisymmetric {
            TWO_PI * self.radial_weight(xi)
        } else {
            1.0
        };
        [[w * a[1][1], -w * a[1][0]], [-w * a[0][1], w * a[0][0]]]
    }

    /// Inverse mapping by Newton iteration from the block centre.
    pub fn mapped_coord(&self, x: [f64; 2]) -> FusionResult<[f64; 2]> {
        if let BlockMapping::Slab(p) = &self.mapping {
            return Ok([x[0] / p.xmax, x[1] / p.ymax]);
        }
        let mut xi = self.cell_center(
            self.domain.size(0) as i64 / 2,
            self.domain.size(1) as i64 / 2,
        );
        for _ in 0..50 {
            let f = self.real_coord(xi);
            let r = [x[0] - f[0], x[1] - f[1]];
            let a = self.dx_dxi(xi);
            let det = a[0][0] * a[1][1] - a[0][1] * a[1][0];
            if det.abs() < 1e-300 {
                break;
            }
            let d0 = (a[1][1] * r[0] - a[0][1] * r[1]) / det;
            let d1 = (-a[1][0] * r[0] + a[0][0] * r[1]) / det;
            xi[0] += d0;
            xi[1] += d1;
            if d0.abs() <= 1e-13 * (1.0 + xi[0].abs()) && d1.abs() <= 1e-13 * (1.0 + xi[1].abs()) {
                return Ok(xi);
            }
        }
        Err(FusionError::SolverDiverged {
            iteration: 50,
            message: format!("mapped_coord did not converge for x = {x:?} in block {}", self.block),
        })
    }

    // ───── magnetic field ─────

    /// Poloidal flux and its mapped gradient `∂ψ/∂ξ`.
    pub fn psi_with_gradient(&self, xi: [f64; 2]) -> (f64, [f64; 2]) {
        match &self.mapping {
            BlockMapping::Slab(p) => (xi[0] * p.xmax, [p.xmax, 0.0]),
            BlockMapping::Miller(p) => (p.dpsidr * xi[0], [p.dpsidr, 0.0]),
            BlockMapping::Tabulated(t) => {
                let s = self.unit(xi);
                let l0 = self.h[0] * self.domain.size(0) as f64;
                let l1 = self.h[1] * self.domain.size(1) as f64;
                let (v, d) = table_eval(&t.psi, s);
                (v, [d[0] / l0, d[1] / l1])
            }
        }
    }

    /// Magnetic flux label at mapped position `xi`.
    pub fn psi(&self, xi: [f64; 2]) -> f64 {
        self.psi_with_gradient(xi).0
    }

    /// Magnetic flux label at physical position `x`.
    pub fn magnetic_flux(&self, x: [f64; 2]) -> FusionResult<f64> {
        Ok(self.psi(self.mapped_coord(x)?))
    }

    /// Physical gradient of ψ, `A^{-T} ∂ψ/∂ξ`.
    pub fn grad_psi(&self, xi: [f64; 2]) -> [f64; 2] {
        let (_, g) = self.psi_with_gradient(xi);
        unmap_vector(&self.dx_dxi(xi), g)
    }

    /// Magnetic field `[B0, B1, B_tor]`.
    pub fn magnetic_field(&self, xi: [f64; 2]) -> [f64; 3] {
        match &self.mapping {
            BlockMapping::Slab(p) => {
                let x = xi[0];
                let bz = p.bz_inner + (p.bz_outer - p.bz_inner) * x;
                let b2 = p.by_inner * p.by_inner + p.bz_inner * p.bz_inner;
                let by = (b2 - bz * bz).max(0.0).sqrt();
                [0.0, by, bz]
            }
            BlockMapping::Miller(p) => {
                let r = self.real_coord(xi)[0].max(R_SAFE_MIN);
                let g = self.grad_psi(xi);
                [-g[1] / r, g[0] / r, p.btor_scale / r]
            }
            BlockMapping::Tabulated(t) => {
                let r = self.radial_weight(xi);
                let g = self.grad_psi(xi);
                [-g[1] / r, g[0] / r, t.b_toroidal / r]
            }
        }
    }
}

/// Convert a mapped gradient `∂f/∂ξ` to the physical gradient using
/// `A = ∂x/∂ξ`: solves `Aᵀ g = ∂f/∂ξ`.
pub fn unmap_vector(a: &[[f64; 2]; 2], dxi: [f64; 2]) -> [f64; 2] {
    let det = a[0][0] * a[1][1] - a[0][1] * a[1][0];
    if det.abs() < 1e-300 {
        return [0.0, 0.0];
    }
    [
        (a[1][1] * dxi[0] - a[1][0] * dxi[1]) / det,
        (-a[0][1] * dxi[0] + a[0][0] * dxi[1]) / det,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_types::config::DiscretizationConfig;

    fn miller_cfg() -> MillerConfig {
        MillerConfig {
            cells: [8, 16],
            inner_radial_bdry: 0.3,
            outer_radial_bdry: 0.4,
            major_radius: 1.7,
            kappa: 1.4,
            beta: 0.2,
            dpsidr: 1.7,
            dr_r0: -0.1,
            s_kappa: 0.3,
            s_delta: 0.5,
            btor_scale: 3.5,
            axisymmetric: true,
            poloidal_blocks: 2,
            discretization: DiscretizationConfig::default(),
        }
    }

    fn slab_cfg() -> SlabConfig {
        SlabConfig {
            cells: [8, 8],
            xmax: 2.0,
            ymax: 3.0,
            bz_inner: 3.0,
            bz_outer: 2.5,
            by_inner: 0.5,
            periodic_poloidal: true,
            discretization: DiscretizationConfig::default(),
        }
    }

    #[test]
    fn test_slab_field_magnitude_constant() {
        let cs = BlockCoordSys::slab(&slab_cfg()).expect("slab");
        let b_in = cs.magnetic_field([0.0, 0.5]);
        let b_out = cs.magnetic_field([1.0, 0.5]);
        let mag = |b: [f64; 3]| (b[0] * b[0] + b[1] * b[1] + b[2] * b[2]).sqrt();
        assert!((mag(b_in) - mag(b_out)).abs() < 1e-12);
        assert!((b_out[2] - 2.5).abs() < 1e-12);
        assert_eq!(cs.boundary_name(0, Side::Lo), Some("radial_inner"));
        assert_eq!(cs.boundary_name(1, Side::Lo), None);
    }

    #[test]
    fn test_slab_rejects_impossible_field() {
        let mut cfg = slab_cfg();
        cfg.bz_outer = 4.0;
        assert!(BlockCoordSys::slab(&cfg).is_err());
    }

    #[test]
    fn test_miller_derivatives_match_differences() {
        let cs = BlockCoordSys::miller(&miller_cfg(), 1).expect("miller");
        let xi = [0.33, 4.0];
        let a = cs.dx_dxi(xi);
        let eps = 1e-6;
        for d in 0..2 {
            let mut xp = xi;
            let mut xm = xi;
            xp[d] += eps;
            xm[d] -= eps;
            let fp = cs.real_coord(xp);
            let fm = cs.real_coord(xm);
            for r in 0..2 {
                let fd = (fp[r] - fm[r]) / (2.0 * eps);
                assert!((fd - a[r][d]).abs() < 1e-7, "A[{r}][{d}]: {fd} vs {}", a[r][d]);
            }
        }
    }

    #[test]
    fn test_miller_block_sectors() {
        let cs = BlockCoordSys::miller(&miller_cfg(), 1).expect("miller");
        assert_eq!(cs.domain.size(1), 8);
        assert!((cs.node(0, 0)[1] - std::f64::consts::PI).abs() < 1e-14);
        assert!((cs.node(0, 8)[1] - TWO_PI).abs() < 1e-12);
    }

    #[test]
    fn test_miller_field_tangent_to_flux_surfaces() {
        let cs = BlockCoordSys::miller(&miller_cfg(), 0).expect("miller");
        let xi = [0.35, 1.1];
        let b = cs.magnetic_field(xi);
        let g = cs.grad_psi(xi);
        assert!((b[0] * g[0] + b[1] * g[1]).abs() < 1e-12);
        let r = cs.real_coord(xi)[0];
        assert!((b[2] - 3.5 / r).abs() < 1e-12);
    }

    #[test]
    fn test_mapped_coord_inverts_real_coord() {
        let cs = BlockCoordSys::miller(&miller_cfg(), 0).expect("miller");
        let xi = [0.36, 0.9];
        let back = cs.mapped_coord(cs.real_coord(xi)).expect("inverse");
        assert!((back[0] - xi[0]).abs() < 1e-10 && (back[1] - xi[1]).abs() < 1e-10);
    }

    #[test]
    fn test_metric_cofactor_identity() {
        // Nᵀ A = J I for the planar cofactor matrix.
        let mut cfg = miller_cfg();
        cfg.axisymmetric = false;
        let cs = BlockCoordSys::miller(&cfg, 0).expect("miller");
        let xi = [0.32, 2.2];
        let a = cs.dx_dxi(xi);
        let n = cs.metric_n(xi);
        let j = cs.jacobian(xi);
        for p in 0..2 {
            for q in 0..2 {
                let v: f64 = (0..2).map(|r| n[r][p] * a[r][q]).sum();
                let expect = if p == q { j } else { 0.0 };
                assert!((v - expect).abs() < 1e-12, "({p},{q}) = {v}");
            }
        }
    }

    #[test]
    fn test_tabulated_linear_continuation() {
        let cfg = TabulatedBlockConfig {
            cells: [2, 2],
            x0: vec![vec![0.0; 3], vec![1.0; 3], vec![2.0; 3]],
            x1: (0..3).map(|_| vec![0.0, 1.0, 2.0]).collect(),
            psi: vec![vec![0.0; 3], vec![0.5; 3], vec![1.0; 3]],
            b_toroidal: 1.0,
            role: BlockRoleConfig::Core,
            boundary_names: [[None, None], [None, None]],
        };
        let cs = BlockCoordSys::tabulated(&cfg, 0, false).expect("tabulated");
        assert!((cs.real_coord([1.25, 0.5])[0] - 2.5).abs() < 1e-12);
        assert!((cs.psi([0.5, 0.5]) - 0.5).abs() < 1e-12);
        let b = cs.magnetic_field([0.5, 0.5]);
        assert!(b[0].abs() < 1e-12 && (b[1] - 0.5).abs() < 1e-12);
    }
}
