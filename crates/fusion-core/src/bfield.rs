//! Magnetic field data derived from a block mapping.
//!
//! For axisymmetric blocks the physical coordinates are cylindrical
//! `(R, Z, φ)` and the poloidal field follows from the flux function:
//!   B_R = -(1/R) ∂Ψ/∂Z
//!   B_Z =  (1/R) ∂Ψ/∂R
//! Slab blocks are Cartesian `(x, y, z)` with `z` ignorable.
//!
//! Derivatives of |B| and of the unit vector b are taken by central
//! differences in mapped space and carried to physical space through the
//! inverse mapping Jacobian.

use crate::coord_sys::{unmap_vector, BlockCoordSys, R_SAFE_MIN};

/// Offsets of the derived quantities inside a packed component array.
pub const B_VEC: usize = 0;
pub const B_MAG: usize = 3;
pub const B_DIR: usize = 4;
pub const GRAD_B_MAG: usize = 7;
pub const CURL_B_DIR: usize = 10;
pub const B_DIR_DOT_CURL_B_DIR: usize = 13;
pub const FIELD_NCOMP: usize = 14;

/// Relative step of the mapped-space difference quotients.
const FD_STEP: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldData {
    pub b: [f64; 3],
    pub b_mag: f64,
    pub b_dir: [f64; 3],
    pub grad_b_mag: [f64; 3],
    pub curl_b_dir: [f64; 3],
    pub b_dir_dot_curl_b_dir: f64,
}

impl FieldData {
    pub fn to_components(&self) -> [f64; FIELD_NCOMP] {
        let mut c = [0.0; FIELD_NCOMP];
        c[B_VEC..B_VEC + 3].copy_from_slice(&self.b);
        c[B_MAG] = self.b_mag;
        c[B_DIR..B_DIR + 3].copy_from_slice(&self.b_dir);
        c[GRAD_B_MAG..GRAD_B_MAG + 3].copy_from_slice(&self.grad_b_mag);
        c[CURL_B_DIR..CURL_B_DIR + 3].copy_from_slice(&self.curl_b_dir);
        c[B_DIR_DOT_CURL_B_DIR] = self.b_dir_dot_curl_b_dir;
        c
    }
}

fn magnitude(b: &[f64; 3]) -> f64 {
    (b[0] * b[0] + b[1] * b[1] + b[2] * b[2]).sqrt()
}

/// `[|B|, b0, b1, b_tor]` at mapped position `xi`.
fn field_scalars(cs: &BlockCoordSys, xi: [f64; 2]) -> [f64; 4] {
    let b = cs.magnetic_field(xi);
    let m = magnitude(&b);
    if m == 0.0 {
        return [0.0; 4];
    }
    [m, b[0] / m, b[1] / m, b[2] / m]
}

/// Evaluate the field and its derived quantities at `xi`.
pub fn field_data(cs: &BlockCoordSys, xi: [f64; 2]) -> FieldData {
    let b = cs.magnetic_field(xi);
    let s = field_scalars(cs, xi);

    // d[q][d] = ∂(scalar q)/∂ξ_d
    let mut d = [[0.0; 2]; 4];
    for dir in 0..2 {
        let eps = FD_STEP * cs.h[dir];
        let mut xp = xi;
        let mut xm = xi;
        xp[dir] += eps;
        xm[dir] -= eps;
        let sp = field_scalars(cs, xp);
        let sm = field_scalars(cs, xm);
        for q in 0..4 {
            d[q][dir] = (sp[q] - sm[q]) / (2.0 * eps);
        }
    }
    let a = cs.dx_dxi(xi);
    let g: Vec<[f64; 2]> = d.iter().map(|dq| unmap_vector(&a, *dq)).collect();
    let (gm, g0, g1, gt) = (g[0], g[1], g[2], g[3]);
    let bd = [s[1], s[2], s[3]];

    let curl = if cs.axisymmetric {
        let r = cs.real_coord(xi)[0].max(R_SAFE_MIN);
        [-gt[1], gt[0] + bd[2] / r, g0[1] - g1[0]]
    } else {
        [gt[1], -gt[0], g0[1] - g1[0]]
    };

    FieldData {
        b,
        b_mag: s[0],
        b_dir: bd,
        grad_b_mag: [gm[0], gm[1], 0.0],
        curl_b_dir: curl,
        b_dir_dot_curl_b_dir: bd[0] * curl[0] + bd[1] * curl[1] + bd[2] * curl[2],
    }
}
