// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — State
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use ndarray::Array1;
use serde::{Deserialize, Serialize};

pub const RADIAL_DIR: usize = 0;
pub const POLOIDAL_DIR: usize = 1;
pub const CFG_DIM: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Lo,
    Hi,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Lo, Side::Hi];

    /// -1 for the low side, +1 for the high side.
    pub fn sign(self) -> i64 {
        match self {
            Side::Lo => -1,
            Side::Hi => 1,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Side::Lo => 0,
            Side::Hi => 1,
        }
    }

    pub fn flip(self) -> Side {
        match self {
            Side::Lo => Side::Hi,
            Side::Hi => Side::Lo,
        }
    }
}

/// Cell index box in a block's logical index space: `lo` inclusive,
/// `hi` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexBox {
    pub lo: [i64; 2],
    pub hi: [i64; 2],
}

impl IndexBox {
    pub fn new(lo: [i64; 2], hi: [i64; 2]) -> Self {
        IndexBox { lo, hi }
    }

    /// Box `[0, n0) x [0, n1)`.
    pub fn from_size(n0: usize, n1: usize) -> Self {
        IndexBox {
            lo: [0, 0],
            hi: [n0 as i64, n1 as i64],
        }
    }

    pub fn size(&self, dir: usize) -> usize {
        (self.hi[dir] - self.lo[dir]).max(0) as usize
    }

    pub fn num_cells(&self) -> usize {
        self.size(0) * self.size(1)
    }

    pub fn is_empty(&self) -> bool {
        self.num_cells() == 0
    }

    pub fn contains(&self, i: i64, j: i64) -> bool {
        i >= self.lo[0] && i < self.hi[0] && j >= self.lo[1] && j < self.hi[1]
    }

    /// Whether face `(i, j)` normal to `dir` belongs to this box, boundary
    /// faces included.
    pub fn contains_face(&self, dir: usize, i: i64, j: i64) -> bool {
        let idx = [i, j];
        (0..2).all(|d| {
            if d == dir {
                idx[d] >= self.lo[d] && idx[d] <= self.hi[d]
            } else {
                idx[d] >= self.lo[d] && idx[d] < self.hi[d]
            }
        })
    }

    pub fn grow(&self, g: i64) -> IndexBox {
        IndexBox {
            lo: [self.lo[0] - g, self.lo[1] - g],
            hi: [self.hi[0] + g, self.hi[1] + g],
        }
    }

    pub fn cells(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        (self.lo[0]..self.hi[0]).flat_map(move |i| (self.lo[1]..self.hi[1]).map(move |j| (i, j)))
    }
}

/// Uniform (v_parallel, mu) velocity grid. Velocity cell `(iv, imu)` is
/// stored as component `iv * n_mu + imu` of phase-space data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityGrid {
    pub n_vpar: usize,
    pub n_mu: usize,
    pub vpar_max: f64,
    pub mu_max: f64,
}

impl VelocityGrid {
    pub fn num_cells(&self) -> usize {
        self.n_vpar * self.n_mu
    }

    pub fn dvpar(&self) -> f64 {
        2.0 * self.vpar_max / self.n_vpar as f64
    }

    pub fn dmu(&self) -> f64 {
        self.mu_max / self.n_mu as f64
    }

    /// Cell-centre parallel velocities on `[-vpar_max, vpar_max]`.
    pub fn vpar_centers(&self) -> Array1<f64> {
        let dv = self.dvpar();
        Array1::from_shape_fn(self.n_vpar, |iv| -self.vpar_max + (iv as f64 + 0.5) * dv)
    }

    /// Cell-centre magnetic moments on `[0, mu_max]`.
    pub fn mu_centers(&self) -> Array1<f64> {
        let dmu = self.dmu();
        Array1::from_shape_fn(self.n_mu, |imu| (imu as f64 + 0.5) * dmu)
    }

    pub fn component(&self, iv: usize, imu: usize) -> usize {
        iv * self.n_mu + imu
    }

    pub fn split_component(&self, comp: usize) -> (usize, usize) {
        (comp / self.n_mu, comp % self.n_mu)
    }
}

/// Counters accumulated by an iterative solver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverStats {
    pub solves: usize,
    pub nonlinear_iterations: usize,
    pub linear_iterations: usize,
}

impl SolverStats {
    pub fn merge(&mut self, other: &SolverStats) {
        self.solves += other.solves;
        self.nonlinear_iterations += other.nonlinear_iterations;
        self.linear_iterations += other.linear_iterations;
    }
}

/// Summary of one completed time step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step: usize,
    pub time: f64,
    pub dt: f64,
    pub stable_dt: f64,
    pub er_lo: f64,
    pub er_hi: f64,
}
