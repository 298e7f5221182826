//! Successive Over-Relaxation on assembled sparse matrices.
//!
//! The elliptic field solver assembles a low-order 5-point approximation
//! of its operator (boundary conditions folded in, block seams coupled
//! through the inter-block index maps) into a [`CsrMatrix`]. A few SOR
//! sweeps from a zero initial guess then act as a fixed linear
//! preconditioner for GMRES.

use fusion_types::error::{FusionError, FusionResult};

/// Compressed sparse row matrix.
#[derive(Debug, Clone)]
pub struct CsrMatrix {
    n: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
    diag_pos: Vec<Option<usize>>,
}

impl CsrMatrix {
    /// Build from (row, col, value) triplets. Duplicates are summed.
    pub fn from_triplets(n: usize, triplets: &[(usize, usize, f64)]) -> FusionResult<Self> {
        let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        for &(r, c, v) in triplets {
            if r >= n || c >= n {
                return Err(FusionError::LinAlg(format!(
                    "triplet ({r}, {c}) outside {n}x{n} matrix"
                )));
            }
            rows[r].push((c, v));
        }

        let mut row_ptr = Vec::with_capacity(n + 1);
        let mut col_idx = Vec::with_capacity(triplets.len());
        let mut values = Vec::with_capacity(triplets.len());
        let mut diag_pos = vec![None; n];
        row_ptr.push(0);
        for (r, row) in rows.iter_mut().enumerate() {
            row.sort_by_key(|&(c, _)| c);
            let mut last: Option<usize> = None;
            for &(c, v) in row.iter() {
                if last == Some(c) {
                    if let Some(val) = values.last_mut() {
                        *val += v;
                    }
                    continue;
                }
                if c == r {
                    diag_pos[r] = Some(col_idx.len());
                }
                col_idx.push(c);
                values.push(v);
                last = Some(c);
            }
            row_ptr.push(col_idx.len());
        }

        Ok(CsrMatrix {
            n,
            row_ptr,
            col_idx,
            values,
            diag_pos,
        })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn diagonal(&self, row: usize) -> f64 {
        self.diag_pos[row].map(|p| self.values[p]).unwrap_or(0.0)
    }

    /// `y = A x`.
    pub fn matvec(&self, x: &[f64], y: &mut [f64]) {
        for r in 0..self.n {
            let mut sum = 0.0;
            for k in self.row_ptr[r]..self.row_ptr[r + 1] {
                sum += self.values[k] * x[self.col_idx[k]];
            }
            y[r] = sum;
        }
    }

    /// Every row must carry a nonzero diagonal for SOR to be defined.
    pub fn check_diagonal(&self) -> FusionResult<()> {
        for r in 0..self.n {
            if self.diagonal(r).abs() < 1e-300 {
                return Err(FusionError::LinAlg(format!("zero diagonal in row {r}")));
            }
        }
        Ok(())
    }
}

/// One forward SOR sweep for `A x = b`.
pub fn sor_step(a: &CsrMatrix, b: &[f64], x: &mut [f64], omega: f64) {
    for r in 0..a.n {
        let mut sigma = 0.0;
        let mut diag = 0.0;
        for k in a.row_ptr[r]..a.row_ptr[r + 1] {
            let c = a.col_idx[k];
            if c == r {
                diag = a.values[k];
            } else {
                sigma += a.values[k] * x[c];
            }
        }
        if diag.abs() > 1e-300 {
            let gs = (b[r] - sigma) / diag;
            x[r] = (1.0 - omega) * x[r] + omega * gs;
        }
    }
}

/// Run N SOR iterations.
pub fn sor_solve(a: &CsrMatrix, b: &[f64], x: &mut [f64], omega: f64, iterations: usize) {
    for _ in 0..iterations {
        sor_step(a, b, x, omega);
    }
}

/// L2 norm of `b - A x`.
pub fn sor_residual(a: &CsrMatrix, b: &[f64], x: &[f64]) -> f64 {
    let mut ax = vec![0.0; a.n];
    a.matvec(x, &mut ax);
    ax.iter()
        .zip(b.iter())
        .map(|(y, bi)| (bi - y) * (bi - y))
        .sum::<f64>()
        .sqrt()
}

/// Fixed-sweep SOR used as a GMRES preconditioner: approximately solve
/// `A z = r` starting from `z = 0`.
#[derive(Debug, Clone)]
pub struct SorPreconditioner {
    pub matrix: CsrMatrix,
    pub sweeps: usize,
    pub omega: f64,
}

impl SorPreconditioner {
    pub fn new(matrix: CsrMatrix, sweeps: usize, omega: f64) -> FusionResult<Self> {
        matrix.check_diagonal()?;
        if !(0.0 < omega && omega < 2.0) {
            return Err(FusionError::ConfigError(format!(
                "SOR relaxation factor must lie in (0, 2), got {omega}"
            )));
        }
        Ok(SorPreconditioner {
            matrix,
            sweeps: sweeps.max(1),
            omega,
        })
    }

    pub fn apply(&self, r: &[f64], z: &mut [f64]) {
        z.iter_mut().for_each(|v| *v = 0.0);
        sor_solve(&self.matrix, r, z, self.omega, self.sweeps);
    }
}
