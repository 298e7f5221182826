// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — GMRES
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Restarted GMRES(m) Krylov subspace solver over any [`OdeVector`].
//!
//! GMRES (Generalised Minimal RESidual) builds an orthonormal Krylov
//! basis via Arnoldi iteration with modified Gram-Schmidt, then solves
//! the projected least-squares problem using Givens rotations on the
//! upper Hessenberg matrix.  When the basis reaches size `m` without
//! convergence the solver restarts from the current approximate
//! solution.
//!
//! A left-preconditioner is applied: instead of solving `A x = b`, we
//! solve `M⁻¹ A x = M⁻¹ b`.  Both the operator and the preconditioner
//! are supplied as closures, so the same routine serves the elliptic
//! field solve (assembled SOR preconditioner) and the Jacobian-free
//! Newton-Krylov stage solves.

use fusion_types::config::LinearSolverConfig;
use fusion_types::error::FusionResult;

use crate::vector::OdeVector;

// ───────────────────────────── configuration ─────────────────────────

/// Configuration for the GMRES(m) solver.
#[derive(Debug, Clone)]
pub struct GmresConfig {
    /// Krylov subspace dimension before restart (default: 30).
    pub restart: usize,
    /// Maximum number of outer (restart) iterations (default: 100).
    pub max_iter: usize,
    /// Convergence tolerance on the preconditioned residual, relative to
    /// its initial value (default: 1e-8).
    pub tol: f64,
    /// Absolute floor on the preconditioned residual (default: 0).
    pub atol: f64,
}

impl Default for GmresConfig {
    fn default() -> Self {
        GmresConfig {
            restart: 30,
            max_iter: 100,
            tol: 1e-8,
            atol: 0.0,
        }
    }
}

impl From<&LinearSolverConfig> for GmresConfig {
    fn from(c: &LinearSolverConfig) -> Self {
        GmresConfig {
            restart: c.restart,
            max_iter: c.max_iter,
            tol: c.tol,
            atol: 0.0,
        }
    }
}

/// Result of a GMRES solve.
#[derive(Debug, Clone)]
pub struct GmresResult {
    /// Total number of operator applications (inner iterations summed
    /// over all restarts).
    pub iterations: usize,
    /// Final preconditioned L2 residual norm.
    pub residual: f64,
    /// Whether convergence was achieved.
    pub converged: bool,
}

// ───────────────────── Givens rotation helpers ──────────────────────

/// A single Givens rotation storing (c, s) such that
/// ```text
/// | c  s | | a |   | r |
/// |-s  c | | b | = | 0 |
/// ```
#[derive(Clone, Copy)]
struct GivensRotation {
    c: f64,
    s: f64,
}

impl GivensRotation {
    /// Compute the rotation that zeroes `b` in (a, b).
    fn compute(a: f64, b: f64) -> Self {
        if b.abs() < 1e-300 {
            GivensRotation { c: 1.0, s: 0.0 }
        } else if b.abs() > a.abs() {
            let tau = -a / b;
            let s = 1.0 / (1.0 + tau * tau).sqrt();
            let c = s * tau;
            GivensRotation { c, s }
        } else {
            let tau = -b / a;
            let c = 1.0 / (1.0 + tau * tau).sqrt();
            let s = c * tau;
            GivensRotation { c, s }
        }
    }

    /// Apply this rotation to (a, b) in place.
    #[inline]
    fn apply(&self, a: &mut f64, b: &mut f64) {
        let ta = *a;
        let tb = *b;
        *a = self.c * ta - self.s * tb;
        *b = self.s * ta + self.c * tb;
    }
}

/// Rotate entries `i`, `i + 1` of a column-major Hessenberg column.
#[inline]
fn rotate_pair(rot: &GivensRotation, h: &mut [f64], a_ptr: usize, b_ptr: usize) {
    let mut ha = h[a_ptr];
    let mut hb = h[b_ptr];
    rot.apply(&mut ha, &mut hb);
    h[a_ptr] = ha;
    h[b_ptr] = hb;
}

/// `out = M⁻¹ (b - A x)`, using `scratch` for the unpreconditioned
/// residual.
fn preconditioned_residual<V, A, P>(
    apply: &mut A,
    precond: &mut P,
    b: &V,
    x: &V,
    scratch: &mut V,
    out: &mut V,
) -> FusionResult<()>
where
    V: OdeVector,
    A: FnMut(&V, &mut V) -> FusionResult<()>,
    P: FnMut(&V, &mut V) -> FusionResult<()>,
{
    apply(x, scratch)?;
    scratch.scale(-1.0);
    scratch.axpy(1.0, b);
    precond(scratch, out)
}

// ─────────────────────────── main solver ─────────────────────────────

/// Solve `A x = b` using restarted GMRES(m) with left preconditioner
/// `M⁻¹`.
///
/// `x` is the initial guess on entry and the solution on exit.
/// `apply(v, out)` writes `A v` into `out`; `precond(r, out)` writes an
/// approximation of `M⁻¹ r` into `out`.
///
/// # Algorithm
///
/// ```text
/// for each restart cycle:
///   z = M⁻¹ (b - A·x)             (preconditioned residual)
///   beta = ||z||₂
///   V[0] = z / beta
///   for j = 0 .. m-1:             (Arnoldi)
///     w = M⁻¹ A V[j]
///     for i = 0 .. j:             (modified Gram-Schmidt)
///       H[i,j] = <w, V[i]>
///       w -= H[i,j] V[i]
///     H[j+1,j] = ||w||₂
///     V[j+1]   = w / H[j+1,j]
///     apply previous Givens to H[:,j]
///     compute new Givens to zero H[j+1,j]
///     update residual norm estimate
///     if converged: break
///   solve upper triangular system for y
///   x += V · y
/// ```
pub fn gmres<V, A, P>(
    mut apply: A,
    mut precond: P,
    b: &V,
    x: &mut V,
    config: &GmresConfig,
) -> FusionResult<GmresResult>
where
    V: OdeVector,
    A: FnMut(&V, &mut V) -> FusionResult<()>,
    P: FnMut(&V, &mut V) -> FusionResult<()>,
{
    let n = b.len_dof();
    if n == 0 {
        return Ok(GmresResult {
            iterations: 0,
            residual: 0.0,
            converged: true,
        });
    }
    let m = config.restart.max(1).min(n);

    let mut scratch = b.clone();
    let mut z = b.clone();
    preconditioned_residual(&mut apply, &mut precond, b, x, &mut scratch, &mut z)?;
    let initial_res_norm = z.norm();
    if initial_res_norm < 1e-300 || initial_res_norm <= config.atol {
        return Ok(GmresResult {
            iterations: 0,
            residual: initial_res_norm,
            converged: true,
        });
    }
    let abs_tol = (config.tol * initial_res_norm).max(config.atol);

    let mut total_iters: usize = 0;
    let mut final_residual = initial_res_norm;

    // ───── outer restart loop ─────
    for restart in 0..config.max_iter.max(1) {
        if restart > 0 {
            preconditioned_residual(&mut apply, &mut precond, b, x, &mut scratch, &mut z)?;
        }
        let beta = z.norm();
        final_residual = beta;
        if beta < abs_tol || beta < 1e-300 {
            return Ok(GmresResult {
                iterations: total_iters,
                residual: beta,
                converged: true,
            });
        }

        let mut v_basis: Vec<V> = Vec::with_capacity(m + 1);
        {
            let mut v0 = z.clone();
            v0.scale(1.0 / beta);
            v_basis.push(v0);
        }

        // Upper Hessenberg matrix H[(m+1) x m] stored column-major
        // H[i][j] => h_store[j * (m+1) + i]
        let h_rows = m + 1;
        let mut h_store = vec![0.0; h_rows * m];
        let mut givens: Vec<GivensRotation> = Vec::with_capacity(m);
        let mut g = vec![0.0; m + 1];
        g[0] = beta;

        let mut converged_inner = false;
        let mut inner_iters: usize = 0;

        // ───── Arnoldi iteration ─────
        for j in 0..m {
            inner_iters = j + 1;
            total_iters += 1;

            apply(&v_basis[j], &mut scratch)?;
            let mut w = b.clone();
            precond(&scratch, &mut w)?;

            // Modified Gram-Schmidt orthogonalisation
            for (i, vi) in v_basis.iter().enumerate().take(j + 1) {
                let h_ij = w.dot(vi);
                h_store[j * h_rows + i] = h_ij;
                w.axpy(-h_ij, vi);
            }

            let h_jp1_j = w.norm();
            h_store[j * h_rows + (j + 1)] = h_jp1_j;

            if h_jp1_j > 1e-300 {
                w.scale(1.0 / h_jp1_j);
            } else {
                w.set_zero();
            }
            v_basis.push(w);

            for (i, rot) in givens.iter().enumerate() {
                rotate_pair(rot, &mut h_store, j * h_rows + i, j * h_rows + i + 1);
            }

            let rot =
                GivensRotation::compute(h_store[j * h_rows + j], h_store[j * h_rows + (j + 1)]);
            rotate_pair(&rot, &mut h_store, j * h_rows + j, j * h_rows + (j + 1));
            rotate_pair(&rot, &mut g, j, j + 1);
            givens.push(rot);

            let res_est = g[j + 1].abs();
            final_residual = res_est;
            if res_est < abs_tol {
                converged_inner = true;
                break;
            }

            // Happy breakdown: can't extend Krylov space
            if h_jp1_j < 1e-300 {
                converged_inner = true;
                break;
            }
        }

        // ───── solve the upper triangular system H y = g ─────
        let k = inner_iters;
        let mut y = vec![0.0; k];
        for i in (0..k).rev() {
            let mut sum = g[i];
            for jj in (i + 1)..k {
                sum -= h_store[jj * h_rows + i] * y[jj];
            }
            let diag = h_store[i * h_rows + i];
            y[i] = if diag.abs() > 1e-300 { sum / diag } else { 0.0 };
        }

        for (yi, vi) in y.iter().zip(v_basis.iter()) {
            x.axpy(*yi, vi);
        }

        if converged_inner {
            preconditioned_residual(&mut apply, &mut precond, b, x, &mut scratch, &mut z)?;
            return Ok(GmresResult {
                iterations: total_iters,
                residual: z.norm(),
                converged: true,
            });
        }
    }

    Ok(GmresResult {
        iterations: total_iters,
        residual: final_residual,
        converged: final_residual < abs_tol,
    })
}

// ═══════════════════════════════ tests ═══════════════════════════════
