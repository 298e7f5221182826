// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Solver Vector Interface
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Vector-space operations required by the Krylov, Newton and ARK
//! layers. Any state type that implements [`OdeVector`] can be
//! integrated; `Vec<f64>` is provided for tests and small systems.

/// Linear-algebra view of an evolved state.
///
/// `clone` must produce an independent vector with the same layout, so
/// that the integrator can allocate stage storage from a template.
pub trait OdeVector: Clone {
    /// `self = other`. Layouts must match.
    fn copy_from(&mut self, other: &Self);

    /// `self += a * x`.
    fn axpy(&mut self, a: f64, x: &Self);

    /// `self *= a`.
    fn scale(&mut self, a: f64);

    fn set_zero(&mut self) {
        self.scale(0.0);
    }

    /// Euclidean inner product over all degrees of freedom.
    fn dot(&self, other: &Self) -> f64;

    fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Number of scalar unknowns.
    fn len_dof(&self) -> usize;
}

impl OdeVector for Vec<f64> {
    fn copy_from(&mut self, other: &Self) {
        self.copy_from_slice(other);
    }

    #[inline]
    fn axpy(&mut self, a: f64, x: &Self) {
        vec_axpy(a, x, self);
    }

    fn scale(&mut self, a: f64) {
        for v in self.iter_mut() {
            *v *= a;
        }
    }

    fn set_zero(&mut self) {
        self.iter_mut().for_each(|v| *v = 0.0);
    }

    #[inline]
    fn dot(&self, other: &Self) -> f64 {
        vec_dot(self, other)
    }

    fn len_dof(&self) -> usize {
        self.len()
    }
}

// ───────────────────────── BLAS-like helpers ─────────────────────────

/// Euclidean (L2) norm of a slice.
#[inline]
pub fn vec_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Dot product.
#[inline]
pub fn vec_dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// `y = y + alpha * x` (axpy).
#[inline]
pub fn vec_axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    for (yi, &xi) in y.iter_mut().zip(x.iter()) {
        *yi += alpha * xi;
    }
}

/// `out = a - b`.
#[inline]
pub fn vec_sub(a: &[f64], b: &[f64], out: &mut [f64]) {
    for ((oi, &ai), &bi) in out.iter_mut().zip(a.iter()).zip(b.iter()) {
        *oi = ai - bi;
    }
}
