//! Piecewise-linear interpolation on tabulated data.
//!
//! `interp1d` handles flux-surface profiles (monotone abscissa in either
//! direction); `bilinear_unit` evaluates node tables laid out on the
//! unit square of a block's mapped coordinates.

use fusion_types::error::{FusionError, FusionResult};
use ndarray::Array2;

/// Linear interpolation of `ys(xs)` at `x`, clamped to the end values.
///
/// `xs` must be strictly monotone, increasing or decreasing.
pub fn interp1d(xs: &[f64], ys: &[f64], x: f64) -> FusionResult<f64> {
    let n = xs.len();
    if n == 0 || n != ys.len() {
        return Err(FusionError::LinAlg(format!(
            "interp1d needs matching non-empty tables, got {} and {}",
            n,
            ys.len()
        )));
    }
    if n == 1 {
        return Ok(ys[0]);
    }
    let increasing = xs[n - 1] > xs[0];
    let monotone = xs
        .windows(2)
        .all(|w| if increasing { w[1] > w[0] } else { w[1] < w[0] });
    if !monotone {
        return Err(FusionError::LinAlg(
            "interp1d abscissa must be strictly monotone".to_string(),
        ));
    }

    // Work on an increasing view.
    let key = |k: usize| if increasing { xs[k] } else { -xs[n - 1 - k] };
    let val = |k: usize| if increasing { ys[k] } else { ys[n - 1 - k] };
    let xq = if increasing { x } else { -x };

    if xq <= key(0) {
        return Ok(val(0));
    }
    if xq >= key(n - 1) {
        return Ok(val(n - 1));
    }
    // Binary search for the bracketing interval.
    let (mut lo, mut hi) = (0usize, n - 1);
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        if key(mid) <= xq {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let t = (xq - key(lo)) / (key(hi) - key(lo));
    Ok((1.0 - t) * val(lo) + t * val(hi))
}

/// Bilinear interpolation of node values `nodes[[i, j]]` located at
/// `(i / (n0 - 1), j / (n1 - 1))` on the unit square. Returns the value
/// and its derivatives with respect to the two unit coordinates.
///
/// Positions outside the square are clamped.
pub fn bilinear_unit(nodes: &Array2<f64>, s0: f64, s1: f64) -> (f64, [f64; 2]) {
    let (n0, n1) = nodes.dim();
    let m0 = (n0.max(2) - 1) as f64;
    let m1 = (n1.max(2) - 1) as f64;
    let f0 = s0.clamp(0.0, 1.0) * m0;
    let f1 = s1.clamp(0.0, 1.0) * m1;

    let i0 = (f0.floor() as usize).min(n0.saturating_sub(2));
    let j0 = (f1.floor() as usize).min(n1.saturating_sub(2));
    let i1 = (i0 + 1).min(n0 - 1);
    let j1 = (j0 + 1).min(n1 - 1);
    let t0 = (f0 - i0 as f64).clamp(0.0, 1.0);
    let t1 = (f1 - j0 as f64).clamp(0.0, 1.0);

    let v00 = nodes[[i0, j0]];
    let v10 = nodes[[i1, j0]];
    let v01 = nodes[[i0, j1]];
    let v11 = nodes[[i1, j1]];

    let value = (1.0 - t0) * ((1.0 - t1) * v00 + t1 * v01) + t0 * ((1.0 - t1) * v10 + t1 * v11);
    let d0 = ((1.0 - t1) * (v10 - v00) + t1 * (v11 - v01)) * m0;
    let d1 = ((1.0 - t0) * (v01 - v00) + t0 * (v11 - v10)) * m1;
    (value, [d0, d1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interp1d_increasing() {
        let xs = [0.0, 1.0, 2.0, 4.0];
        let ys = [0.0, 10.0, 20.0, 40.0];
        assert!((interp1d(&xs, &ys, 3.0).expect("interp") - 30.0).abs() < 1e-12);
        assert_eq!(interp1d(&xs, &ys, -1.0).expect("clamp lo"), 0.0);
        assert_eq!(interp1d(&xs, &ys, 9.0).expect("clamp hi"), 40.0);
    }

    #[test]
    fn test_interp1d_decreasing() {
        let xs = [4.0, 2.0, 1.0];
        let ys = [-4.0, -2.0, -1.0];
        assert!((interp1d(&xs, &ys, 1.5).expect("interp") + 1.5).abs() < 1e-12);
        assert_eq!(interp1d(&xs, &ys, 5.0).expect("clamp"), -4.0);
    }

    #[test]
    fn test_interp1d_rejects_non_monotone() {
        assert!(interp1d(&[0.0, 2.0, 1.0], &[0.0, 1.0, 2.0], 0.5).is_err());
        assert!(interp1d(&[0.0, 1.0], &[0.0], 0.5).is_err());
    }

    #[test]
    fn test_bilinear_exact_for_bilinear_data() {
        // f = 1 + 2 s0 + 3 s1 + 4 s0 s1 on a 5 x 4 node table
        let nodes = Array2::from_shape_fn((5, 4), |(i, j)| {
            let s0 = i as f64 / 4.0;
            let s1 = j as f64 / 3.0;
            1.0 + 2.0 * s0 + 3.0 * s1 + 4.0 * s0 * s1
        });
        let (s0, s1) = (0.3, 0.55);
        let (v, d) = bilinear_unit(&nodes, s0, s1);
        // Piecewise bilinear reproduces the global bilinear exactly.
        assert!((v - (1.0 + 2.0 * s0 + 3.0 * s1 + 4.0 * s0 * s1)).abs() < 1e-12);
        assert!((d[0] - (2.0 + 4.0 * s1)).abs() < 1e-12);
        assert!((d[1] - (3.0 + 4.0 * s0)).abs() < 1e-12);
    }

    #[test]
    fn test_bilinear_corner_nodes() {
        let nodes = Array2::from_shape_fn((3, 3), |(i, j)| (10 * i + j) as f64);
        assert_eq!(bilinear_unit(&nodes, 0.0, 0.0).0, 0.0);
        assert_eq!(bilinear_unit(&nodes, 1.0, 1.0).0, 22.0);
        assert_eq!(bilinear_unit(&nodes, 2.0, -1.0).0, 20.0);
    }
}
