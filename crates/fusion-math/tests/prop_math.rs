// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Property-Based Tests (proptest) for fusion-math
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Property-based tests for fusion-math using proptest.
//!
//! Covers: GMRES on diagonally dominant systems, SOR relaxation,
//! interpolation, tableau consistency, ARK linear-decay accuracy.

use fusion_math::ark::{ArkIntegrator, ImexSystem};
use fusion_math::gmres::{gmres, GmresConfig};
use fusion_math::interp::{bilinear_unit, interp1d};
use fusion_math::newton::OpFlag;
use fusion_math::sor::{sor_residual, sor_solve, CsrMatrix};
use fusion_math::tableau::ButcherTableau;
use fusion_math::vector::OdeVector;
use fusion_types::config::ArkConfig;
use fusion_types::error::FusionResult;
use ndarray::Array2;
use proptest::prelude::*;

/// Tridiagonal, diagonally dominant test matrix.
fn tridiag(n: usize, off: f64) -> CsrMatrix {
    let mut t = Vec::new();
    for i in 0..n {
        t.push((i, i, 2.0));
        if i > 0 {
            t.push((i, i - 1, off));
        }
        if i + 1 < n {
            t.push((i, i + 1, off));
        }
    }
    CsrMatrix::from_triplets(n, &t).expect("assemble")
}

// ── GMRES Properties ─────────────────────────────────────────────────

proptest! {
    /// GMRES solves any diagonally dominant tridiagonal system.
    #[test]
    fn gmres_solves_dominant_systems(n in 3usize..40, off in -0.9f64..0.9) {
        let a = tridiag(n, off);
        let b: Vec<f64> = (0..n).map(|i| (i as f64 + 1.0).sin()).collect();
        let mut x = vec![0.0; n];
        let apply = |v: &Vec<f64>, out: &mut Vec<f64>| -> FusionResult<()> {
            a.matvec(v, out);
            Ok(())
        };
        let ident = |r: &Vec<f64>, out: &mut Vec<f64>| -> FusionResult<()> {
            out.copy_from(r);
            Ok(())
        };
        let cfg = GmresConfig { restart: 40, max_iter: 5, tol: 1e-12, atol: 0.0 };
        let res = gmres(apply, ident, &b, &mut x, &cfg).expect("gmres");
        prop_assert!(res.converged);
        prop_assert!(sor_residual(&a, &b, &x) < 1e-9);
    }
}

// ── SOR Properties ───────────────────────────────────────────────────

proptest! {
    /// Relaxation never increases the residual of a dominant system.
    #[test]
    fn sor_residual_decreases(n in 4usize..40, omega in 0.5f64..1.5) {
        let a = tridiag(n, -0.5);
        let b = vec![1.0; n];
        let mut x = vec![0.0; n];
        let r0 = sor_residual(&a, &b, &x);
        sor_solve(&a, &b, &mut x, omega, 20);
        let r1 = sor_residual(&a, &b, &x);
        prop_assert!(r1 < r0, "{} -> {}", r0, r1);
        prop_assert!(x.iter().all(|v| v.is_finite()));
    }
}

// ── Interpolation Properties ─────────────────────────────────────────

proptest! {
    /// Linear data is reproduced exactly inside the table.
    #[test]
    fn interp1d_linear_exact(
        slope in -5.0f64..5.0,
        offset in -5.0f64..5.0,
        x in 0.0f64..10.0,
    ) {
        let xs: Vec<f64> = (0..11).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|v| slope * v + offset).collect();
        let y = interp1d(&xs, &ys, x).expect("interp");
        prop_assert!((y - (slope * x + offset)).abs() < 1e-10);
    }

    /// Constant node tables interpolate to the constant with zero gradient.
    #[test]
    fn bilinear_constant(c in -10.0f64..10.0, s0 in 0.0f64..1.0, s1 in 0.0f64..1.0) {
        let nodes = Array2::from_elem((6, 5), c);
        let (v, d) = bilinear_unit(&nodes, s0, s1);
        prop_assert!((v - c).abs() < 1e-12);
        prop_assert!(d[0].abs() < 1e-10 && d[1].abs() < 1e-10);
    }
}

// ── Tableau Properties ───────────────────────────────────────────────

#[test]
fn tableau_implicit_part_is_lower_triangular() {
    for name in ["1bee", "2a", "2c", "2e", "prssp2", "3", "4", "5", "rk4"] {
        let t = ButcherTableau::by_name(name).expect("tableau");
        for i in 0..t.stages {
            for j in (i + 1)..t.stages {
                assert_eq!(t.ai(i, j), 0.0, "{name}: Ai[{i}][{j}]");
            }
            for j in i..t.stages {
                assert_eq!(t.ae(i, j), 0.0, "{name}: Ae[{i}][{j}]");
            }
        }
    }
}

// ── ARK Properties ───────────────────────────────────────────────────

struct Decay {
    explicit_rate: f64,
    implicit_rate: f64,
}

impl ImexSystem<Vec<f64>> for Decay {
    fn explicit_op(&mut self, rhs: &mut Vec<f64>, _t: f64, y: &Vec<f64>, _s: usize) -> FusionResult<()> {
        rhs.copy_from(y);
        rhs.scale(self.explicit_rate);
        Ok(())
    }

    fn implicit_op(
        &mut self,
        rhs: &mut Vec<f64>,
        _t: f64,
        y: &Vec<f64>,
        _s: usize,
        _flag: OpFlag,
    ) -> FusionResult<()> {
        rhs.copy_from(y);
        rhs.scale(self.implicit_rate);
        Ok(())
    }

    fn post_time_stage(&mut self, _step: usize, _t: f64, _y: &mut Vec<f64>, _s: usize) -> FusionResult<()> {
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// ARK4 tracks exp((a + b) t) for moderate rates.
    #[test]
    fn ark4_linear_decay(a in -1.0f64..0.0, b in -5.0f64..0.0) {
        let mut sys = Decay { explicit_rate: a, implicit_rate: b };
        let mut y = vec![1.0, -2.0];
        let mut ark = ArkIntegrator::new(&ArkConfig::default(), &y, 0.0, 0.05).expect("ark");
        for _ in 0..20 {
            ark.advance(&mut sys, &mut y).expect("advance");
        }
        let exact = (a + b).exp();
        prop_assert!((y[0] - exact).abs() < 1e-4 * (1.0 + exact), "{} vs {}", y[0], exact);
        prop_assert!((y[1] + 2.0 * exact).abs() < 2e-4 * (1.0 + exact));
    }
}
