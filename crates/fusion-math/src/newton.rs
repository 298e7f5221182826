// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Jacobian-Free Newton-Krylov
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Newton-Krylov solver for the implicit stage equations of the ARK
//! integrator,
//!
//! ```text
//! G(Z) = shift · Z − F(Z) − R = 0,
//! ```
//!
//! where `F` is the implicit operator evaluated at the stage time. Each
//! Newton correction is computed by GMRES on `J δ = −G(Z)` with
//! `J v = shift · v − F'(Z) v`. `F'(Z) v` comes from the system when it
//! provides an exact Jacobian action, otherwise from a one-sided finite
//! difference with step `eps = jfnk_epsilon / ‖v‖`.

use std::cell::RefCell;

use fusion_types::config::ArkConfig;
use fusion_types::error::{FusionError, FusionResult};
use fusion_types::state::SolverStats;

use crate::gmres::{gmres, GmresConfig};
use crate::vector::OdeVector;

/// Tells the operator whether it is computing a true residual or a
/// perturbed evaluation inside a Jacobian-vector product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFlag {
    Residual,
    JacobianApply,
}

/// Nonlinear function `F` of one implicit stage.
pub trait StageFunction<V: OdeVector> {
    fn evaluate(&mut self, z: &V, out: &mut V, flag: OpFlag) -> FusionResult<()>;

    /// Write `F'(z) v` into `out` and return `true`, or return `false`
    /// to fall back to finite differences.
    fn jacobian_apply(&mut self, _z: &V, _v: &V, _out: &mut V) -> FusionResult<bool> {
        Ok(false)
    }

    /// Approximate `(shift I − F')⁻¹ r`.
    fn precondition(&mut self, r: &V, out: &mut V, shift: f64) -> FusionResult<()> {
        out.copy_from(r);
        out.scale(1.0 / shift);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NewtonConfig {
    pub atol: f64,
    pub rtol: f64,
    pub max_iter: usize,
    pub jfnk_epsilon: f64,
    pub gmres: GmresConfig,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self::from(&ArkConfig::default())
    }
}

impl From<&ArkConfig> for NewtonConfig {
    fn from(c: &ArkConfig) -> Self {
        NewtonConfig {
            atol: c.newton.atol,
            rtol: c.newton.rtol,
            max_iter: c.newton.max_iter,
            jfnk_epsilon: c.jfnk_epsilon,
            gmres: GmresConfig::from(&c.gmres),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewtonKrylov {
    pub config: NewtonConfig,
    stats: SolverStats,
}

impl NewtonKrylov {
    pub fn new(config: NewtonConfig) -> FusionResult<Self> {
        if config.jfnk_epsilon <= 0.0 || !config.jfnk_epsilon.is_finite() {
            return Err(FusionError::ConfigError(format!(
                "jfnk_epsilon must be positive, got {}",
                config.jfnk_epsilon
            )));
        }
        if config.max_iter == 0 {
            return Err(FusionError::ConfigError(
                "Newton max_iter must be >= 1".to_string(),
            ));
        }
        Ok(NewtonKrylov {
            config,
            stats: SolverStats::default(),
        })
    }

    /// Counters accumulated over every solve so far.
    pub fn stats(&self) -> &SolverStats {
        &self.stats
    }

    /// `out = shift·z − F(z) − rhs`; `fz` receives `F(z)`.
    fn residual<V, F>(
        func: &mut F,
        shift: f64,
        z: &V,
        rhs: &V,
        fz: &mut V,
        out: &mut V,
    ) -> FusionResult<()>
    where
        V: OdeVector,
        F: StageFunction<V>,
    {
        func.evaluate(z, fz, OpFlag::Residual)?;
        out.copy_from(z);
        out.scale(shift);
        out.axpy(-1.0, fz);
        out.axpy(-1.0, rhs);
        Ok(())
    }

    /// Solve `shift·Z − F(Z) = rhs`. `z` holds the initial guess on entry.
    /// Returns the counters for this solve.
    pub fn solve<V, F>(&mut self, func: &mut F, shift: f64, z: &mut V, rhs: &V) -> FusionResult<SolverStats>
    where
        V: OdeVector,
        F: StageFunction<V>,
    {
        let mut local = SolverStats {
            solves: 1,
            ..SolverStats::default()
        };
        let mut fz = rhs.clone();
        let mut res = rhs.clone();
        Self::residual(func, shift, z, rhs, &mut fz, &mut res)?;
        let res0 = res.norm();
        let target = self.config.atol + self.config.rtol * res0;
        let mut res_norm = res0;

        let mut delta = rhs.clone();
        let mut neg_res = rhs.clone();
        let eps_base = self.config.jfnk_epsilon;

        for iter in 0..self.config.max_iter {
            if res_norm <= target {
                break;
            }
            local.nonlinear_iterations += 1;

            neg_res.copy_from(&res);
            neg_res.scale(-1.0);
            delta.set_zero();
            {
                let cell = RefCell::new(&mut *func);
                let z_cur: &V = z;
                let fz_cur: &V = &fz;
                let apply = |v: &V, out: &mut V| -> FusionResult<()> {
                    let mut f = cell.borrow_mut();
                    if !f.jacobian_apply(z_cur, v, out)? {
                        let vn = v.norm();
                        if vn < 1e-300 {
                            out.set_zero();
                            return Ok(());
                        }
                        let eps = eps_base / vn;
                        let mut zp = z_cur.clone();
                        zp.axpy(eps, v);
                        f.evaluate(&zp, out, OpFlag::JacobianApply)?;
                        out.axpy(-1.0, fz_cur);
                        out.scale(1.0 / eps);
                    }
                    // out = F'(z) v  →  J v = shift v − F'(z) v
                    out.scale(-1.0);
                    out.axpy(shift, v);
                    Ok(())
                };
                let precond = |r: &V, out: &mut V| -> FusionResult<()> {
                    cell.borrow_mut().precondition(r, out, shift)
                };
                let lin = gmres(apply, precond, &neg_res, &mut delta, &self.config.gmres)?;
                local.linear_iterations += lin.iterations;
                if !lin.converged {
                    log::debug!(
                        "Newton iteration {iter}: GMRES stopped at residual {:.3e} after {} iterations",
                        lin.residual,
                        lin.iterations
                    );
                }
            }

            z.axpy(1.0, &delta);
            Self::residual(func, shift, z, rhs, &mut fz, &mut res)?;
            res_norm = res.norm();
            if !res_norm.is_finite() {
                self.stats.merge(&local);
                return Err(FusionError::SolverDiverged {
                    iteration: iter + 1,
                    message: "Newton residual is not finite".to_string(),
                });
            }
        }

        self.stats.merge(&local);
        if res_norm > target {
            return Err(FusionError::SolverDiverged {
                iteration: local.nonlinear_iterations,
                message: format!(
                    "Newton residual {res_norm:.3e} above tolerance {target:.3e} (initial {res0:.3e})"
                ),
            });
        }
        Ok(local)
    }
}
