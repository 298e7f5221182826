// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — IMEX Additive Runge-Kutta Integrator
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Additive Runge-Kutta time integration of `dY/dt = E(t, Y) + I(t, Y)`
//! with `E` treated explicitly and `I` diagonally implicitly.
//!
//! Stage `i`:
//!
//! ```text
//! Y_i = Y_n + dt Σ_{j<i} (Ae[i][j] E_j + Ai[i][j] I_j)        (explicit part)
//! if Ai[i][i] ≠ 0:  solve  Z/(Ai[i][i] dt) − I(t_i, Z) = Y_i/(Ai[i][i] dt),  Y_i = Z
//! post_time_stage(Y_i);  E_i = E(t_i, Y_i);  I_i = I(t_i, Y_i)
//! ```
//!
//! and `Y_{n+1} = Y_n + dt Σ_i (be[i] E_i + bi[i] I_i)`.
//!
//! Only methods whose first stage is explicit are accepted: the first
//! committed stage must be `Y_n` itself, which the field/boundary update
//! in `post_time_stage` relies on.

use fusion_types::config::ArkConfig;
use fusion_types::error::{FusionError, FusionResult};
use fusion_types::state::SolverStats;

use crate::newton::{NewtonConfig, NewtonKrylov, OpFlag, StageFunction};
use crate::tableau::ButcherTableau;
use crate::vector::OdeVector;

/// System integrated by [`ArkIntegrator`].
pub trait ImexSystem<V: OdeVector> {
    /// Explicit (non-stiff) tendency `E(time, state)`.
    fn explicit_op(&mut self, rhs: &mut V, time: f64, state: &V, stage: usize) -> FusionResult<()>;

    /// Implicit (stiff) tendency `I(time, state)`.
    fn implicit_op(
        &mut self,
        rhs: &mut V,
        time: f64,
        state: &V,
        stage: usize,
        flag: OpFlag,
    ) -> FusionResult<()>;

    /// Hook run on every committed stage value before its tendencies are
    /// evaluated.
    fn post_time_stage(&mut self, step: usize, time: f64, state: &mut V, stage: usize) -> FusionResult<()>;

    /// Exact action of `∂I/∂Y` at `state` on `v`. Return `false` to let
    /// the Newton solver difference `implicit_op` instead.
    fn implicit_jacobian_apply(
        &mut self,
        _time: f64,
        _state: &V,
        _v: &V,
        _out: &mut V,
        _stage: usize,
    ) -> FusionResult<bool> {
        Ok(false)
    }

    /// Approximate `(shift − ∂I/∂Y)⁻¹ r`.
    fn precondition(&mut self, r: &V, out: &mut V, shift: f64, _time: f64, _stage: usize) -> FusionResult<()> {
        out.copy_from(r);
        out.scale(1.0 / shift);
        Ok(())
    }
}

/// Binds a system to one stage so Newton sees `F(Z) = I(t_i, Z)`.
struct StageBinding<'a, S> {
    system: &'a mut S,
    time: f64,
    stage: usize,
}

impl<'a, V, S> StageFunction<V> for StageBinding<'a, S>
where
    V: OdeVector,
    S: ImexSystem<V>,
{
    fn evaluate(&mut self, z: &V, out: &mut V, flag: OpFlag) -> FusionResult<()> {
        self.system.implicit_op(out, self.time, z, self.stage, flag)
    }

    fn jacobian_apply(&mut self, z: &V, v: &V, out: &mut V) -> FusionResult<bool> {
        self.system
            .implicit_jacobian_apply(self.time, z, v, out, self.stage)
    }

    fn precondition(&mut self, r: &V, out: &mut V, shift: f64) -> FusionResult<()> {
        self.system.precondition(r, out, shift, self.time, self.stage)
    }
}

pub struct ArkIntegrator<V: OdeVector> {
    tableau: ButcherTableau,
    newton: NewtonKrylov,
    stage_predictor: bool,
    dt: f64,
    time: f64,
    cur_step: usize,
    rhs_exp: Vec<V>,
    rhs_imp: Vec<V>,
    rhs_exp_prev: Vec<V>,
    rhs_imp_prev: Vec<V>,
    y_prev: Option<V>,
    y_stage: V,
    z: V,
    r: V,
}

impl<V: OdeVector> ArkIntegrator<V> {
    /// Allocate stage storage shaped like `template`.
    pub fn new(config: &ArkConfig, template: &V, time: f64, dt: f64) -> FusionResult<Self> {
        let tableau = ButcherTableau::by_name(&config.name)?;
        Self::with_tableau(tableau, config, template, time, dt)
    }

    pub fn with_tableau(
        tableau: ButcherTableau,
        config: &ArkConfig,
        template: &V,
        time: f64,
        dt: f64,
    ) -> FusionResult<Self> {
        if !tableau.explicit_first_stage() {
            return Err(FusionError::Unsupported(format!(
                "ARK method '{}' has an implicit first stage",
                tableau.name
            )));
        }
        let mut stage_predictor = config.stage_predictor;
        if stage_predictor && !tableau.has_dense_output() {
            log::warn!(
                "ARK method \"{}\" does not have dense output; stage predictor disabled",
                tableau.name
            );
            stage_predictor = false;
        }
        let newton = NewtonKrylov::new(NewtonConfig::from(config))?;
        let s = tableau.stages;
        let zero = {
            let mut v = template.clone();
            v.set_zero();
            v
        };
        let prev = if stage_predictor { s } else { 0 };
        log::info!("Time integration method: ark ({})", tableau.name);
        Ok(ArkIntegrator {
            newton,
            stage_predictor,
            dt,
            time,
            cur_step: 0,
            rhs_exp: vec![zero.clone(); s],
            rhs_imp: vec![zero.clone(); s],
            rhs_exp_prev: vec![zero.clone(); prev],
            rhs_imp_prev: vec![zero.clone(); prev],
            y_prev: None,
            y_stage: zero.clone(),
            z: zero.clone(),
            r: zero,
            tableau,
        })
    }

    pub fn tableau(&self) -> &ButcherTableau {
        &self.tableau
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn step(&self) -> usize {
        self.cur_step
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn set_dt(&mut self, dt: f64) {
        self.dt = dt;
    }

    pub fn stage_predictor(&self) -> bool {
        self.stage_predictor
    }

    /// Re-synchronise after a restart. Dense-output history is dropped.
    pub fn reset_time(&mut self, time: f64, step: usize) {
        self.time = time;
        self.cur_step = step;
        self.y_prev = None;
    }

    pub fn newton_stats(&self) -> &SolverStats {
        self.newton.stats()
    }

    /// Predict the stage value at `1 + c` step lengths past the previous
    /// step start from its dense output.
    fn extrapolate(&mut self, c: f64) -> bool {
        let y_prev = match &self.y_prev {
            Some(y) => y,
            None => return false,
        };
        let p = self.tableau.pinterp;
        let t = 1.0 + c;
        self.z.copy_from(y_prev);
        for i in 0..self.tableau.stages {
            let mut bt = 0.0;
            let mut b = 0.0;
            let mut tt = t;
            for j in 0..p {
                bt += self.dt * self.tableau.binterpi[i * p + j] * tt;
                b += self.dt * self.tableau.binterpe[i * p + j] * tt;
                tt *= t;
            }
            self.z.axpy(bt, &self.rhs_imp_prev[i]);
            self.z.axpy(b, &self.rhs_exp_prev[i]);
        }
        true
    }

    /// Take one step of size `dt()` from `time()`, overwriting `y`.
    pub fn advance<S: ImexSystem<V>>(&mut self, system: &mut S, y: &mut V) -> FusionResult<SolverStats> {
        let s = self.tableau.stages;
        let dt = self.dt;
        let mut stats = SolverStats::default();
        self.z.copy_from(y);

        for i in 0..s {
            self.y_stage.copy_from(y);
            for j in 0..i {
                self.y_stage.axpy(dt * self.tableau.ae(i, j), &self.rhs_exp[j]);
                self.y_stage.axpy(dt * self.tableau.ai(i, j), &self.rhs_imp[j]);
            }
            let stage_time = self.time + self.tableau.ce[i] * dt;

            let diag = self.tableau.ai(i, i);
            if diag != 0.0 {
                let shift = 1.0 / (diag * dt);
                self.r.copy_from(&self.y_stage);
                self.r.scale(shift);
                // Initial guess: y_n at the first implicit stage, the
                // previous stage solution afterwards, unless predicted.
                if self.stage_predictor && self.cur_step > 0 {
                    self.extrapolate(self.tableau.ce[i]);
                }
                let mut binding = StageBinding {
                    system: &mut *system,
                    time: stage_time,
                    stage: i,
                };
                let solve = self.newton.solve(&mut binding, shift, &mut self.z, &self.r);
                match solve {
                    Ok(st) => stats.merge(&st),
                    Err(FusionError::SolverDiverged { iteration, message }) => {
                        return Err(FusionError::SolverDiverged {
                            iteration,
                            message: format!(
                                "step {} stage {} (t = {:.6e}): {}",
                                self.cur_step, i, stage_time, message
                            ),
                        });
                    }
                    Err(e) => return Err(e),
                }
                self.y_stage.copy_from(&self.z);
            }

            system.post_time_stage(self.cur_step, stage_time, &mut self.y_stage, i)?;
            system.explicit_op(&mut self.rhs_exp[i], stage_time, &self.y_stage, i)?;
            system.implicit_op(
                &mut self.rhs_imp[i],
                stage_time,
                &self.y_stage,
                i,
                OpFlag::Residual,
            )?;
        }

        if self.stage_predictor {
            match &mut self.y_prev {
                Some(prev) => prev.copy_from(y),
                None => self.y_prev = Some(y.clone()),
            }
            for i in 0..s {
                self.rhs_exp_prev[i].copy_from(&self.rhs_exp[i]);
                self.rhs_imp_prev[i].copy_from(&self.rhs_imp[i]);
            }
        }

        for i in 0..s {
            y.axpy(dt * self.tableau.be[i], &self.rhs_exp[i]);
            y.axpy(dt * self.tableau.bi[i], &self.rhs_imp[i]);
        }

        self.cur_step += 1;
        self.time += dt;
        Ok(stats)
    }
}
