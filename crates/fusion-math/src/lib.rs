//! Numerical building blocks for SCPN Fusion Core: Krylov and Newton
//! solvers, sparse relaxation, interpolation, and the IMEX additive
//! Runge-Kutta integrator.

pub mod ark;
pub mod gmres;
pub mod interp;
pub mod newton;
pub mod sor;
pub mod tableau;
pub mod vector;
