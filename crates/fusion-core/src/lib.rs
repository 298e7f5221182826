//! Gyrokinetic core: multiblock mapped-grid geometry, elliptic field
//! solve and the operator split driven by the IMEX ARK integrator.
//!
//! Layer 1: decomposition, block arrays, coordinate systems, geometry
//! Layer 2: grid functions, potential BCs, field solver
//! Layer 3: phase space, species, physics operators, GKOps, driver

pub mod bfield;
pub mod block_array;
pub mod collisions;
pub mod coord_sys;
pub mod field_solver;
pub mod fluid;
pub mod geometry;
pub mod gkops;
pub mod grid_function;
pub mod history;
pub mod mpi_domain;
pub mod neutrals;
pub mod operators;
pub mod phase_geom;
pub mod potential_bc;
pub mod simulation;
pub mod species;
pub mod transport;
pub mod vlasov;
