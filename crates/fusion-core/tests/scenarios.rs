// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — End-to-End Scenarios
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Whole-run scenarios through the public API.

use std::path::Path;
use std::sync::Arc;

use fusion_core::block_array::{connect, BlockInfo, BlockLayout, ComponentKind, IndexTransform, LevelData};
use fusion_core::field_solver::FieldSolver;
use fusion_core::geometry::MultiblockGeometry;
use fusion_core::gkops::{physical_species, GkOps};
use fusion_core::potential_bc::{BcSpec, PotentialBc};
use fusion_core::simulation::Simulation;
use fusion_core::species::GkState;
use fusion_types::config::{
    BcSpecConfig, DiscretizationConfig, FieldModel, FieldSolverConfig, GeometryConfig, PotentialBcConfig,
    SimulationConfig, SlabConfig,
};
use fusion_types::constants::ReferenceUnits;
use fusion_types::state::{Side, RADIAL_DIR};

fn slab_deck(dir: &Path, ark: &str, gksystem: &str, species_extra: &str, extra: &str, density: &str) -> SimulationConfig {
    let json = format!(
        r#"{{
            "simulation": {{ "max_step": 3, "fixed_dt": 0.01, "output_dir": "{}" }},
            "gksystem": {{ {gksystem} }},
            "ark": {{ "name": "{ark}" }},
            "geometry": {{
                "kind": "slab", "cells": [8, 8], "xmax": 1.0, "ymax": 1.0,
                "bz_inner": 3.0, "bz_outer": 3.0, "by_inner": 0.2
            }},
            "field_solver": {{ "model": "poisson" }},
            "species": [{{
                "name": "hydrogen", "mass": 1.0, "charge": 1.0,
                "velocity": {{ "n_vpar": 8, "n_mu": 2, "vpar_max": 3.0, "mu_max": 1.0 }},
                "density": {density},
                "temperature": {{ "type": "constant", "value": 1.0 }}
                {species_extra}
            }}],
            "potential_bc": [
                {{ "boundary": "radial_inner", "type": "dirichlet", "value": 0.0 }},
                {{ "boundary": "radial_outer", "type": "dirichlet", "value": 0.0 }}
            ]
            {extra}
        }}"#,
        dir.display()
    );
    SimulationConfig::from_json(&json).expect("deck")
}

const UNIFORM: &str = r#"{ "type": "constant", "value": 1.0 }"#;

fn total_density(state: &GkState) -> f64 {
    let s = &state.kinetic[0];
    let layout = s.phase().geometry().layout();
    let mut n = LevelData::new(layout, 1, ComponentKind::Scalar);
    physical_species(s).number_density(&mut n).expect("moment");
    n.sum_valid(0)
}

#[test]
fn slab_maxwellian_is_stationary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut sim = Simulation::new(slab_deck(dir.path(), "rk4", "", "", "", UNIFORM)).expect("setup");
    let initial = sim.state().clone();
    sim.run().expect("run");
    assert_eq!(sim.step(), 3);
    let a = initial.kinetic[0].dfn();
    let b = sim.state().kinetic[0].dfn();
    let scale = a.max_abs();
    for k in 0..a.num_patches() {
        for (x, y) in a.valid_view(k).iter().zip(b.valid_view(k).iter()) {
            assert!((x - y).abs() <= 1e-8 * scale, "{x} vs {y}");
        }
    }
}

#[test]
fn consistent_bcs_hold_without_radial_current() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = slab_deck(dir.path(), "rk4", r#""consistent_potential_bcs": true"#, "", "", UNIFORM);
    let mut sim = Simulation::new(cfg).expect("setup");
    let before = sim.ops().er_boundary();
    sim.run().expect("run");
    let after = sim.ops().er_boundary();
    assert!((after.0 - before.0).abs() < 1e-9 && (after.1 - before.1).abs() < 1e-9);
    assert!(sim.ops().context().gkp.values.iter().all(|g| (g - 1.0).abs() < 1e-10));
}

#[test]
fn consistent_bcs_follow_radial_current_over_steps() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = slab_deck(
        dir.path(),
        "rk4",
        r#""consistent_potential_bcs": true"#,
        "",
        "",
        r#"{ "type": "cosine", "constant": 1.0, "amplitude": 0.2, "mode": [1.0, 1.0] }"#,
    );
    cfg.potential_bc[0].spec = BcSpecConfig::Neumann { value: 0.25 };
    let mut sim = Simulation::new(cfg).expect("setup");
    assert_eq!(sim.ops().er_boundary(), (0.0, 0.0));

    for _ in 0..3 {
        let (lo0, hi0) = sim.ops().er_boundary();
        let summary = sim.advance().expect("step");
        let ops = sim.ops();
        // The update at the last stage uses that stage's current over the
        // whole step.
        let flux = ops
            .geometry()
            .compute_radial_fs_average(&ops.context().radial_flux, 0)
            .expect("average");
        let gkp = &ops.context().gkp;
        let (lo, hi) = ops.er_boundary();
        assert_eq!((summary.er_lo, summary.er_hi), (lo, hi));
        let expect_lo = lo0 - summary.dt * flux.lo() / gkp.lo();
        let expect_hi = hi0 - summary.dt * flux.hi() / gkp.hi();
        assert!((lo - expect_lo).abs() <= 1e-12 * (1.0 + lo.abs()), "{lo} vs {expect_lo}");
        assert!((hi - expect_hi).abs() <= 1e-12 * (1.0 + hi.abs()), "{hi} vs {expect_hi}");
        match ops.boundary_conditions().spec(0, RADIAL_DIR, Side::Lo).expect("inner") {
            BcSpec::Neumann(v) => assert_eq!(*v, lo),
            other => panic!("unexpected inner condition {other:?}"),
        }
        match ops.boundary_conditions().spec(0, RADIAL_DIR, Side::Hi).expect("outer") {
            BcSpec::DirichletValue(v) => assert_eq!(*v, -hi),
            other => panic!("unexpected outer condition {other:?}"),
        }
    }
    let (lo, _) = sim.ops().er_boundary();
    assert!(lo.is_finite() && lo != 0.0, "inner Er did not move: {lo}");
}

#[test]
fn imex_collisional_run_conserves_particles() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = slab_deck(
        dir.path(),
        "4",
        r#""transport_model_on": true"#,
        r#", "collisions": { "model": "krook", "frequency": 5.0 }"#,
        r#", "transport": { "model": "anomalous", "diffusivity": 0.01 }"#,
        r#"{ "type": "cosine", "constant": 1.0, "amplitude": 0.1, "mode": [1.0, 0.0] }"#,
    );
    let mut sim = Simulation::new(cfg).expect("setup");
    assert!(sim.ops().is_imex());
    let before = total_density(sim.state());
    sim.run().expect("run");
    let after = total_density(sim.state());
    assert!((after - before).abs() <= 1e-8 * before, "{before} -> {after}");
}

#[test]
fn rotated_two_block_seam_reads_back_uniform() {
    let n = 6usize;
    let mut blocks = vec![BlockInfo::new(n, n), BlockInfo::new(n, n)];
    // Block 1 continues block 0 radially, its axes rotated by 90 degrees;
    // block 0 is periodic poloidally.
    let rot = IndexTransform::new([1, 0], [1, 1], [0, -(n as i64)]).expect("transform");
    connect(&mut blocks, 0, 0, Side::Hi, 1, rot).expect("seam");
    connect(&mut blocks, 0, 1, Side::Hi, 0, IndexTransform::shift([0, -(n as i64)])).expect("periodic");
    let layout = BlockLayout::new(blocks, [1, 2], 2).expect("layout");

    let mut u = LevelData::new(&layout, 1, ComponentKind::Scalar);
    for b in 0..2 {
        for (i, j) in layout.block(b).domain.cells() {
            u.set(b, i, j, 0, 2.5).expect("set");
        }
    }
    u.fill_internal_ghosts();
    let once: Vec<_> = u.patches().to_vec();
    u.fill_internal_ghosts();
    assert_eq!(u.patches(), once.as_slice());
    for k in 0..layout.num_patches() {
        let tile = layout.tile(k).clone();
        for j in tile.cells.lo[1]..tile.cells.hi[1] {
            if tile.block == 0 && tile.is_block_hi(0) {
                let [li, lj] = layout.local_index(k, n as i64, j);
                assert_eq!(u.patch(k)[[0, li, lj]], 2.5);
            }
        }
        for i in tile.cells.lo[0]..tile.cells.hi[0] {
            if tile.block == 1 && tile.is_block_lo(1) {
                let [li, lj] = layout.local_index(k, i, -1);
                assert_eq!(u.patch(k)[[0, li, lj]], 2.5);
            }
            if tile.block == 0 && tile.is_block_lo(1) {
                let [li, lj] = layout.local_index(k, i, -1);
                assert_eq!(u.patch(k)[[0, li, lj]], 2.5);
            }
        }
    }
}

#[test]
fn zero_charge_gives_zero_potential() {
    let geom = Arc::new(
        MultiblockGeometry::new(&GeometryConfig::Slab(SlabConfig {
            cells: [16, 8],
            xmax: 1.0,
            ymax: 2.0,
            bz_inner: 2.0,
            bz_outer: 2.0,
            by_inner: 0.1,
            periodic_poloidal: true,
            discretization: DiscretizationConfig {
                decomposition: [2, 2],
                ..DiscretizationConfig::default()
            },
        }))
        .expect("slab"),
    );
    let bc_cfg: Vec<PotentialBcConfig> = ["radial_inner", "radial_outer"]
        .iter()
        .map(|name| PotentialBcConfig {
            boundary: name.to_string(),
            spec: BcSpecConfig::Dirichlet { value: 0.0 },
        })
        .collect();
    let bc = PotentialBc::from_config(&bc_cfg, &geom).expect("bc");
    let cfg = FieldSolverConfig {
        model: FieldModel::GkPoisson,
        ..FieldSolverConfig::default()
    };
    let mut solver = FieldSolver::new(&geom, &cfg, &ReferenceUnits::default()).expect("solver");
    let mut mass = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
    mass.set_val(1.0);
    solver.set_operator_coefficients(&geom, &mass, &bc).expect("coefficients");
    let rho = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
    let mut phi = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
    solver.compute_potential(&geom, &bc, &mut phi, &rho).expect("solve");
    assert!(phi.max_abs() < 1e-12);
}

#[test]
fn miller_input_deck_builds_imex_operators() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../inputs/miller_imex.json");
    let cfg = SimulationConfig::from_file(path).expect("deck");
    let geom = Arc::new(MultiblockGeometry::new(&cfg.geometry).expect("geometry"));
    let ops = GkOps::new(&cfg, Arc::clone(&geom)).expect("ops");
    assert!(ops.is_imex());
    assert!(ops.config().consistent_potential_bcs);
    assert!(ops.boltzmann_electron().is_some());
    let state = GkOps::initial_state(&cfg, &geom).expect("state");
    assert!(ops.stable_dt_imex(&state) >= ops.stable_dt_expl(&state));
}
