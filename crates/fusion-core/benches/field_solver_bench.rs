// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Field Solver Benchmark
// © 1998–2026 Miroslav Šotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────

use criterion::{criterion_group, criterion_main, Criterion};
use fusion_core::block_array::{ComponentKind, FluxData, LevelData};
use fusion_core::field_solver::FieldSolver;
use fusion_core::geometry::MultiblockGeometry;
use fusion_core::potential_bc::PotentialBc;
use fusion_types::config::{
    BcSpecConfig, DiscretizationConfig, FieldSolverConfig, GeometryConfig, PotentialBcConfig, SlabConfig,
};
use fusion_types::constants::ReferenceUnits;
use std::hint::black_box;

fn slab(n: usize) -> MultiblockGeometry {
    let cfg = GeometryConfig::Slab(SlabConfig {
        cells: [n, n],
        xmax: 1.0,
        ymax: 1.0,
        bz_inner: 3.0,
        bz_outer: 3.0,
        by_inner: 0.1,
        periodic_poloidal: true,
        discretization: DiscretizationConfig {
            decomposition: [2, 2],
            ..DiscretizationConfig::default()
        },
    });
    match MultiblockGeometry::new(&cfg) {
        Ok(g) => g,
        Err(e) => panic!("geometry: {e}"),
    }
}

fn dirichlet(geom: &MultiblockGeometry) -> PotentialBc {
    let cfg: Vec<PotentialBcConfig> = ["radial_inner", "radial_outer"]
        .iter()
        .map(|b| PotentialBcConfig {
            boundary: b.to_string(),
            spec: BcSpecConfig::Dirichlet { value: 0.0 },
        })
        .collect();
    match PotentialBc::from_config(&cfg, geom) {
        Ok(bc) => bc,
        Err(e) => panic!("bc: {e}"),
    }
}

/// Cosine charge density, one radial and one poloidal mode.
fn charge(geom: &MultiblockGeometry) -> LevelData {
    let layout = geom.layout();
    let mut rho = LevelData::new(layout, 1, ComponentKind::Scalar);
    for k in 0..layout.num_patches() {
        let (lo, hi) = layout.valid_range(k);
        let p = rho.patch_mut(k);
        for li in lo[0]..hi[0] {
            for lj in lo[1]..hi[1] {
                let (i, j) = layout.global_index(k, li, lj);
                p[[0, li, lj]] = (0.3 * i as f64).sin() * (0.5 * j as f64).cos();
            }
        }
    }
    rho
}

fn bench_potential(c: &mut Criterion, n: usize) {
    let geom = slab(n);
    let bc = dirichlet(&geom);
    let mut solver = match FieldSolver::new(&geom, &FieldSolverConfig::default(), &ReferenceUnits::default()) {
        Ok(s) => s,
        Err(e) => panic!("solver: {e}"),
    };
    let mut mass = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
    mass.set_val(1.0);
    if let Err(e) = solver.set_operator_coefficients(&geom, &mass, &bc) {
        panic!("coefficients: {e}");
    }
    let rho = charge(&geom);

    c.bench_function(&format!("compute_potential_{n}x{n}"), |b| {
        b.iter(|| {
            let mut phi = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
            match solver.compute_potential(&geom, &bc, &mut phi, &rho) {
                Ok(res) => black_box(res.iterations),
                Err(e) => panic!("solve: {e}"),
            }
        })
    });
}

fn bench_potential_32(c: &mut Criterion) {
    bench_potential(c, 32);
}

fn bench_potential_64(c: &mut Criterion) {
    bench_potential(c, 64);
}

fn bench_field_from_potential(c: &mut Criterion) {
    let geom = slab(64);
    let bc = dirichlet(&geom);
    let mut solver = match FieldSolver::new(&geom, &FieldSolverConfig::default(), &ReferenceUnits::default()) {
        Ok(s) => s,
        Err(e) => panic!("solver: {e}"),
    };
    let mut phi = LevelData::new(geom.layout(), 1, ComponentKind::Scalar);
    if let Err(e) = solver.compute_potential(&geom, &bc, &mut phi, &charge(&geom)) {
        panic!("solve: {e}");
    }
    let mut cell = LevelData::new(geom.layout(), 2, ComponentKind::Scalar);
    let mut face = FluxData::new(geom.layout(), 2, ComponentKind::Scalar);

    c.bench_function("compute_field_64x64", |b| {
        b.iter(|| {
            if let Err(e) = solver.compute_field(&geom, &phi, &mut cell, &mut face) {
                panic!("field: {e}");
            }
            black_box(cell.max_abs());
        })
    });
}

criterion_group!(
    benches,
    bench_potential_32,
    bench_potential_64,
    bench_field_from_potential
);
criterion_main!(benches);
