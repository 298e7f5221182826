use criterion::{criterion_group, criterion_main, Criterion};
use fusion_math::gmres::{gmres, GmresConfig};
use fusion_math::sor::{sor_step, CsrMatrix, SorPreconditioner};
use fusion_types::error::FusionResult;
use std::hint::black_box;

/// 5-point Dirichlet Laplacian on an n x n interior.
fn laplace_2d(n: usize) -> CsrMatrix {
    let idx = |i: usize, j: usize| i * n + j;
    let mut t = Vec::with_capacity(5 * n * n);
    for i in 0..n {
        for j in 0..n {
            t.push((idx(i, j), idx(i, j), 4.0));
            if i > 0 {
                t.push((idx(i, j), idx(i - 1, j), -1.0));
            }
            if i + 1 < n {
                t.push((idx(i, j), idx(i + 1, j), -1.0));
            }
            if j > 0 {
                t.push((idx(i, j), idx(i, j - 1), -1.0));
            }
            if j + 1 < n {
                t.push((idx(i, j), idx(i, j + 1), -1.0));
            }
        }
    }
    match CsrMatrix::from_triplets(n * n, &t) {
        Ok(a) => a,
        Err(e) => panic!("assembly failed: {e}"),
    }
}

fn solve_sor_preconditioned(a: &CsrMatrix, sweeps: usize) -> usize {
    let n = a.n();
    let precond = match SorPreconditioner::new(a.clone(), sweeps, 1.5) {
        Ok(p) => p,
        Err(e) => panic!("preconditioner: {e}"),
    };
    let b = vec![1.0; n];
    let mut x = vec![0.0; n];
    let apply = |v: &Vec<f64>, out: &mut Vec<f64>| -> FusionResult<()> {
        a.matvec(v, out);
        Ok(())
    };
    let pc = |r: &Vec<f64>, out: &mut Vec<f64>| -> FusionResult<()> {
        precond.apply(r, out);
        Ok(())
    };
    match gmres(apply, pc, &b, &mut x, &GmresConfig::default()) {
        Ok(res) => res.iterations,
        Err(e) => panic!("gmres: {e}"),
    }
}

fn bench_gmres_32(c: &mut Criterion) {
    let a = laplace_2d(32);
    c.bench_function("gmres_sor3_32x32", |b| {
        b.iter(|| black_box(solve_sor_preconditioned(&a, 3)))
    });
}

fn bench_gmres_64(c: &mut Criterion) {
    let a = laplace_2d(64);
    c.bench_function("gmres_sor3_64x64", |b| {
        b.iter(|| black_box(solve_sor_preconditioned(&a, 3)))
    });
}

fn bench_gmres_vs_sor_64(c: &mut Criterion) {
    let a = laplace_2d(64);
    let rhs = vec![1.0; a.n()];

    let mut group = c.benchmark_group("gmres_vs_sor_64x64");
    group.sample_size(10);

    group.bench_function("sor_200iters", |b| {
        b.iter(|| {
            let mut x = vec![0.0; a.n()];
            for _ in 0..200 {
                sor_step(&a, &rhs, &mut x, 1.8);
            }
            black_box(x[a.n() / 2]);
        })
    });

    group.bench_function("gmres_30_precond", |b| {
        b.iter(|| black_box(solve_sor_preconditioned(&a, 5)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_gmres_32,
    bench_gmres_64,
    bench_gmres_vs_sor_64
);
criterion_main!(benches);
