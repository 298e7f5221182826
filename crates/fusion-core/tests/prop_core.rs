// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Property-Based Tests (proptest) for fusion-core
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Property-based tests for fusion-core using proptest.
//!
//! Covers: ghost exchange on arbitrary decompositions, telescoping of the
//! mapped divergence, flux-surface averages of uniform fluxes.

use fusion_core::block_array::{ComponentKind, FluxData, LevelData};
use fusion_core::geometry::MultiblockGeometry;
use fusion_types::config::{DiscretizationConfig, GeometryConfig, SlabConfig};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn slab(per_patch: [usize; 2], dec: [usize; 2], extent: [f64; 2]) -> MultiblockGeometry {
    MultiblockGeometry::new(&GeometryConfig::Slab(SlabConfig {
        cells: [per_patch[0] * dec[0], per_patch[1] * dec[1]],
        xmax: extent[0],
        ymax: extent[1],
        bz_inner: 2.0,
        bz_outer: 2.0,
        by_inner: 0.1,
        periodic_poloidal: true,
        discretization: DiscretizationConfig {
            decomposition: dec,
            ..DiscretizationConfig::default()
        },
    }))
    .expect("slab")
}

fn random_cells(g: &MultiblockGeometry, ncomp: usize, seed: u64) -> LevelData {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut u = LevelData::new(g.layout(), ncomp, ComponentKind::Scalar);
    for p in u.patches_mut() {
        p.mapv_inplace(|_| rng.gen_range(-1.0..1.0));
    }
    u.mark_stale();
    u
}

// ── Ghost Exchange ───────────────────────────────────────────────────

proptest! {
    /// Exchange never touches valid cells and a second fill is a no-op.
    #[test]
    fn ghost_fill_idempotent(
        m0 in 2usize..6,
        m1 in 2usize..6,
        d0 in 1usize..4,
        d1 in 1usize..4,
        seed in any::<u64>(),
    ) {
        let g = slab([m0, m1], [d0, d1], [1.0, 1.0]);
        let mut u = random_cells(&g, 2, seed);
        let before: Vec<_> = (0..u.num_patches()).map(|k| u.valid_view(k).to_owned()).collect();
        u.fill_internal_ghosts();
        for (k, v) in before.iter().enumerate() {
            prop_assert_eq!(&u.valid_view(k).to_owned(), v);
        }
        let once = u.patches().to_vec();
        u.fill_internal_ghosts();
        prop_assert_eq!(u.patches(), once.as_slice());
    }

    /// Poloidal ghosts are periodic copies of the opposite block edge.
    #[test]
    fn poloidal_ghosts_wrap(m in 2usize..6, d1 in 1usize..4, seed in any::<u64>()) {
        let g = slab([m, m], [1, d1], [1.0, 2.0]);
        let n1 = (m * d1) as i64;
        let mut u = random_cells(&g, 1, seed);
        u.fill_internal_ghosts();
        let layout = g.layout();
        for k in 0..layout.num_patches() {
            let tile = layout.tile(k);
            if !tile.is_block_lo(1) {
                continue;
            }
            for i in tile.cells.lo[0]..tile.cells.hi[0] {
                let [li, lj] = layout.local_index(k, i, -1);
                let expect = u.get(0, i, n1 - 1, 0).expect("wrap source");
                prop_assert_eq!(u.patch(k)[[0, li, lj]], expect);
            }
        }
    }
}

// ── Divergence and Averages ──────────────────────────────────────────

proptest! {
    /// With `NTF_0 = a + b i` and a periodic poloidal flux, the summed
    /// divergence telescopes to the boundary difference.
    #[test]
    fn divergence_telescopes(
        m0 in 2usize..6,
        m1 in 2usize..6,
        d0 in 1usize..3,
        d1 in 1usize..3,
        a in -2.0f64..2.0,
        b in -2.0f64..2.0,
    ) {
        let g = slab([m0, m1], [d0, d1], [1.5, 0.7]);
        let layout = g.layout();
        let (n0, n1) = ((m0 * d0) as f64, (m1 * d1) as f64);
        let mut ntf = FluxData::new(layout, 1, ComponentKind::NormalFlux);
        for k in 0..layout.num_patches() {
            for dir in 0..2 {
                let f = ntf.face_mut(k, dir);
                let (_, s0, s1) = f.dim();
                for li in 0..s0 {
                    for lj in 0..s1 {
                        let (i, j) = layout.global_index(k, li, lj);
                        f[[0, li, lj]] = if dir == 0 {
                            a + b * i as f64
                        } else {
                            (2.0 * std::f64::consts::PI * j as f64 / n1).cos()
                        };
                    }
                }
            }
        }
        let mut div = LevelData::new(layout, 1, ComponentKind::Scalar);
        g.compute_normal_flux_divergence(&ntf, &mut div).expect("divergence");
        let h = g.block(0).h;
        let expect = n1 * h[1] * b * n0;
        prop_assert!((div.sum_valid(0) - expect).abs() < 1e-9 * (1.0 + expect.abs()));
    }

    /// A flux equal to `c` times the face area averages to `c` on every
    /// radial face.
    #[test]
    fn fs_average_of_uniform_flux(m in 2usize..6, d0 in 1usize..3, d1 in 1usize..3, c in -3.0f64..3.0) {
        let g = slab([m, m], [d0, d1], [1.0, 1.0]);
        let h1 = g.block(0).h[1];
        let mut ntf = FluxData::new(g.layout(), 1, ComponentKind::NormalFlux);
        ntf.copy_from(g.face_area());
        ntf.scale(c / h1);
        let avg = g.compute_radial_fs_average(&ntf, 0).expect("average");
        prop_assert_eq!(avg.len(), m * d0 + 1);
        for v in &avg.values {
            prop_assert!((v - c).abs() < 1e-12 * (1.0 + c.abs()));
        }
    }
}
