// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Fluid Species Operators
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Passive fluid density carried by the `E × B` drift.

use fusion_types::error::FusionResult;
use rayon::prelude::*;

use crate::bfield::{B_DIR, B_MAG};
use crate::block_array::{ComponentKind, FluxData, LevelData};
use crate::operators::{subtract_mapped_divergence, FieldContext, FluidOperator};
use crate::species::{FluidSpecies, KineticSpecies};
use crate::vlasov::exb_drift;

#[derive(Debug, Clone)]
pub struct ExbAdvection {
    larmor: f64,
}

impl ExbAdvection {
    pub fn new(larmor: f64) -> Self {
        ExbAdvection { larmor }
    }
}

impl FluidOperator for ExbAdvection {
    fn accumulate_rhs(
        &self,
        rhs: &mut LevelData,
        fluid: &FluidSpecies,
        _kinetic: &[KineticSpecies],
        fields: &FieldContext<'_>,
    ) -> FusionResult<()> {
        let geom = fields.geom;
        let layout = geom.layout();
        let mut n = fluid.density(geom);
        n.fill_internal_ghosts();
        n.extrapolate_physical_ghosts();
        let nf = geom.n_face();
        let bf = geom.field_face();
        let larmor = self.larmor;

        let mut flux = FluxData::new(layout, 1, ComponentKind::NormalFlux);
        flux.patches_mut().par_iter_mut().enumerate().for_each(|(k, faces)| {
            let (lo, hi) = layout.valid_range(k);
            let u = n.patch(k);
            for (dir, a) in faces.iter_mut().enumerate() {
                let nm = nf.face(k, dir);
                let b = bf.face(k, dir);
                let e = fields.e_face.face(k, dir);
                let ihi = if dir == 0 { hi[0] + 1 } else { hi[0] };
                let jhi = if dir == 1 { hi[1] + 1 } else { hi[1] };
                for li in lo[0]..ihi {
                    for lj in lo[1]..jhi {
                        let (pi, pj) = if dir == 0 { (li - 1, lj) } else { (li, lj - 1) };
                        let bd = [b[[B_DIR, li, lj]], b[[B_DIR + 1, li, lj]], b[[B_DIR + 2, li, lj]]];
                        let ve = exb_drift(bd, b[[B_MAG, li, lj]], [e[[0, li, lj]], e[[1, li, lj]]], larmor);
                        let normal = nm[[dir, li, lj]] * ve[0] + nm[[2 + dir, li, lj]] * ve[1];
                        a[[0, li, lj]] = normal * 0.5 * (u[[0, pi, pj]] + u[[0, li, lj]]);
                    }
                }
            }
        });
        geom.average_at_block_boundaries(&mut flux);

        let mut div = LevelData::new(layout, 1, ComponentKind::Scalar);
        geom.compute_normal_flux_divergence(&flux, &mut div)?;
        subtract_mapped_divergence(geom, &div, 1.0, rhs);
        Ok(())
    }

    fn compute_dt(&self, _fluid: &FluidSpecies, fields: &FieldContext<'_>) -> f64 {
        let geom = fields.geom;
        let layout = geom.layout();
        let nj = geom.nj_inv_cell();
        let field = geom.field_cell();
        let larmor = self.larmor;
        let rate = (0..layout.num_patches())
            .into_par_iter()
            .map(|k| {
                let h = geom.block(layout.tile(k).block).h;
                let (lo, hi) = layout.valid_range(k);
                let m = nj.patch(k);
                let b = field.patch(k);
                let e = fields.e_cell.patch(k);
                let mut worst = 0.0f64;
                for li in lo[0]..hi[0] {
                    for lj in lo[1]..hi[1] {
                        let bd = [b[[B_DIR, li, lj]], b[[B_DIR + 1, li, lj]], b[[B_DIR + 2, li, lj]]];
                        let ve = exb_drift(bd, b[[B_MAG, li, lj]], [e[[0, li, lj]], e[[1, li, lj]]], larmor);
                        let r: f64 = (0..2)
                            .map(|d| (m[[d, li, lj]] * ve[0] + m[[2 + d, li, lj]] * ve[1]).abs() / h[d])
                            .sum();
                        worst = worst.max(r);
                    }
                }
                worst
            })
            .reduce(|| 0.0, f64::max);
        if rate > 0.0 {
            1.0 / rate
        } else {
            f64::INFINITY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_types::config::{DiscretizationConfig, FluidSpeciesConfig, GeometryConfig, GridFunctionConfig, SlabConfig};

    use crate::geometry::MultiblockGeometry;

    #[test]
    fn test_uniform_drift_of_cosine_density() {
        let g = MultiblockGeometry::new(&GeometryConfig::Slab(SlabConfig {
            cells: [8, 16],
            xmax: 1.0,
            ymax: 1.0,
            bz_inner: 1.0,
            bz_outer: 1.0,
            by_inner: 0.0,
            periodic_poloidal: true,
            discretization: DiscretizationConfig::default(),
        }))
        .expect("slab");
        let fluid = FluidSpecies::from_config(
            &FluidSpeciesConfig {
                name: "tracer".to_string(),
                mass: 1.0,
                charge: 0.0,
                density: GridFunctionConfig::Cosine {
                    constant: 1.0,
                    amplitude: 0.5,
                    mode: [0.0, 1.0],
                    phase: [0.0, 0.0],
                },
            },
            &g,
        )
        .expect("fluid");
        let mut phi = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        phi.set_val(0.0);
        // Radial field drives a poloidal drift.
        let mut e = LevelData::new(g.layout(), 2, ComponentKind::MappedVector);
        e.set_val(0.0);
        let mut ef = FluxData::new(g.layout(), 2, ComponentKind::MappedVector);
        for k in 0..g.layout().num_patches() {
            for dir in 0..2 {
                ef.face_mut(k, dir).index_axis_mut(ndarray::Axis(0), 0).fill(1.0);
            }
            e.patch_mut(k).index_axis_mut(ndarray::Axis(0), 0).fill(1.0);
        }
        let ctx = FieldContext {
            geom: &g,
            phi: &phi,
            e_cell: &e,
            e_face: &ef,
            time: 0.0,
        };
        let op = ExbAdvection::new(0.5);
        let mut rhs = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        rhs.set_val(0.0);
        op.accumulate_rhs(&mut rhs, &fluid, &[], &ctx).expect("rhs");
        assert!(rhs.sum_valid(0).abs() < 1e-12);
        assert!(rhs.max_abs() > 1e-3);
        // v_y = -ρ E_x b_z / B = -0.5.
        let dt = op.compute_dt(&fluid, &ctx);
        assert!((dt - 1.0 / (0.5 * 16.0)).abs() < 1e-12, "dt {dt}");
    }
}
