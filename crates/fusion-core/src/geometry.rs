// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Multiblock Geometry
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Metric, Jacobian and magnetic field data over a multiblock layout.
//!
//! Face metric data `N` is stored with four components, `N[r][c]` at
//! component `2r + c`: row `r` is the physical direction, column `c` the
//! mapped one. Column `d` on a face normal to `d` is the area-weighted
//! normal of that face per unit transverse mapped length.
//!
//! Metric quantities are evaluated from the analytic (or tabulated)
//! mapping on ghost cells and ghost faces as well, so they never need an
//! exchange.

use std::sync::Arc;

use fusion_math::interp::interp1d;
use fusion_types::config::{GeometryConfig, TabulatedTopology};
use fusion_types::error::{FusionError, FusionResult};
use fusion_types::state::{Side, RADIAL_DIR};
use log::{debug, info};
use ndarray::Array3;
use rayon::prelude::*;

use crate::bfield::{field_data, FIELD_NCOMP};
use crate::block_array::{connect, BlockInfo, BlockLayout, ComponentKind, FluxData, IndexTransform, LevelData};
use crate::coord_sys::{BlockCoordSys, BlockRole};

/// Half-width offset of the two-point Gauss rule on a unit interval.
const GAUSS_OFFSET: f64 = 0.288_675_134_594_812_9;

/// Geometry tag, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    Slab,
    Miller,
    SingleNull,
    SnCore,
    Mapped,
}

/// One value per radial face of the core region.
#[derive(Debug, Clone, PartialEq)]
pub struct RadialProfile {
    pub values: Vec<f64>,
}

impl RadialProfile {
    pub fn lo(&self) -> f64 {
        self.values.first().copied().unwrap_or(0.0)
    }

    pub fn hi(&self) -> f64 {
        self.values.last().copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MultiblockGeometry {
    kind: GeometryKind,
    blocks: Vec<BlockCoordSys>,
    layout: Arc<BlockLayout>,
    second_order: bool,
    reference_core_block: usize,
    mapping_tolerance: f64,
    /// Face-averaged `N`, 4 components.
    n_face: FluxData,
    /// Pointwise `N/J` at face centres, 4 components.
    nj_inv_face: FluxData,
    /// Pointwise `N/J` at cell centres, 4 components.
    nj_inv_cell: LevelData,
    /// Cell-averaged Jacobian.
    j_cell: LevelData,
    /// `⟨J⟩ h0 h1`.
    cell_volume: LevelData,
    /// Physical cell centres.
    x_cell: LevelData,
    psi_cell: LevelData,
    /// `|N_d| h_t`.
    face_area: FluxData,
    field_cell: LevelData,
    field_face: FluxData,
}

// ───── Local evaluation helpers ─────

fn metric_entries(n: &[[f64; 2]; 2]) -> [f64; 4] {
    [n[0][0], n[0][1], n[1][0], n[1][1]]
}

/// Average of `f` over the face through `xi` normal to `dir`.
fn face_average<F>(cs: &BlockCoordSys, xi: [f64; 2], dir: usize, second_order: bool, f: F) -> [[f64; 2]; 2]
where
    F: Fn([f64; 2]) -> [[f64; 2]; 2],
{
    if second_order {
        return f(xi);
    }
    let t = 1 - dir;
    let mut a = xi;
    let mut b = xi;
    a[t] -= GAUSS_OFFSET * cs.h[t];
    b[t] += GAUSS_OFFSET * cs.h[t];
    let (fa, fb) = (f(a), f(b));
    let mut out = [[0.0; 2]; 2];
    for r in 0..2 {
        for c in 0..2 {
            out[r][c] = 0.5 * (fa[r][c] + fb[r][c]);
        }
    }
    out
}

/// Face-averaged metric matrix on the face through `xi` normal to `dir`.
fn averaged_face_metric(cs: &BlockCoordSys, xi: [f64; 2], dir: usize, second_order: bool) -> [[f64; 2]; 2] {
    let mut n = face_average(cs, xi, dir, second_order, |p| cs.metric_n(p));
    if !cs.axisymmetric {
        // Exact normal from the edge end points.
        let t = 1 - dir;
        let mut a = xi;
        let mut b = xi;
        a[t] -= 0.5 * cs.h[t];
        b[t] += 0.5 * cs.h[t];
        let xa = cs.real_coord(a);
        let xb = cs.real_coord(b);
        let s = if dir == 0 { 1.0 } else { -1.0 };
        n[0][dir] = s * (xb[1] - xa[1]) / cs.h[t];
        n[1][dir] = -s * (xb[0] - xa[0]) / cs.h[t];
    }
    n
}

fn averaged_jacobian(cs: &BlockCoordSys, xi: [f64; 2], second_order: bool) -> f64 {
    if second_order {
        return cs.jacobian(xi);
    }
    let mut sum = 0.0;
    for s0 in [-GAUSS_OFFSET, GAUSS_OFFSET] {
        for s1 in [-GAUSS_OFFSET, GAUSS_OFFSET] {
            sum += cs.jacobian([xi[0] + s0 * cs.h[0], xi[1] + s1 * cs.h[1]]);
        }
    }
    0.25 * sum
}

fn fill_cells<F>(data: &mut LevelData, blocks: &[BlockCoordSys], f: F)
where
    F: Fn(&BlockCoordSys, [f64; 2], &mut [f64]) + Sync,
{
    let layout = Arc::clone(data.layout());
    data.patches_mut().par_iter_mut().enumerate().for_each(|(k, a)| {
        let cs = &blocks[layout.tile(k).block];
        let (nc, n0, n1) = a.dim();
        let mut buf = vec![0.0; nc];
        for li in 0..n0 {
            for lj in 0..n1 {
                let (i, j) = layout.global_index(k, li, lj);
                f(cs, cs.cell_center(i, j), &mut buf);
                for (c, v) in buf.iter().enumerate() {
                    a[[c, li, lj]] = *v;
                }
            }
        }
    });
    data.mark_ghosts_filled();
}

fn fill_faces<F>(data: &mut FluxData, blocks: &[BlockCoordSys], f: F)
where
    F: Fn(&BlockCoordSys, usize, [f64; 2], &mut [f64]) + Sync,
{
    let layout = Arc::clone(data.layout());
    data.patches_mut().par_iter_mut().enumerate().for_each(|(k, faces)| {
        let cs = &blocks[layout.tile(k).block];
        for (dir, a) in faces.iter_mut().enumerate() {
            let (nc, n0, n1) = a.dim();
            let mut buf = vec![0.0; nc];
            for li in 0..n0 {
                for lj in 0..n1 {
                    let (i, j) = layout.global_index(k, li, lj);
                    f(cs, dir, cs.face_center(dir, i, j), &mut buf);
                    for (c, v) in buf.iter().enumerate() {
                        a[[c, li, lj]] = *v;
                    }
                }
            }
        }
    });
}

/// Transverse central difference `(x[t+1] - x[t-1]) / 2` on a face array.
fn transverse_delta(a: &Array3<f64>, comp: usize, dir: usize, li: usize, lj: usize) -> f64 {
    if dir == 0 {
        0.5 * (a[[comp, li, lj + 1]] - a[[comp, li, lj - 1]])
    } else {
        0.5 * (a[[comp, li + 1, lj]] - a[[comp, li - 1, lj]])
    }
}

impl MultiblockGeometry {
    /// Build the coordinate systems and block topology from an input
    /// deck section, then compute all metric and field data.
    pub fn new(cfg: &GeometryConfig) -> FusionResult<Self> {
        let disc = cfg.discretization();
        let (kind, blocks, infos, reference) = match cfg {
            GeometryConfig::Slab(c) => {
                let cs = BlockCoordSys::slab(c)?;
                let mut infos = vec![BlockInfo::new(c.cells[0], c.cells[1])];
                if c.periodic_poloidal {
                    let n1 = c.cells[1] as i64;
                    connect(&mut infos, 0, 1, Side::Hi, 0, IndexTransform::shift([0, -n1]))?;
                }
                (GeometryKind::Slab, vec![cs], infos, 0)
            }
            GeometryConfig::Miller(c) => {
                let nb = c.poloidal_blocks.max(1);
                let blocks = (0..nb)
                    .map(|b| BlockCoordSys::miller(c, b))
                    .collect::<FusionResult<Vec<_>>>()?;
                let mut infos: Vec<BlockInfo> = blocks
                    .iter()
                    .map(|cs| BlockInfo::new(cs.domain.size(0), cs.domain.size(1)))
                    .collect();
                let nb1 = blocks[0].domain.size(1) as i64;
                for b in 0..nb {
                    connect(&mut infos, b, 1, Side::Hi, (b + 1) % nb, IndexTransform::shift([0, -nb1]))?;
                }
                (GeometryKind::Miller, blocks, infos, 0)
            }
            GeometryConfig::Tabulated(c) => {
                if c.blocks.is_empty() {
                    return Err(FusionError::ConfigError("tabulated geometry has no blocks".to_string()));
                }
                let blocks = c
                    .blocks
                    .iter()
                    .enumerate()
                    .map(|(b, bc)| BlockCoordSys::tabulated(bc, b, c.axisymmetric))
                    .collect::<FusionResult<Vec<_>>>()?;
                let mut infos: Vec<BlockInfo> = blocks
                    .iter()
                    .map(|cs| BlockInfo::new(cs.domain.size(0), cs.domain.size(1)))
                    .collect();
                for conn in &c.connections {
                    let t = IndexTransform::new(conn.perm, conn.sign, conn.offset)?;
                    connect(&mut infos, conn.block, conn.dir, conn.side, conn.neighbor, t)?;
                }
                let kind = match c.topology {
                    TabulatedTopology::SingleNull => GeometryKind::SingleNull,
                    TabulatedTopology::SnCore => GeometryKind::SnCore,
                    TabulatedTopology::Generic => GeometryKind::Mapped,
                };
                if c.reference_core_block >= blocks.len() || blocks[c.reference_core_block].role != BlockRole::Core {
                    return Err(FusionError::ConfigError(format!(
                        "reference core block {} is not a core block",
                        c.reference_core_block
                    )));
                }
                (kind, blocks, infos, c.reference_core_block)
            }
        };
        let layout = BlockLayout::new(infos, disc.decomposition, disc.ghosts)?;
        let geom = Self::from_parts(kind, blocks, layout, disc.second_order, reference, disc.mapping_tolerance)?;
        geom.check_multiblock_mapping_consistency(disc.mapping_tolerance)?;
        info!(
            "Geometry {:?}: {} blocks, {} patches, {} cells",
            kind,
            geom.blocks.len(),
            geom.layout.num_patches(),
            geom.j_cell.num_valid_cells()
        );
        Ok(geom)
    }

    /// Assemble a geometry from prepared coordinate systems and layout.
    pub fn from_parts(
        kind: GeometryKind,
        blocks: Vec<BlockCoordSys>,
        layout: Arc<BlockLayout>,
        second_order: bool,
        reference_core_block: usize,
        mapping_tolerance: f64,
    ) -> FusionResult<Self> {
        if blocks.len() != layout.num_blocks() {
            return Err(FusionError::GeometryMismatch(format!(
                "{} coordinate systems for {} blocks",
                blocks.len(),
                layout.num_blocks()
            )));
        }
        for (b, cs) in blocks.iter().enumerate() {
            if cs.domain != layout.block(b).domain {
                return Err(FusionError::GeometryMismatch(format!(
                    "block {b}: coordinate system domain {:?} differs from layout {:?}",
                    cs.domain,
                    layout.block(b).domain
                )));
            }
        }

        let mut n_face = FluxData::new(&layout, 4, ComponentKind::Scalar);
        fill_faces(&mut n_face, &blocks, |cs, dir, xi, out| {
            out.copy_from_slice(&metric_entries(&averaged_face_metric(cs, xi, dir, second_order)));
        });
        let mut nj_inv_face = FluxData::new(&layout, 4, ComponentKind::Scalar);
        fill_faces(&mut nj_inv_face, &blocks, |cs, _dir, xi, out| {
            let j = cs.jacobian(xi);
            let n = metric_entries(&cs.metric_n(xi));
            for (o, v) in out.iter_mut().zip(n.iter()) {
                *o = v / j;
            }
        });
        let mut face_area = FluxData::new(&layout, 1, ComponentKind::Scalar);
        fill_faces(&mut face_area, &blocks, |cs, dir, xi, out| {
            let n = averaged_face_metric(cs, xi, dir, second_order);
            out[0] = (n[0][dir] * n[0][dir] + n[1][dir] * n[1][dir]).sqrt() * cs.h[1 - dir];
        });
        let mut field_face = FluxData::new(&layout, FIELD_NCOMP, ComponentKind::Scalar);
        fill_faces(&mut field_face, &blocks, |cs, _dir, xi, out| {
            out.copy_from_slice(&field_data(cs, xi).to_components());
        });

        let mut j_cell = LevelData::new(&layout, 1, ComponentKind::Scalar);
        fill_cells(&mut j_cell, &blocks, |cs, xi, out| {
            out[0] = averaged_jacobian(cs, xi, second_order);
        });
        let mut cell_volume = LevelData::new(&layout, 1, ComponentKind::Scalar);
        fill_cells(&mut cell_volume, &blocks, |cs, xi, out| {
            out[0] = averaged_jacobian(cs, xi, second_order) * cs.h[0] * cs.h[1];
        });
        let mut nj_inv_cell = LevelData::new(&layout, 4, ComponentKind::Scalar);
        fill_cells(&mut nj_inv_cell, &blocks, |cs, xi, out| {
            let j = cs.jacobian(xi);
            let n = metric_entries(&cs.metric_n(xi));
            for (o, v) in out.iter_mut().zip(n.iter()) {
                *o = v / j;
            }
        });
        let mut x_cell = LevelData::new(&layout, 2, ComponentKind::Scalar);
        fill_cells(&mut x_cell, &blocks, |cs, xi, out| {
            out.copy_from_slice(&cs.real_coord(xi));
        });
        let mut psi_cell = LevelData::new(&layout, 1, ComponentKind::Scalar);
        fill_cells(&mut psi_cell, &blocks, |cs, xi, out| {
            out[0] = cs.psi(xi);
        });
        let mut field_cell = LevelData::new(&layout, FIELD_NCOMP, ComponentKind::Scalar);
        fill_cells(&mut field_cell, &blocks, |cs, xi, out| {
            out.copy_from_slice(&field_data(cs, xi).to_components());
        });

        for k in 0..layout.num_patches() {
            if j_cell.valid_view(k).iter().any(|&j| j <= 0.0 || !j.is_finite()) {
                return Err(FusionError::GeometryMismatch(format!(
                    "non-positive Jacobian in patch {k} of block {}",
                    layout.tile(k).block
                )));
            }
        }

        let mut geom = MultiblockGeometry {
            kind,
            blocks,
            layout,
            second_order,
            reference_core_block,
            mapping_tolerance,
            n_face,
            nj_inv_face,
            nj_inv_cell,
            j_cell,
            cell_volume,
            x_cell,
            psi_cell,
            face_area,
            field_cell,
            field_face,
        };
        geom.average_metrics_at_block_boundaries();
        Ok(geom)
    }

    // ───── Accessors ─────

    pub fn kind(&self) -> GeometryKind {
        self.kind
    }

    pub fn layout(&self) -> &Arc<BlockLayout> {
        &self.layout
    }

    pub fn blocks(&self) -> &[BlockCoordSys] {
        &self.blocks
    }

    pub fn block(&self, b: usize) -> &BlockCoordSys {
        &self.blocks[b]
    }

    pub fn second_order(&self) -> bool {
        self.second_order
    }

    pub fn mapping_tolerance(&self) -> f64 {
        self.mapping_tolerance
    }

    pub fn reference_core_block(&self) -> usize {
        self.reference_core_block
    }

    pub fn core_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, cs)| cs.role == BlockRole::Core)
            .map(|(b, _)| b)
    }

    pub fn n_face(&self) -> &FluxData {
        &self.n_face
    }

    pub fn nj_inv_face(&self) -> &FluxData {
        &self.nj_inv_face
    }

    pub fn nj_inv_cell(&self) -> &LevelData {
        &self.nj_inv_cell
    }

    pub fn j_cell(&self) -> &LevelData {
        &self.j_cell
    }

    pub fn cell_volume(&self) -> &LevelData {
        &self.cell_volume
    }

    pub fn x_cell(&self) -> &LevelData {
        &self.x_cell
    }

    pub fn psi_cell(&self) -> &LevelData {
        &self.psi_cell
    }

    pub fn face_area(&self) -> &FluxData {
        &self.face_area
    }

    pub fn field_cell(&self) -> &LevelData {
        &self.field_cell
    }

    pub fn field_face(&self) -> &FluxData {
        &self.field_face
    }

    pub fn total_volume(&self) -> f64 {
        self.cell_volume.sum_valid(0)
    }

    /// Block and physical face carrying boundary name `name`.
    pub fn boundary_faces(&self, name: &str) -> Vec<(usize, usize, Side)> {
        let mut out = Vec::new();
        for (b, cs) in self.blocks.iter().enumerate() {
            for dir in 0..2 {
                for side in Side::BOTH {
                    if self.layout.block(b).is_physical(dir, side) && cs.boundary_name(dir, side) == Some(name) {
                        out.push((b, dir, side));
                    }
                }
            }
        }
        out
    }

    // ───── Block-seam consistency ─────

    /// Copy the normal metric column into a 2-component face array.
    fn normal_columns(&self) -> FluxData {
        let mut cols = FluxData::new(&self.layout, 2, ComponentKind::NormalFlux);
        for k in 0..self.layout.num_patches() {
            for dir in 0..2 {
                let src = self.n_face.face(k, dir);
                let dst = cols.face_mut(k, dir);
                for r in 0..2 {
                    dst.index_axis_mut(ndarray::Axis(0), r)
                        .assign(&src.index_axis(ndarray::Axis(0), 2 * r + dir));
                }
            }
        }
        cols
    }

    fn average_metrics_at_block_boundaries(&mut self) {
        if !self.layout.has_block_seams() {
            return;
        }
        let mut cols = self.normal_columns();
        cols.average_at_block_boundaries();
        for k in 0..self.layout.num_patches() {
            for dir in 0..2 {
                let src = cols.face(k, dir).clone();
                let dst = self.n_face.face_mut(k, dir);
                for r in 0..2 {
                    dst.index_axis_mut(ndarray::Axis(0), 2 * r + dir)
                        .assign(&src.index_axis(ndarray::Axis(0), r));
                }
            }
        }
    }

    /// Largest mismatch of the face normals computed independently by
    /// the blocks on either side of every seam, before averaging.
    pub fn max_block_boundary_difference(&self) -> f64 {
        let mut raw = FluxData::new(&self.layout, 2, ComponentKind::NormalFlux);
        fill_faces(&mut raw, &self.blocks, |cs, dir, xi, out| {
            let n = averaged_face_metric(cs, xi, dir, self.second_order);
            out[0] = n[0][dir];
            out[1] = n[1][dir];
        });
        raw.max_block_boundary_difference()
    }

    /// Fail when neighbouring blocks disagree on their shared faces.
    pub fn check_multiblock_mapping_consistency(&self, tol: f64) -> FusionResult<()> {
        if !self.layout.has_block_seams() {
            return Ok(());
        }
        let scale = self.n_face.face(0, 0).iter().fold(0.0f64, |m, v| m.max(v.abs())).max(1.0);
        let diff = self.max_block_boundary_difference();
        debug!("block seam metric mismatch {diff:.3e} (scale {scale:.3e})");
        if diff > tol * scale {
            return Err(FusionError::GeometryMismatch(format!(
                "multiblock mapping inconsistent: seam mismatch {diff:.3e} exceeds {:.3e}",
                tol * scale
            )));
        }
        Ok(())
    }

    /// Make both copies of seam faces agree.
    pub fn average_at_block_boundaries(&self, data: &mut FluxData) {
        data.average_at_block_boundaries();
    }

    /// Fill face ghosts lying in neighbouring blocks, transverse to seams.
    pub fn exchange_transverse_at_block_boundaries(&self, data: &mut FluxData) {
        data.fill_internal_ghosts();
    }

    pub fn fill_internal_ghosts(&self, data: &mut LevelData) {
        data.fill_internal_ghosts();
    }

    // ───── Divergence ─────

    /// Face average of `N_d · F` from face averages of `N` and of the
    /// physical vector flux `F` (`2m` components, vector `v` at `2v, 2v+1`).
    /// The fourth-order form adds the product correction
    /// `(1/12) Σ_r ΔN_r ΔF_r` with transverse central differences, which
    /// needs one transverse ghost face.
    pub fn compute_metric_term_product_average(
        &self,
        flux: &FluxData,
        normal: &mut FluxData,
        fourth_order: bool,
    ) -> FusionResult<()> {
        let m = normal.ncomp();
        if flux.ncomp() != 2 * m {
            return Err(FusionError::GeometryMismatch(format!(
                "vector flux has {} components, expected {}",
                flux.ncomp(),
                2 * m
            )));
        }
        let n_face = &self.n_face;
        normal.patches_mut().par_iter_mut().enumerate().for_each(|(k, out)| {
            for (dir, o) in out.iter_mut().enumerate() {
                let nf = n_face.face(k, dir);
                let f = flux.face(k, dir);
                let (_, a0, a1) = o.dim();
                for li in 0..a0 {
                    for lj in 0..a1 {
                        let interior = if dir == 0 {
                            lj >= 1 && lj + 1 < a1
                        } else {
                            li >= 1 && li + 1 < a0
                        };
                        for v in 0..m {
                            let mut s = 0.0;
                            for r in 0..2 {
                                s += nf[[2 * r + dir, li, lj]] * f[[2 * v + r, li, lj]];
                                if fourth_order && interior {
                                    s += transverse_delta(nf, 2 * r + dir, dir, li, lj)
                                        * transverse_delta(f, 2 * v + r, dir, li, lj)
                                        / 12.0;
                                }
                            }
                            o[[v, li, lj]] = s;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// `Σ_d (NTF(i+1) - NTF(i)) h_t` on valid cells from face-normal fluxes.
    pub fn compute_normal_flux_divergence(&self, normal: &FluxData, div: &mut LevelData) -> FusionResult<()> {
        if normal.ncomp() != div.ncomp() {
            return Err(FusionError::GeometryMismatch(format!(
                "divergence of {} components into {}",
                normal.ncomp(),
                div.ncomp()
            )));
        }
        let layout = Arc::clone(&self.layout);
        let blocks = &self.blocks;
        div.patches_mut().par_iter_mut().enumerate().for_each(|(k, d)| {
            let h = blocks[layout.tile(k).block].h;
            let (lo, hi) = layout.valid_range(k);
            let f0 = normal.face(k, 0);
            let f1 = normal.face(k, 1);
            for c in 0..d.dim().0 {
                for li in lo[0]..hi[0] {
                    for lj in lo[1]..hi[1] {
                        d[[c, li, lj]] = (f0[[c, li + 1, lj]] - f0[[c, li, lj]]) * h[1]
                            + (f1[[c, li, lj + 1]] - f1[[c, li, lj]]) * h[0];
                    }
                }
            }
        });
        Ok(())
    }

    /// Mapped-grid divergence of a physical vector flux: the sum over the
    /// faces of each cell of `N_d · F` times the transverse mapped length.
    /// Divide by the cell volume for the physical divergence.
    pub fn compute_mapped_grid_divergence(
        &self,
        flux: &FluxData,
        div: &mut LevelData,
        fourth_order: bool,
    ) -> FusionResult<()> {
        let mut normal = FluxData::new(&self.layout, div.ncomp(), ComponentKind::NormalFlux);
        self.compute_metric_term_product_average(flux, &mut normal, fourth_order)?;
        self.compute_normal_flux_divergence(&normal, div)
    }

    /// Divide valid cells by the cell volume.
    pub fn divide_cell_volume(&self, data: &mut LevelData) {
        let vol = &self.cell_volume;
        let layout = Arc::clone(&self.layout);
        data.patches_mut().par_iter_mut().enumerate().for_each(|(k, a)| {
            let (lo, hi) = layout.valid_range(k);
            let v = vol.patch(k);
            for c in 0..a.dim().0 {
                for li in lo[0]..hi[0] {
                    for lj in lo[1]..hi[1] {
                        a[[c, li, lj]] /= v[[0, li, lj]];
                    }
                }
            }
        });
    }

    // ───── Gradients and flux-surface data ─────

    /// Physical gradient `(N/J) ∂/∂ξ` of mapped cell gradients
    /// (2 components per variable), on every cell.
    pub fn unmap_gradient(&self, mapped: &LevelData, physical: &mut LevelData) -> FusionResult<()> {
        if mapped.ncomp() % 2 != 0 || mapped.ncomp() != physical.ncomp() {
            return Err(FusionError::GeometryMismatch(format!(
                "cannot unmap {} gradient components into {}",
                mapped.ncomp(),
                physical.ncomp()
            )));
        }
        let nj = &self.nj_inv_cell;
        physical.patches_mut().par_iter_mut().enumerate().for_each(|(k, out)| {
            let g = mapped.patch(k);
            let m = nj.patch(k);
            let (nc, n0, n1) = out.dim();
            for v in 0..nc / 2 {
                for li in 0..n0 {
                    for lj in 0..n1 {
                        for r in 0..2 {
                            out[[2 * v + r, li, lj]] = m[[2 * r, li, lj]] * g[[2 * v, li, lj]]
                                + m[[2 * r + 1, li, lj]] * g[[2 * v + 1, li, lj]];
                        }
                    }
                }
            }
        });
        if mapped.ghost_state() == crate::block_array::GhostState::Valid {
            physical.mark_ghosts_filled();
        }
        Ok(())
    }

    /// Face version of [`Self::unmap_gradient`].
    pub fn unmap_face_gradient(&self, mapped: &FluxData, physical: &mut FluxData) {
        let nj = &self.nj_inv_face;
        physical.patches_mut().par_iter_mut().enumerate().for_each(|(k, faces)| {
            for (dir, out) in faces.iter_mut().enumerate() {
                let g = mapped.face(k, dir);
                let m = nj.face(k, dir);
                let (nc, n0, n1) = out.dim();
                for v in 0..nc / 2 {
                    for li in 0..n0 {
                        for lj in 0..n1 {
                            for r in 0..2 {
                                out[[2 * v + r, li, lj]] = m[[2 * r, li, lj]] * g[[2 * v, li, lj]]
                                    + m[[2 * r + 1, li, lj]] * g[[2 * v + 1, li, lj]];
                            }
                        }
                    }
                }
            }
        });
    }

    /// Flux label at physical position `x` of `block`.
    pub fn magnetic_flux(&self, block: usize, x: [f64; 2]) -> FusionResult<f64> {
        self.blocks
            .get(block)
            .ok_or(FusionError::IndexOutOfBounds { block, i: 0, j: 0 })?
            .magnetic_flux(x)
    }

    fn core_radial_faces(&self) -> FusionResult<usize> {
        let n0 = self.blocks[self.reference_core_block].domain.size(RADIAL_DIR);
        for b in self.core_blocks() {
            if self.blocks[b].domain.size(RADIAL_DIR) != n0 {
                return Err(FusionError::GeometryMismatch(format!(
                    "core block {b} has {} radial cells, reference block has {n0}",
                    self.blocks[b].domain.size(RADIAL_DIR)
                )));
            }
        }
        Ok(n0 + 1)
    }

    /// Flux-surface average of component `comp` of a radial face-normal
    /// flux: per radial face, `Σ NTF h_t / Σ |N_0| h_t` over all core
    /// blocks.
    pub fn compute_radial_fs_average(&self, normal: &FluxData, comp: usize) -> FusionResult<RadialProfile> {
        let nf = self.core_radial_faces()?;
        let mut num = vec![0.0; nf];
        let mut den = vec![0.0; nf];
        for k in 0..self.layout.num_patches() {
            let tile = self.layout.tile(k);
            let cs = &self.blocks[tile.block];
            if cs.role != BlockRole::Core {
                continue;
            }
            let f = normal.face(k, RADIAL_DIR);
            let area = self.face_area.face(k, RADIAL_DIR);
            for i in tile.cells.lo[0]..=tile.cells.hi[0] {
                // Interior patch faces are shared; count each once.
                if i == tile.cells.hi[0] && !tile.is_block_hi(0) {
                    continue;
                }
                for j in tile.cells.lo[1]..tile.cells.hi[1] {
                    let [li, lj] = self.layout.local_index(k, i, j);
                    num[i as usize] += f[[comp, li, lj]] * cs.h[1];
                    den[i as usize] += area[[0, li, lj]];
                }
            }
        }
        let values = num
            .iter()
            .zip(den.iter())
            .map(|(n, d)| if *d > 0.0 { n / d } else { 0.0 })
            .collect();
        Ok(RadialProfile { values })
    }

    /// Flux-surface average of a cell quantity: volume-weighted mean per
    /// radial cell index over all core blocks.
    pub fn compute_radial_cell_average(&self, data: &LevelData, comp: usize) -> FusionResult<Vec<f64>> {
        let nc = self.core_radial_faces()? - 1;
        let mut num = vec![0.0; nc];
        let mut den = vec![0.0; nc];
        for k in 0..self.layout.num_patches() {
            let tile = self.layout.tile(k);
            if self.blocks[tile.block].role != BlockRole::Core {
                continue;
            }
            let u = data.patch(k);
            let v = self.cell_volume.patch(k);
            for (i, j) in tile.cells.cells() {
                let [li, lj] = self.layout.local_index(k, i, j);
                num[i as usize] += u[[comp, li, lj]] * v[[0, li, lj]];
                den[i as usize] += v[[0, li, lj]];
            }
        }
        Ok(num
            .iter()
            .zip(den.iter())
            .map(|(n, d)| if *d > 0.0 { n / d } else { 0.0 })
            .collect())
    }

    /// Flux labels of the radial faces along the `j = 0` cut of the
    /// reference core block.
    pub fn reference_cut_psi(&self) -> Vec<f64> {
        let cs = &self.blocks[self.reference_core_block];
        (0..=cs.domain.size(RADIAL_DIR) as i64)
            .map(|i| cs.psi(cs.face_center(RADIAL_DIR, i, 0)))
            .collect()
    }

    /// Interpolate a radial-face profile given on the reference cut onto
    /// every cell and face by matching flux labels.
    pub fn interpolate_er_from_mag_fs(&self, profile: &RadialProfile) -> FusionResult<(LevelData, FluxData)> {
        let psi = self.reference_cut_psi();
        if psi.len() != profile.len() {
            return Err(FusionError::GeometryMismatch(format!(
                "profile has {} values for {} reference faces",
                profile.len(),
                psi.len()
            )));
        }
        let mut cells = LevelData::new(&self.layout, 1, ComponentKind::Scalar);
        let mut faces = FluxData::new(&self.layout, 1, ComponentKind::Scalar);
        for k in 0..self.layout.num_patches() {
            let cs = &self.blocks[self.layout.tile(k).block];
            let (_, n0, n1) = cells.patch(k).dim();
            for li in 0..n0 {
                for lj in 0..n1 {
                    let (i, j) = self.layout.global_index(k, li, lj);
                    let v = interp1d(&psi, &profile.values, cs.psi(cs.cell_center(i, j)))?;
                    cells.patch_mut(k)[[0, li, lj]] = v;
                }
            }
            for dir in 0..2 {
                let (_, n0, n1) = faces.face(k, dir).dim();
                for li in 0..n0 {
                    for lj in 0..n1 {
                        let (i, j) = self.layout.global_index(k, li, lj);
                        let v = interp1d(&psi, &profile.values, cs.psi(cs.face_center(dir, i, j)))?;
                        faces.face_mut(k, dir)[[0, li, lj]] = v;
                    }
                }
            }
        }
        cells.mark_ghosts_filled();
        Ok((cells, faces))
    }

    /// Unit poloidal-plane normal of radial faces, `N_0 / |N_0|`.
    pub fn radial_unit_normal(&self, k: usize, li: usize, lj: usize) -> [f64; 2] {
        let n = self.n_face.face(k, RADIAL_DIR);
        let (a, b) = (n[[0, li, lj]], n[[2, li, lj]]);
        let m = (a * a + b * b).sqrt();
        if m > 0.0 {
            [a / m, b / m]
        } else {
            [1.0, 0.0]
        }
    }
}
