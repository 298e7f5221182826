// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Distributed Block Arrays
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Cell- and face-centred data over a multiblock patch layout.
//!
//! Index arithmetic across block seams is done in doubled coordinates:
//! cell `i` sits at `2i + 1`, face `i` (normal to that direction) at `2i`.
//! A block with `n` cells along `d` covers `[0, 2n]`; a point is outside
//! the block along `d` iff `p[d] < 0` or `p[d] > 2n`. Block-to-block
//! transforms act on doubled coordinates, so one transform serves cells,
//! faces of either direction, and chains of two seams (corner ghosts).
//!
//! Exchange plans are computed once when the layout is built. Every copy
//! reads a valid cell (or valid face) of the source patch, which makes
//! ghost filling idempotent.

use std::sync::Arc;

use fusion_math::vector::OdeVector;
use fusion_types::error::{FusionError, FusionResult};
use fusion_types::state::{IndexBox, Side};
use ndarray::{s, Array3, ArrayView3};
use rayon::prelude::*;

use crate::mpi_domain::{decompose_blocks, owner_of_cell, owner_of_face, PatchTile};

// ───── Inter-block index transforms ─────

/// Affine index map from a block into a neighbour:
/// `p'[k] = sign[k] * p[perm[k]] + off2[k]` in doubled coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexTransform {
    perm: [usize; 2],
    sign: [i64; 2],
    off2: [i64; 2],
}

impl IndexTransform {
    pub fn identity() -> Self {
        IndexTransform {
            perm: [0, 1],
            sign: [1, 1],
            off2: [0, 0],
        }
    }

    /// Transform sending cell `(i0, i1)` to cell
    /// `(sign[0] * i[perm[0]] + offset[0], sign[1] * i[perm[1]] + offset[1])`.
    pub fn new(perm: [usize; 2], sign: [i64; 2], offset: [i64; 2]) -> FusionResult<Self> {
        if !(perm == [0, 1] || perm == [1, 0]) {
            return Err(FusionError::GeometryMismatch(format!(
                "index permutation {perm:?} is not a permutation of (0, 1)"
            )));
        }
        if sign.iter().any(|s| s.abs() != 1) {
            return Err(FusionError::GeometryMismatch(format!(
                "index signs {sign:?} must be +1 or -1"
            )));
        }
        Ok(IndexTransform {
            perm,
            sign,
            off2: [2 * offset[0] + 1 - sign[0], 2 * offset[1] + 1 - sign[1]],
        })
    }

    /// Pure cell shift, e.g. a periodic wrap.
    pub fn shift(offset: [i64; 2]) -> Self {
        IndexTransform {
            perm: [0, 1],
            sign: [1, 1],
            off2: [2 * offset[0], 2 * offset[1]],
        }
    }

    pub fn perm(&self) -> [usize; 2] {
        self.perm
    }

    pub fn sign(&self) -> [i64; 2] {
        self.sign
    }

    pub fn is_identity(&self) -> bool {
        *self == IndexTransform::identity()
    }

    pub fn apply(&self, p: [i64; 2]) -> [i64; 2] {
        [
            self.sign[0] * p[self.perm[0]] + self.off2[0],
            self.sign[1] * p[self.perm[1]] + self.off2[1],
        ]
    }

    pub fn apply_cell(&self, i: i64, j: i64) -> (i64, i64) {
        let q = self.apply([2 * i + 1, 2 * j + 1]);
        (cell_of(q[0]), cell_of(q[1]))
    }

    /// `self` followed by `then`.
    pub fn compose(&self, then: &IndexTransform) -> IndexTransform {
        let mut out = IndexTransform::identity();
        for k in 0..2 {
            let m = then.perm[k];
            out.perm[k] = self.perm[m];
            out.sign[k] = then.sign[k] * self.sign[m];
            out.off2[k] = then.sign[k] * self.off2[m] + then.off2[k];
        }
        out
    }

    pub fn inverse(&self) -> IndexTransform {
        let mut out = IndexTransform::identity();
        for k in 0..2 {
            let m = self.perm[k];
            out.perm[m] = k;
            out.sign[m] = self.sign[k];
            out.off2[m] = -self.sign[k] * self.off2[k];
        }
        out
    }

    /// Direction of the image carrying direction `d` of the source.
    pub fn image_dir(&self, d: usize) -> usize {
        if self.perm[0] == d {
            0
        } else {
            1
        }
    }
}

fn cell_of(p: i64) -> i64 {
    (p - 1).div_euclid(2)
}

fn face_of(p: i64) -> i64 {
    p.div_euclid(2)
}

// ───── Block topology ─────

#[derive(Debug, Clone, PartialEq)]
pub struct BlockNeighbor {
    pub block: usize,
    pub transform: IndexTransform,
}

#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub domain: IndexBox,
    /// `neighbors[dir][side]`; `None` marks a physical boundary.
    pub neighbors: [[Option<BlockNeighbor>; 2]; 2],
}

impl BlockInfo {
    pub fn new(n0: usize, n1: usize) -> Self {
        BlockInfo {
            domain: IndexBox::from_size(n0, n1),
            neighbors: [[None, None], [None, None]],
        }
    }

    pub fn neighbor(&self, dir: usize, side: Side) -> Option<&BlockNeighbor> {
        self.neighbors[dir][side.index()].as_ref()
    }

    pub fn is_physical(&self, dir: usize, side: Side) -> bool {
        self.neighbor(dir, side).is_none()
    }
}

/// Register a seam beyond `(dir, side)` of `block` and its reverse.
pub fn connect(
    blocks: &mut [BlockInfo],
    block: usize,
    dir: usize,
    side: Side,
    neighbor: usize,
    transform: IndexTransform,
) -> FusionResult<()> {
    if block >= blocks.len() || neighbor >= blocks.len() || dir > 1 {
        return Err(FusionError::GeometryMismatch(format!(
            "seam ({block}, {dir}, {side:?}) -> {neighbor} refers to a missing block"
        )));
    }
    let k = transform.image_dir(dir);
    let same = transform.sign[k] > 0;
    let reverse_side = if same == (side == Side::Hi) { Side::Lo } else { Side::Hi };
    blocks[block].neighbors[dir][side.index()] = Some(BlockNeighbor {
        block: neighbor,
        transform,
    });
    blocks[neighbor].neighbors[k][reverse_side.index()] = Some(BlockNeighbor {
        block,
        transform: transform.inverse(),
    });
    Ok(())
}

// ───── Exchange plans ─────

/// How components transform across a seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    /// Invariant values (densities, physical-space vectors).
    Scalar,
    /// Pairs of components in mapped directions `(c0, c1)`.
    MappedVector,
    /// Face-normal fluxes; change sign under reflection.
    NormalFlux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GhostState {
    Stale,
    Valid,
}

#[derive(Debug, Clone)]
struct GhostCopy {
    dst: [usize; 2],
    src_patch: usize,
    src: [usize; 2],
    /// For destination direction `d`: source direction and orientation.
    dir_map: [usize; 2],
    dir_sign: [f64; 2],
    inter_block: bool,
}

#[derive(Debug, Clone, Default)]
struct ExchangePlan {
    copies: Vec<Vec<GhostCopy>>,
}

impl ExchangePlan {
    fn has_inter_block(&self) -> bool {
        self.copies.iter().flatten().any(|c| c.inter_block)
    }
}

/// Ghost cell beyond a physical boundary and the cell it extrapolates from.
#[derive(Debug, Clone)]
struct BoundaryGhost {
    dst: [usize; 2],
    src: [usize; 2],
}

/// Blocks, patches, ghost width and the precomputed exchange plans.
#[derive(Debug)]
pub struct BlockLayout {
    blocks: Vec<BlockInfo>,
    patches: Vec<PatchTile>,
    ghosts: usize,
    cell_plan: ExchangePlan,
    face_plans: [ExchangePlan; 2],
    seam_plans: [ExchangePlan; 2],
    boundary_ghosts: Vec<Vec<BoundaryGhost>>,
}

impl BlockLayout {
    pub fn new(blocks: Vec<BlockInfo>, decomposition: [usize; 2], ghosts: usize) -> FusionResult<Arc<Self>> {
        if blocks.is_empty() {
            return Err(FusionError::ConfigError("layout needs at least one block".to_string()));
        }
        if ghosts == 0 {
            return Err(FusionError::ConfigError("ghost width must be >= 1".to_string()));
        }
        let domains: Vec<IndexBox> = blocks.iter().map(|b| b.domain).collect();
        for (b, d) in domains.iter().enumerate() {
            if d.lo != [0, 0] {
                return Err(FusionError::GeometryMismatch(format!(
                    "block {b} domain must start at the origin, got {d:?}"
                )));
            }
            if d.size(0) < ghosts || d.size(1) < ghosts {
                return Err(FusionError::GeometryMismatch(format!(
                    "block {b} ({}×{}) is too small for {ghosts} ghost cells",
                    d.size(0),
                    d.size(1)
                )));
            }
        }
        let patches = decompose_blocks(&domains, decomposition)?;
        let mut layout = BlockLayout {
            blocks,
            patches,
            ghosts,
            cell_plan: ExchangePlan::default(),
            face_plans: [ExchangePlan::default(), ExchangePlan::default()],
            seam_plans: [ExchangePlan::default(), ExchangePlan::default()],
            boundary_ghosts: Vec::new(),
        };
        layout.check_seams()?;
        layout.build_cell_plan();
        for d in 0..2 {
            layout.face_plans[d] = layout.build_face_plan(d);
            layout.seam_plans[d] = layout.build_seam_plan(d);
        }
        Ok(Arc::new(layout))
    }

    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    pub fn block(&self, b: usize) -> &BlockInfo {
        &self.blocks[b]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn patches(&self) -> &[PatchTile] {
        &self.patches
    }

    pub fn tile(&self, k: usize) -> &PatchTile {
        &self.patches[k]
    }

    pub fn num_patches(&self) -> usize {
        self.patches.len()
    }

    pub fn ghosts(&self) -> usize {
        self.ghosts
    }

    pub fn has_block_seams(&self) -> bool {
        self.cell_plan.has_inter_block()
    }

    /// Local array index of block cell (or face) `(i, j)` in patch `k`.
    pub fn local_index(&self, k: usize, i: i64, j: i64) -> [usize; 2] {
        let lo = self.patches[k].cells.lo;
        let g = self.ghosts as i64;
        [(i - lo[0] + g) as usize, (j - lo[1] + g) as usize]
    }

    /// Block index of local array position `(li, lj)` in patch `k`.
    pub fn global_index(&self, k: usize, li: usize, lj: usize) -> (i64, i64) {
        let lo = self.patches[k].cells.lo;
        let g = self.ghosts as i64;
        (li as i64 + lo[0] - g, lj as i64 + lo[1] - g)
    }

    pub fn cell_shape(&self, k: usize) -> (usize, usize) {
        let c = &self.patches[k].cells;
        (c.size(0) + 2 * self.ghosts, c.size(1) + 2 * self.ghosts)
    }

    pub fn face_shape(&self, k: usize, dir: usize) -> (usize, usize) {
        let (n0, n1) = self.cell_shape(k);
        if dir == 0 {
            (n0 + 1, n1)
        } else {
            (n0, n1 + 1)
        }
    }

    /// Local index ranges `[lo, hi)` of the valid cells of patch `k`.
    pub fn valid_range(&self, k: usize) -> ([usize; 2], [usize; 2]) {
        let c = &self.patches[k].cells;
        let g = self.ghosts;
        ([g, g], [g + c.size(0), g + c.size(1)])
    }

    fn outside_side(&self, block: usize, p: [i64; 2], d: usize) -> Option<Side> {
        let dom = &self.blocks[block].domain;
        if p[d] < 2 * dom.lo[d] {
            Some(Side::Lo)
        } else if p[d] > 2 * dom.hi[d] {
            Some(Side::Hi)
        } else {
            None
        }
    }

    fn is_inside(&self, block: usize, p: [i64; 2]) -> bool {
        (0..2).all(|d| self.outside_side(block, p, d).is_none())
    }

    fn chain(&self, block: usize, p: [i64; 2], first: usize) -> Option<(usize, [i64; 2], IndexTransform)> {
        let mut b = block;
        let mut q = p;
        let mut total = IndexTransform::identity();
        for _ in 0..2 {
            let d = if self.outside_side(b, q, first).is_some() {
                first
            } else if self.outside_side(b, q, 1 - first).is_some() {
                1 - first
            } else {
                break;
            };
            let side = self.outside_side(b, q, d)?;
            let nb = self.blocks[b].neighbor(d, side)?;
            q = nb.transform.apply(q);
            total = total.compose(&nb.transform);
            b = nb.block;
        }
        if self.is_inside(b, q) {
            Some((b, q, total))
        } else {
            None
        }
    }

    /// Follow at most two seams from `p` in `block` to a point inside some
    /// block. `None` for points beyond a physical boundary.
    pub fn resolve(&self, block: usize, p: [i64; 2]) -> Option<(usize, [i64; 2], IndexTransform)> {
        if self.is_inside(block, p) {
            return Some((block, p, IndexTransform::identity()));
        }
        self.chain(block, p, 0).or_else(|| self.chain(block, p, 1))
    }

    fn check_seams(&self) -> FusionResult<()> {
        for (b, info) in self.blocks.iter().enumerate() {
            for d in 0..2 {
                for side in Side::BOTH {
                    let nb = match info.neighbor(d, side) {
                        Some(nb) => nb,
                        None => continue,
                    };
                    let t = 1 - d;
                    let n_d = info.domain.size(d) as i64;
                    let mid = info.domain.size(t) as i64 / 2;
                    let mut cell = [0i64; 2];
                    cell[d] = if side == Side::Lo { -1 } else { n_d };
                    cell[t] = mid;
                    let q = nb.transform.apply([2 * cell[0] + 1, 2 * cell[1] + 1]);
                    if nb.block >= self.blocks.len() || !self.is_inside(nb.block, q) {
                        return Err(FusionError::GeometryMismatch(format!(
                            "seam beyond block {b} dir {d} {side:?} does not land inside block {}",
                            nb.block
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn dir_data(t: &IndexTransform) -> ([usize; 2], [f64; 2]) {
        let mut map = [0usize; 2];
        let mut sign = [1.0; 2];
        for d in 0..2 {
            let k = t.image_dir(d);
            map[d] = k;
            sign[d] = t.sign[k] as f64;
        }
        (map, sign)
    }

    fn build_cell_plan(&mut self) {
        let g = self.ghosts as i64;
        let mut copies = Vec::with_capacity(self.patches.len());
        let mut boundary = Vec::with_capacity(self.patches.len());
        for (k, tile) in self.patches.iter().enumerate() {
            let mut list = Vec::new();
            let mut bnd = Vec::new();
            let grown = tile.cells.grow(g);
            for (i, j) in grown.cells() {
                if tile.cells.contains(i, j) {
                    continue;
                }
                let p = [2 * i + 1, 2 * j + 1];
                let dst = self.local_index(k, i, j);
                match self.resolve(tile.block, p) {
                    Some((b2, q, t)) => {
                        let (i2, j2) = (cell_of(q[0]), cell_of(q[1]));
                        if let Some(src_patch) = owner_of_cell(&self.patches, b2, i2, j2) {
                            let (dir_map, dir_sign) = Self::dir_data(&t);
                            list.push(GhostCopy {
                                dst,
                                src_patch,
                                src: self.local_index(src_patch, i2, j2),
                                dir_map,
                                dir_sign,
                                inter_block: !self.is_inside(tile.block, p),
                            });
                        }
                    }
                    None => {
                        let info = &self.blocks[tile.block];
                        let mut c = [i, j];
                        let mut clamped = false;
                        for d in 0..2 {
                            if let Some(side) = self.outside_side(tile.block, p, d) {
                                if info.is_physical(d, side) {
                                    c[d] = c[d].clamp(info.domain.lo[d], info.domain.hi[d] - 1);
                                    clamped = true;
                                }
                            }
                        }
                        if !clamped {
                            for d in 0..2 {
                                c[d] = c[d].clamp(info.domain.lo[d], info.domain.hi[d] - 1);
                            }
                        }
                        bnd.push(BoundaryGhost {
                            dst,
                            src: self.local_index(k, c[0], c[1]),
                        });
                    }
                }
            }
            copies.push(list);
            boundary.push(bnd);
        }
        self.cell_plan = ExchangePlan { copies };
        self.boundary_ghosts = boundary;
    }

    fn build_face_plan(&self, dir: usize) -> ExchangePlan {
        let g = self.ghosts as i64;
        let t = 1 - dir;
        let mut copies = Vec::with_capacity(self.patches.len());
        for (k, tile) in self.patches.iter().enumerate() {
            let mut list = Vec::new();
            let c = &tile.cells;
            for a in (c.lo[dir] - g)..=(c.hi[dir] + g) {
                for b in (c.lo[t] - g)..(c.hi[t] + g) {
                    let mut idx = [0i64; 2];
                    idx[dir] = a;
                    idx[t] = b;
                    if c.contains_face(dir, idx[0], idx[1]) {
                        continue;
                    }
                    let mut p = [0i64; 2];
                    p[dir] = 2 * a;
                    p[t] = 2 * b + 1;
                    let Some((b2, q, tr)) = self.resolve(tile.block, p) else {
                        continue;
                    };
                    let (dir_map, dir_sign) = Self::dir_data(&tr);
                    let sdir = dir_map[dir];
                    let mut sidx = [0i64; 2];
                    sidx[sdir] = face_of(q[sdir]);
                    sidx[1 - sdir] = cell_of(q[1 - sdir]);
                    if let Some(src_patch) = owner_of_face(&self.patches, b2, sdir, sidx[0], sidx[1]) {
                        list.push(GhostCopy {
                            dst: self.local_index(k, idx[0], idx[1]),
                            src_patch,
                            src: self.local_index(src_patch, sidx[0], sidx[1]),
                            dir_map,
                            dir_sign,
                            inter_block: !self.is_inside(tile.block, p),
                        });
                    }
                }
            }
            copies.push(list);
        }
        ExchangePlan { copies }
    }

    /// Pairs of faces lying on a block seam, seen from each side.
    fn build_seam_plan(&self, dir: usize) -> ExchangePlan {
        let t = 1 - dir;
        let mut copies = Vec::with_capacity(self.patches.len());
        for (k, tile) in self.patches.iter().enumerate() {
            let mut list = Vec::new();
            let info = &self.blocks[tile.block];
            for side in Side::BOTH {
                let on_side = match side {
                    Side::Lo => tile.cells.lo[dir] == info.domain.lo[dir],
                    Side::Hi => tile.cells.hi[dir] == info.domain.hi[dir],
                };
                let Some(nb) = info.neighbor(dir, side).filter(|_| on_side) else {
                    continue;
                };
                let a = match side {
                    Side::Lo => tile.cells.lo[dir],
                    Side::Hi => tile.cells.hi[dir],
                };
                for b in tile.cells.lo[t]..tile.cells.hi[t] {
                    let mut idx = [0i64; 2];
                    idx[dir] = a;
                    idx[t] = b;
                    let mut p = [0i64; 2];
                    p[dir] = 2 * a;
                    p[t] = 2 * b + 1;
                    let q = nb.transform.apply(p);
                    let (dir_map, dir_sign) = Self::dir_data(&nb.transform);
                    let sdir = dir_map[dir];
                    let mut sidx = [0i64; 2];
                    sidx[sdir] = face_of(q[sdir]);
                    sidx[1 - sdir] = cell_of(q[1 - sdir]);
                    if let Some(src_patch) = owner_of_face(&self.patches, nb.block, sdir, sidx[0], sidx[1]) {
                        list.push(GhostCopy {
                            dst: self.local_index(k, idx[0], idx[1]),
                            src_patch,
                            src: self.local_index(src_patch, sidx[0], sidx[1]),
                            dir_map,
                            dir_sign,
                            inter_block: true,
                        });
                    }
                }
            }
            copies.push(list);
        }
        ExchangePlan { copies }
    }
}

/// Write the components of `src` at a copy's source into `out`, applying
/// the seam orientation. `face_dir` is the destination face direction.
fn transform_components(
    kind: ComponentKind,
    copy: &GhostCopy,
    face_dir: Option<usize>,
    src: &[f64],
    out: &mut Vec<f64>,
) {
    match kind {
        ComponentKind::Scalar => out.extend_from_slice(src),
        ComponentKind::NormalFlux => {
            let f = face_dir.map(|d| copy.dir_sign[d]).unwrap_or(1.0);
            out.extend(src.iter().map(|v| f * v));
        }
        ComponentKind::MappedVector => {
            for c in 0..src.len() {
                let base = c - c % 2;
                let d = c % 2;
                let sc = (base + copy.dir_map[d]).min(src.len() - 1);
                out.push(copy.dir_sign[d] * src[sc]);
            }
        }
    }
}

fn gather(
    arrays: &[&Array3<f64>],
    copies: &[GhostCopy],
    kind: ComponentKind,
    face_dir: Option<usize>,
    include_inter: bool,
) -> Vec<f64> {
    let mut out = Vec::new();
    let mut buf = Vec::new();
    for c in copies.iter().filter(|c| include_inter || !c.inter_block) {
        buf.clear();
        let a = arrays[c.src_patch];
        buf.extend(a.slice(s![.., c.src[0], c.src[1]]).iter().copied());
        transform_components(kind, c, face_dir, &buf, &mut out);
    }
    out
}

fn scatter(dst: &mut Array3<f64>, copies: &[GhostCopy], values: &[f64], include_inter: bool) {
    let ncomp = dst.dim().0;
    for (n, c) in copies
        .iter()
        .filter(|c| include_inter || !c.inter_block)
        .enumerate()
    {
        for comp in 0..ncomp {
            dst[[comp, c.dst[0], c.dst[1]]] = values[n * ncomp + comp];
        }
    }
}

// ───── Cell-centred data ─────

/// Cell-centred data with `ncomp` components and ghost cells on every
/// patch of a [`BlockLayout`]. Arrays are `(ncomp, n0 + 2g, n1 + 2g)`.
#[derive(Debug, Clone)]
pub struct LevelData {
    layout: Arc<BlockLayout>,
    ncomp: usize,
    kind: ComponentKind,
    data: Vec<Array3<f64>>,
    ghost_state: GhostState,
}

impl LevelData {
    pub fn new(layout: &Arc<BlockLayout>, ncomp: usize, kind: ComponentKind) -> Self {
        let data = (0..layout.num_patches())
            .map(|k| {
                let (n0, n1) = layout.cell_shape(k);
                Array3::zeros((ncomp, n0, n1))
            })
            .collect();
        LevelData {
            layout: Arc::clone(layout),
            ncomp,
            kind,
            data,
            ghost_state: GhostState::Valid,
        }
    }

    pub fn layout(&self) -> &Arc<BlockLayout> {
        &self.layout
    }

    pub fn ncomp(&self) -> usize {
        self.ncomp
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn num_patches(&self) -> usize {
        self.data.len()
    }

    pub fn patch(&self, k: usize) -> &Array3<f64> {
        &self.data[k]
    }

    /// Mutable patch access; ghosts become stale.
    pub fn patch_mut(&mut self, k: usize) -> &mut Array3<f64> {
        self.ghost_state = GhostState::Stale;
        &mut self.data[k]
    }

    pub fn patches(&self) -> &[Array3<f64>] {
        &self.data
    }

    /// Mutable access to all patches; ghosts become stale.
    pub fn patches_mut(&mut self) -> &mut [Array3<f64>] {
        self.ghost_state = GhostState::Stale;
        &mut self.data
    }

    /// Valid region of patch `k`.
    pub fn valid_view(&self, k: usize) -> ArrayView3<'_, f64> {
        let (lo, hi) = self.layout.valid_range(k);
        self.data[k].slice(s![.., lo[0]..hi[0], lo[1]..hi[1]])
    }

    pub fn ghost_state(&self) -> GhostState {
        self.ghost_state
    }

    pub fn mark_stale(&mut self) {
        self.ghost_state = GhostState::Stale;
    }

    /// Declare ghosts valid after writing them directly, e.g. from an
    /// analytic expression evaluated on the whole patch.
    pub fn mark_ghosts_filled(&mut self) {
        self.ghost_state = GhostState::Valid;
    }

    /// Assert that ghost values may be read.
    pub fn require_valid_ghosts(&self) -> FusionResult<()> {
        match self.ghost_state {
            GhostState::Valid => Ok(()),
            GhostState::Stale => Err(FusionError::GeometryMismatch(
                "ghost cells read while stale; exchange first".to_string(),
            )),
        }
    }

    fn locate(&self, block: usize, i: i64, j: i64) -> FusionResult<(usize, [usize; 2])> {
        let k = owner_of_cell(self.layout.patches(), block, i, j)
            .ok_or(FusionError::IndexOutOfBounds { block, i, j })?;
        Ok((k, self.layout.local_index(k, i, j)))
    }

    /// Value of valid cell `(i, j)` of `block`.
    pub fn get(&self, block: usize, i: i64, j: i64, comp: usize) -> FusionResult<f64> {
        let (k, [li, lj]) = self.locate(block, i, j)?;
        Ok(self.data[k][[comp, li, lj]])
    }

    pub fn set(&mut self, block: usize, i: i64, j: i64, comp: usize, value: f64) -> FusionResult<()> {
        let (k, [li, lj]) = self.locate(block, i, j)?;
        self.data[k][[comp, li, lj]] = value;
        self.ghost_state = GhostState::Stale;
        Ok(())
    }

    /// Fill every cell, ghosts included.
    pub fn set_val(&mut self, value: f64) {
        self.data.par_iter_mut().for_each(|a| a.fill(value));
        self.ghost_state = GhostState::Valid;
    }

    fn run_plan(&mut self, include_inter: bool) {
        let layout = Arc::clone(&self.layout);
        let plan = &layout.cell_plan;
        let kind = self.kind;
        let arrays: Vec<&Array3<f64>> = self.data.iter().collect();
        let gathered: Vec<Vec<f64>> = plan
            .copies
            .par_iter()
            .map(|copies| gather(&arrays, copies, kind, None, include_inter))
            .collect();
        self.data
            .par_iter_mut()
            .zip(plan.copies.par_iter())
            .zip(gathered.par_iter())
            .for_each(|((dst, copies), values)| scatter(dst, copies, values, include_inter));
    }

    /// Fill ghost cells shared with other patches of the same block.
    /// Ghosts across block seams stay stale unless the layout has none.
    pub fn exchange(&mut self) {
        self.run_plan(false);
        if !self.layout.has_block_seams() {
            self.ghost_state = GhostState::Valid;
        }
    }

    /// Fill every ghost cell that lies inside some block, following block
    /// seams (including permuted or reflected ones) and corner chains.
    pub fn fill_internal_ghosts(&mut self) {
        self.run_plan(true);
        self.ghost_state = GhostState::Valid;
    }

    /// Zeroth-order extrapolation into ghosts beyond physical boundaries.
    /// Call after `fill_internal_ghosts`.
    pub fn extrapolate_physical_ghosts(&mut self) {
        let layout = Arc::clone(&self.layout);
        self.data
            .par_iter_mut()
            .zip(layout.boundary_ghosts.par_iter())
            .for_each(|(a, ghosts)| {
                let ncomp = a.dim().0;
                for gc in ghosts {
                    for c in 0..ncomp {
                        a[[c, gc.dst[0], gc.dst[1]]] = a[[c, gc.src[0], gc.src[1]]];
                    }
                }
            });
    }

    fn check_compatible(&self, other: &LevelData) -> bool {
        Arc::ptr_eq(&self.layout, &other.layout) && self.ncomp == other.ncomp
    }

    /// Sum over valid cells of component `comp`.
    pub fn sum_valid(&self, comp: usize) -> f64 {
        (0..self.data.len())
            .into_par_iter()
            .map(|k| self.valid_view(k).slice(s![comp, .., ..]).sum())
            .sum()
    }

    /// Largest magnitude over valid cells and all components.
    pub fn max_abs(&self) -> f64 {
        (0..self.data.len())
            .into_par_iter()
            .map(|k| self.valid_view(k).iter().fold(0.0f64, |m, v| m.max(v.abs())))
            .reduce(|| 0.0, f64::max)
    }

    pub fn num_valid_cells(&self) -> usize {
        self.layout.patches().iter().map(|t| t.cells.num_cells()).sum()
    }
}

impl OdeVector for LevelData {
    fn copy_from(&mut self, other: &Self) {
        if self.check_compatible(other) {
            self.data
                .par_iter_mut()
                .zip(other.data.par_iter())
                .for_each(|(a, b)| a.assign(b));
        } else {
            self.data = other.data.clone();
            self.layout = Arc::clone(&other.layout);
            self.ncomp = other.ncomp;
        }
        self.kind = other.kind;
        self.ghost_state = other.ghost_state;
    }

    fn axpy(&mut self, a: f64, x: &Self) {
        self.data
            .par_iter_mut()
            .zip(x.data.par_iter())
            .for_each(|(y, xv)| y.scaled_add(a, xv));
        if x.ghost_state == GhostState::Stale {
            self.ghost_state = GhostState::Stale;
        }
    }

    fn scale(&mut self, a: f64) {
        self.data.par_iter_mut().for_each(|y| *y *= a);
    }

    fn set_zero(&mut self) {
        self.set_val(0.0);
    }

    fn dot(&self, other: &Self) -> f64 {
        (0..self.data.len())
            .into_par_iter()
            .map(|k| {
                let a = self.valid_view(k);
                let b = other.valid_view(k);
                a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f64>()
            })
            .sum()
    }

    fn len_dof(&self) -> usize {
        self.num_valid_cells() * self.ncomp
    }
}

// ───── Face-centred data ─────

/// Face-centred data in both directions. For direction `d` the arrays
/// are `(ncomp, n_d + 1 + 2g, n_t + 2g)`; face `i` along `d` separates
/// cells `i - 1` and `i`.
#[derive(Debug, Clone)]
pub struct FluxData {
    layout: Arc<BlockLayout>,
    ncomp: usize,
    kind: ComponentKind,
    data: Vec<[Array3<f64>; 2]>,
}

impl FluxData {
    pub fn new(layout: &Arc<BlockLayout>, ncomp: usize, kind: ComponentKind) -> Self {
        let data = (0..layout.num_patches())
            .map(|k| {
                let (a0, b0) = layout.face_shape(k, 0);
                let (a1, b1) = layout.face_shape(k, 1);
                [Array3::zeros((ncomp, a0, b0)), Array3::zeros((ncomp, a1, b1))]
            })
            .collect();
        FluxData {
            layout: Arc::clone(layout),
            ncomp,
            kind,
            data,
        }
    }

    pub fn layout(&self) -> &Arc<BlockLayout> {
        &self.layout
    }

    pub fn ncomp(&self) -> usize {
        self.ncomp
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn face(&self, k: usize, dir: usize) -> &Array3<f64> {
        &self.data[k][dir]
    }

    pub fn face_mut(&mut self, k: usize, dir: usize) -> &mut Array3<f64> {
        &mut self.data[k][dir]
    }

    pub fn patches_mut(&mut self) -> &mut [[Array3<f64>; 2]] {
        &mut self.data
    }

    pub fn set_val(&mut self, value: f64) {
        self.data.par_iter_mut().for_each(|p| {
            p[0].fill(value);
            p[1].fill(value);
        });
    }

    pub fn copy_from(&mut self, other: &FluxData) {
        self.data
            .par_iter_mut()
            .zip(other.data.par_iter())
            .for_each(|(a, b)| {
                a[0].assign(&b[0]);
                a[1].assign(&b[1]);
            });
    }

    pub fn scale(&mut self, a: f64) {
        self.data.par_iter_mut().for_each(|p| {
            p[0] *= a;
            p[1] *= a;
        });
    }

    fn run(&mut self, plan: &ExchangePlan, dir: usize, average: bool) {
        let kind = self.kind;
        let gathered: Vec<Vec<f64>> = plan
            .copies
            .par_iter()
            .map(|copies| {
                let mut out = Vec::new();
                let mut buf = Vec::new();
                for c in copies {
                    buf.clear();
                    let a = &self.data[c.src_patch][c.dir_map[dir]];
                    buf.extend(a.slice(s![.., c.src[0], c.src[1]]).iter().copied());
                    transform_components(kind, c, Some(dir), &buf, &mut out);
                }
                out
            })
            .collect();
        self.data
            .par_iter_mut()
            .zip(plan.copies.par_iter())
            .zip(gathered.par_iter())
            .for_each(|((faces, copies), values)| {
                let dst = &mut faces[dir];
                let ncomp = dst.dim().0;
                for (n, c) in copies.iter().enumerate() {
                    for comp in 0..ncomp {
                        let v = values[n * ncomp + comp];
                        let cell = &mut dst[[comp, c.dst[0], c.dst[1]]];
                        *cell = if average { 0.5 * (*cell + v) } else { v };
                    }
                }
            });
    }

    /// Fill ghost faces that lie inside some block.
    pub fn fill_internal_ghosts(&mut self) {
        let layout = Arc::clone(&self.layout);
        for d in 0..2 {
            self.run(&layout.face_plans[d], d, false);
        }
    }

    /// Replace the two copies of every block-seam face by their mean
    /// (orientation-corrected), so both blocks see the same value.
    pub fn average_at_block_boundaries(&mut self) {
        let layout = Arc::clone(&self.layout);
        for d in 0..2 {
            self.run(&layout.seam_plans[d], d, true);
        }
    }

    /// Largest disagreement between the two copies of block-seam faces.
    pub fn max_block_boundary_difference(&self) -> f64 {
        let mut worst = 0.0f64;
        for d in 0..2 {
            for (k, copies) in self.layout.seam_plans[d].copies.iter().enumerate() {
                for c in copies {
                    let sdir = c.dir_map[d];
                    for comp in 0..self.ncomp {
                        let own = self.data[k][d][[comp, c.dst[0], c.dst[1]]];
                        let other = self.data[c.src_patch][sdir][[comp, c.src[0], c.src[1]]];
                        let f = match self.kind {
                            ComponentKind::NormalFlux => c.dir_sign[d],
                            _ => 1.0,
                        };
                        worst = worst.max((own - f * other).abs());
                    }
                }
            }
        }
        worst
    }
}
