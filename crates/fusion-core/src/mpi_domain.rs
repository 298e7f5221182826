// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Block Domain Decomposition
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Deterministic decomposition of multiblock index spaces into patches.
//!
//! Every block is split into a `(p0 × p1)` Cartesian grid of patches.
//! Patches are numbered globally, block by block, row-major inside a
//! block: `patch = offset(block) + i0 * p1 + i1`. Patches are the unit
//! of data parallelism in [`crate::block_array`]; the same layout could
//! be distributed over ranks without changing the exchange plans.

use fusion_types::error::{FusionError, FusionResult};
use fusion_types::state::IndexBox;

/// One patch of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTile {
    /// Global patch index.
    pub rank: usize,
    pub block: usize,
    /// Position of the patch inside the block's patch grid.
    pub p0_idx: usize,
    pub p1_idx: usize,
    /// Patch-grid dimensions of the block.
    pub p0: usize,
    pub p1: usize,
    /// Owned cells, in block-local indices.
    pub cells: IndexBox,
}

impl PatchTile {
    pub fn local_n0(&self) -> usize {
        self.cells.size(0)
    }

    pub fn local_n1(&self) -> usize {
        self.cells.size(1)
    }

    pub fn is_block_lo(&self, dir: usize) -> bool {
        match dir {
            0 => self.p0_idx == 0,
            _ => self.p1_idx == 0,
        }
    }

    pub fn is_block_hi(&self, dir: usize) -> bool {
        match dir {
            0 => self.p0_idx + 1 == self.p0,
            _ => self.p1_idx + 1 == self.p1,
        }
    }
}

/// Split `n` items across `k` buckets as evenly as possible.
pub fn balanced_split(n: usize, k: usize) -> Vec<usize> {
    let base = n / k;
    let rem = n % k;
    (0..k).map(|i| base + usize::from(i < rem)).collect()
}

/// Decompose one block's domain into `(p0 × p1)` patches.
///
/// `first_rank` is the global index given to the first patch.
pub fn decompose_block(
    block: usize,
    domain: IndexBox,
    decomposition: [usize; 2],
    first_rank: usize,
) -> FusionResult<Vec<PatchTile>> {
    let [p0, p1] = decomposition;
    if p0 == 0 || p1 == 0 {
        return Err(FusionError::ConfigError(
            "Patch grid dimensions must be >= 1".to_string(),
        ));
    }
    let n0 = domain.size(0);
    let n1 = domain.size(1);
    if n0 == 0 || n1 == 0 {
        return Err(FusionError::ConfigError(format!(
            "Block {block} has an empty domain {domain:?}"
        )));
    }
    if p0 > n0 || p1 > n1 {
        return Err(FusionError::ConfigError(format!(
            "Cannot split block {block} ({n0}×{n1}) into ({p0}×{p1}) patches"
        )));
    }

    let s0 = balanced_split(n0, p0);
    let s1 = balanced_split(n1, p1);
    let mut tiles = Vec::with_capacity(p0 * p1);
    let mut c0 = domain.lo[0];
    for (i0, &w0) in s0.iter().enumerate() {
        let mut c1 = domain.lo[1];
        for (i1, &w1) in s1.iter().enumerate() {
            tiles.push(PatchTile {
                rank: first_rank + i0 * p1 + i1,
                block,
                p0_idx: i0,
                p1_idx: i1,
                p0,
                p1,
                cells: IndexBox::new([c0, c1], [c0 + w0 as i64, c1 + w1 as i64]),
            });
            c1 += w1 as i64;
        }
        c0 += w0 as i64;
    }
    Ok(tiles)
}

/// Decompose every block with the same patch grid, clamped per block so
/// small blocks still get at least one cell per patch.
pub fn decompose_blocks(domains: &[IndexBox], decomposition: [usize; 2]) -> FusionResult<Vec<PatchTile>> {
    let mut out = Vec::new();
    for (block, domain) in domains.iter().enumerate() {
        let dec = [
            decomposition[0].min(domain.size(0).max(1)),
            decomposition[1].min(domain.size(1).max(1)),
        ];
        let tiles = decompose_block(block, *domain, dec, out.len())?;
        out.extend(tiles);
    }
    Ok(out)
}

/// Patch of `block` owning cell `(i, j)`.
pub fn owner_of_cell(tiles: &[PatchTile], block: usize, i: i64, j: i64) -> Option<usize> {
    tiles
        .iter()
        .find(|t| t.block == block && t.cells.contains(i, j))
        .map(|t| t.rank)
}

/// Patch of `block` owning face `(i, j)` normal to `dir`. Faces on an
/// internal patch boundary belong to both sides; the first is returned.
pub fn owner_of_face(tiles: &[PatchTile], block: usize, dir: usize, i: i64, j: i64) -> Option<usize> {
    tiles
        .iter()
        .find(|t| t.block == block && t.cells.contains_face(dir, i, j))
        .map(|t| t.rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_split_sums() {
        let s = balanced_split(17, 4);
        assert_eq!(s, vec![5, 4, 4, 4]);
        assert_eq!(s.iter().sum::<usize>(), 17);
    }

    #[test]
    fn test_decompose_block_covers_domain() {
        let tiles = decompose_block(0, IndexBox::from_size(32, 24), [4, 3], 0).expect("decompose");
        assert_eq!(tiles.len(), 12);
        let total: usize = tiles.iter().map(|t| t.cells.num_cells()).sum();
        assert_eq!(total, 32 * 24);
        // Row-major numbering inside the block.
        assert_eq!(tiles[5].p0_idx, 1);
        assert_eq!(tiles[5].p1_idx, 2);
        assert_eq!(tiles[5].rank, 5);
        for (i, a) in tiles.iter().enumerate() {
            for b in tiles.iter().skip(i + 1) {
                assert!(a.cells.cells().all(|(x, y)| !b.cells.contains(x, y)));
            }
        }
    }

    #[test]
    fn test_decompose_block_rejects_oversplit() {
        let err = decompose_block(0, IndexBox::from_size(2, 8), [3, 1], 0).expect_err("too many patches");
        match err {
            FusionError::ConfigError(msg) => assert!(msg.contains("Cannot split")),
            other => panic!("Unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decompose_blocks_numbers_globally() {
        let domains = [IndexBox::from_size(8, 8), IndexBox::from_size(4, 6)];
        let tiles = decompose_blocks(&domains, [2, 2]).expect("decompose");
        assert_eq!(tiles.len(), 8);
        assert!(tiles.iter().enumerate().all(|(k, t)| t.rank == k));
        assert_eq!(tiles[4].block, 1);
        assert_eq!(owner_of_cell(&tiles, 1, 3, 5), Some(7));
        assert_eq!(owner_of_cell(&tiles, 1, 4, 0), None);
    }

    #[test]
    fn test_face_owner_includes_boundary_faces() {
        let tiles = decompose_block(0, IndexBox::from_size(4, 4), [2, 1], 0).expect("decompose");
        assert_eq!(owner_of_face(&tiles, 0, 0, 4, 1), Some(1));
        assert_eq!(owner_of_face(&tiles, 0, 0, 2, 1), Some(0));
        assert_eq!(owner_of_face(&tiles, 0, 0, 5, 1), None);
        assert!(tiles[0].is_block_lo(0) && !tiles[0].is_block_hi(0));
    }
}
