// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Grid Functions
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Analytic profiles used for initial conditions and boundary values.

use std::sync::Arc;

use fusion_types::config::GridFunctionConfig;
use fusion_types::constants::TWO_PI;
use fusion_types::error::{FusionError, FusionResult};
use ndarray::Array3;

use crate::block_array::LevelData;
use crate::coord_sys::{BlockCoordSys, BlockMapping};
use crate::geometry::MultiblockGeometry;

#[derive(Debug, Clone)]
pub enum GridFunction {
    Constant(f64),
    Cosine {
        constant: f64,
        amplitude: f64,
        mode: [f64; 2],
        phase: [f64; 2],
    },
    Tanh {
        inner_value: f64,
        outer_value: f64,
        center: f64,
        width: f64,
    },
    Localized {
        amplitude: f64,
        location: [f64; 2],
        width: [f64; 2],
        floor: f64,
    },
    /// Cell values given directly, one array per patch.
    DataArray(Arc<Vec<Array3<f64>>>),
}

impl GridFunction {
    pub fn from_config(cfg: &GridFunctionConfig) -> FusionResult<Self> {
        Ok(match cfg {
            GridFunctionConfig::Constant { value } => GridFunction::Constant(*value),
            GridFunctionConfig::Cosine {
                constant,
                amplitude,
                mode,
                phase,
            } => GridFunction::Cosine {
                constant: *constant,
                amplitude: *amplitude,
                mode: *mode,
                phase: *phase,
            },
            GridFunctionConfig::Tanh {
                inner_value,
                outer_value,
                center,
                width,
            } => {
                if *width <= 0.0 {
                    return Err(FusionError::ConfigError(format!(
                        "tanh grid function width must be positive, got {width}"
                    )));
                }
                GridFunction::Tanh {
                    inner_value: *inner_value,
                    outer_value: *outer_value,
                    center: *center,
                    width: *width,
                }
            }
            GridFunctionConfig::Localized {
                amplitude,
                location,
                width,
                floor,
            } => {
                if width.iter().any(|w| *w <= 0.0) {
                    return Err(FusionError::ConfigError(format!(
                        "localized grid function widths must be positive, got {width:?}"
                    )));
                }
                GridFunction::Localized {
                    amplitude: *amplitude,
                    location: *location,
                    width: *width,
                    floor: *floor,
                }
            }
        })
    }

    /// Wrap existing cell data.
    pub fn from_data(data: &LevelData) -> Self {
        GridFunction::DataArray(Arc::new(data.patches().to_vec()))
    }

    /// Mapped coordinates normalised to `[0, 1]`; Miller poloidal angles
    /// are normalised over the full turn rather than per block.
    fn normalized(cs: &BlockCoordSys, xi: [f64; 2]) -> [f64; 2] {
        let mut s = cs.normalized(xi);
        if let BlockMapping::Miller(_) = cs.mapping {
            s[1] = xi[1] / TWO_PI;
        }
        s
    }

    /// Radial coordinate of tanh profiles: `x` for slabs, minor radius for
    /// Miller blocks, normalised `ξ0` otherwise.
    fn radial_coordinate(cs: &BlockCoordSys, xi: [f64; 2]) -> f64 {
        match cs.mapping {
            BlockMapping::Slab(_) => cs.real_coord(xi)[0],
            BlockMapping::Miller(_) => xi[0],
            BlockMapping::Tabulated(_) => cs.normalized(xi)[0],
        }
    }

    /// Value at mapped point `xi` of block `cs`. Not defined for
    /// `DataArray`, which only supports [`Self::assign`].
    pub fn evaluate(&self, cs: &BlockCoordSys, xi: [f64; 2]) -> FusionResult<f64> {
        Ok(match self {
            GridFunction::Constant(v) => *v,
            GridFunction::Cosine {
                constant,
                amplitude,
                mode,
                phase,
            } => {
                let s = Self::normalized(cs, xi);
                constant
                    + amplitude
                        * (TWO_PI * mode[0] * s[0] + phase[0]).cos()
                        * (TWO_PI * mode[1] * s[1] + phase[1]).cos()
            }
            GridFunction::Tanh {
                inner_value,
                outer_value,
                center,
                width,
            } => {
                let r = Self::radial_coordinate(cs, xi);
                inner_value + (outer_value - inner_value) * 0.5 * (1.0 + ((r - center) / width).tanh())
            }
            GridFunction::Localized {
                amplitude,
                location,
                width,
                floor,
            } => {
                let x = cs.real_coord(xi);
                let a0 = (x[0] - location[0]) / width[0];
                let a1 = (x[1] - location[1]) / width[1];
                floor + amplitude * (-(a0 * a0 + a1 * a1)).exp()
            }
            GridFunction::DataArray(_) => {
                return Err(FusionError::Unsupported(
                    "data-array grid functions have no pointwise evaluation".to_string(),
                ))
            }
        })
    }

    /// Fill component `comp` of every cell, ghosts included.
    pub fn assign(&self, geom: &MultiblockGeometry, data: &mut LevelData, comp: usize) -> FusionResult<()> {
        if comp >= data.ncomp() {
            return Err(FusionError::ConfigError(format!(
                "component {comp} out of range for {} components",
                data.ncomp()
            )));
        }
        let layout = Arc::clone(geom.layout());
        if let GridFunction::DataArray(src) = self {
            if src.len() != data.num_patches() {
                return Err(FusionError::GeometryMismatch(format!(
                    "data array has {} patches, target has {}",
                    src.len(),
                    data.num_patches()
                )));
            }
            for (k, a) in data.patches_mut().iter_mut().enumerate() {
                if src[k].dim().1 != a.dim().1 || src[k].dim().2 != a.dim().2 {
                    return Err(FusionError::GeometryMismatch(format!("data array patch {k} has the wrong shape")));
                }
                a.index_axis_mut(ndarray::Axis(0), comp)
                    .assign(&src[k].index_axis(ndarray::Axis(0), 0));
            }
            data.mark_ghosts_filled();
            return Ok(());
        }
        for k in 0..layout.num_patches() {
            let cs = geom.block(layout.tile(k).block);
            let (_, n0, n1) = data.patch(k).dim();
            let a = data.patch_mut(k);
            for li in 0..n0 {
                for lj in 0..n1 {
                    let (i, j) = layout.global_index(k, li, lj);
                    a[[comp, li, lj]] = self.evaluate(cs, cs.cell_center(i, j))?;
                }
            }
        }
        data.mark_ghosts_filled();
        Ok(())
    }
}
