// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Neutral Background
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Charge exchange on a fixed, uniform neutral background.
//!
//! Each exchange swaps an ion for one drawn from the neutral
//! Maxwellian, so the ion distribution relaxes at rate `ν n₀` towards a
//! Maxwellian with its own density and the neutral temperature.

use fusion_types::config::{KineticSpeciesConfig, NeutralsConfig};
use fusion_types::error::{FusionError, FusionResult};

use crate::block_array::LevelData;
use crate::collisions::{reference_temperature, relax_to_local_maxwellian};
use crate::geometry::MultiblockGeometry;
use crate::operators::NeutralsOperator;
use crate::species::KineticSpecies;

#[derive(Debug, Clone)]
pub struct ChargeExchange {
    rate: f64,
    temperature: LevelData,
}

impl ChargeExchange {
    pub fn from_config(
        cfg: &NeutralsConfig,
        species: &KineticSpeciesConfig,
        geom: &MultiblockGeometry,
    ) -> FusionResult<Self> {
        let NeutralsConfig::FixedBackground { frequency, density } = cfg;
        if *frequency < 0.0 || *density < 0.0 {
            return Err(FusionError::ConfigError(format!(
                "neutral background needs non-negative frequency and density, got {frequency} and {density}"
            )));
        }
        Ok(ChargeExchange {
            rate: frequency * density,
            temperature: reference_temperature(species, geom)?,
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl NeutralsOperator for ChargeExchange {
    fn accumulate_rhs(&self, rhs: &mut LevelData, species: &KineticSpecies, _time: f64) -> FusionResult<()> {
        relax_to_local_maxwellian(rhs, species, &self.temperature, self.rate)
    }

    fn compute_dt(&self, _species: &KineticSpecies) -> f64 {
        if self.rate > 0.0 {
            1.0 / self.rate
        } else {
            f64::INFINITY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fusion_types::config::{DiscretizationConfig, GeometryConfig, GridFunctionConfig, SlabConfig};
    use fusion_types::state::VelocityGrid;

    fn setup() -> (Arc<MultiblockGeometry>, KineticSpeciesConfig) {
        let g = Arc::new(
            MultiblockGeometry::new(&GeometryConfig::Slab(SlabConfig {
                cells: [4, 4],
                xmax: 1.0,
                ymax: 1.0,
                bz_inner: 2.0,
                bz_outer: 2.0,
                by_inner: 0.2,
                periodic_poloidal: true,
                discretization: DiscretizationConfig::default(),
            }))
            .expect("slab"),
        );
        let cfg = KineticSpeciesConfig {
            name: "hydrogen".to_string(),
            mass: 1.0,
            charge: 1.0,
            velocity: VelocityGrid {
                n_vpar: 6,
                n_mu: 3,
                vpar_max: 3.0,
                mu_max: 1.0,
            },
            density: GridFunctionConfig::Constant { value: 1.0 },
            temperature: GridFunctionConfig::Constant { value: 1.0 },
            collisions: None,
        };
        (g, cfg)
    }

    #[test]
    fn test_rate_and_dt() {
        let (g, cfg) = setup();
        let op = ChargeExchange::from_config(
            &NeutralsConfig::FixedBackground {
                frequency: 0.5,
                density: 0.4,
            },
            &cfg,
            &g,
        )
        .expect("neutrals");
        assert!((op.rate() - 0.2).abs() < 1e-15);
        let s = KineticSpecies::from_config(&cfg, &g).expect("species");
        assert!((op.compute_dt(&s) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_cooler_neutrals_cool_the_ions() {
        let (g, cfg) = setup();
        let mut hot = cfg.clone();
        hot.temperature = GridFunctionConfig::Constant { value: 2.0 };
        let s = KineticSpecies::from_config(&hot, &g).expect("species");
        let op = ChargeExchange::from_config(
            &NeutralsConfig::FixedBackground {
                frequency: 1.0,
                density: 1.0,
            },
            &cfg,
            &g,
        )
        .expect("neutrals");
        let mut rhs = s.dfn().clone();
        rhs.set_val(0.0);
        op.accumulate_rhs(&mut rhs, &s, 0.0).expect("rhs");
        // Fast particles are lost, slow ones gained.
        let fast = rhs.get(0, 1, 1, 0).expect("fast");
        let slow = rhs.get(0, 1, 1, 2 * 3).expect("slow");
        assert!(fast < 0.0 && slow > 0.0, "fast {fast} slow {slow}");
    }

    #[test]
    fn test_negative_background_rejected() {
        let (g, cfg) = setup();
        let err = ChargeExchange::from_config(
            &NeutralsConfig::FixedBackground {
                frequency: 1.0,
                density: -1.0,
            },
            &cfg,
            &g,
        )
        .expect_err("bad");
        assert!(matches!(err, FusionError::ConfigError(_)));
    }
}
