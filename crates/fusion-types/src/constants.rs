// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Constants and Reference Units
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};

/// Elementary charge (C)
pub const Q_ELECTRON: f64 = 1.602176634e-19;

/// Proton mass (kg)
pub const M_PROTON: f64 = 1.67262192369e-27;

/// Vacuum permittivity (F/m)
pub const EPSILON_0: f64 = 8.8541878128e-12;

pub const TWO_PI: f64 = 2.0 * std::f64::consts::PI;

/// Reference quantities used to normalise the gyrokinetic system.
///
/// Temperature is in eV, mass in proton masses, everything else SI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceUnits {
    #[serde(default = "default_number_density")]
    pub number_density: f64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_length")]
    pub length: f64,
    #[serde(default = "default_mass")]
    pub mass: f64,
    #[serde(default = "default_magnetic_field")]
    pub magnetic_field: f64,
}

fn default_number_density() -> f64 {
    1.0e20
}
fn default_temperature() -> f64 {
    3.0e3
}
fn default_length() -> f64 {
    1.0
}
fn default_mass() -> f64 {
    2.0
}
fn default_magnetic_field() -> f64 {
    3.0
}

impl Default for ReferenceUnits {
    fn default() -> Self {
        ReferenceUnits {
            number_density: default_number_density(),
            temperature: default_temperature(),
            length: default_length(),
            mass: default_mass(),
            magnetic_field: default_magnetic_field(),
        }
    }
}

impl ReferenceUnits {
    /// Thermal speed sqrt(T/m) in m/s.
    pub fn thermal_speed(&self) -> f64 {
        (self.temperature * Q_ELECTRON / (self.mass * M_PROTON)).sqrt()
    }

    /// Reference gyroradius over reference length.
    pub fn larmor_number(&self) -> f64 {
        self.mass * M_PROTON * self.thermal_speed()
            / (Q_ELECTRON * self.magnetic_field * self.length)
    }

    /// Reference Debye length over reference length.
    pub fn debye_number(&self) -> f64 {
        (EPSILON_0 * self.temperature / (self.number_density * Q_ELECTRON)).sqrt() / self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_numbers_are_small_for_tokamak_units() {
        let units = ReferenceUnits::default();
        let larmor = units.larmor_number();
        let debye = units.debye_number();
        assert!(larmor > 1e-4 && larmor < 1e-1, "larmor number {larmor}");
        assert!(debye > 1e-7 && debye < 1e-3, "debye number {debye}");
        assert!(debye < larmor);
    }

    #[test]
    fn test_thermal_speed_scales_with_sqrt_temperature() {
        let mut units = ReferenceUnits::default();
        let v1 = units.thermal_speed();
        units.temperature *= 4.0;
        let v2 = units.thermal_speed();
        assert!((v2 / v1 - 2.0).abs() < 1e-12);
    }
}
