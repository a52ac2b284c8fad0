//! Grazing management policies and their per-cell resolution.

use std::collections::{BTreeMap, HashMap};

use bitflags::bitflags;
use forage_proto::Georeference;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{spatial_index::SpatialIndex, tiling::Window};

bitflags! {
    /// Calendar months in which a seasonal policy grazes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct GrazingMonths: u16 {
        const JAN = 1 << 0;
        const FEB = 1 << 1;
        const MAR = 1 << 2;
        const APR = 1 << 3;
        const MAY = 1 << 4;
        const JUN = 1 << 5;
        const JUL = 1 << 6;
        const AUG = 1 << 7;
        const SEP = 1 << 8;
        const OCT = 1 << 9;
        const NOV = 1 << 10;
        const DEC = 1 << 11;
    }
}

impl GrazingMonths {
    /// Flag for a 1-based calendar month.
    pub fn month(month: u32) -> Option<Self> {
        (1..=12)
            .contains(&month)
            .then(|| Self::from_bits_truncate(1 << (month - 1)))
    }

    pub fn grazes(&self, month: u32) -> bool {
        Self::month(month).is_some_and(|flag| self.contains(flag))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ManagementPolicy {
    Ungrazed,
    Continuous {
        animal_units_per_ha: f64,
    },
    Seasonal {
        animal_units_per_ha: f64,
        months: GrazingMonths,
    },
    /// Grazes only the forage standing above `residual_biomass` (g/m²).
    Threshold {
        animal_units_per_ha: f64,
        residual_biomass: f64,
    },
}

impl ManagementPolicy {
    /// Animal units per hectare present in `month`.
    pub fn stocking_rate(&self, month: u32) -> f64 {
        match *self {
            ManagementPolicy::Ungrazed => 0.0,
            ManagementPolicy::Continuous {
                animal_units_per_ha,
            }
            | ManagementPolicy::Threshold {
                animal_units_per_ha,
                ..
            } => animal_units_per_ha,
            ManagementPolicy::Seasonal {
                animal_units_per_ha,
                months,
            } => {
                if months.grazes(month) {
                    animal_units_per_ha
                } else {
                    0.0
                }
            }
        }
    }

    /// Biomass left ungrazed, falling back to the run-wide residual.
    pub fn residual(&self, default_residual: f64) -> f64 {
        match *self {
            ManagementPolicy::Threshold {
                residual_biomass, ..
            } => residual_biomass.max(default_residual),
            _ => default_residual,
        }
    }
}

impl Default for ManagementPolicy {
    fn default() -> Self {
        ManagementPolicy::Ungrazed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Ungrazed,
    Continuous,
    Seasonal,
    Threshold,
}

/// Policy as written in configuration and zone attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyConfig {
    pub policy: PolicyKind,
    #[serde(default)]
    pub animal_units_per_ha: f64,
    /// 1-based calendar months; only read by seasonal policies.
    #[serde(default)]
    pub grazing_months: Vec<u32>,
    #[serde(default)]
    pub residual_biomass: Option<f64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Ungrazed,
            animal_units_per_ha: 0.0,
            grazing_months: Vec::new(),
            residual_biomass: None,
        }
    }
}

impl PolicyConfig {
    pub fn from_attributes(attributes: &BTreeMap<String, Value>) -> Result<Self, String> {
        let object: serde_json::Map<String, Value> = attributes
            .iter()
            .filter(|(key, _)| {
                matches!(
                    key.as_str(),
                    "policy" | "animal_units_per_ha" | "grazing_months" | "residual_biomass"
                )
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        serde_json::from_value(Value::Object(object)).map_err(|err| err.to_string())
    }
}

impl TryFrom<&PolicyConfig> for ManagementPolicy {
    type Error = String;

    fn try_from(config: &PolicyConfig) -> Result<Self, Self::Error> {
        let rate = config.animal_units_per_ha;
        if config.policy != PolicyKind::Ungrazed && !(rate.is_finite() && rate >= 0.0) {
            return Err(format!("animal_units_per_ha {rate} must be a non-negative number"));
        }
        Ok(match config.policy {
            PolicyKind::Ungrazed => ManagementPolicy::Ungrazed,
            PolicyKind::Continuous => ManagementPolicy::Continuous {
                animal_units_per_ha: rate,
            },
            PolicyKind::Seasonal => {
                let mut months = GrazingMonths::empty();
                for &month in &config.grazing_months {
                    months |= GrazingMonths::month(month)
                        .ok_or_else(|| format!("grazing month {month} outside 1..=12"))?;
                }
                if months.is_empty() {
                    return Err("seasonal policy needs at least one grazing month".to_string());
                }
                ManagementPolicy::Seasonal {
                    animal_units_per_ha: rate,
                    months,
                }
            }
            PolicyKind::Threshold => {
                let residual_biomass = config
                    .residual_biomass
                    .ok_or("threshold policy needs residual_biomass")?;
                if !(residual_biomass.is_finite() && residual_biomass >= 0.0) {
                    return Err(format!("residual_biomass {residual_biomass} must be non-negative"));
                }
                ManagementPolicy::Threshold {
                    animal_units_per_ha: rate,
                    residual_biomass,
                }
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum ManagementError {
    #[error("management zone {feature} has invalid attributes: {reason}")]
    InvalidZone { feature: u64, reason: String },
    #[error("invalid default policy: {0}")]
    InvalidDefault(String),
    #[error("more than {max} distinct management policies", max = u16::MAX)]
    TooManyPolicies,
}

/// Policy index per grid cell, resolved once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagementMap {
    policies: Vec<ManagementPolicy>,
    width: u32,
    cells: Vec<u16>,
}

impl ManagementMap {
    pub fn uniform(width: u32, height: u32, policy: ManagementPolicy) -> Self {
        Self {
            policies: vec![policy],
            width,
            cells: vec![0; width as usize * height as usize],
        }
    }

    /// Resolves each cell centre against the zone index. Cells outside every
    /// zone take `default`, which is always policy 0.
    pub fn resolve(
        index: &SpatialIndex,
        georef: &Georeference,
        default: &PolicyConfig,
    ) -> Result<Self, ManagementError> {
        let default = ManagementPolicy::try_from(default).map_err(ManagementError::InvalidDefault)?;
        let mut map = Self::uniform(georef.width, georef.height, default);

        let mut by_feature: HashMap<u64, u16> = HashMap::new();
        for feature in index.features() {
            let policy = PolicyConfig::from_attributes(&feature.attributes)
                .and_then(|config| ManagementPolicy::try_from(&config))
                .map_err(|reason| ManagementError::InvalidZone {
                    feature: feature.id,
                    reason,
                })?;
            let slot = match map.policies.iter().position(|known| *known == policy) {
                Some(slot) => slot,
                None => {
                    map.policies.push(policy);
                    map.policies.len() - 1
                }
            };
            let slot = u16::try_from(slot).map_err(|_| ManagementError::TooManyPolicies)?;
            by_feature.insert(feature.id, slot);
        }

        for row in 0..georef.height {
            for col in 0..georef.width {
                let (x, y) = georef.transform.cell_center(col, row);
                if let Some(zone) = index.query_point(x, y) {
                    map.cells[row as usize * georef.width as usize + col as usize] = by_feature[&zone.id];
                }
            }
        }
        tracing::debug!(
            target: "forage::config",
            zones = index.len(),
            policies = map.policies.len(),
            "management.resolved"
        );
        Ok(map)
    }

    pub fn policies(&self) -> &[ManagementPolicy] {
        &self.policies
    }

    pub fn policy_at(&self, x: u32, y: u32) -> ManagementPolicy {
        self.policies[self.cells[y as usize * self.width as usize + x as usize] as usize]
    }

    /// Policy indices of the cells in `window`, row-major.
    pub fn window_indices(&self, window: &Window) -> Vec<u16> {
        let mut out = Vec::with_capacity(window.len());
        for y in window.y..window.bottom() {
            let start = y as usize * self.width as usize + window.x as usize;
            out.extend_from_slice(&self.cells[start..start + window.width as usize]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{raster::test_support::georef, vector::test_support::square};

    #[test]
    fn seasonal_policy_grazes_only_listed_months() {
        let config = PolicyConfig {
            policy: PolicyKind::Seasonal,
            animal_units_per_ha: 0.8,
            grazing_months: vec![5, 6, 7],
            residual_biomass: None,
        };
        let policy = ManagementPolicy::try_from(&config).expect("valid");
        assert_eq!(policy.stocking_rate(6), 0.8);
        assert_eq!(policy.stocking_rate(1), 0.0);
    }

    #[test]
    fn threshold_requires_residual() {
        let config = PolicyConfig {
            policy: PolicyKind::Threshold,
            animal_units_per_ha: 1.0,
            ..PolicyConfig::default()
        };
        let err = ManagementPolicy::try_from(&config).expect_err("missing residual");
        assert!(err.contains("residual_biomass"), "{err}");
    }

    #[test]
    fn zones_resolve_per_cell_centre() {
        // 4x4 grid at 30 m from (500000, 4200000); zone covers the south-west quarter.
        let georef = georef(4, 4);
        let zone = square(3, 500_000.0, 4_199_880.0, 60.0)
            .with_attribute("policy", "continuous")
            .with_attribute("animal_units_per_ha", 0.5)
            .with_attribute("name", "west pasture");
        let index = SpatialIndex::build(vec![zone]).expect("index");
        let map = ManagementMap::resolve(&index, &georef, &PolicyConfig::default()).expect("map");

        assert_eq!(map.policies().len(), 2);
        assert_eq!(
            map.policy_at(1, 2),
            ManagementPolicy::Continuous {
                animal_units_per_ha: 0.5
            }
        );
        assert_eq!(map.policy_at(2, 2), ManagementPolicy::Ungrazed);
        assert_eq!(map.policy_at(0, 0), ManagementPolicy::Ungrazed);
        assert_eq!(map.window_indices(&Window::new(0, 2, 4, 1)), vec![1, 1, 0, 0]);
    }

    #[test]
    fn bad_zone_attributes_name_the_feature() {
        let zone = square(11, 0.0, 0.0, 10.0).with_attribute("policy", "rotational");
        let index = SpatialIndex::build(vec![zone]).expect("index");
        let err = ManagementMap::resolve(&index, &georef(2, 2), &PolicyConfig::default())
            .expect_err("unknown policy");
        assert!(matches!(err, ManagementError::InvalidZone { feature: 11, .. }));
    }
}
