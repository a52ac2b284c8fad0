//! Monthly biophysical update of one cell and of one tile.
//!
//! The reference model is a conservative CENTURY-style bucket model. Each
//! step runs the processes in a fixed order (water balance, production,
//! senescence, decomposition, grazing, recruitment) and closes with mass
//! balance and non-negativity checks so drift is caught on the month it
//! appears.

use forage_proto::{CellState, StateTile, SOIL_LAYERS};
use rayon::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    artifacts::{DiagnosticTile, ForcingTile, Halo, ManagementTile, SiteTile},
    management::ManagementPolicy,
};

/// 1 kg/ha expressed in g/m².
const KG_PER_HA_TO_G_PER_M2: f64 = 0.1;
const SOLAR_CONSTANT: f64 = 0.0820; // MJ m⁻² min⁻¹
const MID_MONTH_DAY: [f64; 12] = [
    15.0, 46.0, 74.0, 105.0, 135.0, 166.0, 196.0, 227.0, 258.0, 288.0, 319.0, 349.0,
];
const DAYS_IN_MONTH: [f64; 12] = [
    31.0, 28.25, 31.0, 30.0, 31.0, 30.0, 31.0, 31.0, 30.0, 31.0, 30.0, 31.0,
];

#[derive(Debug, Error, PartialEq)]
pub enum StepError {
    #[error("invalid forcing: {0}")]
    InvalidForcing(String),
    #[error("{pool} balance off by {residual:e}")]
    MassBalance { pool: &'static str, residual: f64 },
    #[error("pool {pool} went negative ({value})")]
    NegativePool { pool: &'static str, value: f64 },
    #[error("tile inputs disagree in shape: {0}")]
    ShapeMismatch(String),
    #[error("cell ({x}, {y}): {source}")]
    AtCell {
        x: u32,
        y: u32,
        #[source]
        source: Box<StepError>,
    },
}

/// Parameters of the reference model. Masses in g/m², water in cm, monthly
/// rates as fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StepParams {
    /// Potential aboveground plus belowground production per month.
    pub max_production: f64,
    pub optimum_temperature: f64,
    pub temperature_width: f64,
    /// Live biomass at which canopy cover reaches half of its maximum.
    pub cover_half_saturation: f64,
    pub layer_depth_cm: [f64; SOIL_LAYERS],
    pub root_fraction: f64,
    /// Grams of N per gram of new biomass.
    pub n_concentration: f64,
    pub shoot_senescence: f64,
    pub dead_fall: f64,
    pub root_turnover: f64,
    pub litter_decay: f64,
    /// Share of decayed litter that becomes soil organic matter.
    pub litter_humified: f64,
    pub som_decay: f64,
    /// Grams of N mineralized per gram of respired organic matter.
    pub som_n_ratio: f64,
    pub n_leaching: f64,
    pub intake_kg_per_au_month: f64,
    pub max_offtake_fraction: f64,
    /// Forage never grazed below this standing biomass.
    pub residual_biomass: f64,
    pub hargreaves_coefficient: f64,
    pub latitude_degrees: f64,
    /// Fraction of mean neighbour live biomass seeded into bare cells.
    pub recruitment_rate: f64,
    pub mass_balance_tolerance: f64,
}

impl Default for StepParams {
    fn default() -> Self {
        Self {
            max_production: 250.0,
            optimum_temperature: 25.0,
            temperature_width: 12.0,
            cover_half_saturation: 20.0,
            layer_depth_cm: [20.0, 40.0],
            root_fraction: 0.4,
            n_concentration: 0.015,
            shoot_senescence: 0.1,
            dead_fall: 0.15,
            root_turnover: 0.05,
            litter_decay: 0.3,
            litter_humified: 0.3,
            som_decay: 0.01,
            som_n_ratio: 0.1,
            n_leaching: 0.05,
            intake_kg_per_au_month: 340.0,
            max_offtake_fraction: 0.5,
            residual_biomass: 30.0,
            hargreaves_coefficient: 0.0023,
            latitude_degrees: 40.0,
            recruitment_rate: 0.0,
            mass_balance_tolerance: 1e-6,
        }
    }
}

impl StepParams {
    pub fn uses_halo(&self) -> bool {
        self.recruitment_rate > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellForcing {
    pub precipitation: f64,
    pub min_temperature: f64,
    pub max_temperature: f64,
}

impl CellForcing {
    pub fn mean_temperature(&self) -> f64 {
        (self.min_temperature + self.max_temperature) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellSite {
    pub clay: f64,
    pub sand: f64,
}

impl CellSite {
    /// Volumetric field capacity from texture.
    pub fn field_capacity(&self) -> f64 {
        (0.15 + 0.35 * self.clay - 0.1 * self.sand).clamp(0.05, 0.5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CellDiagnostics {
    pub standing_biomass: f64,
    pub production: f64,
    pub offtake: f64,
    pub diet_sufficiency: Option<f64>,
    pub aet: f64,
}

/// Extraterrestrial radiation for the middle of `month`, mm/day of
/// evaporation equivalent.
fn extraterrestrial_radiation(latitude_degrees: f64, month: u32) -> f64 {
    let day = MID_MONTH_DAY[(month as usize).clamp(1, 12) - 1];
    let phi = latitude_degrees.to_radians();
    let dr = 1.0 + 0.033 * (2.0 * std::f64::consts::PI * day / 365.0).cos();
    let delta = 0.409 * (2.0 * std::f64::consts::PI * day / 365.0 - 1.39).sin();
    let ws = (-phi.tan() * delta.tan()).clamp(-1.0, 1.0).acos();
    let ra = 24.0 * 60.0 / std::f64::consts::PI
        * SOLAR_CONSTANT
        * dr
        * (ws * phi.sin() * delta.sin() + phi.cos() * delta.cos() * ws.sin());
    (ra * 0.408).max(0.0)
}

/// Hargreaves potential evapotranspiration for one month, cm.
pub fn potential_evapotranspiration(forcing: &CellForcing, params: &StepParams, month: u32) -> f64 {
    let range = (forcing.max_temperature - forcing.min_temperature).max(0.0);
    let daily_mm = params.hargreaves_coefficient
        * extraterrestrial_radiation(params.latitude_degrees, month)
        * (forcing.mean_temperature() + 17.8).max(0.0)
        * range.sqrt();
    daily_mm * DAYS_IN_MONTH[(month as usize).clamp(1, 12) - 1] / 10.0
}

/// The pluggable per-cell transition. Implementations must be pure.
pub trait StepModel: Send + Sync {
    /// Stable identity folded into every step fingerprint.
    fn id(&self) -> &'static str;

    /// Canonical parameter bytes folded into every step fingerprint.
    fn param_bytes(&self) -> Vec<u8>;

    /// Whether a step reads the prior live biomass of neighbouring cells.
    fn uses_halo(&self) -> bool;

    fn step_cell(
        &self,
        prior: &CellState,
        forcing: &CellForcing,
        site: &CellSite,
        policy: &ManagementPolicy,
        month: u32,
        neighbor_live: Option<f64>,
    ) -> Result<(CellState, CellDiagnostics), StepError>;
}

/// Conservative CENTURY-style reference model.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CenturyModel {
    pub params: StepParams,
}

impl CenturyModel {
    pub fn new(params: StepParams) -> Self {
        Self { params }
    }
}

impl StepModel for CenturyModel {
    fn id(&self) -> &'static str {
        "century/1"
    }

    fn param_bytes(&self) -> Vec<u8> {
        // Plain floats and arrays always encode.
        bincode::serialize(&self.params).unwrap_or_default()
    }

    fn uses_halo(&self) -> bool {
        self.params.uses_halo()
    }

    fn step_cell(
        &self,
        prior: &CellState,
        forcing: &CellForcing,
        site: &CellSite,
        policy: &ManagementPolicy,
        month: u32,
        neighbor_live: Option<f64>,
    ) -> Result<(CellState, CellDiagnostics), StepError> {
        step_cell(prior, forcing, site, policy, &self.params, month, neighbor_live)
    }
}

fn check_forcing(forcing: &CellForcing) -> Result<(), StepError> {
    let values = [
        ("precipitation", forcing.precipitation),
        ("min_temperature", forcing.min_temperature),
        ("max_temperature", forcing.max_temperature),
    ];
    if let Some((name, value)) = values.iter().find(|(_, value)| !value.is_finite()) {
        return Err(StepError::InvalidForcing(format!("{name} is {value}")));
    }
    if forcing.precipitation < 0.0 {
        return Err(StepError::InvalidForcing(format!(
            "negative precipitation {}",
            forcing.precipitation
        )));
    }
    Ok(())
}

fn check_balance(pool: &'static str, before: f64, after: f64, tolerance: f64) -> Result<(), StepError> {
    let residual = after - before;
    if residual.abs() > tolerance * before.abs().max(1.0) {
        return Err(StepError::MassBalance { pool, residual });
    }
    Ok(())
}

/// Advances one cell by one month.
pub fn step_cell(
    prior: &CellState,
    forcing: &CellForcing,
    site: &CellSite,
    policy: &ManagementPolicy,
    params: &StepParams,
    month: u32,
    neighbor_live: Option<f64>,
) -> Result<(CellState, CellDiagnostics), StepError> {
    check_forcing(forcing)?;
    let mut next = *prior;
    let t_mean = forcing.mean_temperature();

    // 1. Water balance.
    let field_capacity = site.field_capacity();
    let capacity = params.layer_depth_cm.map(|depth| depth * field_capacity);
    let mut incoming = forcing.precipitation;
    for (water, cap) in next.soil_water.iter_mut().zip(capacity) {
        let room = (cap - *water).max(0.0);
        let filled = incoming.min(room);
        *water += filled;
        incoming -= filled;
    }
    let drainage = incoming;
    let pet = potential_evapotranspiration(forcing, params, month);
    let mut demand = pet;
    let mut aet = 0.0;
    for water in next.soil_water.iter_mut() {
        let taken = demand.min(*water);
        *water -= taken;
        aet += taken;
        demand -= taken;
    }
    let total_capacity: f64 = capacity.iter().sum();
    let relative_water = if total_capacity > 0.0 {
        (next.total_water() / total_capacity).clamp(0.0, 1.0)
    } else {
        0.0
    };

    // 2. Production.
    let live_pools = prior.aboveground_live + prior.root_biomass;
    let cover = live_pools / (live_pools + params.cover_half_saturation);
    let temperature_factor =
        (-((t_mean - params.optimum_temperature) / params.temperature_width).powi(2)).exp();
    let moisture_factor = if pet > 0.0 { (aet / pet).clamp(0.0, 1.0) } else { 1.0 };
    let potential = params.max_production * cover * temperature_factor * moisture_factor;
    let n_limited = if params.n_concentration > 0.0 {
        next.mineral_n / params.n_concentration
    } else {
        f64::INFINITY
    };
    let production = potential.min(n_limited).max(0.0);
    next.mineral_n -= production * params.n_concentration;
    next.aboveground_live += production * (1.0 - params.root_fraction);
    next.root_biomass += production * params.root_fraction;

    // 3. Senescence.
    let senesced = next.aboveground_live * params.shoot_senescence;
    let fallen = next.standing_dead * params.dead_fall;
    let root_death = next.root_biomass * params.root_turnover;
    next.aboveground_live -= senesced;
    next.standing_dead += senesced - fallen;
    next.litter += fallen;
    next.root_biomass -= root_death;
    next.soil_organic += root_death;

    // 4. Decomposition.
    let decomposition_factor =
        2f64.powf((t_mean - 20.0) / 10.0).clamp(0.0, 2.0) * (0.2 + 0.8 * relative_water);
    let litter_loss = next.litter * (params.litter_decay * decomposition_factor).min(1.0);
    let humified = litter_loss * params.litter_humified;
    let som_loss = next.soil_organic * (params.som_decay * decomposition_factor).min(1.0);
    let respired = (litter_loss - humified) + som_loss;
    next.litter -= litter_loss;
    next.soil_organic += humified - som_loss;
    let mineralized = respired * params.som_n_ratio;
    let leaching_share = if total_capacity > 0.0 {
        (drainage / total_capacity).min(1.0)
    } else {
        0.0
    };
    let leached = (next.mineral_n + mineralized) * params.n_leaching * leaching_share;
    next.mineral_n += mineralized - leached;

    // 5. Grazing.
    let rate = policy.stocking_rate(month);
    let demand_g = rate * params.intake_kg_per_au_month * KG_PER_HA_TO_G_PER_M2;
    let standing = next.standing_biomass();
    let residual = policy.residual(params.residual_biomass);
    let available = (standing - residual).max(0.0) * params.max_offtake_fraction;
    let offtake = demand_g.min(available);
    if offtake > 0.0 && standing > 0.0 {
        let live_share = next.aboveground_live / standing;
        next.aboveground_live -= offtake * live_share;
        next.standing_dead -= offtake * (1.0 - live_share);
    }
    let diet_sufficiency = (demand_g > 0.0).then(|| offtake / demand_g);

    // 6. Recruitment into bare cells.
    let mut recruited = 0.0;
    if params.recruitment_rate > 0.0 && live_pools <= 0.0 {
        if let Some(neighbor) = neighbor_live {
            recruited = neighbor.max(0.0) * params.recruitment_rate;
            next.aboveground_live += recruited;
        }
    }

    let tolerance = params.mass_balance_tolerance;
    check_balance(
        "water",
        prior.total_water() + forcing.precipitation,
        next.total_water() + drainage + aet,
        tolerance,
    )?;
    check_balance(
        "organic",
        prior.total_organic() + production + recruited,
        next.total_organic() + respired + offtake,
        tolerance,
    )?;
    check_balance(
        "nitrogen",
        prior.mineral_n + mineralized,
        next.mineral_n + production * params.n_concentration + leached,
        tolerance,
    )?;

    let pools = [
        ("aboveground_live", &mut next.aboveground_live),
        ("standing_dead", &mut next.standing_dead),
        ("root_biomass", &mut next.root_biomass),
        ("litter", &mut next.litter),
        ("soil_organic", &mut next.soil_organic),
        ("mineral_n", &mut next.mineral_n),
    ];
    for (pool, value) in pools {
        // Rounding may leave a pool a hair below zero.
        if *value < 0.0 {
            if *value < -tolerance {
                return Err(StepError::NegativePool { pool, value: *value });
            }
            *value = 0.0;
        }
    }
    for water in next.soil_water.iter_mut() {
        if *water < -tolerance {
            return Err(StepError::NegativePool {
                pool: "soil_water",
                value: *water,
            });
        }
        *water = water.max(0.0);
    }

    let diagnostics = CellDiagnostics {
        standing_biomass: next.standing_biomass(),
        production,
        offtake,
        diet_sufficiency,
        aet,
    };
    Ok((next, diagnostics))
}

/// Advances every active cell of a tile. `halo` is only consulted when the
/// model reads neighbours.
pub fn step_tile(
    model: &dyn StepModel,
    prior: &StateTile,
    forcing: &ForcingTile,
    site: &SiteTile,
    management: &ManagementTile,
    halo: Option<&Halo>,
    month: u32,
) -> Result<(StateTile, DiagnosticTile), StepError> {
    let len = prior.cells.len();
    let shapes = [
        ("precipitation", forcing.precipitation.len()),
        ("min_temperature", forcing.min_temperature.len()),
        ("max_temperature", forcing.max_temperature.len()),
        ("clay", site.clay.len()),
        ("sand", site.sand.len()),
        ("management", management.policy_index.len()),
    ];
    if let Some((name, actual)) = shapes.iter().find(|(_, actual)| *actual != len) {
        return Err(StepError::ShapeMismatch(format!(
            "{name} has {actual} cells, state has {len}"
        )));
    }

    let width = prior.width;
    let results: Vec<Option<(CellState, CellDiagnostics)>> = (0..len)
        .into_par_iter()
        .map(|idx| {
            if !prior.mask[idx] {
                return Ok(None);
            }
            let (x, y) = (idx as u32 % width, idx as u32 / width);
            let cell_forcing = CellForcing {
                precipitation: forcing.precipitation[idx],
                min_temperature: forcing.min_temperature[idx],
                max_temperature: forcing.max_temperature[idx],
            };
            let cell_site = CellSite {
                clay: site.clay[idx],
                sand: site.sand[idx],
            };
            let neighbor_live = halo.and_then(|halo| halo.neighbor_mean(x, y));
            model
                .step_cell(
                    &prior.cells[idx],
                    &cell_forcing,
                    &cell_site,
                    &management.policy(idx),
                    month,
                    neighbor_live,
                )
                .map(Some)
                .map_err(|source| StepError::AtCell {
                    x,
                    y,
                    source: Box::new(source),
                })
        })
        .collect::<Result<_, _>>()?;

    let mut next = prior.clone();
    let mut diagnostics = DiagnosticTile::empty(prior.tile, prior.width, prior.height);
    for (idx, result) in results.into_iter().enumerate() {
        let Some((cell, diag)) = result else {
            continue;
        };
        next.cells[idx] = cell;
        diagnostics.standing_biomass[idx] = diag.standing_biomass;
        diagnostics.production[idx] = diag.production;
        diagnostics.offtake[idx] = diag.offtake;
        diagnostics.diet_sufficiency[idx] = diag.diet_sufficiency.unwrap_or(f64::NAN);
        diagnostics.aet[idx] = diag.aet;
    }
    Ok((next, diagnostics))
}
