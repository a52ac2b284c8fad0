//! A prepared run: validated configuration, aligned input rasters, tiling and
//! the resolved management map. Built once and read-only afterwards.

use std::{fmt, sync::Arc};

use forage_proto::{CellState, Fingerprint, FingerprintBuilder, Georeference, StateTile, TileId};
use serde::{Deserialize, Serialize};

use crate::{
    artifacts::{ForcingTile, ManagementTile, SiteTile},
    error::ForageError,
    management::{ManagementMap, ManagementPolicy},
    raster::{self, is_nodata, RasterError, RasterSource},
    run_config::{expand_pattern, LayerSource, RunConfig},
    spatial_index::SpatialIndex,
    step::{CenturyModel, StepModel},
    tiling::{TileLayout, Window},
    validation, vector,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CalendarMonth {
    pub year: i32,
    /// 1-based.
    pub month: u32,
}

impl CalendarMonth {
    pub fn next(self) -> Self {
        if self.month >= 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn horizon(start_year: i32, start_month: u32, n_months: u32) -> Vec<Self> {
        let mut months = Vec::with_capacity(n_months as usize);
        let mut current = Self {
            year: start_year,
            month: start_month,
        };
        for _ in 0..n_months {
            months.push(current);
            current = current.next();
        }
        months
    }
}

impl fmt::Display for CalendarMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// An initial-condition layer: a constant or an aligned raster.
#[derive(Debug)]
pub enum LayerInput {
    Constant(f64),
    Raster(RasterSource),
}

impl LayerInput {
    fn open(source: &LayerSource, reference: &Georeference) -> Result<Self, RasterError> {
        Ok(match source {
            LayerSource::Constant(value) => LayerInput::Constant(*value),
            LayerSource::Raster(path) => LayerInput::Raster(raster::open_aligned(path, reference)?),
        })
    }

    /// Window values with nodata cells as NaN, plus a content fingerprint.
    fn read(&self, window: &Window) -> Result<(Vec<f64>, Fingerprint), RasterError> {
        match self {
            LayerInput::Constant(value) => {
                let mut builder = FingerprintBuilder::new("constant_layer");
                builder
                    .u64("width", window.width as u64)
                    .u64("height", window.height as u64)
                    .f64s("value", &[*value]);
                Ok((vec![*value; window.len()], builder.finish()))
            }
            LayerInput::Raster(source) => read_masked(source, window),
        }
    }
}

fn read_masked(source: &RasterSource, window: &Window) -> Result<(Vec<f64>, Fingerprint), RasterError> {
    let (mut values, fingerprint) = source.read_window_fingerprinted(window)?;
    let nodata = source.nodata();
    for value in values.iter_mut() {
        if is_nodata(*value, nodata) {
            *value = f64::NAN;
        }
    }
    Ok((values, fingerprint))
}

#[derive(Debug)]
pub struct InitialLayers {
    pub aboveground_live: LayerInput,
    pub standing_dead: LayerInput,
    pub root_biomass: LayerInput,
    pub litter: LayerInput,
    pub soil_organic: LayerInput,
    pub mineral_n: LayerInput,
    pub soil_water: Vec<LayerInput>,
}

#[derive(Debug)]
pub struct MonthForcing {
    pub month: CalendarMonth,
    pub precipitation: RasterSource,
    pub min_temperature: RasterSource,
    pub max_temperature: RasterSource,
}

pub struct SimulationRun {
    config: RunConfig,
    georef: Georeference,
    layout: TileLayout,
    months: Vec<CalendarMonth>,
    model: Arc<dyn StepModel>,
    clay: RasterSource,
    sand: RasterSource,
    initial: InitialLayers,
    forcing: Vec<MonthForcing>,
    management: ManagementMap,
}

impl fmt::Debug for SimulationRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationRun")
            .field("model", &self.model.id())
            .field("layout", &self.layout)
            .field("months", &self.months.len())
            .finish()
    }
}

fn required<T>(value: Option<T>, key: &str) -> Result<T, ForageError> {
    value.ok_or_else(|| {
        ForageError::Validation(vec![validation::ValidationIssue {
            keys: vec![key.to_string()],
            message: validation::NO_VALUE.to_string(),
        }])
    })
}

impl SimulationRun {
    /// Prepares a run of the reference model parameterised by `config.step`.
    pub fn prepare(config: RunConfig) -> Result<Self, ForageError> {
        let model = Arc::new(CenturyModel::new(config.step.clone()));
        Self::with_model(config, model)
    }

    /// Validates `config`, opens every input aligned to the clay grid and
    /// resolves management zones.
    pub fn with_model(config: RunConfig, model: Arc<dyn StepModel>) -> Result<Self, ForageError> {
        let issues = validation::validate(&config, None);
        if !issues.is_empty() {
            return Err(ForageError::Validation(issues));
        }
        let inputs = &config.inputs;

        let clay = raster::open(required(inputs.clay_path.as_ref(), "inputs.clay_path")?)?;
        let georef = clay.georef().clone();
        let sand = raster::open_aligned(required(inputs.sand_path.as_ref(), "inputs.sand_path")?, &georef)?;

        let initial_config = &inputs.initial;
        let live = required(
            initial_config.aboveground_live.as_ref(),
            "inputs.initial.aboveground_live",
        )?;
        let initial = InitialLayers {
            aboveground_live: LayerInput::open(live, &georef)?,
            standing_dead: LayerInput::open(&initial_config.standing_dead, &georef)?,
            root_biomass: LayerInput::open(&initial_config.root_biomass, &georef)?,
            litter: LayerInput::open(&initial_config.litter, &georef)?,
            soil_organic: LayerInput::open(&initial_config.soil_organic, &georef)?,
            mineral_n: LayerInput::open(&initial_config.mineral_n, &georef)?,
            soil_water: initial_config
                .soil_water
                .iter()
                .map(|source| LayerInput::open(source, &georef))
                .collect::<Result<_, _>>()?,
        };

        let months = CalendarMonth::horizon(config.starting_year, config.starting_month, config.n_months);
        let climate = &inputs.climate;
        let precipitation = required(climate.precipitation.as_deref(), "inputs.climate.precipitation")?;
        let min_temperature = required(climate.min_temperature.as_deref(), "inputs.climate.min_temperature")?;
        let max_temperature = required(climate.max_temperature.as_deref(), "inputs.climate.max_temperature")?;
        let forcing = months
            .iter()
            .map(|month| {
                let open = |pattern: &str| {
                    raster::open_aligned(expand_pattern(pattern, month.year, month.month), &georef)
                };
                Ok(MonthForcing {
                    month: *month,
                    precipitation: open(precipitation)?,
                    min_temperature: open(min_temperature)?,
                    max_temperature: open(max_temperature)?,
                })
            })
            .collect::<Result<Vec<_>, RasterError>>()?;

        let management = match &inputs.management_zones_path {
            Some(path) => {
                let index = SpatialIndex::build(vector::load_geojson(path)?)?;
                ManagementMap::resolve(&index, &georef, &config.default_policy)?
            }
            None => {
                let policy = ManagementPolicy::try_from(&config.default_policy)
                    .map_err(crate::management::ManagementError::InvalidDefault)?;
                ManagementMap::uniform(georef.width, georef.height, policy)
            }
        };

        let layout = TileLayout::new(georef.width, georef.height, config.tile_size);
        tracing::info!(
            target: "forage::driver",
            width = georef.width,
            height = georef.height,
            tiles = layout.tile_count(),
            months = months.len(),
            model = model.id(),
            "run.prepared"
        );
        Ok(Self {
            config,
            georef,
            layout,
            months,
            model,
            clay,
            sand,
            initial,
            forcing,
            management,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn georef(&self) -> &Georeference {
        &self.georef
    }

    pub fn layout(&self) -> &TileLayout {
        &self.layout
    }

    pub fn months(&self) -> &[CalendarMonth] {
        &self.months
    }

    pub fn model(&self) -> &Arc<dyn StepModel> {
        &self.model
    }

    pub fn management(&self) -> &ManagementMap {
        &self.management
    }

    pub fn cell_area_m2(&self) -> f64 {
        (self.georef.transform.pixel_width * self.georef.transform.pixel_height).abs()
    }

    pub fn site_tile(&self, tile: TileId) -> Result<(SiteTile, Fingerprint), RasterError> {
        let window = self.layout.window(tile);
        let (clay, clay_fp) = read_masked(&self.clay, &window)?;
        let (sand, sand_fp) = read_masked(&self.sand, &window)?;
        let mut builder = FingerprintBuilder::new("site");
        builder.fingerprint("clay", &clay_fp).fingerprint("sand", &sand_fp);
        Ok((SiteTile { clay, sand }, builder.finish()))
    }

    pub fn management_tile(&self, tile: TileId) -> Result<(ManagementTile, Fingerprint), ForageError> {
        let window = self.layout.window(tile);
        let management = ManagementTile {
            policy_index: self.management.window_indices(&window),
            policies: self.management.policies().to_vec(),
        };
        let mut builder = FingerprintBuilder::new("management");
        builder
            .value("tile", &management)
            .map_err(|err| ForageError::Encode {
                what: format!("management/{tile}"),
                reason: err.to_string(),
            })?;
        Ok((management, builder.finish()))
    }

    /// Climate of month `index` (0-based into [`Self::months`]).
    pub fn forcing_tile(&self, index: usize, tile: TileId) -> Result<(ForcingTile, Fingerprint), RasterError> {
        let window = self.layout.window(tile);
        let month = &self.forcing[index];
        let (precipitation, p_fp) = read_masked(&month.precipitation, &window)?;
        let (min_temperature, tmin_fp) = read_masked(&month.min_temperature, &window)?;
        let (max_temperature, tmax_fp) = read_masked(&month.max_temperature, &window)?;
        let mut builder = FingerprintBuilder::new("forcing");
        builder
            .fingerprint("precipitation", &p_fp)
            .fingerprint("min_temperature", &tmin_fp)
            .fingerprint("max_temperature", &tmax_fp);
        Ok((
            ForcingTile {
                precipitation,
                min_temperature,
                max_temperature,
            },
            builder.finish(),
        ))
    }

    /// Initial state of a tile. Cells that are nodata in live biomass, clay
    /// or sand are inactive; nodata in the other pools reads as zero.
    pub fn initial_state(&self, tile: TileId) -> Result<(StateTile, Fingerprint), RasterError> {
        let window = self.layout.window(tile);
        let initial = &self.initial;
        let (live, live_fp) = initial.aboveground_live.read(&window)?;
        let (dead, dead_fp) = initial.standing_dead.read(&window)?;
        let (roots, roots_fp) = initial.root_biomass.read(&window)?;
        let (litter, litter_fp) = initial.litter.read(&window)?;
        let (som, som_fp) = initial.soil_organic.read(&window)?;
        let (mineral_n, n_fp) = initial.mineral_n.read(&window)?;
        let water = initial
            .soil_water
            .iter()
            .map(|layer| layer.read(&window))
            .collect::<Result<Vec<_>, _>>()?;
        let (clay, clay_fp) = read_masked(&self.clay, &window)?;
        let (sand, sand_fp) = read_masked(&self.sand, &window)?;

        let mut state = StateTile::inactive(tile, window.width, window.height);
        let or_zero = |value: f64| if value.is_nan() { 0.0 } else { value };
        for idx in 0..window.len() {
            if live[idx].is_nan() || clay[idx].is_nan() || sand[idx].is_nan() {
                continue;
            }
            state.mask[idx] = true;
            let mut cell = CellState {
                aboveground_live: live[idx],
                standing_dead: or_zero(dead[idx]),
                root_biomass: or_zero(roots[idx]),
                litter: or_zero(litter[idx]),
                soil_organic: or_zero(som[idx]),
                mineral_n: or_zero(mineral_n[idx]),
                ..CellState::default()
            };
            for (layer, (values, _)) in cell.soil_water.iter_mut().zip(water.iter()) {
                *layer = or_zero(values[idx]);
            }
            state.cells[idx] = cell;
        }

        let mut builder = FingerprintBuilder::new("initial_state");
        builder
            .u64("col", tile.col as u64)
            .u64("row", tile.row as u64)
            .fingerprint("aboveground_live", &live_fp)
            .fingerprint("standing_dead", &dead_fp)
            .fingerprint("root_biomass", &roots_fp)
            .fingerprint("litter", &litter_fp)
            .fingerprint("soil_organic", &som_fp)
            .fingerprint("mineral_n", &n_fp)
            .fingerprint("clay", &clay_fp)
            .fingerprint("sand", &sand_fp);
        for (_, fingerprint) in &water {
            builder.fingerprint("soil_water", fingerprint);
        }
        Ok((state, builder.finish()))
    }
}
