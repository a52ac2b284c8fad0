#![allow(dead_code)]

use std::{fs, path::PathBuf};

use anyhow::Result;
use forage_proto::{GeoTransform, Georeference};
use forage_sim::{
    raster::{self, RasterLayer},
    run_config::LayerSource,
    CalendarMonth, OutputFormat, RunConfig, SimulationRun,
};
use tempfile::TempDir;

pub const YEAR: i32 = 2018;
pub const START_MONTH: u32 = 4;
pub const NODATA: f64 = -9999.0;

/// A scratch landscape of constant ASCII grids that tests edit cell by cell.
pub struct Scenario {
    pub dir: TempDir,
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub n_months: u32,
}

impl Scenario {
    pub fn uniform(width: u32, height: u32, tile_size: u32, n_months: u32) -> Result<Self> {
        let scenario = Self {
            dir: tempfile::tempdir()?,
            width,
            height,
            tile_size,
            n_months,
        };
        fs::create_dir_all(scenario.dir.path().join("climate"))?;
        scenario.write_constant("clay", 0.25)?;
        scenario.write_constant("sand", 0.4)?;
        scenario.write_constant("live", 80.0)?;
        for (index, month) in scenario.months().iter().enumerate() {
            scenario.write_constant(&precip_name(month), 4.0 + index as f64)?;
            scenario.write_constant(&climate_name("tmin", month), 10.0)?;
            scenario.write_constant(&climate_name("tmax", month), 26.0)?;
        }
        Ok(scenario)
    }

    pub fn georef(&self) -> Georeference {
        Georeference {
            width: self.width,
            height: self.height,
            transform: GeoTransform {
                origin_x: 320_000.0,
                origin_y: 4_510_000.0,
                pixel_width: 30.0,
                pixel_height: -30.0,
            },
            projection: None,
        }
    }

    pub fn months(&self) -> Vec<CalendarMonth> {
        CalendarMonth::horizon(YEAR, START_MONTH, self.n_months)
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{name}.asc"))
    }

    pub fn write_values(&self, name: &str, values: Vec<f64>) -> Result<()> {
        let layer = RasterLayer::new(name, self.georef(), Some(NODATA), values);
        raster::write(self.path(name), &layer, self.tile_size)?;
        Ok(())
    }

    pub fn write_constant(&self, name: &str, value: f64) -> Result<()> {
        self.write_values(name, vec![value; (self.width * self.height) as usize])
    }

    /// Rewrites one grid through `edit(x, y, value)`.
    pub fn edit(&self, name: &str, mut edit: impl FnMut(u32, u32, &mut f64)) -> Result<()> {
        let layer = raster::open(self.path(name))?.read_layer()?;
        let mut values = layer.values().to_vec();
        for (idx, value) in values.iter_mut().enumerate() {
            let idx = idx as u32;
            edit(idx % self.width, idx / self.width, value);
        }
        self.write_values(name, values)
    }

    pub fn config(&self) -> RunConfig {
        let root = self.dir.path();
        let pattern = |name: &str| {
            root.join("climate")
                .join(format!("{name}_{{year}}_{{month2}}.asc"))
                .to_string_lossy()
                .into_owned()
        };
        let mut config = RunConfig {
            workspace_dir: root.join("workspace"),
            cache_dir: Some(root.join("cache")),
            starting_year: YEAR,
            starting_month: START_MONTH,
            n_months: self.n_months,
            tile_size: self.tile_size,
            n_workers: 2,
            output_format: OutputFormat::Ascii,
            ..RunConfig::default()
        };
        config.inputs.clay_path = Some(self.path("clay"));
        config.inputs.sand_path = Some(self.path("sand"));
        config.inputs.initial.aboveground_live = Some(LayerSource::Raster(self.path("live")));
        config.inputs.climate.precipitation = Some(pattern("precip"));
        config.inputs.climate.min_temperature = Some(pattern("tmin"));
        config.inputs.climate.max_temperature = Some(pattern("tmax"));
        config
    }

    pub fn prepare(&self, config: RunConfig) -> Result<SimulationRun> {
        Ok(SimulationRun::prepare(config)?)
    }
}

pub fn climate_name(variable: &str, month: &CalendarMonth) -> String {
    format!("climate/{variable}_{}_{:02}", month.year, month.month)
}

pub fn precip_name(month: &CalendarMonth) -> String {
    climate_name("precip", month)
}
