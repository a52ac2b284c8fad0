//! Seeded synthetic landscapes for demos and benchmarks.

use std::{
    fs,
    path::{Path, PathBuf},
};

use forage_proto::{GeoTransform, Georeference};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;

use crate::{
    error::ForageError,
    raster::{self, RasterLayer},
    run_config::{LayerSource, OutputFormat, RunConfig},
    simulation::CalendarMonth,
};

pub const SYNTH_NODATA: f64 = -9999.0;

#[derive(Debug, Clone)]
pub struct SynthOptions {
    pub width: u32,
    pub height: u32,
    pub starting_year: i32,
    pub starting_month: u32,
    pub n_months: u32,
    pub tile_size: u32,
    pub seed: u64,
    pub format: OutputFormat,
    /// Write a two-zone management GeoJSON.
    pub zones: bool,
}

impl Default for SynthOptions {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            starting_year: 2016,
            starting_month: 1,
            n_months: 12,
            tile_size: 16,
            seed: 7,
            format: OutputFormat::Ascii,
            zones: true,
        }
    }
}

pub fn synthetic_georef(width: u32, height: u32) -> Georeference {
    Georeference {
        width,
        height,
        transform: GeoTransform {
            origin_x: 500_000.0,
            origin_y: 4_200_000.0,
            pixel_width: 30.0,
            pixel_height: -30.0,
        },
        projection: Some("EPSG:32614".to_string()),
    }
}

struct Writer<'a> {
    dir: &'a Path,
    georef: Georeference,
    extension: &'static str,
    block: u32,
}

impl Writer<'_> {
    fn layer(&self, name: &str, values: Vec<f64>) -> Result<PathBuf, ForageError> {
        let relative = PathBuf::from(format!("{name}.{}", self.extension));
        let layer = RasterLayer::new(name, self.georef.clone(), Some(SYNTH_NODATA), values);
        raster::write(self.dir.join(&relative), &layer, self.block)?;
        Ok(relative)
    }
}

/// Writes site, initial, climate and zone inputs plus `run_config.json` into
/// `dir` and returns the config with paths resolved against `dir`.
pub fn synthesize(dir: &Path, options: &SynthOptions) -> Result<RunConfig, ForageError> {
    fs::create_dir_all(dir.join("climate")).map_err(|source| ForageError::io(dir, source))?;
    let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
    let (w, h) = (options.width, options.height);
    let writer = Writer {
        dir,
        georef: synthetic_georef(w, h),
        extension: options.format.raster_format().extension(),
        block: options.tile_size.max(1),
    };

    // A ridge running west to east: finer texture and less biomass uphill.
    let elevation: Vec<f64> = (0..h)
        .flat_map(|y| (0..w).map(move |x| (x as f64 / w.max(1) as f64, y as f64 / h.max(1) as f64)))
        .map(|(fx, fy)| 0.5 * (1.0 - (2.0 * fy - 1.0).abs()) + 0.2 * fx)
        .collect();
    // The north-east corner cell is outside the study area.
    let outside = |idx: usize| idx == (w as usize).saturating_sub(1);

    let mut field = |base: f64, slope: f64, jitter: f64| -> Vec<f64> {
        elevation
            .iter()
            .enumerate()
            .map(|(idx, e)| {
                if outside(idx) {
                    SYNTH_NODATA
                } else {
                    base + slope * e + rng.gen_range(-jitter..=jitter)
                }
            })
            .collect()
    };
    let clay = field(0.35, -0.2, 0.02);
    let sand = field(0.3, 0.25, 0.02);
    let live = field(90.0, -50.0, 5.0);

    let clay_path = writer.layer("clay", clay)?;
    let sand_path = writer.layer("sand", sand)?;
    let live_path = writer.layer("aboveground_live", live)?;

    let len = w as usize * h as usize;
    for month in CalendarMonth::horizon(options.starting_year, options.starting_month, options.n_months) {
        let season = ((month.month as f64 - 1.0) / 12.0 * std::f64::consts::TAU).cos();
        let wet = 5.0 - 3.0 * season;
        let warm = 14.0 - 12.0 * season;
        let precipitation: Vec<f64> = (0..len).map(|_| (wet + rng.gen_range(-0.5..=0.5)).max(0.0)).collect();
        let min_temperature: Vec<f64> = elevation.iter().map(|e| warm - 7.0 - 4.0 * e).collect();
        let max_temperature: Vec<f64> = elevation.iter().map(|e| warm + 7.0 - 4.0 * e).collect();
        let stamp = format!("{}_{:02}", month.year, month.month);
        writer.layer(&format!("climate/precip_{stamp}"), precipitation)?;
        writer.layer(&format!("climate/tmin_{stamp}"), min_temperature)?;
        writer.layer(&format!("climate/tmax_{stamp}"), max_temperature)?;
    }

    let zones_path = if options.zones {
        let transform = writer.georef.transform;
        let west = transform.origin_x;
        let north = transform.origin_y;
        let mid = west + transform.pixel_width * (w / 2) as f64;
        let east = west + transform.pixel_width * w as f64;
        let south = north + transform.pixel_height * h as f64;
        let ring = |x0: f64, x1: f64| json!([[[x0, south], [x1, south], [x1, north], [x0, north], [x0, south]]]);
        let zones = json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "id": 1,
                    "geometry": {"type": "Polygon", "coordinates": ring(west, mid)},
                    "properties": {"policy": "continuous", "animal_units_per_ha": 0.6}
                },
                {
                    "type": "Feature",
                    "id": 2,
                    "geometry": {"type": "Polygon", "coordinates": ring(mid, east)},
                    "properties": {
                        "policy": "seasonal",
                        "animal_units_per_ha": 1.2,
                        "grazing_months": [5, 6, 7, 8, 9]
                    }
                }
            ]
        });
        let path = dir.join("zones.geojson");
        fs::write(&path, zones.to_string()).map_err(|source| ForageError::io(&path, source))?;
        Some(PathBuf::from("zones.geojson"))
    } else {
        None
    };

    let ext = writer.extension;
    let mut config = RunConfig {
        workspace_dir: PathBuf::from("workspace"),
        starting_year: options.starting_year,
        starting_month: options.starting_month,
        n_months: options.n_months,
        tile_size: options.tile_size,
        output_format: options.format,
        ..RunConfig::default()
    };
    config.inputs.clay_path = Some(clay_path);
    config.inputs.sand_path = Some(sand_path);
    config.inputs.initial.aboveground_live = Some(LayerSource::Raster(live_path));
    config.inputs.climate.precipitation = Some(format!("climate/precip_{{year}}_{{month2}}.{ext}"));
    config.inputs.climate.min_temperature = Some(format!("climate/tmin_{{year}}_{{month2}}.{ext}"));
    config.inputs.climate.max_temperature = Some(format!("climate/tmax_{{year}}_{{month2}}.{ext}"));
    config.inputs.management_zones_path = zones_path;

    let json = config.to_json_pretty().map_err(|err| ForageError::Encode {
        what: "run config".to_string(),
        reason: err.to_string(),
    })?;
    let path = dir.join("run_config.json");
    fs::write(&path, json).map_err(|source| ForageError::io(&path, source))?;
    tracing::info!(
        target: "forage::config",
        path = %path.display(),
        seed = options.seed,
        "synth.written"
    );

    config.resolve_relative(dir);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate;

    #[test]
    fn synthetic_inputs_validate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = SynthOptions {
            width: 8,
            height: 6,
            n_months: 2,
            tile_size: 4,
            ..SynthOptions::default()
        };
        let config = synthesize(dir.path(), &options).expect("synth");
        assert_eq!(validate(&config, None), Vec::new());
        let reloaded = RunConfig::from_file(&dir.path().join("run_config.json")).expect("reload");
        assert_eq!(reloaded, config);
    }

    #[test]
    fn same_seed_same_landscape() {
        let a = tempfile::tempdir().expect("tempdir");
        let b = tempfile::tempdir().expect("tempdir");
        let options = SynthOptions {
            width: 5,
            height: 5,
            n_months: 1,
            zones: false,
            ..SynthOptions::default()
        };
        synthesize(a.path(), &options).expect("synth a");
        synthesize(b.path(), &options).expect("synth b");
        let read = |dir: &Path| fs::read_to_string(dir.join("clay.asc")).expect("clay");
        assert_eq!(read(a.path()), read(b.path()));
    }
}
