use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use forage_proto::SOIL_LAYERS;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{management::PolicyConfig, raster::RasterFormat, step::StepParams};

pub const BUILTIN_RUN_CONFIG: &str = include_str!("data/run_config.json");

/// Environment variable naming a run configuration file.
pub const RUN_CONFIG_ENV: &str = "FORAGE_CONFIG_PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Tiled,
    Ascii,
}

impl OutputFormat {
    pub fn raster_format(self) -> RasterFormat {
        match self {
            OutputFormat::Tiled => RasterFormat::Tiled,
            OutputFormat::Ascii => RasterFormat::Ascii,
        }
    }
}

/// A raster path or a constant applied to every active cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum LayerSource {
    Constant(f64),
    Raster(PathBuf),
}

impl LayerSource {
    pub fn raster_path(&self) -> Option<&Path> {
        match self {
            LayerSource::Raster(path) => Some(path),
            LayerSource::Constant(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct InitialConditions {
    /// Required; its nodata cells define the inactive part of the grid.
    pub aboveground_live: Option<LayerSource>,
    pub standing_dead: LayerSource,
    pub root_biomass: LayerSource,
    pub litter: LayerSource,
    pub soil_organic: LayerSource,
    pub mineral_n: LayerSource,
    pub soil_water: [LayerSource; SOIL_LAYERS],
}

impl Default for InitialConditions {
    fn default() -> Self {
        Self {
            aboveground_live: None,
            standing_dead: LayerSource::Constant(20.0),
            root_biomass: LayerSource::Constant(100.0),
            litter: LayerSource::Constant(20.0),
            soil_organic: LayerSource::Constant(1000.0),
            mineral_n: LayerSource::Constant(3.0),
            soil_water: [LayerSource::Constant(2.0), LayerSource::Constant(4.0)],
        }
    }
}

impl InitialConditions {
    /// Every non-required layer with its config key.
    pub fn optional_layers(&self) -> Vec<(String, &LayerSource)> {
        let mut layers = vec![
            ("standing_dead".to_string(), &self.standing_dead),
            ("root_biomass".to_string(), &self.root_biomass),
            ("litter".to_string(), &self.litter),
            ("soil_organic".to_string(), &self.soil_organic),
            ("mineral_n".to_string(), &self.mineral_n),
        ];
        for (layer, source) in self.soil_water.iter().enumerate() {
            layers.push((format!("soil_water[{layer}]"), source));
        }
        layers
    }
}

/// Monthly climate path patterns. `{year}`, `{month}` and the zero-padded
/// `{month2}` are substituted per month.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ClimatePatterns {
    pub precipitation: Option<String>,
    pub min_temperature: Option<String>,
    pub max_temperature: Option<String>,
}

impl ClimatePatterns {
    pub fn patterns(&self) -> [(&'static str, Option<&str>); 3] {
        [
            ("precipitation", self.precipitation.as_deref()),
            ("min_temperature", self.min_temperature.as_deref()),
            ("max_temperature", self.max_temperature.as_deref()),
        ]
    }
}

pub fn expand_pattern(pattern: &str, year: i32, month: u32) -> PathBuf {
    PathBuf::from(
        pattern
            .replace("{year}", &year.to_string())
            .replace("{month2}", &format!("{month:02}"))
            .replace("{month}", &month.to_string()),
    )
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct InputPaths {
    pub clay_path: Option<PathBuf>,
    pub sand_path: Option<PathBuf>,
    pub initial: InitialConditions,
    pub climate: ClimatePatterns,
    /// GeoJSON of management zones; cells outside every zone use the
    /// default policy.
    pub management_zones_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RunConfig {
    pub workspace_dir: PathBuf,
    pub results_suffix: String,
    pub starting_year: i32,
    pub starting_month: u32,
    pub n_months: u32,
    pub tile_size: u32,
    /// Worker pool size; 0 uses the available parallelism.
    pub n_workers: usize,
    /// Artifact cache directory, `<workspace>/_tmp_work_tokens` when unset.
    pub cache_dir: Option<PathBuf>,
    pub fail_fast: bool,
    /// Months between checkpoints; 0 checkpoints only at the end.
    pub checkpoint_interval: u32,
    pub output_format: OutputFormat,
    pub inputs: InputPaths,
    pub default_policy: PolicyConfig,
    pub step: StepParams,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("workspace"),
            results_suffix: String::new(),
            starting_year: 2016,
            starting_month: 1,
            n_months: 12,
            tile_size: 256,
            n_workers: 0,
            cache_dir: None,
            fail_fast: false,
            checkpoint_interval: 6,
            output_format: OutputFormat::Tiled,
            inputs: InputPaths::default(),
            default_policy: PolicyConfig::default(),
            step: StepParams::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse run config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read run config from {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path:?}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RunConfig {
    pub fn builtin() -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(BUILTIN_RUN_CONFIG)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reads a config file; relative paths inside it resolve against the
    /// file's directory.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = RunConfig::from_json_str(&contents)?;
        if let Some(base) = path.parent() {
            config.resolve_relative(base);
        }
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.workspace_dir.join("_tmp_work_tokens"))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.workspace_dir.join("state")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.workspace_dir.join("output")
    }

    pub fn resolve_relative(&mut self, base: &Path) {
        let fix = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        let fix_source = |source: &mut LayerSource| {
            if let LayerSource::Raster(path) = source {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        };
        let fix_pattern = |pattern: &mut Option<String>| {
            if let Some(text) = pattern {
                if Path::new(text.as_str()).is_relative() {
                    *text = base.join(text.as_str()).to_string_lossy().into_owned();
                }
            }
        };

        fix(&mut self.workspace_dir);
        if let Some(dir) = self.cache_dir.as_mut() {
            fix(dir);
        }
        let inputs = &mut self.inputs;
        inputs.clay_path.iter_mut().for_each(fix);
        inputs.sand_path.iter_mut().for_each(fix);
        inputs.management_zones_path.iter_mut().for_each(fix);
        let initial = &mut inputs.initial;
        initial.aboveground_live.iter_mut().for_each(fix_source);
        fix_source(&mut initial.standing_dead);
        fix_source(&mut initial.root_biomass);
        fix_source(&mut initial.litter);
        fix_source(&mut initial.soil_organic);
        fix_source(&mut initial.mineral_n);
        initial.soil_water.iter_mut().for_each(fix_source);
        fix_pattern(&mut inputs.climate.precipitation);
        fix_pattern(&mut inputs.climate.min_temperature);
        fix_pattern(&mut inputs.climate.max_temperature);
    }

    /// Writes the resolved configuration next to the run outputs.
    pub fn write_parameters(&self) -> Result<PathBuf, ConfigError> {
        let path = self.workspace_dir.join("parameters.json");
        let json = self.to_json_pretty()?;
        fs::create_dir_all(&self.workspace_dir)
            .and_then(|_| fs::write(&path, json))
            .map_err(|source| ConfigError::WriteFailed {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

#[derive(Debug, Clone)]
pub struct RunConfigMetadata {
    path: Option<PathBuf>,
}

impl RunConfigMetadata {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

/// Loads the file named by `FORAGE_CONFIG_PATH`, falling back to the builtin
/// defaults when it is unset or unreadable.
pub fn load_run_config_from_env() -> Result<(RunConfig, RunConfigMetadata), ConfigError> {
    if let Some(path) = env::var(RUN_CONFIG_ENV).ok().map(PathBuf::from) {
        match RunConfig::from_file(&path) {
            Ok(config) => {
                tracing::info!(
                    target: "forage::config",
                    path = %path.display(),
                    "run_config.loaded=file"
                );
                return Ok((config, RunConfigMetadata::new(Some(path))));
            }
            Err(err) => {
                tracing::warn!(
                    target: "forage::config",
                    path = %path.display(),
                    error = %err,
                    "run_config.load_failed"
                );
            }
        }
    }

    let config = RunConfig::builtin()?;
    tracing::info!(target: "forage::config", "run_config.loaded=builtin");
    Ok((config, RunConfigMetadata::new(None)))
}
