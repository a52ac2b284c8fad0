//! Pre-run checks of a [`RunConfig`], reported as a list of issues rather
//! than a first error so a user can fix everything in one pass.

use std::{fmt, path::Path};

use serde::Serialize;

use crate::{
    management::ManagementPolicy,
    raster,
    run_config::{expand_pattern, LayerSource, RunConfig},
    simulation::CalendarMonth,
    step::StepParams,
    vector,
};

pub const NO_VALUE: &str = "parameter has no value";
pub const NOT_ON_DISK: &str = "not found on disk";
pub const NOT_A_RASTER: &str = "not a raster";
pub const NOT_A_VECTOR: &str = "not a vector";

/// Keys that caused a problem and what is wrong with them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub keys: Vec<String>,
    pub message: String,
}

impl ValidationIssue {
    fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            keys: vec![key.into()],
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.keys.join(", "), self.message)
    }
}

#[derive(Clone, Copy)]
enum FileKind {
    Raster,
    Vector,
}

struct Checker<'a> {
    limit_to: Option<&'a str>,
    issues: Vec<ValidationIssue>,
}

impl Checker<'_> {
    fn wants(&self, key: &str) -> bool {
        self.limit_to.map_or(true, |limit| limit == key)
    }

    fn push(&mut self, key: &str, message: impl Into<String>) {
        if self.wants(key) {
            self.issues.push(ValidationIssue::new(key, message));
        }
    }

    fn file(&mut self, key: &str, path: &Path, kind: FileKind) -> bool {
        if !self.wants(key) {
            return true;
        }
        if !path.exists() {
            self.push(key, NOT_ON_DISK);
            return false;
        }
        let readable = match kind {
            FileKind::Raster => raster::open(path).is_ok(),
            FileKind::Vector => vector::load_geojson(path).is_ok(),
        };
        if !readable {
            let message = match kind {
                FileKind::Raster => NOT_A_RASTER,
                FileKind::Vector => NOT_A_VECTOR,
            };
            self.push(key, message);
        }
        readable
    }
}

/// Validates every key, or only `limit_to` when given.
pub fn validate(config: &RunConfig, limit_to: Option<&str>) -> Vec<ValidationIssue> {
    let mut checker = Checker {
        limit_to,
        issues: Vec::new(),
    };
    let inputs = &config.inputs;
    let climate = &inputs.climate;

    let required: [(&str, bool); 7] = [
        ("workspace_dir", !config.workspace_dir.as_os_str().is_empty()),
        ("inputs.clay_path", inputs.clay_path.is_some()),
        ("inputs.sand_path", inputs.sand_path.is_some()),
        ("inputs.initial.aboveground_live", inputs.initial.aboveground_live.is_some()),
        ("inputs.climate.precipitation", climate.precipitation.is_some()),
        ("inputs.climate.min_temperature", climate.min_temperature.is_some()),
        ("inputs.climate.max_temperature", climate.max_temperature.is_some()),
    ];
    let no_value: Vec<String> = required
        .iter()
        .filter(|(key, present)| !present && checker.wants(key))
        .map(|(key, _)| key.to_string())
        .collect();
    if !no_value.is_empty() {
        checker.issues.push(ValidationIssue {
            keys: no_value,
            message: NO_VALUE.to_string(),
        });
    }

    if !(1..=12).contains(&config.starting_month) {
        checker.push("starting_month", "must be between 1 and 12");
    }
    if config.n_months == 0 {
        checker.push("n_months", "must be at least 1");
    }
    if config.tile_size == 0 {
        checker.push("tile_size", "must be at least 1");
    }
    if let Err(reason) = ManagementPolicy::try_from(&config.default_policy) {
        checker.push("default_policy", reason);
    }
    check_step_params(&mut checker, &config.step);

    for (key, path) in [
        ("inputs.clay_path", inputs.clay_path.as_deref()),
        ("inputs.sand_path", inputs.sand_path.as_deref()),
    ] {
        if let Some(path) = path {
            checker.file(key, path, FileKind::Raster);
        }
    }
    if let Some(LayerSource::Raster(path)) = &inputs.initial.aboveground_live {
        checker.file("inputs.initial.aboveground_live", path, FileKind::Raster);
    }
    for (name, source) in inputs.initial.optional_layers() {
        match source {
            LayerSource::Raster(path) => {
                checker.file(&format!("inputs.initial.{name}"), path, FileKind::Raster);
            }
            LayerSource::Constant(value) if !(value.is_finite() && *value >= 0.0) => {
                checker.push(&format!("inputs.initial.{name}"), "must be a non-negative number");
            }
            LayerSource::Constant(_) => {}
        }
    }
    if let Some(path) = &inputs.management_zones_path {
        checker.file("inputs.management_zones_path", path, FileKind::Vector);
    }

    // Month-specific paths are only checked once the horizon itself is sane.
    if (1..=12).contains(&config.starting_month) {
        let horizon = CalendarMonth::horizon(config.starting_year, config.starting_month, config.n_months);
        for (name, pattern) in climate.patterns() {
            let key = format!("inputs.climate.{name}");
            let Some(pattern) = pattern else { continue };
            if !checker.wants(&key) {
                continue;
            }
            let missing = horizon
                .iter()
                .find(|month| !expand_pattern(pattern, month.year, month.month).exists());
            match missing {
                Some(month) => checker.push(&key, format!("{NOT_ON_DISK} for {month}")),
                None => {
                    if let Some(first) = horizon.first() {
                        checker.file(&key, &expand_pattern(pattern, first.year, first.month), FileKind::Raster);
                    }
                }
            }
        }
    }

    checker.issues
}

/// Ranges the reference model relies on: widths and half-saturations divide,
/// fractions split a pool between two destinations.
fn check_step_params(checker: &mut Checker<'_>, step: &StepParams) {
    let positive = [
        ("temperature_width", step.temperature_width),
        ("cover_half_saturation", step.cover_half_saturation),
        ("intake_kg_per_au_month", step.intake_kg_per_au_month),
        ("hargreaves_coefficient", step.hargreaves_coefficient),
    ];
    for (name, value) in positive {
        if !(value.is_finite() && value > 0.0) {
            checker.push(&format!("step.{name}"), "must be a positive number");
        }
    }
    if !step
        .layer_depth_cm
        .iter()
        .all(|depth| depth.is_finite() && *depth > 0.0)
    {
        checker.push("step.layer_depth_cm", "every layer must have a positive depth");
    }

    let fractions = [
        ("root_fraction", step.root_fraction),
        ("shoot_senescence", step.shoot_senescence),
        ("dead_fall", step.dead_fall),
        ("root_turnover", step.root_turnover),
        ("litter_decay", step.litter_decay),
        ("litter_humified", step.litter_humified),
        ("som_decay", step.som_decay),
        ("n_leaching", step.n_leaching),
        ("max_offtake_fraction", step.max_offtake_fraction),
        ("recruitment_rate", step.recruitment_rate),
    ];
    for (name, value) in fractions {
        if !(0.0..=1.0).contains(&value) {
            checker.push(&format!("step.{name}"), "must be between 0 and 1");
        }
    }

    let non_negative = [
        ("max_production", step.max_production),
        ("n_concentration", step.n_concentration),
        ("som_n_ratio", step.som_n_ratio),
        ("residual_biomass", step.residual_biomass),
    ];
    for (name, value) in non_negative {
        if !(value.is_finite() && value >= 0.0) {
            checker.push(&format!("step.{name}"), "must be a non-negative number");
        }
    }
    if !(-90.0..=90.0).contains(&step.latitude_degrees) {
        checker.push("step.latitude_degrees", "must be between -90 and 90");
    }
    if !step.optimum_temperature.is_finite() {
        checker.push("step.optimum_temperature", "must be a finite number");
    }

    let tolerance = step.mass_balance_tolerance;
    if !(tolerance.is_finite() && tolerance > 0.0) {
        checker.push("step.mass_balance_tolerance", "must be a positive number");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{raster::RasterLayer, raster::test_support::georef};

    fn render(issues: &[ValidationIssue]) -> String {
        issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn empty_config_reports_missing_values() {
        let mut config = RunConfig::default();
        config.starting_month = 13;
        config.tile_size = 0;
        insta::assert_snapshot!(render(&validate(&config, None)), @r###"
        inputs.clay_path, inputs.sand_path, inputs.initial.aboveground_live, inputs.climate.precipitation, inputs.climate.min_temperature, inputs.climate.max_temperature: parameter has no value
        starting_month: must be between 1 and 12
        tile_size: must be at least 1
        "###);
    }

    #[test]
    fn files_are_checked_for_existence_and_type() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clay = dir.path().join("clay.asc");
        raster::write(&clay, &RasterLayer::filled("clay", georef(2, 2), None, 0.3), 2).expect("write");
        let sand = dir.path().join("sand.asc");
        fs::write(&sand, "not a grid").expect("write");
        let zones = dir.path().join("zones.geojson");
        fs::write(&zones, "{").expect("write");

        let mut config = RunConfig::default();
        config.workspace_dir = dir.path().join("ws");
        config.n_months = 2;
        config.inputs.clay_path = Some(clay.clone());
        config.inputs.sand_path = Some(sand);
        config.inputs.initial.aboveground_live = Some(LayerSource::Raster(dir.path().join("live.asc")));
        config.inputs.management_zones_path = Some(zones);
        let precip = dir.path().join("precip_{year}_{month2}.asc");
        raster::write(
            dir.path().join("precip_2016_01.asc"),
            &RasterLayer::filled("p", georef(2, 2), None, 3.0),
            2,
        )
        .expect("write");
        config.inputs.climate.precipitation = Some(precip.to_string_lossy().into_owned());
        config.inputs.climate.min_temperature = Some(clay.to_string_lossy().into_owned());
        config.inputs.climate.max_temperature = Some(clay.to_string_lossy().into_owned());

        insta::assert_snapshot!(render(&validate(&config, None)), @r###"
        inputs.sand_path: not a raster
        inputs.initial.aboveground_live: not found on disk
        inputs.management_zones_path: not a vector
        inputs.climate.precipitation: not found on disk for 2016-02
        "###);

        let limited = validate(&config, Some("inputs.sand_path"));
        assert_eq!(limited, vec![ValidationIssue::new("inputs.sand_path", NOT_A_RASTER)]);
    }

    #[test]
    fn step_parameters_are_range_checked() {
        let mut config = RunConfig::default();
        config.step.temperature_width = 0.0;
        config.step.cover_half_saturation = -1.0;
        config.step.layer_depth_cm[1] = 0.0;
        config.step.root_fraction = 1.5;
        config.step.max_offtake_fraction = f64::NAN;
        config.step.recruitment_rate = -0.1;
        config.step.max_production = -5.0;
        config.step.mass_balance_tolerance = 0.0;
        let step_issues: Vec<_> = validate(&config, None)
            .into_iter()
            .filter(|issue| issue.keys.iter().all(|key| key.starts_with("step.")))
            .collect();
        insta::assert_snapshot!(render(&step_issues), @r###"
        step.temperature_width: must be a positive number
        step.cover_half_saturation: must be a positive number
        step.layer_depth_cm: every layer must have a positive depth
        step.root_fraction: must be between 0 and 1
        step.max_offtake_fraction: must be between 0 and 1
        step.recruitment_rate: must be between 0 and 1
        step.max_production: must be a non-negative number
        step.mass_balance_tolerance: must be a positive number
        "###);
        assert!(validate(&RunConfig::default(), Some("step.root_fraction")).is_empty());
    }
}
