use std::{fmt::Write as _, fs, io, path::Path};

use serde::{Deserialize, Serialize};

use crate::{artifacts::DiagnosticTile, simulation::CalendarMonth, tiling::Window};

/// Full-grid diagnostics of one month assembled from tile outputs, for
/// formats that cannot be written block by block. Cells of tiles that did not
/// complete stay NaN.
#[derive(Debug, Clone)]
pub struct DiagnosticMosaic {
    pub width: u32,
    pub height: u32,
    pub standing_biomass: Vec<f64>,
    pub production: Vec<f64>,
    pub offtake: Vec<f64>,
    pub diet_sufficiency: Vec<f64>,
}

impl DiagnosticMosaic {
    pub fn new(width: u32, height: u32) -> Self {
        let nan = vec![f64::NAN; width as usize * height as usize];
        Self {
            width,
            height,
            standing_biomass: nan.clone(),
            production: nan.clone(),
            offtake: nan.clone(),
            diet_sufficiency: nan,
        }
    }

    pub fn blit(&mut self, window: &Window, tile: &DiagnosticTile) {
        let width = self.width;
        let copy = |target: &mut Vec<f64>, source: &[f64]| {
            for row in 0..window.height {
                let src = row as usize * window.width as usize;
                let dst = (window.y + row) as usize * width as usize + window.x as usize;
                target[dst..dst + window.width as usize]
                    .copy_from_slice(&source[src..src + window.width as usize]);
            }
        };
        copy(&mut self.standing_biomass, &tile.standing_biomass);
        copy(&mut self.production, &tile.production);
        copy(&mut self.offtake, &tile.offtake);
        copy(&mut self.diet_sufficiency, &tile.diet_sufficiency);
    }

    /// Takes one layer out, leaving it empty.
    pub fn take_layer(&mut self, name: &str) -> Vec<f64> {
        let layer = match name {
            "standing_biomass" => &mut self.standing_biomass,
            "offtake" => &mut self.offtake,
            "production" => &mut self.production,
            _ => &mut self.diet_sufficiency,
        };
        std::mem::take(layer)
    }
}

/// Running sums of one month's diagnostics, fed a tile at a time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonthTally {
    active_cells: usize,
    standing_biomass: f64,
    production: f64,
    offtake_g_per_m2: f64,
    diet_sufficiency: f64,
    fed_cells: usize,
}

impl MonthTally {
    pub fn add(&mut self, tile: &DiagnosticTile) {
        for (idx, biomass) in tile.standing_biomass.iter().enumerate() {
            if !biomass.is_finite() {
                continue;
            }
            self.active_cells += 1;
            self.standing_biomass += biomass;
            self.production += finite_or_zero(tile.production[idx]);
            self.offtake_g_per_m2 += finite_or_zero(tile.offtake[idx]);
            let diet = tile.diet_sufficiency[idx];
            if diet.is_finite() {
                self.diet_sufficiency += diet;
                self.fed_cells += 1;
            }
        }
    }

    pub fn active_cells(&self) -> usize {
        self.active_cells
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn mean(sum: f64, count: usize) -> Option<f64> {
    (count > 0).then(|| sum / count as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthSummary {
    pub timestep: u32,
    pub year: i32,
    pub month: u32,
    pub active_cells: usize,
    /// g/m² over active cells.
    pub mean_standing_biomass: f64,
    pub mean_production: f64,
    /// Whole-landscape offtake in kg.
    pub total_offtake_kg: f64,
    /// `None` when no cell carried animals.
    pub mean_diet_sufficiency: Option<f64>,
    pub steps_executed: usize,
    pub steps_cached: usize,
    pub failed_tiles: usize,
}

impl MonthSummary {
    #[allow(clippy::too_many_arguments)]
    pub fn collect(
        timestep: u32,
        month: CalendarMonth,
        tally: &MonthTally,
        cell_area_m2: f64,
        steps_executed: usize,
        steps_cached: usize,
        failed_tiles: usize,
    ) -> Self {
        Self {
            timestep,
            year: month.year,
            month: month.month,
            active_cells: tally.active_cells,
            mean_standing_biomass: mean(tally.standing_biomass, tally.active_cells).unwrap_or(0.0),
            mean_production: mean(tally.production, tally.active_cells).unwrap_or(0.0),
            total_offtake_kg: tally.offtake_g_per_m2 * cell_area_m2 / 1000.0,
            mean_diet_sufficiency: mean(tally.diet_sufficiency, tally.fed_cells),
            steps_executed,
            steps_cached,
            failed_tiles,
        }
    }
}

/// Per-month summaries of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub months: Vec<MonthSummary>,
}

impl RunMetrics {
    pub fn push(&mut self, summary: MonthSummary) {
        self.months.push(summary);
    }

    pub fn steps_executed(&self) -> usize {
        self.months.iter().map(|month| month.steps_executed).sum()
    }

    pub fn steps_cached(&self) -> usize {
        self.months.iter().map(|month| month.steps_cached).sum()
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from(
            "timestep,year,month,active_cells,mean_standing_biomass,mean_production,\
             total_offtake_kg,mean_diet_sufficiency,steps_executed,steps_cached,failed_tiles\n",
        );
        for m in &self.months {
            let diet = m
                .mean_diet_sufficiency
                .map(|value| value.to_string())
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{},{}",
                m.timestep,
                m.year,
                m.month,
                m.active_cells,
                m.mean_standing_biomass,
                m.mean_production,
                m.total_offtake_kg,
                diet,
                m.steps_executed,
                m.steps_cached,
                m.failed_tiles
            );
        }
        out
    }

    /// Writes `summary.json` and `summary.csv` into `dir`.
    pub fn write(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(dir.join("summary.json"), json)?;
        fs::write(dir.join("summary.csv"), self.to_csv())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forage_proto::TileId;

    #[test]
    fn summary_ignores_missing_cells() {
        let mut tally = MonthTally::default();
        let mut tile = DiagnosticTile::empty(TileId::new(0, 0), 3, 1);
        tile.standing_biomass = vec![100.0, 50.0, f64::NAN];
        tile.production = vec![10.0, 20.0, f64::NAN];
        tile.offtake = vec![2.0, 4.0, f64::NAN];
        tile.diet_sufficiency = vec![1.0, f64::NAN, f64::NAN];
        tally.add(&tile);
        tally.add(&DiagnosticTile::empty(TileId::new(1, 0), 3, 1));

        let month = CalendarMonth { year: 2020, month: 7 };
        let summary = MonthSummary::collect(3, month, &tally, 900.0, 1, 1, 0);
        assert_eq!(summary.active_cells, 2);
        assert_eq!(summary.mean_standing_biomass, 75.0);
        assert_eq!(summary.total_offtake_kg, 6.0 * 900.0 / 1000.0);
        assert_eq!(summary.mean_diet_sufficiency, Some(1.0));
    }

    #[test]
    fn mosaic_places_tiles_by_window() {
        let mut mosaic = DiagnosticMosaic::new(3, 2);
        let mut tile = DiagnosticTile::empty(TileId::new(1, 0), 1, 2);
        tile.standing_biomass = vec![7.0, 8.0];
        mosaic.blit(&Window::new(2, 0, 1, 2), &tile);
        let biomass = mosaic.take_layer("standing_biomass");
        assert_eq!(biomass[2], 7.0);
        assert_eq!(biomass[5], 8.0);
        assert!(biomass[0].is_nan());
    }

    #[test]
    fn csv_has_one_row_per_month() {
        let mut metrics = RunMetrics::default();
        let tally = MonthTally::default();
        for timestep in 1..=2 {
            let month = CalendarMonth { year: 2020, month: timestep };
            metrics.push(MonthSummary::collect(timestep, month, &tally, 1.0, 1, 0, 0));
        }
        let csv = metrics.to_csv();
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.lines().nth(2).is_some_and(|line| line.starts_with("2,2020,2,0,")));
        assert_eq!(metrics.steps_executed(), 2);
    }
}
