mod common;

use anyhow::Result;
use forage_proto::{CellState, TileId};
use forage_sim::{
    driver, ArtifactCache, MemoryStateStore, RunConfig, RunControl, RunStatus, SimulationRun,
    StateStore,
};

fn run_to_end(scenario: &common::Scenario, config: RunConfig) -> Result<(SimulationRun, MemoryStateStore)> {
    let run = scenario.prepare(config)?;
    let store = MemoryStateStore::new();
    let control = RunControl {
        write_outputs: false,
        ..RunControl::default()
    };
    let outcome = driver::run(&run, &store, &ArtifactCache::in_memory(), &control)?;
    assert_eq!(outcome.status, RunStatus::Success);
    Ok((run, store))
}

fn final_cells(scenario: &common::Scenario, recruitment_rate: f64) -> Result<Vec<(TileId, CellState)>> {
    let mut config = scenario.config();
    config.step.recruitment_rate = recruitment_rate;
    let (run, store) = run_to_end(scenario, config)?;
    run.layout()
        .tiles()
        .map(|tile| {
            let stored = store.get(tile, scenario.n_months)?;
            Ok((tile, stored.state.cells[0]))
        })
        .collect()
}

/// Final cells in row-major grid order, whatever the tiling.
fn final_grid(scenario: &common::Scenario, tile_size: u32, recruitment_rate: f64) -> Result<Vec<CellState>> {
    let mut config = scenario.config();
    config.tile_size = tile_size;
    config.step.recruitment_rate = recruitment_rate;
    let (run, store) = run_to_end(scenario, config)?;
    let width = scenario.width as usize;
    let mut grid = vec![CellState::default(); width * scenario.height as usize];
    for tile in run.layout().tiles() {
        let window = run.layout().window(tile);
        let state = store.get(tile, scenario.n_months)?.state;
        for row in 0..window.height as usize {
            for col in 0..window.width as usize {
                let at = (window.y as usize + row) * width + window.x as usize + col;
                grid[at] = state.cells[row * window.width as usize + col];
            }
        }
    }
    Ok(grid)
}

#[test]
fn identical_cells_evolve_identically() -> Result<()> {
    let scenario = common::Scenario::uniform(2, 2, 1, 3)?;
    let cells = final_cells(&scenario, 0.0)?;
    assert_eq!(cells.len(), 4);
    for (tile, cell) in &cells[1..] {
        assert_eq!(cell, &cells[0].1, "tile {tile} diverged");
    }
    Ok(())
}

#[test]
fn halo_exchange_keeps_uniform_landscape_symmetric() -> Result<()> {
    let scenario = common::Scenario::uniform(2, 2, 1, 3)?;
    let cells = final_cells(&scenario, 0.2)?;
    for (tile, cell) in &cells[1..] {
        assert_eq!(cell, &cells[0].1, "tile {tile} diverged");
    }
    Ok(())
}

#[test]
fn single_cell_perturbation_stays_local() -> Result<()> {
    let scenario = common::Scenario::uniform(2, 2, 1, 3)?;
    let baseline = final_cells(&scenario, 0.0)?;

    scenario.edit("live", |x, y, value| {
        if (x, y) == (0, 0) {
            *value *= 2.0;
        }
    })?;
    let perturbed = final_cells(&scenario, 0.0)?;

    for ((tile, before), (_, after)) in baseline.iter().zip(&perturbed) {
        if *tile == TileId::new(0, 0) {
            assert_ne!(before, after);
        } else {
            assert_eq!(before, after, "tile {tile} changed");
        }
    }
    Ok(())
}

#[test]
fn bare_cell_stays_local_without_recruitment() -> Result<()> {
    let scenario = common::Scenario::uniform(2, 2, 1, 3)?;
    let baseline = final_cells(&scenario, 0.0)?;

    scenario.edit("live", |x, y, value| {
        if (x, y) == (0, 0) {
            *value = 0.0;
        }
    })?;
    let perturbed = final_cells(&scenario, 0.0)?;

    for ((tile, before), (_, after)) in baseline.iter().zip(&perturbed) {
        if *tile == TileId::new(0, 0) {
            assert_eq!(after.aboveground_live, 0.0);
            assert_ne!(before, after);
        } else {
            assert_eq!(before, after, "tile {tile} changed");
        }
    }
    Ok(())
}

#[test]
fn border_cell_recruits_across_tiles_as_in_one_tile() -> Result<()> {
    let scenario = common::Scenario::uniform(4, 2, 2, 3)?;
    // West edge of tile c1r0; its west neighbour lives in c0r0.
    scenario.edit("live", |x, y, value| {
        if (x, y) == (2, 0) {
            *value = 0.0;
        }
    })?;

    let tiled = final_grid(&scenario, 2, 0.2)?;
    let whole = final_grid(&scenario, 4, 0.2)?;
    assert!(tiled[2].aboveground_live > 0.0, "bare cell never recruited");
    assert_eq!(tiled, whole);
    Ok(())
}
