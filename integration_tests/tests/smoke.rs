mod common;

use anyhow::Result;
use forage_proto::TileId;
use forage_sim::{
    driver, ArtifactCache, CancellationToken, MemoryStateStore, RunControl, RunStatus, StateStore,
};

#[test]
fn uniform_landscape_runs_to_completion() -> Result<()> {
    let scenario = common::Scenario::uniform(4, 4, 2, 3)?;
    let config = scenario.config();
    let workspace = config.workspace_dir.clone();
    let run = scenario.prepare(config)?;
    let store = MemoryStateStore::new();
    let cache = ArtifactCache::in_memory();

    let outcome = driver::run(&run, &store, &cache, &RunControl::default())?;

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.metrics.months.len(), 3);
    assert_eq!(outcome.metrics.steps_executed(), 4 * 3);
    for tile in run.layout().tiles() {
        assert!(store.contains(tile, 3), "tile {tile} missing final state");
    }
    assert_eq!(
        outcome.checkpoints.iter().map(|token| token.timestep).collect::<Vec<_>>(),
        vec![3]
    );

    // Four result layers per month.
    assert_eq!(outcome.outputs.len(), 12);
    assert!(workspace
        .join("output")
        .join("standing_biomass_2018_06.asc")
        .is_file());
    assert!(workspace.join("parameters.json").is_file());
    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(workspace.join("summary.json"))?)?;
    assert_eq!(summary["months"].as_array().map(Vec::len), Some(3));
    assert!(workspace.join("summary.csv").is_file());

    let june = &outcome.metrics.months[2];
    assert_eq!(june.active_cells, 16);
    assert!(june.mean_standing_biomass > 0.0);
    assert_eq!(june.total_offtake_kg, 0.0);
    assert_eq!(june.mean_diet_sufficiency, None);
    Ok(())
}

#[test]
fn nodata_cells_stay_inactive() -> Result<()> {
    let scenario = common::Scenario::uniform(2, 2, 2, 2)?;
    scenario.edit("live", |x, y, value| {
        if (x, y) == (1, 1) {
            *value = common::NODATA;
        }
    })?;
    let run = scenario.prepare(scenario.config())?;
    let store = MemoryStateStore::new();
    let control = RunControl {
        write_outputs: false,
        ..RunControl::default()
    };
    let outcome = driver::run(&run, &store, &ArtifactCache::in_memory(), &control)?;

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.metrics.months[1].active_cells, 3);
    let state = store.get(TileId::new(0, 0), 2)?.state;
    assert_eq!(state.active_count(), 3);
    assert!(state.cell(1, 1).is_none());
    Ok(())
}

#[test]
fn grazed_zone_produces_offtake() -> Result<()> {
    let scenario = common::Scenario::uniform(4, 2, 2, 2)?;
    let georef = scenario.georef();
    let t = georef.transform;
    // Covers the western half of the grid.
    let (west, north) = (t.origin_x, t.origin_y);
    let (mid, south) = (west + 2.0 * t.pixel_width, north + 2.0 * t.pixel_height);
    let zones = serde_json::json!({
        "type": "FeatureCollection",
        "features": [{
            "type": "Feature",
            "id": 1,
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[west, south], [mid, south], [mid, north], [west, north], [west, south]]]
            },
            "properties": {"policy": "continuous", "animal_units_per_ha": 1.0}
        }]
    });
    let zones_path = scenario.dir.path().join("zones.geojson");
    std::fs::write(&zones_path, zones.to_string())?;

    let mut config = scenario.config();
    config.inputs.management_zones_path = Some(zones_path);
    let run = scenario.prepare(config)?;
    let control = RunControl {
        write_outputs: false,
        ..RunControl::default()
    };
    let outcome = driver::run(&run, &MemoryStateStore::new(), &ArtifactCache::in_memory(), &control)?;

    assert_eq!(outcome.status, RunStatus::Success);
    let first = &outcome.metrics.months[0];
    assert!(first.total_offtake_kg > 0.0);
    let sufficiency = first.mean_diet_sufficiency.expect("grazed cells report sufficiency");
    assert!(sufficiency > 0.0 && sufficiency <= 1.0, "{sufficiency}");
    Ok(())
}

#[test]
fn cancelled_run_stops_before_the_first_month() -> Result<()> {
    let scenario = common::Scenario::uniform(2, 2, 1, 3)?;
    let run = scenario.prepare(scenario.config())?;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let control = RunControl {
        cancel,
        write_outputs: false,
        ..RunControl::default()
    };
    let store = MemoryStateStore::new();
    let outcome = driver::run(&run, &store, &ArtifactCache::in_memory(), &control)?;

    assert_eq!(
        outcome.status,
        RunStatus::Cancelled {
            completed_through: 0,
            failed: Vec::new()
        }
    );
    assert!(outcome.metrics.months.is_empty());
    assert!(!store.contains(TileId::new(0, 0), 1));
    Ok(())
}
