mod common;

use std::sync::Arc;

use anyhow::Result;
use forage_proto::{CellState, TileId};
use forage_sim::{
    driver,
    step::{CellDiagnostics, CellForcing, CellSite},
    ArtifactCache, CancellationToken, CenturyModel, ManagementPolicy, MemoryStateStore, OutputFormat,
    RunControl, RunStatus, SimulationRun, StateError, StateStore, StepError, StepModel,
};

/// The reference model, except that it raises `cancel` while stepping `month`.
struct CancelDuring {
    inner: CenturyModel,
    month: u32,
    cancel: CancellationToken,
}

impl StepModel for CancelDuring {
    fn id(&self) -> &'static str {
        self.inner.id()
    }

    fn param_bytes(&self) -> Vec<u8> {
        self.inner.param_bytes()
    }

    fn uses_halo(&self) -> bool {
        self.inner.uses_halo()
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
        if month == self.month {
            self.cancel.cancel();
        }
        self.inner.step_cell(prior, forcing, site, policy, month, neighbor_live)
    }
}

fn east_fails_in_april(scenario: &common::Scenario) -> Result<()> {
    let april = scenario.months()[0];
    scenario.edit(&common::precip_name(&april), |x, _, value| {
        if x >= 2 {
            *value = -1.0;
        }
    })
}

#[test]
fn bad_forcing_fails_only_its_tile() -> Result<()> {
    let scenario = common::Scenario::uniform(4, 2, 2, 3)?;
    east_fails_in_april(&scenario)?;

    let run = scenario.prepare(scenario.config())?;
    let store = MemoryStateStore::new();
    let outcome = driver::run(&run, &store, &ArtifactCache::in_memory(), &RunControl::default())?;

    let RunStatus::PartialFailure { failed } = &outcome.status else {
        panic!("expected partial failure, got {:?}", outcome.status);
    };
    let east = TileId::new(1, 0);
    let first = &failed[0];
    assert_eq!((first.tile, first.timestep), (east, 1));
    assert!(first.reason.contains("negative precipitation"), "{}", first.reason);
    assert!(failed.iter().all(|region| region.tile == east));
    assert_eq!(failed.len(), 3);

    let west = TileId::new(0, 0);
    for timestep in 1..=3 {
        assert!(store.get(west, timestep).is_ok(), "west tile missing t{timestep}");
    }
    assert!(matches!(store.get(east, 1), Err(StateError::NotFound { .. })));
    assert!(outcome.checkpoints.is_empty());
    assert_eq!(outcome.metrics.months.len(), 3);
    assert!(outcome.metrics.months.iter().all(|month| month.failed_tiles == 1));
    Ok(())
}

#[test]
fn fail_fast_stops_after_the_failing_month() -> Result<()> {
    let scenario = common::Scenario::uniform(4, 2, 2, 3)?;
    east_fails_in_april(&scenario)?;
    let mut config = scenario.config();
    config.fail_fast = true;

    let run = scenario.prepare(config)?;
    let control = RunControl {
        write_outputs: false,
        ..RunControl::default()
    };
    let outcome = driver::run(&run, &MemoryStateStore::new(), &ArtifactCache::in_memory(), &control)?;
    assert!(matches!(outcome.status, RunStatus::PartialFailure { .. }));
    assert_eq!(outcome.metrics.months.len(), 1);
    Ok(())
}

#[test]
fn cancellation_keeps_earlier_failures() -> Result<()> {
    let scenario = common::Scenario::uniform(4, 2, 2, 3)?;
    east_fails_in_april(&scenario)?;
    let mut config = scenario.config();
    // One worker and one live tile in May: the cancellation lands between
    // months, never inside one.
    config.n_workers = 1;
    let cancel = CancellationToken::new();
    let model = CancelDuring {
        inner: CenturyModel::new(config.step.clone()),
        month: 5,
        cancel: cancel.clone(),
    };
    let run = SimulationRun::with_model(config, Arc::new(model))?;
    let control = RunControl {
        cancel,
        write_outputs: false,
        ..RunControl::default()
    };
    let outcome = driver::run(&run, &MemoryStateStore::new(), &ArtifactCache::in_memory(), &control)?;

    let RunStatus::Cancelled {
        completed_through,
        failed,
    } = &outcome.status
    else {
        panic!("expected cancellation, got {:?}", outcome.status);
    };
    assert_eq!(*completed_through, 2);
    let east = TileId::new(1, 0);
    let failed: Vec<(TileId, u32)> = failed.iter().map(|region| (region.tile, region.timestep)).collect();
    assert_eq!(failed, vec![(east, 1), (east, 2)]);
    Ok(())
}

#[test]
fn tiled_outputs_mark_failed_tiles_as_nodata() -> Result<()> {
    let scenario = common::Scenario::uniform(4, 2, 2, 2)?;
    east_fails_in_april(&scenario)?;
    let mut config = scenario.config();
    config.output_format = OutputFormat::Tiled;
    let output_dir = config.output_dir();

    let run = scenario.prepare(config)?;
    let outcome = driver::run(&run, &MemoryStateStore::new(), &ArtifactCache::in_memory(), &RunControl::default())?;
    assert!(matches!(outcome.status, RunStatus::PartialFailure { .. }));
    assert_eq!(outcome.outputs.len(), 8);

    let path = output_dir.join(format!("standing_biomass_{}_04.frs", common::YEAR));
    let layer = forage_sim::raster::open(&path)?.read_layer()?;
    for y in 0..2 {
        assert!(layer.sample(0, y).is_some_and(|value| value > 0.0));
        assert!(layer.sample(1, y).is_some());
        assert_eq!(layer.sample(2, y), None);
        assert_eq!(layer.sample(3, y), None);
    }
    Ok(())
}
