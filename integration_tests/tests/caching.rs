mod common;

use anyhow::Result;
use forage_proto::TileId;
use forage_sim::{
    driver, Artifact, ArtifactCache, DiskStateStore, MemoryStateStore, RunControl, RunStatus, StateStore,
};

fn control() -> RunControl {
    RunControl {
        write_outputs: false,
        ..RunControl::default()
    }
}

fn run_once(
    scenario: &common::Scenario,
    config: forage_sim::RunConfig,
) -> Result<(forage_sim::RunOutcome, MemoryStateStore)> {
    let run = scenario.prepare(config.clone())?;
    let cache: ArtifactCache<Artifact> = ArtifactCache::open(config.cache_dir())?;
    let store = MemoryStateStore::new();
    let outcome = driver::run(&run, &store, &cache, &control())?;
    assert_eq!(outcome.status, RunStatus::Success);
    Ok((outcome, store))
}

#[test]
fn second_run_executes_nothing() -> Result<()> {
    let scenario = common::Scenario::uniform(4, 4, 2, 3)?;
    let config = scenario.config();

    let (first, first_store) = run_once(&scenario, config.clone())?;
    assert_eq!(first.metrics.steps_executed(), 12);
    assert_eq!(first.metrics.steps_cached(), 0);

    let (second, second_store) = run_once(&scenario, config)?;
    assert_eq!(second.metrics.steps_executed(), 0);
    assert_eq!(second.metrics.steps_cached(), 12);
    for tile in [TileId::new(0, 0), TileId::new(1, 1)] {
        assert_eq!(first_store.get(tile, 3)?, second_store.get(tile, 3)?);
    }
    Ok(())
}

#[test]
fn changed_forcing_recomputes_only_downstream_steps() -> Result<()> {
    let scenario = common::Scenario::uniform(4, 4, 2, 3)?;
    let config = scenario.config();
    run_once(&scenario, config.clone())?;

    // Wetter second month inside tile c1r0 only.
    let may = scenario.months()[1];
    scenario.edit(&common::precip_name(&may), |x, y, value| {
        if x >= 2 && y < 2 {
            *value += 2.0;
        }
    })?;
    let (outcome, _) = run_once(&scenario, config)?;

    let executed: Vec<usize> = outcome
        .metrics
        .months
        .iter()
        .map(|month| month.steps_executed)
        .collect();
    assert_eq!(executed, vec![0, 1, 1]);
    assert_eq!(outcome.metrics.steps_cached(), 10);
    Ok(())
}

#[test]
fn changed_parameter_recomputes_everything() -> Result<()> {
    let scenario = common::Scenario::uniform(4, 2, 2, 2)?;
    let config = scenario.config();
    run_once(&scenario, config.clone())?;

    let mut changed = config;
    changed.step.max_production *= 1.1;
    let (outcome, _) = run_once(&scenario, changed)?;
    assert_eq!(outcome.metrics.steps_executed(), 4);
    assert_eq!(outcome.metrics.steps_cached(), 0);
    Ok(())
}

#[test]
fn rerun_with_changed_parameter_shares_the_state_directory() -> Result<()> {
    let scenario = common::Scenario::uniform(4, 2, 2, 2)?;
    let config = scenario.config();
    let tile = TileId::new(1, 0);

    let first_store = DiskStateStore::open(config.state_dir())?;
    let cache: ArtifactCache<Artifact> = ArtifactCache::open(config.cache_dir())?;
    let first = driver::run(&scenario.prepare(config.clone())?, &first_store, &cache, &control())?;
    assert_eq!(first.status, RunStatus::Success);
    let before = first_store.get(tile, 2)?;

    let mut changed = config.clone();
    changed.step.max_production *= 1.1;
    let second_store = DiskStateStore::open(changed.state_dir())?;
    let cache: ArtifactCache<Artifact> = ArtifactCache::open(changed.cache_dir())?;
    let second = driver::run(&scenario.prepare(changed)?, &second_store, &cache, &control())?;
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.metrics.steps_executed(), 4);
    let after = second_store.get(tile, 2)?;
    assert_ne!(before.fingerprint, after.fingerprint);

    // The first run's checkpoint still restores its own states.
    let reopened = DiskStateStore::open(config.state_dir())?;
    let restored = reopened.restore(&first.checkpoints[0])?;
    assert_eq!(restored.states[&tile], before);
    Ok(())
}

#[test]
fn memory_residency_does_not_grow_with_the_horizon() -> Result<()> {
    let resident_after = |n_months: u32| -> Result<usize> {
        let scenario = common::Scenario::uniform(4, 4, 2, n_months)?;
        let cache: ArtifactCache<Artifact> = ArtifactCache::in_memory();
        let outcome = driver::run(
            &scenario.prepare(scenario.config())?,
            &MemoryStateStore::new(),
            &cache,
            &control(),
        )?;
        assert_eq!(outcome.status, RunStatus::Success);
        Ok(cache.memory_len())
    };
    assert_eq!(resident_after(2)?, resident_after(8)?);
    Ok(())
}
