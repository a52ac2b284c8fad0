//! Sequences the months of a [`SimulationRun`].
//!
//! Each month is one task graph generation: per tile an optional `edges`
//! node exposing the borders of the prior state, and a `step` node that
//! consumes prior state, forcing, site, management and neighbour edges.
//! Completed states go to the [`StateStore`]; diagnostics are streamed into
//! the month's result rasters and tallied into its summary. Artifacts of
//! earlier months are evicted from the cache's memory once a month is done.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use forage_proto::{CheckpointToken, Fingerprint, StoredState, TileId};
use serde::Serialize;

use crate::{
    artifact_cache::ArtifactCache,
    artifacts::{Artifact, Halo, ManagementTile, SiteTile, TileEdges},
    error::ForageError,
    executor::{execute, CancellationToken, ExecutorOptions, NodeStatus},
    metrics::{MonthSummary, MonthTally, RunMetrics},
    outputs::MonthOutputs,
    simulation::{CalendarMonth, SimulationRun},
    state_store::StateStore,
    step::step_tile,
    taskgraph::{ArtifactKey, TaskError, TaskGraph, TaskPlan, TaskSpec},
    tiling::Direction,
    validation::ValidationIssue,
};

pub const STEP_OP: &str = "step";
pub const EDGES_OP: &str = "edges";

pub fn state_key(timestep: u32, tile: TileId) -> ArtifactKey {
    ArtifactKey::new(format!("state/t{timestep}/{tile}"))
}

pub fn forcing_key(timestep: u32, tile: TileId) -> ArtifactKey {
    ArtifactKey::new(format!("forcing/t{timestep}/{tile}"))
}

pub fn site_key(tile: TileId) -> ArtifactKey {
    ArtifactKey::new(format!("site/{tile}"))
}

pub fn management_key(tile: TileId) -> ArtifactKey {
    ArtifactKey::new(format!("management/{tile}"))
}

pub fn edges_key(timestep: u32, tile: TileId) -> ArtifactKey {
    ArtifactKey::new(format!("edges/t{timestep}/{tile}"))
}

pub fn diagnostics_key(timestep: u32, tile: TileId) -> ArtifactKey {
    ArtifactKey::new(format!("diag/t{timestep}/{tile}"))
}

pub fn step_task_name(timestep: u32, tile: TileId) -> String {
    format!("step/t{timestep}/{tile}")
}

#[derive(Debug, Clone)]
pub struct RunControl {
    pub cancel: CancellationToken,
    /// Continue from a checkpoint instead of the initial conditions.
    pub resume_from: Option<CheckpointToken>,
    /// Write result rasters and the run summary under the workspace.
    pub write_outputs: bool,
}

impl Default for RunControl {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            resume_from: None,
            write_outputs: true,
        }
    }
}

/// A tile that has no state at `timestep`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRegion {
    pub tile: TileId,
    pub timestep: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    PartialFailure { failed: Vec<FailedRegion> },
    /// `completed_through` is the last timestep held by every tile; `failed`
    /// lists tiles that had already failed before the cancellation.
    Cancelled {
        completed_through: u32,
        failed: Vec<FailedRegion>,
    },
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub metrics: RunMetrics,
    pub checkpoints: Vec<CheckpointToken>,
    pub outputs: Vec<PathBuf>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

type Prior = BTreeMap<TileId, (Fingerprint, Arc<Artifact>)>;

struct TileStatics {
    site: (SiteTile, Fingerprint),
    management: (ManagementTile, Fingerprint),
}

struct StepKeys {
    prior: ArtifactKey,
    forcing: ArtifactKey,
    site: ArtifactKey,
    management: ArtifactKey,
    edges: Vec<(Direction, ArtifactKey)>,
}

fn missing(key: &ArtifactKey) -> ForageError {
    ForageError::CacheCorruption(format!("artifact {key} missing after its task completed"))
}

fn fetch(
    plan: &TaskPlan<Artifact>,
    cache: &ArtifactCache<Artifact>,
    key: &ArtifactKey,
) -> Result<(Fingerprint, Arc<Artifact>), ForageError> {
    let fingerprint = plan.fingerprint_of(key).ok_or_else(|| missing(key))?;
    let artifact = cache.get(&fingerprint)?.ok_or_else(|| missing(key))?;
    Ok((fingerprint, artifact))
}

fn step_task(run: &SimulationRun, timestep: u32, tile: TileId, month: CalendarMonth, keys: StepKeys) -> TaskSpec<Artifact> {
    let model = Arc::clone(run.model());
    let out = timestep + 1;
    let mut spec = TaskSpec::new(step_task_name(out, tile), STEP_OP)
        .input(keys.prior.clone())
        .input(keys.forcing.clone())
        .input(keys.site.clone())
        .input(keys.management.clone());
    for (_, key) in &keys.edges {
        spec = spec.input(key.clone());
    }
    spec.output(state_key(out, tile))
        .output(diagnostics_key(out, tile))
        .param("model", &model.id())
        .param("model_params", &model.param_bytes())
        .param("month", &month.month)
        .run(move |inputs| {
            let prior = Artifact::state(inputs, &keys.prior)?;
            let forcing = Artifact::forcing(inputs, &keys.forcing)?;
            let site = Artifact::site(inputs, &keys.site)?;
            let management = Artifact::management(inputs, &keys.management)?;
            let halo = if model.uses_halo() {
                let edges = keys
                    .edges
                    .iter()
                    .map(|(direction, key)| Ok((*direction, Artifact::edges(inputs, key)?)))
                    .collect::<Result<Vec<_>, TaskError>>()?;
                Some(Halo::assemble(prior, &edges))
            } else {
                None
            };
            let (next, diagnostics) = step_tile(
                model.as_ref(),
                prior,
                forcing,
                site,
                management,
                halo.as_ref(),
                month.month,
            )
            .map_err(|err| TaskError::Failed(err.to_string()))?;
            Ok(vec![Artifact::State(next), Artifact::Diagnostics(diagnostics)])
        })
}

fn edges_task(timestep: u32, tile: TileId) -> TaskSpec<Artifact> {
    let key = state_key(timestep, tile);
    TaskSpec::new(format!("edges/t{timestep}/{tile}"), EDGES_OP)
        .input(key.clone())
        .output(edges_key(timestep, tile))
        .run(move |inputs| {
            let state = Artifact::state(inputs, &key)?;
            Ok(vec![Artifact::Edges(TileEdges::of_state(state))])
        })
}

fn initial_prior(
    run: &SimulationRun,
    store: &dyn StateStore,
    cache: &ArtifactCache<Artifact>,
    control: &RunControl,
) -> Result<(usize, Prior), ForageError> {
    let mut prior = Prior::new();
    match &control.resume_from {
        Some(token) => {
            let horizon = run.months().len();
            if token.timestep as usize > horizon {
                return Err(ForageError::Validation(vec![ValidationIssue {
                    keys: vec!["resume_from".to_string()],
                    message: format!(
                        "checkpoint at timestep {} lies beyond the {horizon}-month horizon",
                        token.timestep
                    ),
                }]));
            }
            let restored = store.restore(token)?;
            for (tile, stored) in restored.states {
                if run.layout().contains(tile) {
                    let artifact = Arc::new(Artifact::State(stored.state));
                    cache.insert_transient(stored.fingerprint, artifact.clone());
                    prior.insert(tile, (stored.fingerprint, artifact));
                }
            }
            tracing::info!(
                target: "forage::driver",
                timestep = token.timestep,
                tiles = prior.len(),
                "run.resumed"
            );
            Ok((token.timestep as usize, prior))
        }
        None => {
            for tile in run.layout().tiles() {
                let (state, fingerprint) = run.initial_state(tile)?;
                store.put(
                    tile,
                    0,
                    StoredState {
                        fingerprint,
                        state: state.clone(),
                    },
                )?;
                prior.insert(tile, (fingerprint, Arc::new(Artifact::State(state))));
            }
            Ok((0, prior))
        }
    }
}

/// Runs every remaining month. Tile failures end in
/// [`RunStatus::PartialFailure`]; only structural problems return `Err`.
pub fn run(
    run: &SimulationRun,
    store: &dyn StateStore,
    cache: &ArtifactCache<Artifact>,
    control: &RunControl,
) -> Result<RunOutcome, ForageError> {
    let config = run.config();
    let layout = run.layout();
    let months = run.months();
    let uses_halo = run.model().uses_halo();
    config.write_parameters()?;

    let mut statics: BTreeMap<TileId, TileStatics> = BTreeMap::new();
    for tile in layout.tiles() {
        statics.insert(
            tile,
            TileStatics {
                site: run.site_tile(tile)?,
                management: run.management_tile(tile)?,
            },
        );
    }

    let (start, mut prior) = initial_prior(run, store, cache, control)?;
    let options = ExecutorOptions {
        workers: config.n_workers,
        fail_fast: config.fail_fast,
        cancel: control.cancel.clone(),
    };

    let mut metrics = RunMetrics::default();
    let mut failed: Vec<FailedRegion> = Vec::new();
    let mut checkpoints = Vec::new();
    let mut outputs = Vec::new();
    let mut cancelled_at: Option<u32> = None;

    for (index, month) in months.iter().copied().enumerate().skip(start) {
        let timestep = index as u32;
        let out = timestep + 1;
        if control.cancel.is_cancelled() {
            cancelled_at = Some(timestep);
            break;
        }

        let mut graph = TaskGraph::new();
        let mut month_failed = Vec::new();
        let mut stepped = Vec::new();
        for (tile, (fingerprint, artifact)) in &prior {
            let seeded = (!cache.contains(fingerprint)).then(|| artifact.as_ref().clone());
            graph.seed(state_key(timestep, *tile), *fingerprint, seeded);
            if uses_halo {
                graph.add_task(edges_task(timestep, *tile));
            }
        }
        for tile in layout.tiles() {
            if !prior.contains_key(&tile) {
                month_failed.push(FailedRegion {
                    tile,
                    timestep: out,
                    reason: format!("no state at timestep {timestep}"),
                });
                continue;
            }
            let neighbors = layout.neighbors(tile);
            if uses_halo {
                if let Some((_, dead)) = neighbors.iter().find(|(_, n)| !prior.contains_key(n)) {
                    month_failed.push(FailedRegion {
                        tile,
                        timestep: out,
                        reason: format!("neighbour {dead} has no state at timestep {timestep}"),
                    });
                    continue;
                }
            }

            let (forcing, forcing_fp) = run.forcing_tile(index, tile)?;
            graph.seed(forcing_key(timestep, tile), forcing_fp, Some(Artifact::Forcing(forcing)));
            let tile_statics = &statics[&tile];
            let (site, site_fp) = &tile_statics.site;
            graph.seed(site_key(tile), *site_fp, Some(Artifact::Site(site.clone())));
            let (management, management_fp) = &tile_statics.management;
            graph.seed(
                management_key(tile),
                *management_fp,
                Some(Artifact::Management(management.clone())),
            );

            let edges = if uses_halo {
                neighbors
                    .iter()
                    .map(|(direction, neighbor)| (*direction, edges_key(timestep, *neighbor)))
                    .collect()
            } else {
                Vec::new()
            };
            let keys = StepKeys {
                prior: state_key(timestep, tile),
                forcing: forcing_key(timestep, tile),
                site: site_key(tile),
                management: management_key(tile),
                edges,
            };
            graph.add_task(step_task(run, timestep, tile, month, keys));
            stepped.push(tile);
        }

        let plan = graph.plan()?;
        let generation = cache.begin_generation();
        let report = execute(&plan, cache, &options)?;

        let mut tally = MonthTally::default();
        let mut month_outputs = if control.write_outputs && !report.cancelled {
            Some(MonthOutputs::create(run, month)?)
        } else {
            None
        };
        let mut next = Prior::new();
        for tile in stepped {
            let name = step_task_name(out, tile);
            let reason = match report.status_of(&name) {
                Some(NodeStatus::Done { .. }) => {
                    let (fingerprint, artifact) = fetch(&plan, cache, &state_key(out, tile))?;
                    let state = artifact
                        .as_state()
                        .ok_or_else(|| missing(&state_key(out, tile)))?;
                    store.put(
                        tile,
                        out,
                        StoredState {
                            fingerprint,
                            state: state.clone(),
                        },
                    )?;
                    let (_, diagnostics) = fetch(&plan, cache, &diagnostics_key(out, tile))?;
                    let diagnostics = diagnostics
                        .as_diagnostics()
                        .ok_or_else(|| missing(&diagnostics_key(out, tile)))?;
                    tally.add(diagnostics);
                    if let Some(month_outputs) = month_outputs.as_mut() {
                        month_outputs.add(&layout.window(tile), diagnostics)?;
                    }
                    next.insert(tile, (fingerprint, artifact));
                    continue;
                }
                Some(NodeStatus::Failed { error }) => error.clone(),
                Some(NodeStatus::Blocked { by }) => format!("blocked by {by}"),
                _ if report.cancelled => continue,
                _ => "not dispatched after an earlier failure".to_string(),
            };
            tracing::warn!(
                target: "forage::driver",
                %tile,
                timestep = out,
                reason = %reason,
                "tile.failed"
            );
            month_failed.push(FailedRegion {
                tile,
                timestep: out,
                reason,
            });
        }

        if report.cancelled {
            cancelled_at = Some(timestep);
            failed.extend(month_failed);
            break;
        }

        let summary = MonthSummary::collect(
            out,
            month,
            &tally,
            run.cell_area_m2(),
            report.executed(STEP_OP),
            report.cache_hits(STEP_OP),
            month_failed.len(),
        );
        tracing::info!(
            target: "forage::driver",
            timestep = out,
            month = %month,
            executed = summary.steps_executed,
            cached = summary.steps_cached,
            failed = summary.failed_tiles,
            "month.completed"
        );
        metrics.push(summary);
        if let Some(month_outputs) = month_outputs {
            outputs.extend(month_outputs.finish()?);
        }
        prior = next;
        // Only this month's generation can feed the next one.
        let evicted = cache.evict_older_than(generation);
        tracing::debug!(target: "forage::driver", timestep = out, evicted, "cache.evicted");

        let interval = config.checkpoint_interval;
        let due = out as usize == months.len() || (interval > 0 && out % interval == 0);
        if due {
            if prior.len() == layout.tile_count() {
                let token = store.snapshot(out)?;
                tracing::info!(target: "forage::driver", timestep = out, "checkpoint.taken");
                checkpoints.push(token);
            } else {
                tracing::warn!(
                    target: "forage::driver",
                    timestep = out,
                    missing = layout.tile_count() - prior.len(),
                    "checkpoint.skipped"
                );
            }
        }

        let stop = config.fail_fast && !month_failed.is_empty();
        failed.extend(month_failed);
        if stop {
            break;
        }
    }

    if control.write_outputs {
        let dir = config.workspace_dir.clone();
        metrics
            .write(&dir)
            .map_err(|source| ForageError::io(&dir, source))?;
    }

    let status = match cancelled_at {
        Some(completed_through) => {
            tracing::info!(
                target: "forage::driver",
                completed_through,
                failed = failed.len(),
                "run.cancelled"
            );
            RunStatus::Cancelled {
                completed_through,
                failed,
            }
        }
        None if failed.is_empty() => RunStatus::Success,
        None => RunStatus::PartialFailure { failed },
    };
    Ok(RunOutcome {
        status,
        metrics,
        checkpoints,
        outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_name_tile_and_timestep() {
        let tile = TileId::new(1, 0);
        assert_eq!(state_key(3, tile).as_str(), "state/t3/c1r0");
        assert_eq!(step_task_name(4, tile), "step/t4/c1r0");
    }
}
