use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{
    eyre::{bail, eyre, WrapErr},
    Result,
};
use forage_proto::{encode_checkpoint_json, CheckpointToken};
use forage_sim::{
    driver, load_run_config_from_env,
    synth::{synthesize, SynthOptions},
    validate, ArtifactCache, CancellationToken, DiskStateStore, OutputFormat, RunConfig, RunControl, RunStatus,
    SimulationRun, StateStore,
};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Rangeland forage production engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a simulation. Without --config the FORAGE_CONFIG_PATH file or the
    /// builtin defaults are used.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Resume from the checkpoint at this timestep, or `latest`.
        #[arg(long)]
        resume: Option<String>,
        /// Skip result rasters and the run summary.
        #[arg(long)]
        no_outputs: bool,
    },
    /// Check a configuration and report every problem found.
    Validate {
        #[arg(long)]
        config: PathBuf,
        /// Only check this key, e.g. `inputs.clay_path`.
        #[arg(long)]
        key: Option<String>,
    },
    /// Print the JSON schema of the run configuration.
    Schema,
    /// Write a seeded synthetic landscape and its run configuration.
    Synth {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value_t = 64)]
        width: u32,
        #[arg(long, default_value_t = 48)]
        height: u32,
        #[arg(long, default_value_t = 12)]
        months: u32,
        #[arg(long, default_value_t = 16)]
        tile_size: u32,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        #[arg(long, value_enum, default_value_t = FormatArg::Ascii)]
        format: FormatArg,
        #[arg(long)]
        no_zones: bool,
    },
    /// List the checkpoints recorded under a run's state directory.
    Checkpoints {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Tiled,
    Ascii,
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Tiled => OutputFormat::Tiled,
            FormatArg::Ascii => OutputFormat::Ascii,
        }
    }
}

#[derive(Serialize)]
struct RunSummary<'a> {
    status: &'static str,
    completed_through: Option<u32>,
    failed: &'a [driver::FailedRegion],
    steps_executed: usize,
    steps_cached: usize,
    checkpoints: Vec<u32>,
    outputs: usize,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            resume,
            no_outputs,
        } => run(config.as_deref(), resume.as_deref(), !no_outputs),
        Command::Validate { config, key } => {
            let config = RunConfig::from_file(&config)?;
            let issues = validate(&config, key.as_deref());
            if issues.is_empty() {
                println!("configuration is valid");
                return Ok(());
            }
            for issue in &issues {
                println!("{issue}");
            }
            bail!("{} validation issue(s)", issues.len())
        }
        Command::Schema => {
            let schema = schemars::schema_for!(RunConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Command::Synth {
            dir,
            width,
            height,
            months,
            tile_size,
            seed,
            format,
            no_zones,
        } => {
            let options = SynthOptions {
                width,
                height,
                n_months: months,
                tile_size,
                seed,
                format: format.into(),
                zones: !no_zones,
                ..SynthOptions::default()
            };
            synthesize(&dir, &options)?;
            println!("{}", dir.join("run_config.json").display());
            Ok(())
        }
        Command::Checkpoints { config } => {
            let config = RunConfig::from_file(&config)?;
            let store = DiskStateStore::open(config.state_dir())?;
            for token in store.checkpoints()? {
                println!("{}", encode_checkpoint_json(&token)?);
            }
            Ok(())
        }
    }
}

fn pick_checkpoint(store: &dyn StateStore, resume: &str) -> Result<CheckpointToken> {
    let checkpoints = store.checkpoints()?;
    if resume == "latest" {
        return checkpoints
            .into_iter()
            .max_by_key(|token| token.timestep)
            .ok_or_else(|| eyre!("no checkpoints recorded"));
    }
    let timestep: u32 = resume
        .parse()
        .wrap_err_with(|| format!("--resume expects a timestep or `latest`, got {resume:?}"))?;
    checkpoints
        .into_iter()
        .find(|token| token.timestep == timestep)
        .ok_or_else(|| eyre!("no checkpoint at timestep {timestep}"))
}

/// Raises `cancel` on the first Ctrl-C. The run finishes the tiles in flight
/// and reports how far it got.
fn cancel_on_ctrl_c(cancel: CancellationToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .wrap_err("failed to start the signal listener")?;
    std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Ctrl-C received, stopping after the tiles in flight");
                    cancel.cancel();
                }
            });
        })
        .wrap_err("failed to spawn the signal listener")?;
    Ok(())
}

fn run(config_path: Option<&Path>, resume: Option<&str>, write_outputs: bool) -> Result<()> {
    let config = match config_path {
        Some(path) => RunConfig::from_file(path)?,
        None => load_run_config_from_env()?.0,
    };
    let store = DiskStateStore::open(config.state_dir())?;
    let cache = ArtifactCache::open(config.cache_dir())?;
    let resume_from = resume
        .map(|resume| pick_checkpoint(&store, resume))
        .transpose()?;
    let simulation = SimulationRun::prepare(config)?;
    info!(
        tiles = simulation.layout().tile_count(),
        months = simulation.months().len(),
        "Starting run"
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone())?;
    let control = RunControl {
        resume_from,
        write_outputs,
        cancel,
    };
    let outcome = driver::run(&simulation, &store, &cache, &control)?;

    let (status, completed_through, failed) = match &outcome.status {
        RunStatus::Success => ("success", None, &[][..]),
        RunStatus::PartialFailure { failed } => ("partial_failure", None, failed.as_slice()),
        RunStatus::Cancelled {
            completed_through,
            failed,
        } => ("cancelled", Some(*completed_through), failed.as_slice()),
    };
    let summary = RunSummary {
        status,
        completed_through,
        failed,
        steps_executed: outcome.metrics.steps_executed(),
        steps_cached: outcome.metrics.steps_cached(),
        checkpoints: outcome.checkpoints.iter().map(|token| token.timestep).collect(),
        outputs: outcome.outputs.len(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !outcome.is_success() {
        warn!(status, failed = failed.len(), "Run did not complete cleanly");
        bail!("run finished with status {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_listener_leaves_the_token_alone_until_interrupted() {
        let cancel = CancellationToken::new();
        cancel_on_ctrl_c(cancel.clone()).expect("listener");
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!cancel.is_cancelled());
    }
}
