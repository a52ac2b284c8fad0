//! Core engine of the rangeland forage simulation.
//!
//! A run is prepared once ([`SimulationRun::prepare`]) and then advanced month
//! by month by [`driver::run`], which schedules one step per tile on a
//! fingerprinted task graph whose artifacts are cached across runs.

pub mod artifact_cache;
pub mod artifacts;
pub mod driver;
mod error;
pub mod executor;
pub mod management;
pub mod metrics;
pub mod outputs;
pub mod raster;
pub mod raster_ascii;
pub mod raster_tiled;
pub mod run_config;
pub mod simulation;
pub mod spatial_index;
pub mod state_store;
pub mod step;
pub mod synth;
pub mod taskgraph;
pub mod tiling;
pub mod validation;
pub mod vector;

pub use artifact_cache::{ArtifactCache, CacheError};
pub use artifacts::Artifact;
pub use driver::{run, FailedRegion, RunControl, RunOutcome, RunStatus};
pub use error::ForageError;
pub use executor::{execute, CancellationToken, ExecutorOptions, NodeStatus, RunReport, TaskFailure};
pub use management::{GrazingMonths, ManagementMap, ManagementPolicy, PolicyConfig, PolicyKind};
pub use metrics::{MonthSummary, MonthTally, RunMetrics};
pub use outputs::{MonthOutputs, OUTPUT_LAYERS, OUTPUT_NODATA};
pub use raster::{open, open_aligned, RasterError, RasterFormat, RasterLayer, RasterSource};
pub use raster_tiled::TiledRasterWriter;
pub use run_config::{load_run_config_from_env, ConfigError, OutputFormat, RunConfig, RunConfigMetadata};
pub use simulation::{CalendarMonth, SimulationRun};
pub use spatial_index::{IndexError, SpatialIndex};
pub use state_store::{DiskStateStore, MemoryStateStore, StateAsOf, StateError, StateStore};
pub use step::{CenturyModel, StepError, StepModel, StepParams};
pub use taskgraph::{ArtifactKey, GraphError, TaskError, TaskGraph, TaskInputs, TaskPlan, TaskSpec};
pub use tiling::{Direction, TileLayout, Window};
pub use validation::{validate, ValidationIssue};
pub use vector::{load_geojson, BoundingBox, Geometry, VectorError, VectorFeature};
