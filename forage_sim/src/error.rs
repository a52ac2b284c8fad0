use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{
    artifact_cache::CacheError,
    executor::TaskFailure,
    management::ManagementError,
    raster::RasterError,
    run_config::ConfigError,
    spatial_index::IndexError,
    state_store::StateError,
    taskgraph::GraphError,
    validation::ValidationIssue,
    vector::VectorError,
};

/// Every way a run can fail before or while it executes. Per-tile step
/// failures are not errors; they end up in the run's status.
#[derive(Debug, Error)]
pub enum ForageError {
    /// Unreadable, corrupt or unsupported raster input or output.
    #[error(transparent)]
    Format(RasterError),
    #[error(transparent)]
    GeoreferenceMismatch(RasterError),
    #[error("dependency cycle: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
    #[error(transparent)]
    TaskFailure(TaskFailure),
    #[error("cache corruption: {0}")]
    CacheCorruption(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid configuration: {}", render_issues(.0))]
    Validation(Vec<ValidationIssue>),
    #[error(transparent)]
    State(StateError),
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Management(#[from] ManagementError),
    #[error(transparent)]
    Graph(GraphError),
    #[error(transparent)]
    Cache(CacheError),
    #[error("failed to encode {what}: {reason}")]
    Encode { what: String, reason: String },
    #[error("I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn render_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ForageError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ForageError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<RasterError> for ForageError {
    fn from(err: RasterError) -> Self {
        match err {
            RasterError::GeoreferenceMismatch { .. } => ForageError::GeoreferenceMismatch(err),
            other => ForageError::Format(other),
        }
    }
}

impl From<CacheError> for ForageError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Corruption { .. } => ForageError::CacheCorruption(err.to_string()),
            other => ForageError::Cache(other),
        }
    }
}

impl From<StateError> for ForageError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Corrupted { .. } => ForageError::CacheCorruption(err.to_string()),
            other => ForageError::State(other),
        }
    }
}

impl From<GraphError> for ForageError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::CyclicDependency { cycle } => ForageError::CyclicDependency { cycle },
            GraphError::TaskFailure(failure) => ForageError::TaskFailure(failure),
            GraphError::Cache(cache) => cache.into(),
            other => ForageError::Graph(other),
        }
    }
}
