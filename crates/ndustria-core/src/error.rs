//! Error types for ndustria

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using the crate-wide [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ndustria operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Cache store errors
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Worker group synchronisation errors
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Scheduling and execution errors
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when a result was requested from a task or view that has not finished.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::Pipeline(PipelineError::NotReady(_)))
    }

    /// True for errors caused by configuration rather than by running tasks.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Pipeline(PipelineError::NoProgress { .. })
                | Self::Pipeline(PipelineError::UnknownTask(_))
        )
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither the environment nor the config file name a cache directory
    #[error(
        "No cache directory configured. Set NDUSTRIA_CACHE_DIR or add it to {0}. \
         Run the first-time setup to create one."
    )]
    MissingCacheDir(PathBuf),

    /// A config file line is not of the form KEY=VALUE
    #[error("Malformed line {line} in {path}: expected KEY=VALUE")]
    Malformed { path: PathBuf, line: usize },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Cache store errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// No entry exists under the key
    #[error("No cache entry found for {0}")]
    NotFound(String),

    /// Key would escape the cache root
    #[error("Invalid cache key '{0}': keys must be relative paths inside the cache root")]
    InvalidKey(String),

    /// Manifest lock could not be acquired
    #[error("Timed out waiting for manifest lock at {0}")]
    Lock(PathBuf),

    /// IO error
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Temporary file could not be moved into place
    #[error("Failed to persist cache entry: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Worker group synchronisation errors
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another member aborted the group
    #[error("Worker group aborted by another member")]
    Aborted,

    /// Waiting for the other members took too long
    #[error("Timed out after {0:?} waiting for other workers")]
    Timeout(Duration),

    /// Members disagree about the registered pipeline
    #[error("Workers registered different pipelines: {0}")]
    Diverged(String),

    /// Shared state was poisoned by a panicking member
    #[error("Worker group state poisoned")]
    Poisoned,

    /// Invalid rank or size
    #[error("Invalid worker group: rank {rank} of size {size}")]
    InvalidMember { rank: usize, size: usize },

    /// IO error
    #[error("Worker group IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A member sent a payload that could not be decoded
    #[error("Worker group message could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Scheduling and execution errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Result requested before the task or view finished
    #[error("{0} is not ready: a dependency has not finished")]
    NotReady(String),

    /// Task asked to run while it is already running
    #[error("{0} is already running")]
    Reentrant(String),

    /// The task callable returned an error
    #[error("Task {task} failed: {error:#}")]
    TaskFailed { task: String, error: anyhow::Error },

    /// The view callable returned an error
    #[error("View {view} failed: {error:#}")]
    ViewFailed { view: String, error: anyhow::Error },

    /// An iteration finished without settling anything
    #[error(
        "No progress: {waiting} item(s) still waiting after an iteration that completed none. \
         Check your pipeline for missing dependencies: {pending}"
    )]
    NoProgress { waiting: usize, pending: String },

    /// One or more workers reported failures and the run stalled on them
    #[error("Failed on a worker: {}", .0.join("; "))]
    RemoteFailures(Vec<String>),

    /// Iteration ceiling reached with work remaining
    #[error("Iteration limit of {0} reached with work remaining")]
    IterationLimit(usize),

    /// Handle does not belong to this pipeline
    #[error("Unknown task handle #{0}")]
    UnknownTask(usize),

    /// No process-wide pipeline was installed
    #[error("No global pipeline installed")]
    GlobalUnset,

    /// User declined a destructive operation
    #[error("Operation cancelled by user")]
    Cancelled,
}
