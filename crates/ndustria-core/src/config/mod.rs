//! Configuration: cache root location and run limits

mod loader;

use std::path::{Path, PathBuf};
use std::time::Duration;

pub use loader::*;

/// Environment variable naming the cache root
pub const CACHE_DIR_VAR: &str = "NDUSTRIA_CACHE_DIR";

/// Environment variable bounding filesystem worker group waits, in seconds
pub const SYNC_TIMEOUT_VAR: &str = "NDUSTRIA_SYNC_TIMEOUT_SECS";

/// Environment variable overriding the scheduler iteration ceiling
pub const MAX_ITERATIONS_VAR: &str = "NDUSTRIA_MAX_ITERATIONS";

/// Rank of this process in a multi-process run
pub const RANK_VAR: &str = "NDUSTRIA_RANK";

/// Number of processes in a multi-process run
pub const WORLD_SIZE_VAR: &str = "NDUSTRIA_WORLD_SIZE";

/// Identifier shared by all processes of one multi-process run
pub const SESSION_VAR: &str = "NDUSTRIA_SESSION";

/// Fallback config file, relative to the home directory
pub const CONFIG_FILE_NAME: &str = ".nd_config";

/// Hard ceiling on scheduler iterations
pub const DEFAULT_MAX_ITERATIONS: usize = 10_000;

/// Resolved engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Absolute path of the cache root
    pub cache_dir: PathBuf,
    /// How long a filesystem worker group waits for its peers
    pub sync_timeout: Option<Duration>,
    /// Scheduler iteration ceiling
    pub max_iterations: usize,
}

impl Config {
    /// Configuration with defaults for everything but the cache root
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            sync_timeout: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Set the filesystem worker group timeout
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = Some(timeout);
        self
    }

    /// Set the scheduler iteration ceiling
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Cache root
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}
