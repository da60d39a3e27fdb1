//! Run options and summaries

use std::path::PathBuf;
use std::time::Duration;

/// Options for one [`Pipeline::run`](crate::Pipeline::run)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Clear the cache entries of every registered task first (asks for
    /// confirmation)
    pub rerun: bool,
    /// Walk the schedule without invoking any callable
    pub dry_run: bool,
    /// Write `<name>_timing.csv` after the run
    pub timeit: bool,
    /// Write `<name>_memcheck.csv` after the run
    pub memcheck: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            rerun: false,
            dry_run: false,
            timeit: true,
            memcheck: false,
        }
    }
}

impl RunOptions {
    pub fn rerun(mut self, rerun: bool) -> Self {
        self.rerun = rerun;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn timeit(mut self, timeit: bool) -> Self {
        self.timeit = timeit;
        self
    }

    pub fn memcheck(mut self, memcheck: bool) -> Self {
        self.memcheck = memcheck;
        self
    }
}

/// What a run did on this worker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Tasks executed by this worker
    pub executed: usize,
    /// Tasks already done when the run started
    pub cached: usize,
    /// Views shown by this worker
    pub views_shown: usize,
    /// Scheduler iterations over both sweeps
    pub iterations: usize,
    /// Wall-clock time of the run
    pub duration: Duration,
    /// Timing CSV, when written by this worker
    pub timing_file: Option<PathBuf>,
    /// Memcheck CSV, when written by this worker
    pub memcheck_file: Option<PathBuf>,
}

/// Result of [`Pipeline::clear_cache`](crate::Pipeline::clear_cache)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearOutcome {
    /// These cache files were removed
    Cleared(Vec<String>),
    /// No registered task had a cache entry
    NothingToClear,
}
