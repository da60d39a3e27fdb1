//! Append-only textual run log kept in the cache root

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

/// Prefix written in front of every run log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    Info,
    Save,
    Warning,
    Error,
}

impl fmt::Display for LogTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Info => "[Info]",
            Self::Save => "[Save]",
            Self::Warning => "[Warning]",
            Self::Error => "[Error]",
        };
        f.write_str(tag)
    }
}

/// Handle on `last_run.log`. Every call opens the file in append mode, so
/// several processes may write to the same log.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line, propagating IO failures
    pub fn append(&self, tag: LogTag, message: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        writeln!(file, "{stamp} {tag} {message}")
    }

    /// Append one line; a failed write is reported through tracing only
    pub fn record(&self, tag: LogTag, message: &str) {
        if let Err(e) = self.append(tag, message) {
            warn!(path = %self.path.display(), error = %e, "could not write run log");
        }
    }

    /// Full log contents
    pub fn read(&self) -> std::io::Result<String> {
        std::fs::read_to_string(&self.path)
    }
}
