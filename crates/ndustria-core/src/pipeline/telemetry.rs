//! Per-task timing and memory CSV files

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::task::Telemetry;

/// One CSV row
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRow {
    pub name: String,
    pub telemetry: Telemetry,
}

/// `<name>, <seconds>` per task
pub fn timing_csv(rows: &[TelemetryRow]) -> String {
    let mut out = String::new();
    for row in rows {
        let _ = writeln!(out, "{}, {}", row.name, row.telemetry.wall_time.as_secs_f64());
    }
    out
}

/// `<name>, <initial>, <final>, <peak>` per task, in bytes
pub fn memcheck_csv(rows: &[TelemetryRow]) -> String {
    let mut out = String::new();
    for row in rows {
        let memory = row.telemetry.memory;
        let _ = writeln!(
            out,
            "{}, {}, {}, {}",
            row.name, memory.initial, memory.final_bytes, memory.peak
        );
    }
    out
}

/// Write `contents` to `<root>/<pipeline>_<suffix>.csv`.
///
/// Failures are logged and swallowed.
pub(crate) fn write_report(root: &Path, pipeline: &str, suffix: &str, contents: &str) -> Option<PathBuf> {
    let path = root.join(format!("{pipeline}_{suffix}.csv"));
    match fs::write(&path, contents) {
        Ok(()) => {
            debug!(path = %path.display(), "wrote run telemetry");
            Some(path)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not write run telemetry");
            None
        }
    }
}
