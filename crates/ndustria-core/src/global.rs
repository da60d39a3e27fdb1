//! Process-wide default pipeline
//!
//! Scripts that register tasks from many places can install one pipeline
//! here and reach it with [`with`]. Passing a [`Pipeline`] explicitly
//! remains the primary API.

use std::sync::{Mutex, OnceLock};

use tracing::debug;

use crate::error::{PipelineError, Result, SyncError};
use crate::pipeline::Pipeline;

static GLOBAL: OnceLock<Mutex<Pipeline>> = OnceLock::new();

/// Install `pipeline` as the process default.
///
/// Only the first call succeeds; later calls hand the pipeline back.
pub fn install(pipeline: Pipeline) -> std::result::Result<(), Pipeline> {
    let name = pipeline.name().to_string();
    GLOBAL.set(Mutex::new(pipeline)).map_err(|rejected| {
        rejected
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    })?;
    debug!(pipeline = %name, "installed global pipeline");
    Ok(())
}

pub fn is_installed() -> bool {
    GLOBAL.get().is_some()
}

/// Run `f` against the installed pipeline
pub fn with<R>(f: impl FnOnce(&mut Pipeline) -> R) -> Result<R> {
    let lock = GLOBAL.get().ok_or(PipelineError::GlobalUnset)?;
    let mut pipeline = lock.lock().map_err(|_| SyncError::Poisoned)?;
    Ok(f(&mut *pipeline))
}
