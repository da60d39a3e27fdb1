//! Exit codes for the CLI

use ndustria_core::{Error, PipelineError};

/// Success
#[allow(dead_code)]
pub const SUCCESS: i32 = 0;

/// General error
pub const ERROR: i32 = 1;

/// Configuration error
pub const CONFIG_ERROR: i32 = 2;

/// User cancelled
pub const CANCELLED: i32 = 130;

/// Exit code for a failed command
pub fn for_error(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(Error::Pipeline(PipelineError::Cancelled)) => CANCELLED,
        Some(e) if e.is_config() => CONFIG_ERROR,
        _ => ERROR,
    }
}
