//! Worker groups
//!
//! A pipeline runs identically on every member of a group. Members meet at
//! barriers where they swap small messages: the batch outcomes, the
//! registration summary and the final telemetry.
//!
//! | Group | Members |
//! |---|---|
//! | [`Solo`] | one process, no synchronisation |
//! | [`LocalGroup`] | threads in one process |
//! | [`FileGroup`] | processes sharing the cache directory |

mod file;
mod local;

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

pub use file::FileGroup;
pub use local::LocalGroup;

use crate::config::{RANK_VAR, SESSION_VAR, WORLD_SIZE_VAR};
use crate::error::{ConfigError, SyncError};

/// Directory under the cache root holding filesystem group messages
pub const SYNC_DIR: &str = ".sync";

/// Membership and collective operations of one worker
pub trait Communicator: Send {
    /// This member's position, `0..size`
    fn rank(&self) -> usize;

    /// Number of members
    fn size(&self) -> usize;

    /// All-gather: every member contributes `payload` and receives every
    /// member's payload, indexed by rank. Doubles as a barrier.
    fn exchange(&mut self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, SyncError>;

    /// Tell the other members to stop waiting for this one
    fn abort(&mut self);

    /// Block until every member arrives
    fn barrier(&mut self) -> Result<(), SyncError> {
        self.exchange(Vec::new()).map(|_| ())
    }

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// Single-member group
#[derive(Debug, Default, Clone, Copy)]
pub struct Solo;

impl Communicator for Solo {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn exchange(&mut self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, SyncError> {
        Ok(vec![payload])
    }

    fn abort(&mut self) {}
}

/// Typed all-gather over JSON
pub fn all_gather<T>(comm: &mut dyn Communicator, value: &T) -> Result<Vec<T>, SyncError>
where
    T: Serialize + DeserializeOwned,
{
    let payload = serde_json::to_vec(value)?;
    comm.exchange(payload)?
        .iter()
        .map(|bytes| serde_json::from_slice(bytes).map_err(SyncError::from))
        .collect()
}

/// Build the group described by `NDUSTRIA_RANK`, `NDUSTRIA_WORLD_SIZE` and
/// `NDUSTRIA_SESSION`.
///
/// Without a world size above one this is [`Solo`]. Otherwise the members
/// meet under `<cache_root>/.sync/<session>`.
pub fn from_env(
    cache_root: &Path,
    timeout: Option<Duration>,
) -> Result<Box<dyn Communicator>, crate::Error> {
    from_lookup(|key| std::env::var(key).ok(), cache_root, timeout)
}

pub(crate) fn from_lookup<F>(
    env: F,
    cache_root: &Path,
    timeout: Option<Duration>,
) -> Result<Box<dyn Communicator>, crate::Error>
where
    F: Fn(&str) -> Option<String>,
{
    let size = parse_var(&env, WORLD_SIZE_VAR)?.unwrap_or(1);
    if size <= 1 {
        return Ok(Box::new(Solo));
    }
    let rank = parse_var(&env, RANK_VAR)?.unwrap_or(0);
    let session = env(SESSION_VAR)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(default_session);

    info!(rank, size, session = %session, "joining filesystem worker group");
    let group = FileGroup::join(cache_root.join(SYNC_DIR), &session, rank, size, timeout)?;
    Ok(Box::new(group))
}

fn parse_var<F>(env: &F, key: &str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| {
            raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: key.to_string(),
                message: format!("'{raw}' is not a valid number"),
            })
        })
        .transpose()
}

/// Processes started together by one launcher share a parent
#[cfg(unix)]
fn default_session() -> String {
    format!("ppid-{}", std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
fn default_session() -> String {
    "default".to_string()
}
