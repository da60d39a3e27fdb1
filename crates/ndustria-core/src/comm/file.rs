//! Worker group of separate processes that share a directory
//!
//! Layout under the session directory:
//!
//! ```text
//! <session>/<epoch>/<rank>.msg   one message per member per exchange
//! <session>/ABORT                written by a member that gave up
//! <session>/left/<rank>          written by a member that is done
//! ```
//!
//! Messages are written through a temporary file and renamed into place, so
//! a reader never sees a partial message.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::Communicator;
use crate::error::SyncError;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const ABORT_MARKER: &str = "ABORT";
const LEFT_DIR: &str = "left";

/// Member of a filesystem-backed worker group
#[derive(Debug)]
pub struct FileGroup {
    dir: PathBuf,
    rank: usize,
    size: usize,
    epoch: u64,
    timeout: Option<Duration>,
}

impl FileGroup {
    /// Join session `session` under `sync_root` as member `rank` of `size`
    pub fn join(
        sync_root: impl AsRef<Path>,
        session: &str,
        rank: usize,
        size: usize,
        timeout: Option<Duration>,
    ) -> Result<Self, SyncError> {
        if size == 0 || rank >= size {
            return Err(SyncError::InvalidMember { rank, size });
        }
        let dir = sync_root.as_ref().join(session);
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), rank, size, "joined worker group");

        Ok(Self {
            dir,
            rank,
            size,
            epoch: 0,
            timeout,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn epoch_dir(&self, epoch: u64) -> PathBuf {
        self.dir.join(epoch.to_string())
    }

    fn message_path(&self, epoch: u64, rank: usize) -> PathBuf {
        self.epoch_dir(epoch).join(format!("{rank}.msg"))
    }

    fn aborted(&self) -> bool {
        self.dir.join(ABORT_MARKER).exists()
    }

    fn post(&self, epoch: u64, payload: &[u8]) -> Result<(), SyncError> {
        let dir = self.epoch_dir(epoch);
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::Builder::new().prefix(".msg").tempfile_in(&dir)?;
        tmp.write_all(payload)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.message_path(epoch, self.rank))
            .map_err(|e| SyncError::Io(e.error))?;
        Ok(())
    }

    /// Every member has read epoch `epoch - 1` before posting to `epoch`,
    /// so our message from that round is no longer needed.
    fn collect_garbage(&self, epoch: u64) {
        if epoch < 2 {
            return;
        }
        let previous = epoch - 1;
        let _ = fs::remove_file(self.message_path(previous, self.rank));
        let _ = fs::remove_dir(self.epoch_dir(previous));
    }
}

impl Communicator for FileGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn exchange(&mut self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, SyncError> {
        if self.aborted() {
            return Err(SyncError::Aborted);
        }
        self.epoch += 1;
        let epoch = self.epoch;
        self.post(epoch, &payload)?;

        let start = Instant::now();
        let mut gathered: Vec<Option<Vec<u8>>> = vec![None; self.size];
        gathered[self.rank] = Some(payload);

        loop {
            for (rank, slot) in gathered.iter_mut().enumerate() {
                if slot.is_some() {
                    continue;
                }
                match fs::read(self.message_path(epoch, rank)) {
                    Ok(bytes) => *slot = Some(bytes),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(SyncError::Io(e)),
                }
            }

            if gathered.iter().all(Option::is_some) {
                break;
            }
            if self.aborted() {
                return Err(SyncError::Aborted);
            }
            if let Some(timeout) = self.timeout {
                if start.elapsed() > timeout {
                    warn!(epoch, rank = self.rank, "timed out waiting for workers");
                    return Err(SyncError::Timeout(timeout));
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        self.collect_garbage(epoch);
        Ok(gathered.into_iter().flatten().collect())
    }

    fn abort(&mut self) {
        if let Err(e) = fs::write(self.dir.join(ABORT_MARKER), self.rank.to_string()) {
            warn!(error = %e, "could not signal abort to workers");
        }
    }
}

impl Drop for FileGroup {
    /// The last member to leave removes the session directory
    fn drop(&mut self) {
        let left = self.dir.join(LEFT_DIR);
        if fs::create_dir_all(&left).is_err()
            || fs::write(left.join(self.rank.to_string()), b"").is_err()
        {
            return;
        }
        let gone = fs::read_dir(&left).map(|d| d.count()).unwrap_or(0);
        if gone >= self.size && !self.aborted() {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_exchange_between_members() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let root = root.clone();
                thread::spawn(move || {
                    let mut group =
                        FileGroup::join(&root, "s", rank, 3, Some(Duration::from_secs(10))).unwrap();
                    let mut rounds = Vec::new();
                    for round in 0..4u8 {
                        rounds.push(group.exchange(vec![rank as u8, round]).unwrap());
                    }
                    rounds
                })
            })
            .collect();

        for handle in handles {
            for (round, gathered) in handle.join().unwrap().into_iter().enumerate() {
                let expected: Vec<Vec<u8>> = (0..3u8).map(|r| vec![r, round as u8]).collect();
                assert_eq!(gathered, expected);
            }
        }
        assert!(!root.join("s").exists());
    }

    #[test]
    fn test_timeout() {
        let temp = TempDir::new().unwrap();
        let mut group =
            FileGroup::join(temp.path(), "s", 0, 2, Some(Duration::from_millis(50))).unwrap();
        assert!(matches!(group.barrier(), Err(SyncError::Timeout(_))));
    }

    #[test]
    fn test_abort_marker_stops_peers() {
        let temp = TempDir::new().unwrap();
        let mut first = FileGroup::join(temp.path(), "s", 0, 2, None).unwrap();
        let mut second = FileGroup::join(temp.path(), "s", 1, 2, None).unwrap();

        second.abort();
        assert!(matches!(first.barrier(), Err(SyncError::Aborted)));
    }

    #[test]
    fn test_invalid_member() {
        let temp = TempDir::new().unwrap();
        let err = FileGroup::join(temp.path(), "s", 3, 2, None).unwrap_err();
        assert!(matches!(err, SyncError::InvalidMember { rank: 3, size: 2 }));
    }
}
