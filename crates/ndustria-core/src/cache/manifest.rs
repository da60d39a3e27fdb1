//! Cache manifest: filename → (task description, byte size)
//!
//! The manifest is a side table used for listing and packing. It is never
//! consulted for correctness, so a damaged manifest is replaced by an empty
//! one instead of failing the store.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;

const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_WAIT: Duration = Duration::from_secs(60);
const LOCK_POLL: Duration = Duration::from_millis(10);

/// One manifest row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Human-readable description of the task that produced the file
    pub description: String,
    /// Size of the file in bytes
    pub size: u64,
}

/// In-memory copy of `cache_data`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Read a manifest file, tolerating absence and corruption
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "manifest unreadable, starting empty");
                return Self::default();
            }
        };

        if content.trim().is_empty() {
            return Self::default();
        }

        match serde_json::from_str(&content) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "manifest corrupt, resetting to empty");
                Self::default()
            }
        }
    }

    /// Write the manifest atomically
    pub fn write(&self, path: &Path) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes())
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: ManifestEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<ManifestEntry> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&ManifestEntry> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ManifestEntry)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all recorded sizes
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Copy of the rows whose keys are listed
    pub fn subset<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Self {
        let entries = keys
            .into_iter()
            .filter_map(|k| self.entries.get(k).map(|e| (k.to_string(), e.clone())))
            .collect();
        Self { entries }
    }

    /// Plain-text table written to `cache_info`
    pub fn render_table(&self) -> String {
        const FILE: &str = "File";
        const SIZE: &str = "Size";
        const TASK: &str = "Task";

        let sizes: Vec<String> = self.entries.values().map(|e| format_size(e.size)).collect();
        let file_w = self
            .entries
            .keys()
            .map(|k| k.len())
            .chain([FILE.len()])
            .max()
            .unwrap_or(FILE.len());
        let size_w = sizes
            .iter()
            .map(|s| s.len())
            .chain([SIZE.len()])
            .max()
            .unwrap_or(SIZE.len());

        let mut out = String::new();
        out.push_str(&format!("{FILE:<file_w$}  {SIZE:>size_w$}  {TASK}\n"));
        out.push_str(&format!(
            "{}  {}  {}\n",
            "-".repeat(file_w),
            "-".repeat(size_w),
            "-".repeat(TASK.len())
        ));
        for ((key, entry), size) in self.entries.iter().zip(&sizes) {
            out.push_str(&format!(
                "{key:<file_w$}  {size:>size_w$}  {}\n",
                entry.description
            ));
        }
        out.push_str(&format!(
            "\n{} entries, {} total\n",
            self.entries.len(),
            format_size(self.total_size())
        ));
        out
    }
}

/// Format a byte count in human-readable form
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Write `bytes` to `path` through a temporary file in the same directory,
/// so readers see either the old or the new content.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

/// Exclusive lock on the manifest, held as a `<manifest>.lock` file
pub(crate) struct ManifestLock {
    path: PathBuf,
}

impl ManifestLock {
    pub(crate) fn acquire(manifest: &Path) -> Result<Self, CacheError> {
        let mut name = manifest.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        let start = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        debug!(lock = %path.display(), "removing stale manifest lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if start.elapsed() > LOCK_WAIT {
                        return Err(CacheError::Lock(path));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(CacheError::Io(e)),
            }
        }
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}
