//! Content-addressable cache store
//!
//! Every entry is one file under the cache root, named by its key (normally a
//! task fingerprint). Next to the data files the root holds:
//!
//! | File | Contents |
//! |---|---|
//! | `cache_data` | JSON manifest: filename → (task description, byte size) |
//! | `cache_info` | table rendering of the manifest |
//! | `last_run.log` | append-only run log |

mod archive;
mod manifest;
mod runlog;

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

pub use archive::{PackSummary, UnpackSummary};
pub use manifest::{format_size, Manifest, ManifestEntry};
pub use runlog::{LogTag, RunLog};

use crate::error::CacheError;
use manifest::{write_atomic, ManifestLock};

/// Manifest file name
pub const MANIFEST_FILE: &str = "cache_data";

/// Manifest table file name
pub const INFO_FILE: &str = "cache_info";

/// Run log file name
pub const LOG_FILE: &str = "last_run.log";

/// Files in the cache root that are not entries
pub const RESERVED_FILES: [&str; 3] = [MANIFEST_FILE, INFO_FILE, LOG_FILE];

/// On-disk form of an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    /// Serialized result
    Value { value: Value },
    /// Result lives in a file the task wrote into the cache root itself
    File { name: String },
}

/// Durable key → result mapping rooted at a directory
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    manifest: Manifest,
    log: RunLog,
}

impl CacheStore {
    /// Open (and create if needed) a store at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let mut store = Self {
            root: PathBuf::new(),
            manifest: Manifest::default(),
            log: RunLog::new(PathBuf::new()),
        };
        store.set_root(root)?;
        Ok(store)
    }

    /// (Re)initialise the store at `root`, creating the directory and its
    /// manifest, info and log files if absent, and reloading the manifest.
    pub fn set_root(&mut self, root: impl AsRef<Path>) -> Result<(), CacheError> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;

        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            Manifest::default().write(&manifest_path)?;
        }
        let info_path = root.join(INFO_FILE);
        if !info_path.exists() {
            fs::write(&info_path, Manifest::default().render_table())?;
        }
        let log_path = root.join(LOG_FILE);
        if !log_path.exists() {
            fs::File::create(&log_path)?;
        }

        self.manifest = Manifest::load(&manifest_path);
        self.log = RunLog::new(log_path);
        self.root = root;

        debug!(root = %self.root.display(), entries = self.manifest.len(), "cache root set");
        Ok(())
    }

    /// Re-read the manifest from disk
    pub fn reload(&mut self) -> Result<(), CacheError> {
        let root = self.root.clone();
        self.set_root(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn info_path(&self) -> PathBuf {
        self.root.join(INFO_FILE)
    }

    /// Path of the file backing `key`
    pub fn entry_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Filesystem check; does not read the entry
    pub fn exists(&self, key: &str) -> bool {
        self.entry_path(key).map(|p| p.exists()).unwrap_or(false)
    }

    /// Deserialize the entry stored under `key`.
    ///
    /// Entries written by a task that produced its own file resolve to that
    /// file's name.
    pub fn load(&self, key: &str) -> Result<Value, CacheError> {
        let path = self.entry_path(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key, "no cache result found");
                return Err(CacheError::NotFound(key.to_string()));
            }
            Err(e) => return Err(CacheError::Io(e)),
        };

        debug!(key, "found cache result");
        match serde_json::from_slice(&bytes)? {
            Record::Value { value } => Ok(value),
            Record::File { name } => Ok(Value::String(name)),
        }
    }

    /// Serialize `value` under `key`
    pub fn save(&mut self, key: &str, value: &Value, description: &str) -> Result<(), CacheError> {
        let record = Record::Value {
            value: value.clone(),
        };
        let size = self.write_record(key, &record)?;
        self.update_manifest(&[(key, size)], description)?;
        self.log
            .record(LogTag::Save, &format!("{description} -> {key} ({})", format_size(size)));
        info!(key, size, task = description, "saved result");
        Ok(())
    }

    /// Record that the task behind `key` wrote its result to `name` itself.
    ///
    /// The file is not re-serialized; `key` holds a pointer to it and both
    /// files are listed in the manifest.
    pub fn save_file_ref(
        &mut self,
        key: &str,
        name: &str,
        description: &str,
    ) -> Result<(), CacheError> {
        let file_path = self.entry_path(name)?;
        if file_path == self.entry_path(key)? {
            // The pointer record would overwrite the file it points to
            return Err(CacheError::InvalidKey(name.to_string()));
        }
        let file_size = disk_size(&file_path)?;
        let record = Record::File {
            name: name.to_string(),
        };
        let size = self.write_record(key, &record)?;
        self.update_manifest(&[(key, size), (name, file_size)], description)?;
        self.log
            .record(LogTag::Save, &format!("{description} -> {name} (via {key})"));
        info!(key, file = name, size = file_size, task = description, "recorded task-written file");
        Ok(())
    }

    /// Name of the task-written file an entry points to, if any
    pub fn referenced_file(&self, key: &str) -> Result<Option<String>, CacheError> {
        let bytes = fs::read(self.entry_path(key)?)?;
        match serde_json::from_slice(&bytes)? {
            Record::File { name } => Ok(Some(name)),
            Record::Value { .. } => Ok(None),
        }
    }

    /// Delete the entry; removing an absent key is not an error
    pub fn remove(&mut self, key: &str) -> Result<(), CacheError> {
        let path = self.entry_path(key)?;
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => debug!(key, "removed cache entry"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::Io(e)),
        }

        let _lock = ManifestLock::acquire(&self.manifest_path())?;
        let mut manifest = Manifest::load(&self.manifest_path());
        if manifest.remove(key).is_some() {
            self.persist_manifest(&manifest)?;
        }
        self.manifest = manifest;
        Ok(())
    }

    fn write_record(&self, key: &str, record: &Record) -> Result<u64, CacheError> {
        let path = self.entry_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(record)?;
        write_atomic(&path, &bytes)?;
        Ok(bytes.len() as u64)
    }

    /// Merge rows into the on-disk manifest under the lock, then rewrite the
    /// manifest and its table.
    fn update_manifest(&mut self, rows: &[(&str, u64)], description: &str) -> Result<(), CacheError> {
        let _lock = ManifestLock::acquire(&self.manifest_path())?;
        let mut manifest = Manifest::load(&self.manifest_path());
        for (key, size) in rows {
            manifest.insert(
                *key,
                ManifestEntry {
                    description: description.to_string(),
                    size: *size,
                },
            );
        }
        self.persist_manifest(&manifest)?;
        self.manifest = manifest;
        Ok(())
    }

    pub(crate) fn merge_manifest(&mut self, incoming: &Manifest) -> Result<(), CacheError> {
        let _lock = ManifestLock::acquire(&self.manifest_path())?;
        let mut manifest = Manifest::load(&self.manifest_path());
        for (key, entry) in incoming.iter() {
            manifest.insert(key.clone(), entry.clone());
        }
        self.persist_manifest(&manifest)?;
        self.manifest = manifest;
        Ok(())
    }

    fn persist_manifest(&self, manifest: &Manifest) -> Result<(), CacheError> {
        manifest.write(&self.manifest_path())?;
        write_atomic(&self.info_path(), manifest.render_table().as_bytes())
    }
}

/// Keys are relative paths that stay inside the root and do not shadow the
/// store's own files
fn validate_key(key: &str) -> Result<(), CacheError> {
    let path = Path::new(key);
    let inside = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !inside || RESERVED_FILES.contains(&key) {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn disk_size(path: &Path) -> Result<u64, CacheError> {
    let meta = fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += disk_size(&entry?.path())?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, CacheStore) {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path().join("cache")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_open_creates_layout() {
        let (temp, _store) = store();
        let root = temp.path().join("cache");
        assert!(root.join(MANIFEST_FILE).is_file());
        assert!(root.join(INFO_FILE).is_file());
        assert!(root.join(LOG_FILE).is_file());
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_temp, mut store) = store();
        let value = json!({"sum": 12.5, "items": [1, 2, 3], "label": "ok"});

        assert!(!store.exists("k1"));
        store.save("k1", &value, "analysis()").unwrap();
        assert!(store.exists("k1"));
        assert_eq!(store.load("k1").unwrap(), value);
    }

    #[test]
    fn test_float_bits_survive() {
        let (_temp, mut store) = store();
        let x = 0.1_f64 + 0.2_f64;
        store.save("f", &json!(x), "f()").unwrap();
        let back = store.load("f").unwrap().as_f64().unwrap();
        assert_eq!(back.to_bits(), x.to_bits());
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let (_temp, store) = store();
        let err = store.load("nope").unwrap_err();
        assert!(matches!(err, CacheError::NotFound(key) if key == "nope"));
    }

    #[test]
    fn test_save_updates_manifest_info_and_log() {
        let (_temp, mut store) = store();
        store.save("k1", &json!(5), "five()").unwrap();

        let on_disk = Manifest::load(&store.manifest_path());
        let row = on_disk.get("k1").unwrap();
        assert_eq!(row.description, "five()");
        assert!(row.size > 0);

        let info = std::fs::read_to_string(store.info_path()).unwrap();
        assert!(info.contains("five()"));

        let log = store.log().read().unwrap();
        assert!(log.contains("[Save] five() -> k1"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_temp, mut store) = store();
        store.save("k1", &json!(1), "one()").unwrap();

        store.remove("k1").unwrap();
        assert!(!store.exists("k1"));
        assert!(store.manifest().get("k1").is_none());

        store.remove("k1").unwrap();
    }

    #[test]
    fn test_file_reference() {
        let (_temp, mut store) = store();
        let written = store.entry_path("plot.txt").unwrap();
        std::fs::write(&written, "hello").unwrap();

        store.save_file_ref("fp", "plot.txt", "plot()").unwrap();

        assert_eq!(store.load("fp").unwrap(), json!("plot.txt"));
        assert_eq!(store.referenced_file("fp").unwrap().as_deref(), Some("plot.txt"));
        assert_eq!(store.manifest().get("plot.txt").unwrap().size, 5);
        assert_eq!(std::fs::read_to_string(&written).unwrap(), "hello");
    }

    #[test]
    fn test_file_reference_to_itself_rejected() {
        let (_temp, mut store) = store();
        let written = store.entry_path("fp").unwrap();
        std::fs::write(&written, "data").unwrap();

        let err = store.save_file_ref("fp", "./fp", "plot()").unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));
        assert_eq!(std::fs::read_to_string(&written).unwrap(), "data");
        assert!(store.manifest().get("fp").is_none());
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let (_temp, store) = store();
        assert!(matches!(store.entry_path("../escape"), Err(CacheError::InvalidKey(_))));
        assert!(matches!(store.entry_path("/abs"), Err(CacheError::InvalidKey(_))));
        assert!(matches!(store.entry_path(MANIFEST_FILE), Err(CacheError::InvalidKey(_))));
        assert!(!store.exists("../escape"));
    }

    #[test]
    fn test_set_root_tolerates_corrupt_manifest() {
        let (temp, mut store) = store();
        store.save("k1", &json!(1), "one()").unwrap();
        std::fs::write(store.manifest_path(), "garbage").unwrap();

        store.set_root(temp.path().join("cache")).unwrap();
        assert!(store.manifest().is_empty());
        assert!(store.exists("k1"));
    }

    #[test]
    fn test_two_handles_share_manifest() {
        let temp = TempDir::new().unwrap();
        let mut a = CacheStore::open(temp.path()).unwrap();
        let mut b = CacheStore::open(temp.path()).unwrap();

        a.save("from_a", &json!(1), "a()").unwrap();
        b.save("from_b", &json!(2), "b()").unwrap();

        let on_disk = Manifest::load(&a.manifest_path());
        assert!(on_disk.get("from_a").is_some());
        assert!(on_disk.get("from_b").is_some());
    }
}
