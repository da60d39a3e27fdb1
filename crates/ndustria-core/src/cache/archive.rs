//! Moving cache entries between machines as `.tar.gz` archives

use std::fs;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::{CacheStore, LogTag, Manifest, MANIFEST_FILE, RESERVED_FILES};
use crate::error::CacheError;

/// What went into an archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackSummary {
    /// Archive written
    pub archive: PathBuf,
    /// Entries copied into the archive
    pub files: Vec<String>,
    /// Requested entries that were not on disk
    pub missing: Vec<String>,
    /// Bytes of entry data packed
    pub bytes: u64,
}

/// What came out of an archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    /// Entries placed in the cache root
    pub files: Vec<String>,
    /// Manifest rows merged
    pub manifest_rows: usize,
}

impl CacheStore {
    /// Archive the listed entries, with their manifest rows, into `dest`.
    ///
    /// Entries are staged in a temporary directory that is removed once the
    /// archive is written.
    pub fn pack<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
        dest: &Path,
    ) -> Result<PackSummary, CacheError> {
        let staging = TempDir::new()?;
        let mut summary = PackSummary {
            archive: dest.to_path_buf(),
            ..Default::default()
        };

        for key in keys {
            if summary.files.iter().any(|f| f == key) {
                continue;
            }
            let source = self.entry_path(key)?;
            if !source.exists() {
                warn!(key, "cache entry missing, not packed");
                summary.missing.push(key.to_string());
                continue;
            }
            summary.bytes += copy_recursively(&source, &staging.path().join(key))?;
            summary.files.push(key.to_string());
        }

        let subset = self
            .manifest()
            .subset(summary.files.iter().map(String::as_str));
        subset.write(&staging.path().join(MANIFEST_FILE))?;

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(dest)?;
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        builder.append_dir_all(".", staging.path())?;
        builder.into_inner()?.finish()?;

        self.log().record(
            LogTag::Info,
            &format!("Packed {} file(s) into {}", summary.files.len(), dest.display()),
        );
        info!(
            archive = %dest.display(),
            files = summary.files.len(),
            missing = summary.missing.len(),
            "cache packed"
        );
        Ok(summary)
    }

    /// Extract an archive written by [`CacheStore::pack`] into this store and
    /// merge its manifest rows.
    pub fn unpack(&mut self, archive: &Path) -> Result<UnpackSummary, CacheError> {
        let staging = TempDir::new()?;
        let decoder = GzDecoder::new(fs::File::open(archive)?);
        Archive::new(decoder).unpack(staging.path())?;

        let mut summary = UnpackSummary::default();
        for entry in fs::read_dir(staging.path())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if RESERVED_FILES.contains(&name.as_str()) {
                continue;
            }
            let target = self.entry_path(&name)?;
            copy_recursively(&entry.path(), &target)?;
            debug!(file = %name, "unpacked cache entry");
            summary.files.push(name);
        }
        summary.files.sort();

        let incoming = Manifest::load(&staging.path().join(MANIFEST_FILE));
        summary.manifest_rows = incoming.len();
        self.merge_manifest(&incoming)?;

        self.log().record(
            LogTag::Info,
            &format!(
                "Unpacked {} file(s) from {}",
                summary.files.len(),
                archive.display()
            ),
        );
        info!(archive = %archive.display(), files = summary.files.len(), "cache unpacked");
        Ok(summary)
    }
}

/// Copy a file or directory tree, returning the bytes copied
fn copy_recursively(source: &Path, target: &Path) -> std::io::Result<u64> {
    if source.is_dir() {
        fs::create_dir_all(target)?;
        let mut total = 0;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            total += copy_recursively(&entry.path(), &target.join(entry.file_name()))?;
        }
        Ok(total)
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, target)
    }
}
