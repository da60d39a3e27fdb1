//! Cache inspection and cleanup commands

use std::fs;
use std::path::Path;

use clap::Args;
use console::style;
use serde::Serialize;

use ndustria_core::cache::{format_size, MANIFEST_FILE, RESERVED_FILES};
use ndustria_core::comm::SYNC_DIR;
use ndustria_core::CacheStore;

use crate::cli::{output, Cli, OutputFormat};

/// Print the cache table
#[derive(Debug, Args)]
pub struct InfoCommand;

/// Print the run log
#[derive(Debug, Args)]
pub struct LogCommand {
    /// Only print the last N lines
    #[arg(short = 'n', long)]
    pub tail: Option<usize>,
}

/// Show cache statistics
#[derive(Debug, Args)]
pub struct StatusCommand;

/// List cache entries
#[derive(Debug, Args)]
pub struct ListCommand;

/// Remove individual entries
#[derive(Debug, Args)]
pub struct RemoveCommand {
    /// Cache keys (fingerprints or file names)
    #[arg(required = true)]
    pub keys: Vec<String>,
}

/// Remove every entry
#[derive(Debug, Args)]
pub struct CleanCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

/// Print the resolved cache root
#[derive(Debug, Args)]
pub struct WhereCommand;

/// One `list` row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryRow {
    pub key: String,
    pub size: u64,
    pub description: String,
}

impl InfoCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = cli.open_store()?;
        let table = fs::read_to_string(store.info_path())?;
        print!("{table}");
        Ok(())
    }
}

impl LogCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = cli.open_store()?;
        let log = store.log().read()?;
        print!("{}", tail(&log, self.tail));
        Ok(())
    }
}

impl StatusCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = cli.open_store()?;
        let manifest = store.manifest();

        if cli.format == OutputFormat::Json {
            output::json(&serde_json::json!({
                "entries": manifest.len(),
                "total_size": manifest.total_size(),
                "total_size_formatted": format_size(manifest.total_size()),
                "cache_dir": store.root().display().to_string(),
            }))?;
        } else if !cli.quiet {
            println!("{}", output::header("Cache Status"));
            println!();
            let location = output::path_style().apply_to(store.root().display()).to_string();
            let size = style(format_size(manifest.total_size())).yellow().to_string();
            println!("{}", output::key_value("Location", &location));
            println!("{}", output::key_value("Entries", &manifest.len().to_string()));
            println!("{}", output::key_value("Size", &size));
        }
        Ok(())
    }
}

impl ListCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = cli.open_store()?;
        let rows = entry_rows(&store);

        if cli.format == OutputFormat::Json {
            return output::json(&rows);
        }
        if rows.is_empty() {
            if !cli.quiet {
                output::info("Cache is empty.");
            }
            return Ok(());
        }
        for row in &rows {
            let key = if cli.verbose {
                row.key.as_str()
            } else {
                short_key(&row.key)
            };
            println!("{}", output::entry_line(key, &format_size(row.size), &row.description));
        }
        Ok(())
    }
}

impl RemoveCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let mut store = cli.open_store()?;

        for key in &self.keys {
            let known = store.manifest().get(key).is_some() || store.exists(key);
            store.remove(key).map_err(ndustria_core::Error::from)?;
            if cli.quiet {
                continue;
            }
            if known {
                output::success(&format!("Removed {}", output::key_style().apply_to(key)));
            } else {
                output::warning(&format!("No entry named {key}"));
            }
        }
        Ok(())
    }
}

impl CleanCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let mut store = cli.open_store()?;
        let count = store.manifest().len() + orphan_files(&store)?.len();

        if count == 0 {
            let swept = remove_sync_dir(store.root())?;
            if !cli.quiet {
                output::success("Cache is already empty.");
                if swept {
                    output::info("Removed stale worker synchronisation files.");
                }
            }
            return Ok(());
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!(
                    "Remove all {} cached entries ({}) at {}?",
                    count,
                    format_size(store.manifest().total_size()),
                    store.root().display()
                ))
                .default(false)
                .interact()?;

            if !confirmed {
                println!("{}", style("Aborted.").yellow());
                return Err(ndustria_core::Error::from(ndustria_core::PipelineError::Cancelled).into());
            }
        }

        let removed = clean(&mut store)?;

        if !cli.quiet {
            output::success(&format!(
                "Removed {} entries from {}",
                removed.len(),
                output::path_style().apply_to(store.root().display())
            ));
        }
        Ok(())
    }
}

impl WhereCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let root = cli.cache_root()?;
        let root = root.canonicalize().unwrap_or(root);

        if cli.format == OutputFormat::Json {
            output::json(&serde_json::json!({ "cache_dir": root.display().to_string() }))
        } else {
            println!("{}", root.display());
            Ok(())
        }
    }
}

/// Manifest rows in key order
pub fn entry_rows(store: &CacheStore) -> Vec<EntryRow> {
    store
        .manifest()
        .iter()
        .map(|(key, entry)| EntryRow {
            key: key.clone(),
            size: entry.size,
            description: entry.description.clone(),
        })
        .collect()
}

/// Remove every manifest entry, entry files the manifest lost track of and
/// any leftover worker synchronisation files; returns the removed keys
pub fn clean(store: &mut CacheStore) -> anyhow::Result<Vec<String>> {
    let mut keys: Vec<String> = store.manifest().keys().cloned().collect();
    for key in &keys {
        store.remove(key).map_err(ndustria_core::Error::from)?;
    }
    for orphan in orphan_files(store)? {
        fs::remove_file(store.root().join(&orphan))?;
        keys.push(orphan);
    }
    remove_sync_dir(store.root())?;
    tracing::info!(entries = keys.len(), root = %store.root().display(), "cache cleaned");
    Ok(keys)
}

/// Top-level files in the cache root that are not listed in the manifest.
///
/// The store's own files, hidden files (temporaries, the sync directory)
/// and telemetry reports are kept.
fn orphan_files(store: &CacheStore) -> anyhow::Result<Vec<String>> {
    let lock = format!("{MANIFEST_FILE}.lock");
    let mut orphans = Vec::new();

    for entry in fs::read_dir(store.root())? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let kept = name.starts_with('.')
            || name == lock
            || RESERVED_FILES.contains(&name.as_str())
            || name.ends_with("_timing.csv")
            || name.ends_with("_memcheck.csv")
            || store.manifest().get(&name).is_some();
        if !kept {
            orphans.push(name);
        }
    }
    orphans.sort();
    Ok(orphans)
}

/// Session directories left behind by aborted multi-worker runs
fn remove_sync_dir(root: &Path) -> anyhow::Result<bool> {
    let sync = root.join(SYNC_DIR);
    if !sync.exists() {
        return Ok(false);
    }
    fs::remove_dir_all(&sync)?;
    Ok(true)
}

fn short_key(key: &str) -> &str {
    let is_fingerprint = key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit());
    if is_fingerprint {
        &key[..12]
    } else {
        key
    }
}

fn tail(text: &str, lines: Option<usize>) -> String {
    let Some(n) = lines else {
        return text.to_string();
    };
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(n);
    all[start..].iter().map(|line| format!("{line}\n")).collect()
}
