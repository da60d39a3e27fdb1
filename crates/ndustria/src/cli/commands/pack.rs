//! Moving caches between machines

use std::path::PathBuf;

use clap::Args;

use ndustria_core::cache::format_size;

use crate::cli::{output, Cli, OutputFormat};

/// Archive cache entries into a .tar.gz
#[derive(Debug, Args)]
pub struct PackCommand {
    /// Archive to write
    #[arg(default_value = "ndustria_cache.tar.gz")]
    pub dest: PathBuf,

    /// Only pack these keys (default: every manifest entry)
    #[arg(short, long = "key")]
    pub keys: Vec<String>,
}

/// Extract an archive into the cache
#[derive(Debug, Args)]
pub struct UnpackCommand {
    /// Archive written by `ndustria pack`
    pub archive: PathBuf,
}

impl PackCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = cli.open_store()?;
        let keys: Vec<String> = if self.keys.is_empty() {
            store.manifest().keys().cloned().collect()
        } else {
            self.keys.clone()
        };

        if !cli.quiet && cli.format == OutputFormat::Text {
            output::info(&format!(
                "Packing {} entries from {}",
                keys.len(),
                output::path_style().apply_to(store.root().display())
            ));
        }

        let summary = store
            .pack(keys.iter().map(String::as_str), &self.dest)
            .map_err(ndustria_core::Error::from)?;

        if cli.format == OutputFormat::Json {
            return output::json(&serde_json::json!({
                "archive": summary.archive.display().to_string(),
                "files": summary.files,
                "missing": summary.missing,
                "bytes": summary.bytes,
            }));
        }
        if !cli.quiet {
            for key in &summary.missing {
                output::warning(&format!("{key} is not on disk, skipped"));
            }
            output::success(&format!(
                "Wrote {} ({} files, {})",
                output::path_style().apply_to(summary.archive.display()),
                summary.files.len(),
                format_size(summary.bytes)
            ));
        }
        Ok(())
    }
}

impl UnpackCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let mut store = cli.open_store()?;
        let summary = store
            .unpack(&self.archive)
            .map_err(ndustria_core::Error::from)?;

        if cli.format == OutputFormat::Json {
            return output::json(&serde_json::json!({
                "files": summary.files,
                "manifest_rows": summary.manifest_rows,
                "cache_dir": store.root().display().to_string(),
            }));
        }
        if !cli.quiet {
            if cli.verbose {
                for file in &summary.files {
                    println!("  {}", output::key_style().apply_to(file));
                }
            }
            output::success(&format!(
                "Unpacked {} files into {}",
                summary.files.len(),
                output::path_style().apply_to(store.root().display())
            ));
        }
        Ok(())
    }
}
