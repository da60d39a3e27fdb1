//! CLI definition and command handling

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ndustria_core::config::{load_config, CACHE_DIR_VAR};
use ndustria_core::CacheStore;

use commands::{
    CleanCommand, InfoCommand, ListCommand, LogCommand, PackCommand, RemoveCommand,
    StatusCommand, UnpackCommand, WhereCommand,
};

/// Ndustria - inspect, clean and move pipeline caches
#[derive(Debug, Parser)]
#[command(name = "ndustria")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Cache root (overrides the environment and ~/.nd_config)
    #[arg(long, global = true, env = CACHE_DIR_VAR)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the cache table
    Info(InfoCommand),

    /// Print the log of the last runs
    Log(LogCommand),

    /// Show entry count and total size
    Status(StatusCommand),

    /// List cache entries
    List(ListCommand),

    /// Remove individual cache entries
    Remove(RemoveCommand),

    /// Remove every cache entry
    Clean(CleanCommand),

    /// Archive cache entries into a .tar.gz
    Pack(PackCommand),

    /// Extract an archive into the cache
    Unpack(UnpackCommand),

    /// Print the resolved cache root
    Where(WhereCommand),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> anyhow::Result<()> {
        match self.command {
            Commands::Info(ref cmd) => cmd.execute(&self),
            Commands::Log(ref cmd) => cmd.execute(&self),
            Commands::Status(ref cmd) => cmd.execute(&self),
            Commands::List(ref cmd) => cmd.execute(&self),
            Commands::Remove(ref cmd) => cmd.execute(&self),
            Commands::Clean(ref cmd) => cmd.execute(&self),
            Commands::Pack(ref cmd) => cmd.execute(&self),
            Commands::Unpack(ref cmd) => cmd.execute(&self),
            Commands::Where(ref cmd) => cmd.execute(&self),
        }
    }

    /// Cache root from `--cache-dir`, falling back to the configuration
    pub fn cache_root(&self) -> anyhow::Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(load_config().map_err(ndustria_core::Error::from)?.cache_dir),
        }
    }

    /// Open the store at the resolved cache root
    pub fn open_store(&self) -> anyhow::Result<CacheStore> {
        let root = self.cache_root()?;
        tracing::debug!(root = %root.display(), "opening cache store");
        Ok(CacheStore::open(&root).map_err(ndustria_core::Error::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "ndustria",
            "list",
            "--format",
            "json",
            "--cache-dir",
            "/tmp/cache",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/cache")));
        assert!(matches!(cli.command, Commands::List(_)));
    }

    #[test]
    fn test_clean_yes_flag() {
        let cli = Cli::try_parse_from(["ndustria", "clean", "-y"]).unwrap();
        match cli.command {
            Commands::Clean(cmd) => assert!(cmd.yes),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
