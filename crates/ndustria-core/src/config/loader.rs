//! Configuration loading

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use super::{
    Config, CACHE_DIR_VAR, CONFIG_FILE_NAME, DEFAULT_MAX_ITERATIONS, MAX_ITERATIONS_VAR,
    SYNC_TIMEOUT_VAR,
};
use crate::error::ConfigError;

/// Location of the fallback `KEY=VALUE` config file
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME))
}

/// Parse a `KEY=VALUE` config file.
///
/// A missing file yields an empty map. Blank lines and lines starting with
/// `#` are skipped.
pub fn parse_config_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut values = BTreeMap::new();

    if !path.is_file() {
        debug!(path = %path.display(), "no config file");
        return Ok(values);
    }

    let content = std::fs::read_to_string(path)?;
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Malformed {
            path: path.to_path_buf(),
            line: idx + 1,
        })?;
        values.insert(key.trim().to_string(), value.trim().to_string());
    }

    Ok(values)
}

/// Load configuration from the process environment, falling back to
/// `~/.nd_config`
pub fn load_config() -> Result<Config, ConfigError> {
    let file = default_config_path();
    resolve_config(|key| std::env::var(key).ok(), file.as_deref())
}

/// Resolve configuration from an environment lookup and an optional config
/// file. Environment values win over file values.
pub fn resolve_config<F>(env: F, config_file: Option<&Path>) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let file_values = match config_file {
        Some(path) => parse_config_file(path)?,
        None => BTreeMap::new(),
    };

    let lookup = |key: &str| -> Option<String> {
        env(key)
            .filter(|v| !v.trim().is_empty())
            .or_else(|| file_values.get(key).cloned())
    };

    let cache_dir = lookup(CACHE_DIR_VAR).ok_or_else(|| {
        ConfigError::MissingCacheDir(
            config_file
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME)),
        )
    })?;

    let sync_timeout = lookup(SYNC_TIMEOUT_VAR)
        .map(|raw| parse_number::<u64>(SYNC_TIMEOUT_VAR, &raw))
        .transpose()?
        .map(Duration::from_secs);

    let max_iterations = lookup(MAX_ITERATIONS_VAR)
        .map(|raw| parse_number::<usize>(MAX_ITERATIONS_VAR, &raw))
        .transpose()?
        .unwrap_or(DEFAULT_MAX_ITERATIONS);

    if max_iterations == 0 {
        return Err(ConfigError::InvalidValue {
            field: MAX_ITERATIONS_VAR.to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    let cache_dir = absolutize(Path::new(&cache_dir))?;
    info!(cache_dir = %cache_dir.display(), "resolved cache root");

    Ok(Config {
        cache_dir,
        sync_timeout,
        max_iterations,
    })
}

fn parse_number<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("'{raw}' is not a valid number"),
    })
}

fn absolutize(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_var_wins() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join(".nd_config");
        std::fs::write(&file, "NDUSTRIA_CACHE_DIR=/from/file\n").unwrap();

        let config =
            resolve_config(env_from(&[(CACHE_DIR_VAR, "/from/env")]), Some(&file)).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/from/env"));
        assert_eq!(config.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert!(config.sync_timeout.is_none());
    }

    #[test]
    fn test_config_file_fallback() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join(".nd_config");
        std::fs::write(
            &file,
            "# written by setup\n\nNDUSTRIA_CACHE_DIR = /data/cache\nNDUSTRIA_SYNC_TIMEOUT_SECS=30\n",
        )
        .unwrap();

        let config = resolve_config(env_from(&[]), Some(&file)).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/data/cache"));
        assert_eq!(config.sync_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_missing_cache_dir_is_error() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("absent");

        let err = resolve_config(env_from(&[]), Some(&file)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCacheDir(_)));
        assert!(err.to_string().contains("first-time setup"));
    }

    #[test]
    fn test_malformed_line() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join(".nd_config");
        std::fs::write(&file, "NDUSTRIA_CACHE_DIR=/x\nnot a pair\n").unwrap();

        let err = parse_config_file(&file).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { line: 2, .. }));
    }

    #[test]
    fn test_invalid_number() {
        let err = resolve_config(
            env_from(&[(CACHE_DIR_VAR, "/c"), (MAX_ITERATIONS_VAR, "lots")]),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_relative_cache_dir_is_absolutized() {
        let config = resolve_config(env_from(&[(CACHE_DIR_VAR, "rel/cache")]), None).unwrap();
        assert!(config.cache_dir.is_absolute());
        assert!(config.cache_dir.ends_with("rel/cache"));
    }
}
