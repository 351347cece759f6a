// src/config.rs

//! Configuration loading utilities.
//!
//! Convenience functions for loading the config file, merging credentials
//! from the environment, and reading package lists.

use std::path::Path;

use crate::error::{AppError, Result};
use crate::models::{Config, TOKENS_ENV};

/// Load configuration from a TOML file and append tokens from the environment.
///
/// A missing file falls back to defaults; a file that exists but does not
/// parse is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        Config::load(path)?
    } else {
        log::warn!("Config file {} not found, using defaults", path.display());
        Config::default()
    };
    Ok(config.with_env_tokens(std::env::var(TOKENS_ENV).ok().as_deref()))
}

/// Read a package list: one name per line, `#` starts a comment.
pub fn load_packages(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        AppError::config(format!("cannot read package list {}: {e}", path.display()))
    })?;
    Ok(parse_packages(&text))
}

pub fn parse_packages(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_packages() {
        let text = "# top packages\nnumpy\n\n  requests  # http\n#flask\npandas\n";
        assert_eq!(parse_packages(text), ["numpy", "requests", "pandas"]);
    }

    #[test]
    fn test_load_packages_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = load_packages(&tmp.path().join("nope.txt")).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("harvester.toml")).unwrap();
        assert_eq!(config.harvest.worker_pool_size, 2);
    }

    #[test]
    fn test_load_config_rejects_bad_toml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("harvester.toml");
        std::fs::write(&path, "[harvest\nworker_pool_size = ").unwrap();
        assert!(load_config(&path).is_err());
    }
}
