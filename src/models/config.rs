//! Application configuration structures.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Environment variable carrying comma separated search tokens.
pub const TOKENS_ENV: &str = "HARVESTER_GITHUB_TOKENS";

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Search API access settings
    #[serde(default)]
    pub github: GithubConfig,

    /// Harvest scheduling, retry and rate-limit settings
    #[serde(default)]
    pub harvest: HarvestConfig,

    /// Output locations
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Append credentials passed out-of-band as a comma separated token list.
    pub fn with_env_tokens(mut self, tokens: Option<&str>) -> Self {
        let Some(tokens) = tokens else {
            return self;
        };
        let extra = tokens
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .enumerate()
            .map(|(i, token)| CredentialConfig {
                id: format!("env-{}", i + 1),
                token: token.to_string(),
            });
        self.github.credentials.extend(extra);
        self
    }

    /// Validate configuration values before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.github.credentials.is_empty() {
            return Err(AppError::config(format!(
                "no search credentials configured (set github.credentials or {TOKENS_ENV})"
            )));
        }
        if let Some(blank) = self
            .github
            .credentials
            .iter()
            .find(|c| c.token.trim().is_empty())
        {
            return Err(AppError::config(format!(
                "credential '{}' has an empty token",
                blank.id
            )));
        }
        if self.github.user_agent.trim().is_empty() {
            return Err(AppError::config("github.user_agent is empty"));
        }
        if self.github.timeout_secs == 0 {
            return Err(AppError::config("github.timeout_secs must be > 0"));
        }
        if self.harvest.worker_pool_size == 0 {
            return Err(AppError::config("harvest.worker_pool_size must be > 0"));
        }
        if self.harvest.max_pages_per_package == 0 {
            return Err(AppError::config("harvest.max_pages_per_package must be > 0"));
        }
        if self.harvest.retry_max_attempts == 0 {
            return Err(AppError::config("harvest.retry_max_attempts must be > 0"));
        }
        for (key, seconds) in [
            ("backoff_base_seconds", self.harvest.backoff_base_seconds),
            ("backoff_max_seconds", self.harvest.backoff_max_seconds),
        ] {
            if Duration::try_from_secs_f64(seconds).is_err() {
                return Err(AppError::config(format!(
                    "harvest.{key} is not a usable duration: {seconds}"
                )));
            }
        }
        if !(self.harvest.backoff_base_seconds > 0.0) {
            return Err(AppError::config("harvest.backoff_base_seconds must be > 0"));
        }
        if self.harvest.backoff_max_seconds < self.harvest.backoff_base_seconds {
            return Err(AppError::config(
                "harvest.backoff_max_seconds must be >= backoff_base_seconds",
            ));
        }
        if self.harvest.rate_limit_ceiling_per_credential == 0 {
            return Err(AppError::config(
                "harvest.rate_limit_ceiling_per_credential must be > 0",
            ));
        }
        if self.harvest.rate_limit_window_seconds == 0 {
            return Err(AppError::config("harvest.rate_limit_window_seconds must be > 0"));
        }
        if self.harvest.file_suffixes.iter().all(|s| s.trim().is_empty()) {
            return Err(AppError::config("harvest.file_suffixes is empty"));
        }
        Ok(())
    }
}

/// Search API access settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    /// Base URL of the REST API
    #[serde(default = "defaults::api_url")]
    pub api_url: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Results per search page (the API caps this at 100)
    #[serde(default = "defaults::per_page")]
    pub per_page: u32,

    /// Search credentials, one per parallel worker
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

impl GithubConfig {
    pub fn effective_per_page(&self) -> u32 {
        self.per_page.clamp(1, defaults::MAX_PER_PAGE)
    }
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: defaults::api_url(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            per_page: defaults::per_page(),
            credentials: Vec::new(),
        }
    }
}

/// One configured credential.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub id: String,
    pub token: String,
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Harvest scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Upper bound on result pages walked per query
    #[serde(default = "defaults::max_pages")]
    pub max_pages_per_package: u32,

    /// Number of concurrent search workers
    #[serde(default = "defaults::worker_pool_size")]
    pub worker_pool_size: usize,

    /// Attempts per page before a transient error fails the package
    #[serde(default = "defaults::retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// First backoff delay; doubles on every attempt
    #[serde(default = "defaults::backoff_base")]
    pub backoff_base_seconds: f64,

    /// Cap on a single backoff delay
    #[serde(default = "defaults::backoff_max")]
    pub backoff_max_seconds: f64,

    /// Calls allowed per credential per window
    #[serde(default = "defaults::rate_limit_ceiling")]
    pub rate_limit_ceiling_per_credential: u32,

    /// Length of the rate-limit window
    #[serde(default = "defaults::rate_limit_window")]
    pub rate_limit_window_seconds: u64,

    /// Minimum spacing between calls on one credential
    #[serde(default)]
    pub min_request_interval_ms: u64,

    /// One query per suffix: `.py` searches imports, anything else a file name
    #[serde(default = "defaults::file_suffixes")]
    pub file_suffixes: Vec<String>,

    /// Write a checkpoint snapshot every N completed packages (0 disables)
    #[serde(default)]
    pub checkpoint_every: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_pages_per_package: defaults::max_pages(),
            worker_pool_size: defaults::worker_pool_size(),
            retry_max_attempts: defaults::retry_max_attempts(),
            backoff_base_seconds: defaults::backoff_base(),
            backoff_max_seconds: defaults::backoff_max(),
            rate_limit_ceiling_per_credential: defaults::rate_limit_ceiling(),
            rate_limit_window_seconds: defaults::rate_limit_window(),
            min_request_interval_ms: 0,
            file_suffixes: defaults::file_suffixes(),
            checkpoint_every: 0,
        }
    }
}

/// Output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding compressed snapshot files
    #[serde(default = "defaults::snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// SQLite database holding the count table
    #[serde(default = "defaults::database")]
    pub database: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: defaults::snapshot_dir(),
            database: defaults::database(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub const MAX_PER_PAGE: u32 = 100;

    // GitHub defaults
    pub fn api_url() -> String {
        "https://api.github.com".into()
    }
    pub fn user_agent() -> String {
        "harvester/0.1 (package usage counter)".into()
    }
    pub fn timeout() -> u64 {
        15
    }
    pub fn per_page() -> u32 {
        MAX_PER_PAGE
    }

    // Harvest defaults
    pub fn max_pages() -> u32 {
        10
    }
    pub fn worker_pool_size() -> usize {
        2
    }
    pub fn retry_max_attempts() -> u32 {
        5
    }
    pub fn backoff_base() -> f64 {
        1.0
    }
    pub fn backoff_max() -> f64 {
        60.0
    }
    pub fn rate_limit_ceiling() -> u32 {
        10
    }
    pub fn rate_limit_window() -> u64 {
        60
    }
    pub fn file_suffixes() -> Vec<String> {
        vec![".py".into(), "requirements.txt".into()]
    }

    // Path defaults
    pub fn snapshot_dir() -> PathBuf {
        PathBuf::from("data/snapshots")
    }
    pub fn database() -> PathBuf {
        PathBuf::from("data/counts.sqlite3")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_credential() -> Config {
        Config::default().with_env_tokens(Some("ghp_one"))
    }

    #[test]
    fn validate_rejects_missing_credentials() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults_with_credential() {
        assert!(with_credential().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_pool() {
        let mut config = with_credential();
        config.harvest.worker_pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_backoff() {
        let mut config = with_credential();
        config.harvest.backoff_base_seconds = 0.0;
        assert!(config.validate().is_err());

        let mut config = with_credential();
        config.harvest.backoff_max_seconds = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unrepresentable_backoff() {
        let mut config = with_credential();
        config.harvest.backoff_max_seconds = 1e300;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let mut config = with_credential();
        config.harvest.backoff_max_seconds = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = with_credential();
        config.harvest.backoff_base_seconds = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_tokens_are_appended_with_ids() {
        let config = Config::default().with_env_tokens(Some(" a , ,b "));
        let ids: Vec<_> = config.github.credentials.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["env-1", "env-2"]);
        assert_eq!(config.github.credentials[1].token, "b");
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let config = with_credential();
        let debug = format!("{:?}", config.github.credentials);
        assert!(!debug.contains("ghp_one"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [harvest]
            worker_pool_size = 4

            [[github.credentials]]
            id = "ci"
            token = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.harvest.worker_pool_size, 4);
        assert_eq!(config.harvest.max_pages_per_package, 10);
        assert_eq!(config.github.credentials[0].id, "ci");
        assert_eq!(config.github.effective_per_page(), 100);
    }
}
