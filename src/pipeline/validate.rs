// src/pipeline/validate.rs

use std::path::Path;

use crate::config::load_config;
use crate::error::Result;
use crate::models::Config;
use crate::utils::log;

/// Load and validate configuration, reporting the effective settings.
pub fn run_validate(config_path: &Path) -> Result<Config> {
    log::header("Validating configuration");

    let config = load_config(config_path)?;
    if let Err(e) = config.validate() {
        ::log::error!("Configuration invalid: {}", e);
        return Err(e);
    }

    ::log::info!("Configuration OK ({})", config_path.display());
    for item in describe(&config) {
        log::sub_item(&item);
    }
    Ok(config)
}

/// Human-readable lines for the settings that shape a run.
pub fn describe(config: &Config) -> Vec<String> {
    let ids: Vec<&str> = config
        .github
        .credentials
        .iter()
        .map(|c| c.id.as_str())
        .collect();
    vec![
        format!("API: {}", config.github.api_url),
        format!("Credentials: {} ({})", ids.len(), ids.join(", ")),
        format!("Workers: {}", config.harvest.worker_pool_size),
        format!("Max pages per query: {}", config.harvest.max_pages_per_package),
        format!("File filters: {}", config.harvest.file_suffixes.join(", ")),
        format!(
            "Budget: {} calls / {}s per credential",
            config.harvest.rate_limit_ceiling_per_credential,
            config.harvest.rate_limit_window_seconds
        ),
        format!(
            "Retries: {} attempts, backoff {}s..{}s",
            config.harvest.retry_max_attempts,
            config.harvest.backoff_base_seconds,
            config.harvest.backoff_max_seconds
        ),
        format!("Snapshots: {}", config.paths.snapshot_dir.display()),
        format!("Database: {}", config.paths.database.display()),
    ]
}
