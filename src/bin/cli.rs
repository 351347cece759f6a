//! Package usage harvester CLI
//!
//! Local execution entry point. Scheduling is left to cron or a timer unit.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use harvester::{
    config::{load_config, load_packages},
    error::{AppError, Result},
    pipeline::{self, HarvestOptions, harvest::build_pool},
    services::{GithubSearchClient, SearchApi},
    storage::{CountStore, LoadMode},
    utils::{Cancellation, format_duration},
};

/// Harvester - GitHub code search usage counts for Python packages
#[derive(Parser, Debug)]
#[command(
    name = "harvester",
    version,
    about = "Estimate Python package usage from GitHub code search"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "harvester.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search packages and write today's snapshot
    Harvest {
        #[command(flatten)]
        packages: PackageArgs,

        /// Skip packages already in today's snapshot
        #[arg(long)]
        resume: bool,
    },

    /// Aggregate snapshots into the count table
    Aggregate {
        /// Snapshot files (default: every snapshot in the snapshot directory)
        paths: Vec<PathBuf>,

        /// Clear the table before loading
        #[arg(long)]
        replace_all: bool,
    },

    /// Run full pipeline: Harvest → Aggregate
    Pipeline {
        #[command(flatten)]
        packages: PackageArgs,

        /// Skip packages already in today's snapshot
        #[arg(long)]
        resume: bool,
    },

    /// Validate configuration
    Validate,

    /// Show the search budget of every credential
    RateLimit,

    /// Show stored counts for a package
    Show {
        /// Exact package name
        package: String,
    },
}

#[derive(clap::Args, Debug)]
struct PackageArgs {
    /// File with one package name per line
    #[arg(long)]
    packages: Option<PathBuf>,

    /// Package names
    names: Vec<String>,
}

impl PackageArgs {
    fn resolve(&self) -> Result<Vec<String>> {
        let mut names = match &self.packages {
            Some(path) => load_packages(path)?,
            None => Vec::new(),
        };
        names.extend(self.names.iter().cloned());
        if names.is_empty() {
            return Err(AppError::config(
                "no packages given (pass names or --packages <file>)",
            ));
        }
        Ok(names)
    }
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Cancel the run on Ctrl-C; a second Ctrl-C is left to the default handler.
fn cancel_on_ctrl_c() -> Cancellation {
    let cancel = Cancellation::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, finishing in-flight pages...");
            handle.cancel();
        }
    });
    cancel
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match cli.command {
        Command::Validate => pipeline::run_validate(&cli.config)?,
        _ => load_config(&cli.config)?,
    };
    log::debug!("Loaded configuration from {}", cli.config.display());

    match cli.command {
        Command::Harvest { packages, resume } => {
            let packages = packages.resolve()?;
            let report = pipeline::run_harvest(
                &config,
                &packages,
                &HarvestOptions { resume },
                cancel_on_ctrl_c(),
            )
            .await?;
            log::info!("Snapshot written to {}", report.snapshot_path.display());
        }

        Command::Aggregate { paths, replace_all } => {
            let mode = if replace_all {
                LoadMode::ReplaceAll
            } else {
                LoadMode::Append
            };
            pipeline::run_aggregate(&config, &paths, mode).await?;
        }

        Command::Pipeline { packages, resume } => {
            let packages = packages.resolve()?;
            pipeline::run_pipeline(
                &config,
                &packages,
                &HarvestOptions { resume },
                cancel_on_ctrl_c(),
            )
            .await?;
        }

        Command::RateLimit => {
            config.validate()?;
            let client = GithubSearchClient::new(&config.github)?;
            let pool = build_pool(&config);
            for credential in pool.credentials() {
                match client.rate_limit(&credential).await {
                    Ok(headers) => pool.report(&credential, &headers),
                    Err(e) => log::error!("{}: {}", credential.id(), e),
                }
            }
            for status in pool.status() {
                log::info!(
                    "{}: {}/{} remaining, resets in {}",
                    status.credential_id,
                    status.remaining,
                    status.ceiling,
                    format_duration(status.reset_in)
                );
            }
        }

        Command::Show { package } => {
            let store = CountStore::open(&config.paths.database)?;
            let rows = store.counts_for(&package)?;
            if rows.is_empty() {
                log::info!("No counts stored for '{}'", package);
            }
            for row in rows {
                println!(
                    "{}\t{}\trepos={}\tfiles={}\trequirements={}",
                    row.date,
                    row.package_name,
                    row.n_repos_importing_package,
                    row.n_files_importing_package,
                    row.n_requirement_files_citing_package
                );
            }
        }

        Command::Validate => log::info!("All validations passed!"),
    }

    Ok(())
}
