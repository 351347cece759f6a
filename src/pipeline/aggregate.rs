// src/pipeline/aggregate.rs

//! Snapshot aggregation into per-package count rows.
//!
//! Records are validated one by one from raw JSON so that a single bad
//! record is quarantined instead of failing its whole snapshot, and an
//! unreadable snapshot is skipped instead of failing the run.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::models::{Config, Finding, PackageCountRow};
use crate::storage::local::decompress;
use crate::storage::{CountStore, LoadMode, LocalSnapshotStore, SnapshotStore};
use crate::utils::log;

/// A snapshot file that could not be used at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableSnapshot {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of aggregating a set of snapshots.
#[derive(Debug, Default)]
pub struct AggregateOutcome {
    /// One row per (date, package), ordered by date then package
    pub rows: Vec<PackageCountRow>,
    pub snapshots_read: usize,
    pub findings_accepted: usize,
    pub findings_quarantined: usize,
    pub unreadable: Vec<UnreadableSnapshot>,
}

#[derive(Default)]
struct Tally {
    repos: BTreeSet<String>,
    files: u64,
    requirement_files: u64,
}

/// Groups findings by (search date, package) and counts them.
#[derive(Default)]
pub struct Aggregator {
    tallies: BTreeMap<(NaiveDate, String), Tally>,
    outcome: AggregateOutcome,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate every snapshot in `paths`; duplicate paths are read once.
    pub async fn aggregate(paths: &[PathBuf]) -> AggregateOutcome {
        let mut aggregator = Self::new();
        let mut seen = HashSet::new();
        for path in paths {
            if seen.insert(path.clone()) {
                aggregator.add_snapshot(path).await;
            }
        }
        aggregator.finish()
    }

    /// Read one snapshot file and fold its valid records.
    pub async fn add_snapshot(&mut self, path: &Path) {
        match read_records(path).await {
            Ok(records) => {
                self.outcome.snapshots_read += 1;
                let before = self.outcome.findings_quarantined;
                self.add_records(&records);
                let quarantined = self.outcome.findings_quarantined - before;
                if quarantined > 0 {
                    log::sub_item(&format!(
                        "{}: quarantined {} of {} records",
                        path.display(),
                        quarantined,
                        records.len()
                    ));
                }
            }
            Err(reason) => {
                ::log::warn!("Skipping unreadable snapshot {}: {}", path.display(), reason);
                self.outcome.unreadable.push(UnreadableSnapshot {
                    path: path.to_path_buf(),
                    reason,
                });
            }
        }
    }

    /// Fold raw JSON records, quarantining the malformed ones.
    pub fn add_records(&mut self, records: &[Value]) {
        for (index, record) in records.iter().enumerate() {
            match validate_record(record) {
                Ok(finding) => self.add_finding(&finding),
                Err(reason) => {
                    ::log::debug!("Quarantined record #{}: {}", index, reason);
                    self.outcome.findings_quarantined += 1;
                }
            }
        }
    }

    pub fn add_finding(&mut self, finding: &Finding) {
        let tally = self
            .tallies
            .entry((finding.search_date, finding.package_name.clone()))
            .or_default();
        tally.repos.insert(finding.repository_name.clone());
        tally.files += u64::from(finding.n_files_in_repo_that_import_package);
        if finding.requirements_file_mentions_package_name {
            tally.requirement_files += 1;
        }
        self.outcome.findings_accepted += 1;
    }

    pub fn finish(self) -> AggregateOutcome {
        let Self { tallies, mut outcome } = self;
        outcome.rows = tallies
            .into_iter()
            .map(|((date, package_name), tally)| PackageCountRow {
                package_name,
                n_repos_importing_package: tally.repos.len() as u64,
                n_files_importing_package: tally.files,
                n_requirement_files_citing_package: tally.requirement_files,
                date,
            })
            .collect();
        outcome
    }
}

async fn read_records(path: &Path) -> std::result::Result<Vec<Value>, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let json = decompress(&bytes).map_err(|e| format!("decompression failed: {e}"))?;
    match serde_json::from_slice::<Value>(&json) {
        Ok(Value::Array(records)) => Ok(records),
        Ok(_) => Err("top level is not a JSON array".into()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

/// Check one raw record against the finding schema and ranges.
pub fn validate_record(record: &Value) -> std::result::Result<Finding, String> {
    let object = record.as_object().ok_or("record is not an object")?;

    let package_name = non_blank(object, "package_name")?;
    let repository_name = non_blank(object, "repository_name")?;

    let n_files = object
        .get("n_files_in_repo_that_import_package")
        .and_then(Value::as_i64)
        .ok_or("n_files_in_repo_that_import_package missing or not an integer")?;
    if n_files < 1 {
        return Err(format!("n_files_in_repo_that_import_package is {n_files}, expected >= 1"));
    }
    let n_files = u32::try_from(n_files)
        .map_err(|_| format!("n_files_in_repo_that_import_package {n_files} out of range"))?;

    let requirements = object
        .get("requirements_file_mentions_package_name")
        .and_then(Value::as_bool)
        .ok_or("requirements_file_mentions_package_name missing or not a boolean")?;

    let version = match object.get("version_of_package") {
        None | Some(Value::Null) => None,
        Some(Value::String(v)) => Some(v.clone()),
        Some(_) => return Err("version_of_package is not a string".into()),
    };

    let date = object
        .get("search_date")
        .and_then(Value::as_str)
        .ok_or("search_date missing or not a string")?;
    let search_date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| format!("search_date '{date}' is not YYYY-MM-DD: {e}"))?;

    Ok(Finding {
        package_name,
        repository_name,
        n_files_in_repo_that_import_package: n_files,
        requirements_file_mentions_package_name: requirements,
        version_of_package: version,
        search_date,
    })
}

fn non_blank(object: &Map<String, Value>, field: &str) -> std::result::Result<String, String> {
    match object.get(field).and_then(Value::as_str) {
        Some(value) if !value.trim().is_empty() => Ok(value.to_string()),
        Some(_) => Err(format!("{field} is blank")),
        None => Err(format!("{field} missing or not a string")),
    }
}

/// Aggregate snapshots and load the rows into the count table.
///
/// With no explicit paths every snapshot in the snapshot directory is used.
pub async fn run_aggregate(
    config: &Config,
    paths: &[PathBuf],
    mode: LoadMode,
) -> Result<AggregateOutcome> {
    log::header("Aggregating snapshots");

    let paths = if paths.is_empty() {
        LocalSnapshotStore::new(&config.paths.snapshot_dir).list().await?
    } else {
        paths.to_vec()
    };
    if paths.is_empty() {
        return Err(AppError::config(format!(
            "no snapshots found in {}",
            config.paths.snapshot_dir.display()
        )));
    }
    ::log::info!("Reading {} snapshot(s)", paths.len());

    let outcome = Aggregator::aggregate(&paths).await;

    if outcome.snapshots_read == 0 {
        return Err(AppError::validation(format!(
            "none of the {} snapshot(s) could be read",
            paths.len()
        )));
    }

    let mut store = CountStore::open(&config.paths.database)?;
    let written = store.load(&outcome.rows, mode)?;
    ::log::info!(
        "Loaded {} rows into {} ({:?})",
        written,
        store.path().display(),
        mode
    );

    log::summary(
        "Aggregation",
        &[
            ("Snapshots read", outcome.snapshots_read.to_string()),
            ("Snapshots unreadable", outcome.unreadable.len().to_string()),
            ("Findings accepted", outcome.findings_accepted.to_string()),
            ("Findings quarantined", outcome.findings_quarantined.to_string()),
            ("Rows produced", outcome.rows.len().to_string()),
        ],
    );
    for unreadable in &outcome.unreadable {
        log::sub_item(&format!("{}: {}", unreadable.path.display(), unreadable.reason));
    }

    Ok(outcome)
}
