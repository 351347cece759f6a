//! Findings and the dated snapshot that carries them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One (package, repository) usage record produced by a single harvest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub package_name: String,

    /// `owner/name` of the repository
    pub repository_name: String,

    /// Distinct matched files in the repository, always >= 1
    pub n_files_in_repo_that_import_package: u32,

    /// A requirements-like file names the package exactly
    pub requirements_file_mentions_package_name: bool,

    /// Version specifier from the first requirements line naming the package
    pub version_of_package: Option<String>,

    pub search_date: NaiveDate,
}

/// Immutable, dated batch of findings from one harvest run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestSnapshot {
    pub started_at: DateTime<Utc>,
    pub findings: Vec<Finding>,
}

impl HarvestSnapshot {
    /// Build a snapshot, ordering findings by package then repository.
    pub fn new(started_at: DateTime<Utc>, mut findings: Vec<Finding>) -> Self {
        findings.sort_by(|a, b| {
            a.package_name
                .cmp(&b.package_name)
                .then_with(|| a.repository_name.cmp(&b.repository_name))
        });
        Self {
            started_at,
            findings,
        }
    }

    /// Date the snapshot is keyed by.
    pub fn search_date(&self) -> NaiveDate {
        self.started_at.date_naive()
    }

    pub fn package_count(&self) -> usize {
        let mut names: Vec<&str> = self
            .findings
            .iter()
            .map(|f| f.package_name.as_str())
            .collect();
        names.dedup();
        names.len()
    }

    /// Names of the packages that have at least one finding.
    pub fn packages(&self) -> impl Iterator<Item = &str> {
        let mut last: Option<&str> = None;
        self.findings.iter().filter_map(move |f| {
            let name = f.package_name.as_str();
            if last == Some(name) {
                None
            } else {
                last = Some(name);
                Some(name)
            }
        })
    }
}
