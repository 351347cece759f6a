//! Persistent per-package count rows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Aggregated usage counts for one package on one search date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct PackageCountRow {
    pub package_name: String,
    pub n_repos_importing_package: u64,
    pub n_files_importing_package: u64,
    pub n_requirement_files_citing_package: u64,
    pub date: NaiveDate,
}
