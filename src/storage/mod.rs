//! Storage for harvest snapshots and aggregated counts.
//!
//! ## Layout
//!
//! ```text
//! {snapshot_dir}/
//! ├── findings-2026-10-11.json.gz   # one immutable snapshot per harvest date
//! └── findings-2026-10-18.json.gz
//! {database}                        # SQLite file holding package_counts
//! ```

pub mod database;
pub mod local;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;
use crate::models::{Finding, HarvestSnapshot};

pub use database::{CountStore, LoadMode};
pub use local::LocalSnapshotStore;

/// Durable, date-keyed snapshot persistence.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Write a snapshot atomically, returning where it landed.
    ///
    /// A second write for the same date replaces the first.
    async fn write(&self, snapshot: &HarvestSnapshot) -> Result<PathBuf>;

    /// Findings of the snapshot for `date`, if one exists.
    async fn read(&self, date: NaiveDate) -> Result<Option<Vec<Finding>>>;

    /// All snapshot files, oldest date first.
    async fn list(&self) -> Result<Vec<PathBuf>>;
}
