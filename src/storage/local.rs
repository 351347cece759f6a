//! Local filesystem snapshot storage.
//!
//! Snapshots are gzip compressed pretty JSON arrays of findings named
//! `findings-YYYY-MM-DD.json.gz`. Writes go to a `.tmp` sibling first and
//! are renamed into place, so readers never see a partial file.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::{Finding, HarvestSnapshot};
use crate::storage::SnapshotStore;

const PREFIX: &str = "findings-";
const SUFFIX: &str = ".json.gz";

/// Local filesystem snapshot backend.
#[derive(Debug, Clone)]
pub struct LocalSnapshotStore {
    root_dir: PathBuf,
}

impl LocalSnapshotStore {
    /// Create a store rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Path of the snapshot for a harvest date.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.root_dir.join(file_name_for(date))
    }

    /// Write bytes atomically (tmp + rename).
    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root_dir).await?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Err(e) = write_then_rename(&tmp, path, bytes).await {
            match tokio::fs::remove_file(&tmp).await {
                Err(cleanup) if cleanup.kind() != std::io::ErrorKind::NotFound => {
                    log::warn!("Could not remove {}: {}", tmp.display(), cleanup);
                }
                _ => {}
            }
            return Err(AppError::Io(e));
        }
        Ok(())
    }

    /// Read bytes, returning None if the file doesn't exist.
    async fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }
}

async fn write_then_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(tmp, path).await
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    async fn write(&self, snapshot: &HarvestSnapshot) -> Result<PathBuf> {
        let path = self.path_for(snapshot.search_date());
        let json = serde_json::to_vec_pretty(&snapshot.findings)?;
        let bytes = compress(&json).map_err(|e| AppError::snapshot(path.display().to_string(), e))?;
        self.write_bytes(&path, &bytes).await?;

        log::info!(
            "Wrote {} findings for {} packages to {}",
            snapshot.findings.len(),
            snapshot.package_count(),
            path.display()
        );
        Ok(path)
    }

    async fn read(&self, date: NaiveDate) -> Result<Option<Vec<Finding>>> {
        let path = self.path_for(date);
        let Some(bytes) = self.read_bytes(&path).await? else {
            return Ok(None);
        };
        let json = decompress(&bytes).map_err(|e| AppError::snapshot(path.display().to_string(), e))?;
        let findings = serde_json::from_slice(&json)
            .map_err(|e| AppError::snapshot(path.display().to_string(), e))?;
        Ok(Some(findings))
    }

    async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.root_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Io(e)),
        };

        let mut dated = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(date) = name.to_str().and_then(date_from_file_name) {
                dated.push((date, entry.path()));
            }
        }
        dated.sort();
        Ok(dated.into_iter().map(|(_, path)| path).collect())
    }
}

/// `findings-YYYY-MM-DD.json.gz`
pub fn file_name_for(date: NaiveDate) -> String {
    format!("{PREFIX}{}{SUFFIX}", date.format("%Y-%m-%d"))
}

/// Harvest date embedded in a snapshot file name.
pub fn date_from_file_name(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

pub fn compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn decompress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
