//! SQLite sink for aggregated package counts.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rusqlite::{Connection, Row, params};

use crate::error::{AppError, Result};
use crate::models::PackageCountRow;

/// How a batch of rows is applied to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Upsert rows; other dates are left alone.
    Append,
    /// Clear the table and insert the batch, in one transaction.
    ReplaceAll,
}

/// Wide `package_counts` table keyed by (package_name, date).
pub struct CountStore {
    conn: Connection,
    path: PathBuf,
}

impl CountStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;

        let store = Self {
            conn,
            path: path.to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
            path: PathBuf::from(":memory:"),
        };
        store.init()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS package_counts (
                package_name TEXT NOT NULL,
                n_repos_importing_package INTEGER NOT NULL,
                n_files_importing_package INTEGER NOT NULL,
                n_requirement_files_citing_package INTEGER NOT NULL,
                date TEXT NOT NULL,
                PRIMARY KEY (package_name, date)
            );

            CREATE INDEX IF NOT EXISTS idx_package_counts_date ON package_counts(date);
            ",
        )?;
        Ok(())
    }

    /// Apply `rows` in a single transaction; returns rows written.
    pub fn load(&mut self, rows: &[PackageCountRow], mode: LoadMode) -> Result<usize> {
        let tx = self.conn.transaction()?;
        if mode == LoadMode::ReplaceAll {
            let cleared = tx.execute("DELETE FROM package_counts", [])?;
            log::debug!("Cleared {} existing count rows", cleared);
        }

        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO package_counts (
                    package_name,
                    n_repos_importing_package,
                    n_files_importing_package,
                    n_requirement_files_citing_package,
                    date
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.package_name,
                    to_sql_count(row.n_repos_importing_package),
                    to_sql_count(row.n_files_importing_package),
                    to_sql_count(row.n_requirement_files_citing_package),
                    row.date.format("%Y-%m-%d").to_string(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(rows.len())
    }

    /// Rows for one package, oldest date first. Exact name match only.
    pub fn counts_for(&self, package: &str) -> Result<Vec<PackageCountRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT package_name, n_repos_importing_package, n_files_importing_package,
                    n_requirement_files_citing_package, date
             FROM package_counts WHERE package_name = ?1 ORDER BY date",
        )?;
        let rows = stmt.query_map([package], read_row)?;
        collect_rows(rows)
    }

    /// Every row, ordered by date then package.
    pub fn all_rows(&self) -> Result<Vec<PackageCountRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT package_name, n_repos_importing_package, n_files_importing_package,
                    n_requirement_files_citing_package, date
             FROM package_counts ORDER BY date, package_name",
        )?;
        let rows = stmt.query_map([], read_row)?;
        collect_rows(rows)
    }

    pub fn row_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM package_counts", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

type RawRow = (String, i64, i64, i64, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn collect_rows(
    rows: impl Iterator<Item = rusqlite::Result<RawRow>>,
) -> Result<Vec<PackageCountRow>> {
    rows.map(|row| {
        let (package_name, repos, files, requirements, date) = row?;
        let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
            AppError::validation(format!("bad date '{date}' for {package_name}: {e}"))
        })?;
        Ok(PackageCountRow {
            package_name,
            n_repos_importing_package: u64::try_from(repos).unwrap_or(0),
            n_files_importing_package: u64::try_from(files).unwrap_or(0),
            n_requirement_files_citing_package: u64::try_from(requirements).unwrap_or(0),
            date,
        })
    })
    .collect()
}
