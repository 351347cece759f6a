// src/pipeline/harvest.rs

//! Harvest coordination.
//!
//! A fixed number of worker loops each check out one credential for their
//! whole lifetime and pull packages from a shared queue. Completed packages
//! are sent over a channel to a single collector, which owns the finding
//! accumulator, so a package only becomes visible once all of its pages are
//! in.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use tokio::sync::mpsc;

use crate::error::{AppError, Result, SearchError};
use crate::models::{Config, Finding, HarvestSnapshot, PackageFailure, RunCounts};
use crate::services::{GithubSearchClient, SearchApi, SearchWorker};
use crate::storage::{LocalSnapshotStore, SnapshotStore};
use crate::throttle::{Credential, CredentialPool};
use crate::utils::{Cancellation, format_duration, log};

/// Everything a harvest run produced.
#[derive(Debug)]
pub struct HarvestOutcome {
    pub snapshot: HarvestSnapshot,
    pub succeeded: Vec<String>,
    pub failures: Vec<PackageFailure>,
    /// Packages abandoned or never started because the run was cancelled
    pub interrupted: Vec<String>,
    /// Packages carried over from a resumed snapshot
    pub resumed: Vec<String>,
    pub cancelled: bool,
}

impl HarvestOutcome {
    pub fn counts(&self) -> RunCounts {
        RunCounts {
            packages_succeeded: self.succeeded.len() + self.resumed.len(),
            packages_failed: self.failures.len(),
            findings_quarantined: None,
        }
    }
}

struct Checkpoint {
    store: Arc<dyn SnapshotStore>,
    every: usize,
}

type PackageResult = (String, std::result::Result<Vec<Finding>, SearchError>);

/// Fans packages out over credential-bound search workers.
pub struct HarvestCoordinator {
    pool: Arc<CredentialPool>,
    worker: SearchWorker,
    worker_count: usize,
    cancel: Cancellation,
    checkpoint: Option<Checkpoint>,
    seed: Vec<Finding>,
}

impl HarvestCoordinator {
    /// Run at most `pool_size` workers, never more than there are credentials.
    pub fn new(
        pool: Arc<CredentialPool>,
        worker: SearchWorker,
        pool_size: usize,
        cancel: Cancellation,
    ) -> Self {
        let worker_count = pool_size.max(1).min(pool.len());
        Self {
            pool,
            worker,
            worker_count,
            cancel,
            checkpoint: None,
            seed: Vec::new(),
        }
    }

    /// Write a partial snapshot every `every` completed packages.
    pub fn with_checkpoints(mut self, store: Arc<dyn SnapshotStore>, every: usize) -> Self {
        if every > 0 {
            self.checkpoint = Some(Checkpoint { store, every });
        }
        self
    }

    /// Findings from an earlier run today; their packages are not searched again.
    pub fn with_seed(mut self, findings: Vec<Finding>) -> Self {
        self.seed = findings;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Seed every credential's budget from the rate-limit endpoint.
    pub async fn prime_budgets(&self, api: &dyn SearchApi) {
        for credential in self.pool.credentials() {
            match api.rate_limit(&credential).await {
                Ok(headers) => {
                    ::log::debug!(
                        "Credential '{}': {:?}/{:?} search calls left",
                        credential.id(),
                        headers.remaining,
                        headers.limit
                    );
                    self.pool.report(&credential, &headers);
                }
                Err(e) => ::log::warn!(
                    "Rate limit probe failed for credential '{}': {}. Using configured ceiling.",
                    credential.id(),
                    e
                ),
            }
        }
    }

    /// Harvest `packages` and return the snapshot of completed packages.
    ///
    /// Duplicate names are searched once. Failed and interrupted packages
    /// are reported separately and never appear in the snapshot.
    pub async fn run(&self, packages: &[String]) -> Result<HarvestOutcome> {
        let packages = dedupe(packages);
        if packages.is_empty() {
            return Err(AppError::config("no packages to search"));
        }
        if self.pool.is_empty() {
            return Err(AppError::config("no search credentials configured"));
        }

        let started_at = Utc::now();
        let search_date = started_at.date_naive();

        let seeded: HashSet<&str> = self.seed.iter().map(|f| f.package_name.as_str()).collect();
        let (resumed, pending): (Vec<String>, Vec<String>) = packages
            .into_iter()
            .partition(|p| seeded.contains(p.as_str()));
        if !resumed.is_empty() {
            ::log::info!("Resuming: {} package(s) already harvested today", resumed.len());
        }

        let total = pending.len();
        let queue = Mutex::new(pending.into_iter().collect::<VecDeque<_>>());
        let (tx, rx) = mpsc::unbounded_channel::<PackageResult>();

        ::log::info!(
            "Harvesting {} package(s) with {} worker(s)",
            total,
            self.worker_count
        );

        let workers: Vec<_> = (0..self.worker_count)
            .map(|id| {
                let tx = tx.clone();
                let queue = &queue;
                async move { self.worker_loop(id, queue, tx, search_date).await }
            })
            .collect();
        drop(tx);

        let (_, collected) = tokio::join!(join_all(workers), self.collect(rx, started_at, total));

        let mut interrupted = collected.interrupted;
        let never_started = queue
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        interrupted.extend(never_started);

        let mut findings = self.seed.clone();
        findings.extend(collected.findings);

        Ok(HarvestOutcome {
            snapshot: HarvestSnapshot::new(started_at, findings),
            succeeded: collected.succeeded,
            failures: collected.failures,
            interrupted,
            resumed,
            cancelled: self.cancel.is_cancelled(),
        })
    }

    async fn worker_loop(
        &self,
        id: usize,
        queue: &Mutex<VecDeque<String>>,
        tx: mpsc::UnboundedSender<PackageResult>,
        search_date: NaiveDate,
    ) {
        let lease = tokio::select! {
            lease = self.pool.checkout() => lease,
            _ = self.cancel.cancelled() => return,
        };
        ::log::debug!("Worker {} holds credential '{}'", id, lease.credential().id());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let next = queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            let Some(package) = next else {
                break;
            };

            let result = self.worker.harvest_package(&lease, &package, search_date).await;
            if tx.send((package, result)).is_err() {
                break;
            }
        }
    }

    async fn collect(
        &self,
        mut rx: mpsc::UnboundedReceiver<PackageResult>,
        started_at: DateTime<Utc>,
        total: usize,
    ) -> Collected {
        let mut collected = Collected::default();
        let mut done = 0usize;

        while let Some((package, result)) = rx.recv().await {
            match result {
                Ok(findings) => {
                    done += 1;
                    log::sub_item(&format!(
                        "[{}/{}] {}: {} repositories",
                        done,
                        total,
                        package,
                        findings.len()
                    ));
                    collected.findings.extend(findings);
                    collected.succeeded.push(package);

                    if let Some(checkpoint) = &self.checkpoint {
                        if collected.succeeded.len() % checkpoint.every == 0 {
                            self.write_checkpoint(checkpoint, started_at, &collected.findings)
                                .await;
                        }
                    }
                }
                Err(SearchError::Cancelled) => {
                    ::log::info!("{}: interrupted", package);
                    collected.interrupted.push(package);
                }
                Err(e) => {
                    done += 1;
                    ::log::warn!("[{}/{}] {}: failed: {}", done, total, package, e);
                    collected.failures.push(PackageFailure {
                        package_name: package,
                        reason: e.to_string(),
                    });
                }
            }
        }
        collected
    }

    async fn write_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        started_at: DateTime<Utc>,
        findings: &[Finding],
    ) {
        let mut all = self.seed.clone();
        all.extend_from_slice(findings);
        let snapshot = HarvestSnapshot::new(started_at, all);
        match checkpoint.store.write(&snapshot).await {
            Ok(path) => ::log::info!(
                "Checkpoint: {} package(s) saved to {}",
                snapshot.package_count(),
                path.display()
            ),
            Err(e) => ::log::warn!("Checkpoint write failed: {}", e),
        }
    }
}

#[derive(Default)]
struct Collected {
    findings: Vec<Finding>,
    succeeded: Vec<String>,
    failures: Vec<PackageFailure>,
    interrupted: Vec<String>,
}

/// Trim names, drop blanks and keep the first occurrence of each.
fn dedupe(packages: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    packages
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .filter(|p| seen.insert(p.to_string()))
        .map(str::to_string)
        .collect()
}

/// What `run_harvest` hands back to its caller.
#[derive(Debug)]
pub struct HarvestReport {
    pub outcome: HarvestOutcome,
    pub snapshot_path: PathBuf,
}

/// Options for a harvest run that do not live in the config file.
#[derive(Debug, Clone, Default)]
pub struct HarvestOptions {
    /// Carry over packages already present in today's snapshot
    pub resume: bool,
}

/// Credential pool built from the configured tokens and budget settings.
pub fn build_pool(config: &Config) -> CredentialPool {
    let credentials = config
        .github
        .credentials
        .iter()
        .map(|c| Credential::new(c.id.clone(), c.token.clone()))
        .collect();
    CredentialPool::new(
        credentials,
        config.harvest.rate_limit_ceiling_per_credential,
        Duration::from_secs(config.harvest.rate_limit_window_seconds),
        Duration::from_millis(config.harvest.min_request_interval_ms),
    )
}

/// Harvest packages against the live API and write the dated snapshot.
pub async fn run_harvest(
    config: &Config,
    packages: &[String],
    options: &HarvestOptions,
    cancel: Cancellation,
) -> Result<HarvestReport> {
    let (api, store) = live_sources(config, packages)?;
    harvest_with(config, api, store, packages, options, cancel).await
}

/// Validate the run and build the live search client and snapshot store.
pub(crate) fn live_sources(
    config: &Config,
    packages: &[String],
) -> Result<(Arc<dyn SearchApi>, Arc<dyn SnapshotStore>)> {
    config.validate()?;
    if packages.iter().all(|p| p.trim().is_empty()) {
        return Err(AppError::config("no packages to search"));
    }

    let api: Arc<dyn SearchApi> = Arc::new(GithubSearchClient::new(&config.github)?);
    let store: Arc<dyn SnapshotStore> = Arc::new(LocalSnapshotStore::new(&config.paths.snapshot_dir));
    Ok((api, store))
}

/// Harvest with an injected API and snapshot store.
pub async fn harvest_with(
    config: &Config,
    api: Arc<dyn SearchApi>,
    store: Arc<dyn SnapshotStore>,
    packages: &[String],
    options: &HarvestOptions,
    cancel: Cancellation,
) -> Result<HarvestReport> {
    let start = std::time::Instant::now();
    log::header("Harvesting package usage");

    let pool = Arc::new(build_pool(config));
    let worker = SearchWorker::from_config(Arc::clone(&api), &config.harvest, cancel.clone());
    let mut coordinator =
        HarvestCoordinator::new(pool, worker, config.harvest.worker_pool_size, cancel)
            .with_checkpoints(Arc::clone(&store), config.harvest.checkpoint_every);

    if options.resume {
        let today = Utc::now().date_naive();
        if let Some(findings) = store.read(today).await? {
            ::log::info!("Loaded {} findings from today's snapshot", findings.len());
            coordinator = coordinator.with_seed(findings);
        }
    }

    coordinator.prime_budgets(api.as_ref()).await;
    let outcome = coordinator.run(packages).await?;
    let snapshot_path = store.write(&outcome.snapshot).await?;

    let mut items = outcome.counts().summary_items();
    items.push(("Packages interrupted", outcome.interrupted.len().to_string()));
    items.push(("Findings written", outcome.snapshot.findings.len().to_string()));
    items.push(("Snapshot", snapshot_path.display().to_string()));
    items.push(("Elapsed", format_duration(start.elapsed())));
    log::summary("Harvest", &items);
    for failure in &outcome.failures {
        log::sub_item(&format!("FAILED {}", failure));
    }
    if outcome.cancelled {
        ::log::warn!(
            "Harvest was cancelled; {} package(s) not harvested",
            outcome.interrupted.len()
        );
    }

    Ok(HarvestReport {
        outcome,
        snapshot_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CredentialConfig;
    use crate::services::github::mock::{ScriptedSearchApi, page};
    use crate::throttle::RetryPolicy;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn pool(ids: &[&str]) -> Arc<CredentialPool> {
        Arc::new(CredentialPool::new(
            ids.iter().map(|id| Credential::new(*id, "token")).collect(),
            1000,
            Duration::from_secs(60),
            Duration::ZERO,
        ))
    }

    fn coordinator(
        api: &Arc<ScriptedSearchApi>,
        creds: &[&str],
        pool_size: usize,
        cancel: Cancellation,
    ) -> HarvestCoordinator {
        let worker = SearchWorker::new(
            api.clone(),
            RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(2)),
            10,
            vec![".py".into()],
            cancel.clone(),
        );
        HarvestCoordinator::new(pool(creds), worker, pool_size, cancel)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_isolated() {
        let api = ScriptedSearchApi::new();
        api.push("numpy", ".py", 1, Ok(page(&[("A", "a.py"), ("B", "b.py")], false)));
        api.push("foo", ".py", 1, Ok(page(&[("F", "f.py")], true)));
        api.push(
            "foo",
            ".py",
            2,
            Err(SearchError::Permanent {
                status: 422,
                message: "Validation Failed".into(),
            }),
        );
        api.push("requests", ".py", 1, Ok(page(&[("R", "r.py")], false)));
        let api = Arc::new(api);

        let outcome = coordinator(&api, &["a", "b"], 2, Cancellation::new())
            .run(&names(&["numpy", "foo", "requests"]))
            .await
            .unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].package_name, "foo");
        assert!(outcome.failures[0].reason.contains("422"));
        assert_eq!(
            outcome.snapshot.packages().collect::<Vec<_>>(),
            ["numpy", "requests"]
        );
        assert_eq!(outcome.snapshot.findings.len(), 3);
        assert_eq!(outcome.counts().packages_succeeded, 2);
        assert_eq!(outcome.counts().packages_failed, 1);
        assert!(!outcome.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_never_share_a_credential() {
        let api = Arc::new(ScriptedSearchApi::new().with_latency(Duration::from_secs(1)));
        let packages: Vec<String> = (0..12).map(|i| format!("pkg{i}")).collect();

        let coordinator = coordinator(&api, &["a", "b", "c"], 8, Cancellation::new());
        assert_eq!(coordinator.worker_count(), 3);
        let outcome = coordinator.run(&packages).await.unwrap();

        assert_eq!(outcome.succeeded.len(), 12);
        assert!(!api.overlap_detected());
        let used: HashSet<String> = api.calls().into_iter().map(|(id, _)| id).collect();
        assert_eq!(used.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_pool_runs_two_workers() {
        let api = Arc::new(ScriptedSearchApi::new().with_latency(Duration::from_secs(1)));
        let packages: Vec<String> = (0..4).map(|i| format!("pkg{i}")).collect();
        let start = tokio::time::Instant::now();

        let coordinator = coordinator(&api, &["a", "b", "c"], 2, Cancellation::new());
        assert_eq!(coordinator.worker_count(), 2);
        coordinator.run(&packages).await.unwrap();

        // Four one-second packages over two workers.
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_keeps_completed_packages() {
        let api = ScriptedSearchApi::new().with_latency(Duration::from_secs(10));
        api.push("alpha", ".py", 1, Ok(page(&[("A", "a.py")], false)));
        api.push("beta", ".py", 1, Ok(page(&[("B", "b1.py")], true)));
        api.push("beta", ".py", 2, Ok(page(&[("B", "b2.py")], false)));
        let api = Arc::new(api);
        let cancel = Cancellation::new();
        let coordinator = coordinator(&api, &["a"], 1, cancel.clone());

        let packages = names(&["alpha", "beta", "gamma", "delta"]);
        let (outcome, _) = tokio::join!(coordinator.run(&packages), async {
            sleep(Duration::from_secs(15)).await;
            cancel.cancel();
        });
        let outcome = outcome.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.succeeded, ["alpha"]);
        assert_eq!(outcome.interrupted, ["beta", "gamma", "delta"]);
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.snapshot.packages().collect::<Vec<_>>(), ["alpha"]);
        assert_eq!(api.calls_for("gamma"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_package_list_is_fatal() {
        let api = Arc::new(ScriptedSearchApi::new());
        let err = coordinator(&api, &["a"], 2, Cancellation::new())
            .run(&names(&["", "  "]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_packages_searched_once() {
        let api = Arc::new(ScriptedSearchApi::new());
        let outcome = coordinator(&api, &["a", "b"], 2, Cancellation::new())
            .run(&names(&["numpy", " numpy", "numpy"]))
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, ["numpy"]);
        assert_eq!(api.calls_for("numpy"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_skips_seeded_packages() {
        let api = ScriptedSearchApi::new();
        api.push("requests", ".py", 1, Ok(page(&[("R", "r.py")], false)));
        let api = Arc::new(api);
        let seeded = Finding {
            package_name: "numpy".into(),
            repository_name: "A".into(),
            n_files_in_repo_that_import_package: 3,
            requirements_file_mentions_package_name: false,
            version_of_package: None,
            search_date: Utc::now().date_naive(),
        };

        let outcome = coordinator(&api, &["a"], 1, Cancellation::new())
            .with_seed(vec![seeded.clone()])
            .run(&names(&["numpy", "requests"]))
            .await
            .unwrap();

        assert_eq!(api.calls_for("numpy"), 0);
        assert_eq!(outcome.resumed, ["numpy"]);
        assert_eq!(outcome.succeeded, ["requests"]);
        assert!(outcome.snapshot.findings.contains(&seeded));
        assert_eq!(outcome.counts().packages_succeeded, 2);
    }

    #[tokio::test]
    async fn test_checkpoints_are_written() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalSnapshotStore::new(tmp.path()));
        let api = ScriptedSearchApi::new();
        api.push("numpy", ".py", 1, Ok(page(&[("A", "a.py")], false)));
        let api = Arc::new(api);

        let outcome = coordinator(&api, &["a"], 1, Cancellation::new())
            .with_checkpoints(store.clone(), 1)
            .run(&names(&["numpy"]))
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        let saved = store
            .read(outcome.snapshot.search_date())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved, outcome.snapshot.findings);
    }

    #[tokio::test]
    async fn test_harvest_with_writes_snapshot() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.github.credentials = vec![CredentialConfig {
            id: "ci".into(),
            token: "t".into(),
        }];
        config.harvest.file_suffixes = vec![".py".into()];
        config.paths.snapshot_dir = tmp.path().to_path_buf();

        let api = ScriptedSearchApi::new();
        api.push("numpy", ".py", 1, Ok(page(&[("A", "a.py"), ("A", "b.py")], false)));
        let api: Arc<dyn SearchApi> = Arc::new(api);
        let store: Arc<dyn SnapshotStore> = Arc::new(LocalSnapshotStore::new(tmp.path()));

        let report = harvest_with(
            &config,
            api,
            store,
            &names(&["numpy"]),
            &HarvestOptions::default(),
            Cancellation::new(),
        )
        .await
        .unwrap();

        assert!(report.snapshot_path.exists());
        assert_eq!(report.outcome.snapshot.findings[0].n_files_in_repo_that_import_package, 2);
    }

    #[tokio::test]
    async fn test_run_harvest_rejects_missing_credentials() {
        let err = run_harvest(
            &Config::default(),
            &names(&["numpy"]),
            &HarvestOptions::default(),
            Cancellation::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
