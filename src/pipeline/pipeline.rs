// src/pipeline/pipeline.rs

use std::sync::Arc;

use crate::error::Result;
use crate::models::{Config, RunCounts};
use crate::services::SearchApi;
use crate::storage::{LoadMode, SnapshotStore};
use crate::utils::{Cancellation, log};

use super::aggregate::{AggregateOutcome, run_aggregate};
use super::harvest::{HarvestOptions, HarvestReport, harvest_with, live_sources};

/// Result of a harvest followed by aggregation of its snapshot.
#[derive(Debug)]
pub struct PipelineReport {
    pub harvest: HarvestReport,
    pub aggregate: AggregateOutcome,
    pub counts: RunCounts,
}

/// Run the full pipeline: harvest, then aggregate the new snapshot.
pub async fn run_pipeline(
    config: &Config,
    packages: &[String],
    options: &HarvestOptions,
    cancel: Cancellation,
) -> Result<PipelineReport> {
    let (api, store) = live_sources(config, packages)?;
    pipeline_with(config, api, store, packages, options, cancel).await
}

/// Pipeline with an injected API and snapshot store.
pub async fn pipeline_with(
    config: &Config,
    api: Arc<dyn SearchApi>,
    store: Arc<dyn SnapshotStore>,
    packages: &[String],
    options: &HarvestOptions,
    cancel: Cancellation,
) -> Result<PipelineReport> {
    log::header("Pipeline");

    log::step(1, 2, "Harvest - Searching package usage");
    let harvest = harvest_with(config, api, store, packages, options, cancel).await?;

    log::step(2, 2, "Aggregate - Loading counts");
    let aggregate = run_aggregate(
        config,
        std::slice::from_ref(&harvest.snapshot_path),
        LoadMode::Append,
    )
    .await?;

    let counts = harvest
        .outcome
        .counts()
        .with_quarantined(aggregate.findings_quarantined);
    log::summary("Pipeline", &counts.summary_items());

    Ok(PipelineReport {
        harvest,
        aggregate,
        counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CredentialConfig;
    use crate::services::github::mock::{ScriptedSearchApi, page};
    use crate::storage::{CountStore, LocalSnapshotStore};
    use tempfile::TempDir;

    fn config_in(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.github.credentials = vec![CredentialConfig {
            id: "ci".into(),
            token: "t".into(),
        }];
        config.harvest.file_suffixes = vec![".py".into()];
        config.paths.snapshot_dir = tmp.path().join("snapshots");
        config.paths.database = tmp.path().join("counts.sqlite3");
        config
    }

    #[tokio::test]
    async fn test_pipeline_reports_quarantined_findings() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(&tmp);

        // A match without a repository name folds into a finding the
        // aggregator refuses.
        let api = ScriptedSearchApi::new();
        api.push(
            "numpy",
            ".py",
            1,
            Ok(page(&[("A", "a.py"), ("A", "b.py"), ("", "c.py")], false)),
        );
        let api: Arc<dyn SearchApi> = Arc::new(api);
        let store: Arc<dyn SnapshotStore> =
            Arc::new(LocalSnapshotStore::new(&config.paths.snapshot_dir));

        let report = pipeline_with(
            &config,
            api,
            store,
            &["numpy".to_string()],
            &HarvestOptions::default(),
            Cancellation::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.harvest.outcome.snapshot.findings.len(), 2);
        assert_eq!(report.aggregate.findings_accepted, 1);
        assert_eq!(
            report.counts,
            RunCounts {
                packages_succeeded: 1,
                packages_failed: 0,
                findings_quarantined: Some(1),
            }
        );

        let rows = CountStore::open(&config.paths.database)
            .unwrap()
            .counts_for("numpy")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].n_repos_importing_package, 1);
        assert_eq!(rows[0].n_files_importing_package, 2);
    }
}
