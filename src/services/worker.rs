// src/services/worker.rs

//! Per-package search harvesting.
//!
//! A [`SearchWorker`] walks every result page of every configured file
//! filter for one package and folds the matched files into one [`Finding`]
//! per repository. Each call goes through the worker's credential lease, so
//! budget waits, rate-limit rejections and transient retries all happen here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::time::sleep;

use crate::error::SearchError;
use crate::models::{CodeMatch, Finding, HarvestConfig, SearchPage, SearchQuery};
use crate::services::github::SearchApi;
use crate::services::requirements::{find_requirement, is_requirements_path};
use crate::throttle::{CredentialLease, RetryPolicy};
use crate::utils::Cancellation;

type SearchResult<T> = std::result::Result<T, SearchError>;

/// Harvests one package at a time through a leased credential.
#[derive(Clone)]
pub struct SearchWorker {
    api: Arc<dyn SearchApi>,
    retry: RetryPolicy,
    max_pages: u32,
    suffixes: Vec<String>,
    cancel: Cancellation,
}

impl SearchWorker {
    pub fn new(
        api: Arc<dyn SearchApi>,
        retry: RetryPolicy,
        max_pages: u32,
        suffixes: Vec<String>,
        cancel: Cancellation,
    ) -> Self {
        Self {
            api,
            retry,
            max_pages: max_pages.max(1),
            suffixes,
            cancel,
        }
    }

    pub fn from_config(api: Arc<dyn SearchApi>, config: &HarvestConfig, cancel: Cancellation) -> Self {
        let suffixes = config
            .file_suffixes
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self::new(
            api,
            RetryPolicy::from_config(config),
            config.max_pages_per_package,
            suffixes,
            cancel,
        )
    }

    /// Search every page for `package` and fold the matches into findings.
    ///
    /// Findings come back ordered by repository. Any error abandons the
    /// whole package; nothing partial is returned.
    pub async fn harvest_package(
        &self,
        lease: &CredentialLease,
        package: &str,
        search_date: NaiveDate,
    ) -> SearchResult<Vec<Finding>> {
        let mut fold = FindingFold::new(package, search_date);

        for suffix in &self.suffixes {
            let mut query = SearchQuery::first(package, suffix.as_str());
            loop {
                if self.cancel.is_cancelled() {
                    return Err(SearchError::Cancelled);
                }

                let page = self.fetch_page(lease, &query).await?;
                if page.incomplete_results {
                    log::warn!(
                        "Incomplete results for '{}' page {} ({})",
                        package,
                        query.page_cursor,
                        suffix
                    );
                }
                fold.add_all(&page.items);

                if !page.has_next {
                    break;
                }
                if query.page_cursor >= self.max_pages {
                    log::debug!(
                        "Page bound {} reached for '{}' ({}), {} total hits",
                        self.max_pages,
                        package,
                        suffix,
                        page.total_count
                    );
                    break;
                }
                query = query.next_page();
            }
        }

        Ok(fold.finish())
    }

    /// One page with rate-limit waits and bounded transient retries.
    async fn fetch_page(&self, lease: &CredentialLease, query: &SearchQuery) -> SearchResult<SearchPage> {
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = lease.acquire_slot() => {}
                _ = self.cancel.cancelled() => return Err(SearchError::Cancelled),
            }

            match self.api.search_code(lease.credential(), query).await {
                Ok(page) => {
                    lease.report(&page.rate);
                    return Ok(page);
                }
                Err(SearchError::RateLimited { reset_at, retry_after }) => {
                    log::warn!(
                        "Rate limited on credential '{}' for '{}' page {}",
                        lease.credential().id(),
                        query.package_name,
                        query.page_cursor
                    );
                    lease.mark_rate_limited(reset_at, retry_after);
                }
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    if !self.retry.allows_retry(failures) {
                        return Err(SearchError::Transient(format!(
                            "gave up after {failures} attempts: {err}"
                        )));
                    }
                    let delay = self.retry.delay_for(failures);
                    log::warn!(
                        "Transient error for '{}' page {} (attempt {}/{}), retrying in {:.1}s: {}",
                        query.package_name,
                        query.page_cursor,
                        failures,
                        self.retry.max_attempts,
                        delay.as_secs_f64(),
                        err
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(SearchError::Cancelled),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Default)]
struct RepoMatches {
    paths: BTreeSet<String>,
    requirements: bool,
    version: Option<String>,
}

/// Folds matched files into one entry per repository.
struct FindingFold {
    package: String,
    search_date: NaiveDate,
    repos: BTreeMap<String, RepoMatches>,
}

impl FindingFold {
    fn new(package: &str, search_date: NaiveDate) -> Self {
        Self {
            package: package.to_string(),
            search_date,
            repos: BTreeMap::new(),
        }
    }

    fn add_all(&mut self, items: &[CodeMatch]) {
        for item in items {
            self.add(item);
        }
    }

    fn add(&mut self, item: &CodeMatch) {
        let repo = self.repos.entry(item.repository.clone()).or_default();
        if !repo.paths.insert(item.path.clone()) {
            return;
        }
        if !is_requirements_path(&item.path) {
            return;
        }
        if let Some(version) = find_requirement(&item.fragments, &self.package) {
            repo.requirements = true;
            if repo.version.is_none() {
                repo.version = version;
            }
        }
    }

    fn finish(self) -> Vec<Finding> {
        let Self {
            package,
            search_date,
            repos,
        } = self;
        repos
            .into_iter()
            .map(|(repository_name, matches)| Finding {
                package_name: package.clone(),
                repository_name,
                n_files_in_repo_that_import_package: u32::try_from(matches.paths.len())
                    .unwrap_or(u32::MAX),
                requirements_file_mentions_package_name: matches.requirements,
                version_of_package: matches.version,
                search_date,
            })
            .collect()
    }
}
