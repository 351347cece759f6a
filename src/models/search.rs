//! Search API request and response shapes.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// One page request for one package and one file filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub package_name: String,
    /// 1-based page number
    pub page_cursor: u32,
    /// `.py` for an extension filter, anything else is a file name filter
    pub file_suffix_filter: String,
}

impl SearchQuery {
    pub fn first(package_name: impl Into<String>, file_suffix_filter: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            page_cursor: 1,
            file_suffix_filter: file_suffix_filter.into(),
        }
    }

    /// Query for the following page.
    pub fn next_page(&self) -> Self {
        Self {
            page_cursor: self.page_cursor + 1,
            ..self.clone()
        }
    }

    /// Render the `q` parameter of a code search request.
    ///
    /// Extension filters look for an import statement; file name filters
    /// (requirements files) look for the bare package name.
    pub fn to_query_string(&self) -> String {
        match self.file_suffix_filter.strip_prefix('.') {
            Some(extension) => format!(
                "\"import {}\" in:file extension:{}",
                self.package_name, extension
            ),
            None => format!(
                "{} in:file filename:{}",
                self.package_name, self.file_suffix_filter
            ),
        }
    }
}

/// One matched file in a search result page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeMatch {
    /// `owner/name` of the repository
    pub repository: String,
    /// Path of the file inside the repository
    pub path: String,
    /// Text-match fragments around the hit
    pub fragments: Vec<String>,
}

/// Rate-limit metadata attached to an API response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after: Option<Duration>,
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchPage {
    pub total_count: u64,
    pub incomplete_results: bool,
    pub items: Vec<CodeMatch>,
    /// The API reports a further page
    pub has_next: bool,
    pub rate: RateLimitHeaders,
}
