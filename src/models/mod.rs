// src/models/mod.rs

//! Domain models for the harvester.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod finding;
mod package;
mod report;
mod search;

// Re-export all public types
pub use config::{
    Config, CredentialConfig, GithubConfig, HarvestConfig, PathsConfig, TOKENS_ENV,
};
pub use finding::{Finding, HarvestSnapshot};
pub use package::PackageCountRow;
pub use report::{PackageFailure, RunCounts};
pub use search::{CodeMatch, RateLimitHeaders, SearchPage, SearchQuery};
