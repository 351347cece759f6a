//! Service layer for the harvester.
//!
//! - Code search API access (`GithubSearchClient`, `SearchApi`)
//! - Requirements file parsing
//! - Per-package harvesting (`SearchWorker`)

pub mod github;
pub mod requirements;
pub mod worker;

pub use github::{GithubSearchClient, SearchApi};
pub use worker::SearchWorker;
