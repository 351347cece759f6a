// src/error.rs

//! Unified error handling for the harvester.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for harvester operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// SQLite operation failed
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Search API call failed outside of a package harvest
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    /// Configuration error; aborts a run before any work starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Snapshot could not be written or read
    #[error("Snapshot error for {path}: {message}")]
    Snapshot { path: String, message: String },
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a snapshot error with the offending path.
    pub fn snapshot(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Snapshot {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Outcome of a single failed search API call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    /// Primary or secondary rate limit hit; never counted as a failure.
    #[error("rate limit exceeded (reset at {reset_at:?}, retry after {retry_after:?})")]
    RateLimited {
        reset_at: Option<DateTime<Utc>>,
        retry_after: Option<Duration>,
    },

    /// Timeout, connection failure, 5xx or an undecodable body.
    #[error("transient API error: {0}")]
    Transient(String),

    /// Malformed query, bad credentials or any other non-retryable 4xx.
    #[error("API error {status}: {message}")]
    Permanent { status: u16, message: String },

    /// The run was cancelled while this call was waiting.
    #[error("cancelled")]
    Cancelled,
}

impl SearchError {
    /// Worth another attempt on the same credential.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }

    /// Map a transport-level reqwest failure.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transient(format!("timeout: {err}"))
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Self::Transient(err.to_string())
        } else if err.is_decode() {
            Self::Transient(format!("undecodable response: {err}"))
        } else {
            match err.status() {
                Some(status) if status.is_server_error() => Self::Transient(err.to_string()),
                Some(status) => Self::Permanent {
                    status: status.as_u16(),
                    message: err.to_string(),
                },
                None => Self::Transient(err.to_string()),
            }
        }
    }
}
