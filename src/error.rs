//! Error types for filing-dl
//!
//! This module provides the error taxonomy shared by the index builder and the
//! download executor:
//! - [`Error`] - crate-wide error, fatal for the invoking command only
//! - [`FetchError`] - per-entry fetch outcome, split into transient and permanent
//!   failures so the retry loop knows what to do with it
//! - Machine-readable error codes and process exit codes for the CLI

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for filing-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for filing-dl
///
/// Per-entry download failures never surface as this type; they are recorded in
/// the download report instead. An `Error` means the invoking command could not
/// obtain any data at all or could not persist its output.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "search.page_size")
        key: Option<String>,
    },

    /// Date range with start after end, or an unparsable date
    #[error("invalid date range: {0}")]
    InvalidDateRange(String),

    /// The search endpoint could not be queried at all
    #[error("search failed: {0}")]
    Search(String),

    /// The index file could not be read or parsed
    #[error("failed to read index {path}: {reason}")]
    IndexRead {
        /// The index file that was being read
        path: PathBuf,
        /// Why reading failed
        reason: String,
    },

    /// A snapshot, report, or alias file could not be written
    #[error("failed to write {path}: {reason}")]
    ReportWrite {
        /// The output file that was being written
        path: PathBuf,
        /// Why writing failed
        reason: String,
    },

    /// A document fetch failed
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV read/write error
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Shutdown requested before the operation could start
    #[error("shutdown in progress")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Outcome of a failed document fetch
///
/// Transient failures are retried with backoff; permanent failures are terminal
/// on the first attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Network timeout, 5xx, rate-limit signal, challenge page, short body
    #[error("{0}")]
    Transient(String),

    /// 404/410, malformed URL, missing URL
    #[error("{0}")]
    Permanent(String),
}

impl FetchError {
    /// Build a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        FetchError::Transient(msg.into())
    }

    /// Build a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        FetchError::Permanent(msg.into())
    }

    /// Classify a reqwest transport error
    pub fn from_reqwest(url: &str, e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::transient(format!("timeout fetching {}", url))
        } else if e.is_connect() {
            FetchError::transient(format!("connection failed for {}: {}", url, e))
        } else if e.is_builder() {
            FetchError::permanent(format!("invalid request for {}: {}", url, e))
        } else {
            FetchError::transient(format!("request to {} failed: {}", url, e))
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(url: &str, status: u16) -> Self {
        match status {
            429 | 500..=599 | 408 => FetchError::transient(format!("HTTP {} for {}", status, url)),
            _ => FetchError::permanent(format!("HTTP {} for {}", status, url)),
        }
    }

    /// Whether this is a permanent failure
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::Permanent(_))
    }
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::InvalidDateRange(_) => "invalid_date_range",
            Error::Search(_) => "search_failed",
            Error::IndexRead { .. } => "index_read_error",
            Error::ReportWrite { .. } => "report_write_error",
            Error::Fetch(FetchError::Transient(_)) => "transient_fetch_error",
            Error::Fetch(FetchError::Permanent(_)) => "permanent_fetch_error",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::Csv(_) => "csv_error",
            Error::ShuttingDown => "shutting_down",
            Error::Other(_) => "internal_error",
        }
    }

    /// Process exit code for the CLI
    ///
    /// Usage errors map to 2, unreadable inputs to 3, unwritable outputs to 4,
    /// failed searches to 5, everything else to 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config { .. } | Error::InvalidDateRange(_) => 2,
            Error::IndexRead { .. } => 3,
            Error::ReportWrite { .. } => 4,
            Error::Search(_) | Error::Network(_) => 5,
            Error::ShuttingDown => 130,
            _ => 1,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(!FetchError::from_status("u", 503).is_permanent());
        assert!(!FetchError::from_status("u", 429).is_permanent());
        assert!(FetchError::from_status("u", 404).is_permanent());
        assert!(FetchError::from_status("u", 410).is_permanent());
        assert!(FetchError::from_status("u", 403).is_permanent());
    }

    #[test]
    fn error_codes_and_exit_codes() {
        let read = Error::IndexRead {
            path: PathBuf::from("/tmp/idx.json"),
            reason: "missing".into(),
        };
        assert_eq!(read.error_code(), "index_read_error");
        assert_eq!(read.exit_code(), 3);

        let cfg = Error::config("download.workers", "must be greater than 0");
        assert_eq!(cfg.error_code(), "config_error");
        assert_eq!(cfg.exit_code(), 2);

        let fetch = Error::Fetch(FetchError::transient("timeout"));
        assert_eq!(fetch.error_code(), "transient_fetch_error");
        assert_eq!(fetch.exit_code(), 1);
    }

    #[test]
    fn display_preserves_message() {
        let e = FetchError::permanent("HTTP 404 for https://example.com/a.pdf");
        assert_eq!(e.to_string(), "HTTP 404 for https://example.com/a.pdf");
        let wrapped: Error = e.into();
        assert_eq!(
            wrapped.to_string(),
            "fetch error: HTTP 404 for https://example.com/a.pdf"
        );
    }
}
