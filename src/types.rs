//! Core types for filing-dl

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Disclosure portal an entry was discovered on
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// cninfo full-text announcement search
    Cninfo,
    /// SSE site-wide document search
    SseSearch,
    /// SSE inquiry-letter column
    SseInquiry,
}

impl Source {
    /// Stable tag used in unique keys and file prefixes
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cninfo => "cninfo",
            Source::SseSearch => "sse_search",
            Source::SseInquiry => "sse_inquiry",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cninfo" => Ok(Source::Cninfo),
            "sse_search" | "sse" => Ok(Source::SseSearch),
            "sse_inquiry" => Ok(Source::SseInquiry),
            other => Err(Error::config("source", format!("unknown source '{}'", other))),
        }
    }
}

/// Inclusive calendar date range `[start, end]`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateRange {
    /// First day included
    pub start: NaiveDate,
    /// Last day included
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a range, rejecting `start > end`
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidDateRange(format!(
                "start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse two `YYYY-MM-DD` strings
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse = |s: &str| {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| {
                Error::InvalidDateRange(format!("'{}' is not a YYYY-MM-DD date", s))
            })
        };
        Self::new(parse(start)?, parse(end)?)
    }

    /// Number of days covered (a single-day range covers 1)
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Whether the range covers exactly one day
    pub fn is_single_day(&self) -> bool {
        self.start == self.end
    }

    /// Split at the temporal midpoint into two adjacent, non-overlapping halves
    ///
    /// Returns `None` for single-day ranges.
    pub fn split(&self) -> Option<(DateRange, DateRange)> {
        if self.is_single_day() {
            return None;
        }
        let mid = self.start + chrono::Duration::days((self.end - self.start).num_days() / 2);
        let right_start = mid.succ_opt()?;
        Some((
            DateRange {
                start: self.start,
                end: mid,
            },
            DateRange {
                start: right_start,
                end: self.end,
            },
        ))
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}~{}", self.start, self.end)
    }
}

/// Keyword plus portal-specific filters for one build
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Search keyword
    pub keyword: String,
    /// Filters such as `stock`, `column`, `category`
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl SearchQuery {
    /// Query with no filters
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            filters: BTreeMap::new(),
        }
    }

    /// Add a filter
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    /// Look up a non-empty filter value
    pub fn filter(&self, key: &str) -> Option<&str> {
        self.filters
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// One discoverable document
///
/// Field order is the tabular column order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// `<source>:<document id>` or `<source>:url:<download url>`
    pub unique_key: String,
    /// Document title with highlight markup stripped
    pub title: String,
    /// Publication date
    pub publish_date: NaiveDate,
    /// Portal the entry came from
    pub source_category: Source,
    /// Listed-company security code
    #[serde(default)]
    pub entity_code: Option<String>,
    /// Listed-company short name
    #[serde(default)]
    pub entity_name: Option<String>,
    /// Portal organization id
    #[serde(default)]
    pub entity_org_id: Option<String>,
    /// Download location, possibly relative to the portal's file host
    pub download_url: String,
    /// Extension hint (e.g. `pdf`)
    #[serde(default)]
    pub file_type: Option<String>,
}

impl IndexEntry {
    /// Build the unique key from a document id, falling back to the URL
    pub fn make_key(source: Source, doc_id: Option<&str>, url: &str) -> Option<String> {
        match doc_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => Some(format!("{}:{}", source, id)),
            None if !url.trim().is_empty() => Some(format!("{}:url:{}", source, url.trim())),
            None => None,
        }
    }

    /// Document id part of the key (the URL for URL-derived keys)
    pub fn doc_id(&self) -> &str {
        let rest = self
            .unique_key
            .split_once(':')
            .map(|(_, rest)| rest)
            .unwrap_or(&self.unique_key);
        rest.strip_prefix("url:").unwrap_or(rest)
    }

    /// Whether the key was derived from the URL rather than a document id
    pub fn has_url_key(&self) -> bool {
        self.unique_key
            .split_once(':')
            .is_some_and(|(_, rest)| rest.starts_with("url:"))
    }
}

/// Non-fatal condition recorded on a snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotWarning {
    /// A single-day range still exceeds the ceiling; results may be truncated
    SegmentationExhausted {
        /// The unsplittable range
        range: DateRange,
        /// Total reported by the portal
        reported_total: u64,
        /// Records retrievable per query
        ceiling: u64,
    },
    /// A leaf could not be paged to completion
    LeafIncomplete {
        /// The affected range
        range: DateRange,
        /// Pages fetched before giving up
        pages_fetched: u32,
        /// Last error seen
        error: String,
    },
}

impl std::fmt::Display for SnapshotWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotWarning::SegmentationExhausted {
                range,
                reported_total,
                ceiling,
            } => write!(
                f,
                "{} reports {} records but only {} are reachable",
                range, reported_total, ceiling
            ),
            SnapshotWarning::LeafIncomplete {
                range,
                pages_fetched,
                error,
            } => write!(
                f,
                "{} stopped after {} pages: {}",
                range, pages_fetched, error
            ),
        }
    }
}

/// One immutable generation of the index
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Search keyword
    pub keyword: String,
    /// Portal searched (absent for snapshots read back from CSV)
    #[serde(default)]
    pub source: Option<Source>,
    /// Filters applied
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    /// Requested date range
    #[serde(default)]
    pub date_range: Option<DateRange>,
    /// When the snapshot was built
    pub generated_at: DateTime<Utc>,
    /// Sum of totals reported by the portal over all leaves
    #[serde(default)]
    pub total_observed: u64,
    /// Truncation and partial-leaf annotations
    #[serde(default)]
    pub warnings: Vec<SnapshotWarning>,
    /// Entries, publish date descending then key ascending
    pub entries: Vec<IndexEntry>,
}

impl IndexSnapshot {
    /// Snapshot wrapping bare entries (e.g. read from a tabular index)
    pub fn from_entries(keyword: impl Into<String>, entries: Vec<IndexEntry>) -> Self {
        Self {
            keyword: keyword.into(),
            source: None,
            filters: BTreeMap::new(),
            date_range: None,
            generated_at: Utc::now(),
            total_observed: 0,
            warnings: Vec::new(),
            entries,
        }
    }

    /// Whether any leaf may be missing records
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Per-entry download state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Not yet resolved
    Pending,
    /// Artifact saved
    Success,
    /// Retry budget exhausted or permanent error
    Failed,
}

impl DownloadStatus {
    /// Whether no further transitions occur
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadStatus::Pending)
    }

    /// Value written to the report's status column
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Success => "success",
            DownloadStatus::Failed => "failed",
        }
    }
}

/// One entry's download outcome; a row of the download report
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Join key into the index
    pub unique_key: String,
    /// Current state
    pub status: DownloadStatus,
    /// Last error, empty on success
    #[serde(default)]
    pub error: String,
    /// Absolute artifact path, empty on failure
    #[serde(default)]
    pub file_path: String,
    /// Fetch attempts made
    #[serde(default)]
    pub attempt_count: u32,
    /// When the entry reached a terminal state
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadRecord {
    /// Record for an entry that has not been resolved
    pub fn pending(unique_key: impl Into<String>) -> Self {
        Self {
            unique_key: unique_key.into(),
            status: DownloadStatus::Pending,
            error: String::new(),
            file_path: String::new(),
            attempt_count: 0,
            completed_at: None,
        }
    }

    /// Successful terminal record
    pub fn success(unique_key: impl Into<String>, path: &std::path::Path, attempts: u32) -> Self {
        Self {
            unique_key: unique_key.into(),
            status: DownloadStatus::Success,
            error: String::new(),
            file_path: path.display().to_string(),
            attempt_count: attempts,
            completed_at: Some(Utc::now()),
        }
    }

    /// Failed terminal record
    pub fn failed(unique_key: impl Into<String>, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            unique_key: unique_key.into(),
            status: DownloadStatus::Failed,
            error: error.into(),
            file_path: String::new(),
            attempt_count: attempts,
            completed_at: Some(Utc::now()),
        }
    }

    /// Artifact path, if one was recorded
    pub fn artifact(&self) -> Option<PathBuf> {
        if self.file_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.file_path))
        }
    }

    /// Success whose artifact still exists on disk with non-zero size
    pub fn is_satisfied(&self) -> bool {
        self.status == DownloadStatus::Success
            && self
                .artifact()
                .and_then(|p| std::fs::metadata(p).ok())
                .is_some_and(|m| m.is_file() && m.len() > 0)
    }
}

/// Event emitted by the download executor
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Execution started
    Started {
        /// Unique entries in the index
        total: usize,
        /// Entries scheduled for fetching
        scheduled: usize,
        /// Entries already satisfied by an earlier report
        skipped: usize,
    },

    /// Entry skipped because a prior report marks it satisfied
    EntrySkipped {
        /// Entry key
        unique_key: String,
    },

    /// A fetch attempt failed (it may be retried)
    AttemptFailed {
        /// Entry key
        unique_key: String,
        /// 1-based attempt number
        attempt: u32,
        /// Error message
        error: String,
    },

    /// Entry reached a final state for this run
    EntryFinished {
        /// The record sent to the report
        record: DownloadRecord,
    },

    /// Report persisted
    ReportWritten {
        /// Report path
        path: PathBuf,
        /// Whether this was the final write of the run
        is_final: bool,
    },
}
