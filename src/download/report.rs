//! Download report files
//!
//! A report is a CSV with one row per index entry. Reports double as the resume
//! state: a later run reads every `download_report_*.csv` in the output directory
//! and skips entries whose recorded artifact is still on disk.

use crate::error::{Error, Result};
use crate::types::DownloadRecord;
use crate::utils::{atomic_write, compact_timestamp, keyword_tag};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// File-name prefix shared by all download reports
pub const REPORT_PREFIX: &str = "download_report_";

/// Column order of a download report
pub const REPORT_COLUMNS: [&str; 6] = [
    "unique_key",
    "status",
    "error",
    "file_path",
    "attempt_count",
    "completed_at",
];

/// Path for a new report in `dir`
///
/// Appends a counter if a report with the same second-resolution name exists.
pub fn report_path(dir: &Path, keyword: &str, at: DateTime<Utc>) -> PathBuf {
    let tag = if keyword.trim().is_empty() {
        "index".to_string()
    } else {
        keyword_tag(keyword)
    };
    let stem = format!("{}{}_{}", REPORT_PREFIX, tag, compact_timestamp(at));
    let mut path = dir.join(format!("{}.csv", stem));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{}_{}.csv", stem, n));
        n += 1;
    }
    path
}

/// Atomically write `records` (already in report order) to `path`
pub fn write_report(path: &Path, records: &[DownloadRecord]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(REPORT_COLUMNS)?;
    for record in records {
        writer.serialize(record)?;
    }
    let bytes = writer.into_inner().map_err(|e| Error::ReportWrite {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    atomic_write(path, &bytes)
}

/// Read every record of one report
pub fn read_report(path: &Path) -> Result<Vec<DownloadRecord>> {
    let read_err = |reason: String| Error::IndexRead {
        path: path.to_path_buf(),
        reason,
    };
    let mut reader = csv::Reader::from_path(path).map_err(|e| read_err(e.to_string()))?;
    reader
        .deserialize::<DownloadRecord>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| read_err(e.to_string()))
}

/// Whether `path` is a CSV whose header is a download report header
pub fn is_report_file(path: &Path) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    let mut header = String::new();
    if BufReader::new(file).read_line(&mut header).is_err() {
        return false;
    }
    let header = header.trim_start_matches('\u{feff}').trim_end();
    header == REPORT_COLUMNS.join(",")
}

/// All report files in `dir`, oldest first
///
/// Ordered by modification time, then by name.
pub fn report_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for dir_entry in std::fs::read_dir(dir)? {
        let path = dir_entry?.path();
        let is_report = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(REPORT_PREFIX) && n.ends_with(".csv"));
        if is_report && path.is_file() {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
            found.push((modified, path));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Merge every report in `dir`, later reports overriding earlier ones per key
///
/// Unreadable reports are skipped with a warning.
pub fn load_prior(dir: &Path) -> Result<HashMap<String, DownloadRecord>> {
    let mut merged = HashMap::new();
    for path in report_files(dir)? {
        match read_report(&path) {
            Ok(records) => {
                for record in records {
                    merged.insert(record.unique_key.clone(), record);
                }
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable report"),
        }
    }
    Ok(merged)
}
