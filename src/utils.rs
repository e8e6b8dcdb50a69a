//! Utility functions for file naming and crash-safe file writes

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

/// Characters that are not allowed in artifact or snapshot file names
const UNSAFE_FILENAME_CHARS: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|', '\r', '\n'];

/// Remove characters that are unsafe in file names and cap the length
///
/// The length cap counts characters, not bytes, so multi-byte names are never
/// cut inside a code point.
///
/// # Examples
///
/// ```
/// use filing_dl::utils::safe_filename;
///
/// assert_eq!(safe_filename("a/b:c?.pdf", 50), "abc.pdf");
/// assert_eq!(safe_filename("abcdef", 3), "abc");
/// ```
#[must_use]
pub fn safe_filename(text: &str, max_len: usize) -> String {
    text.chars()
        .filter(|c| !UNSAFE_FILENAME_CHARS.contains(c))
        .take(max_len)
        .collect()
}

/// File-name tag for a search keyword
///
/// Unsafe characters removed, spaces replaced by `_`, at most 40 characters,
/// `keyword` when nothing usable remains.
#[must_use]
pub fn keyword_tag(keyword: &str) -> String {
    let tag = safe_filename(keyword, 40).trim().replace(' ', "_");
    if tag.is_empty() {
        "keyword".to_string()
    } else {
        tag
    }
}

/// Compact ISO 8601 timestamp used in artifact names (`20240131T235959`)
#[must_use]
pub fn compact_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S").to_string()
}

#[allow(clippy::expect_used)]
static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("html tag pattern should compile"));

/// Strip HTML tags and the entities the portals use in highlighted titles
#[must_use]
pub fn strip_html(raw: &str) -> String {
    HTML_TAG
        .replace_all(raw, "")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

/// First `len` hex characters of the MD5 digest of `text`
#[must_use]
pub fn short_hash(text: &str, len: usize) -> String {
    let digest = format!("{:x}", md5::compute(text.as_bytes()));
    digest.chars().take(len).collect()
}

/// Write `bytes` to `path` by way of a temp file in the same directory
///
/// Readers see either the old file or the complete new one, never a partial write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let report_err = |reason: String| Error::ReportWrite {
        path: path.to_path_buf(),
        reason,
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| report_err(e.to_string()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| report_err(e.to_string()))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| report_err(e.to_string()))?;
    tmp.persist(path).map_err(|e| report_err(e.error.to_string()))?;
    Ok(())
}

/// Write `bytes` to a new file at `path`, failing if it already exists
///
/// Used for timestamped artifacts, which are append-only.
pub fn write_new(path: &Path, bytes: &[u8]) -> Result<()> {
    let report_err = |reason: String| Error::ReportWrite {
        path: path.to_path_buf(),
        reason,
    };
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| report_err(e.to_string()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| report_err(e.to_string()))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| report_err(e.to_string()))
}
