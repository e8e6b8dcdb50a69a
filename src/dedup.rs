//! Dedup pass over previously downloaded artifacts
//!
//! Classifies each entry of an index (or of a download report) against the
//! successes recorded in earlier reports, and flags artifacts whose content is
//! byte-identical to another entry's artifact. Nothing is re-downloaded.

use crate::download::report::{is_report_file, load_prior, read_report};
use crate::error::{Error, Result};
use crate::index::load_index;
use crate::types::DownloadRecord;
use crate::utils::{atomic_write, compact_timestamp};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Files smaller than this are never considered content duplicates
const MIN_HASH_BYTES: u64 = 100;

/// Classification of one entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DedupState {
    /// A prior success exists and its artifact is on disk
    Satisfied,
    /// No usable prior success
    Missing,
    /// Artifact content is identical to another entry's artifact
    DuplicateContent {
        /// Key of the entry holding the canonical copy
        of: String,
    },
}

impl DedupState {
    /// Tag used in the report
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupState::Satisfied => "satisfied",
            DedupState::Missing => "missing",
            DedupState::DuplicateContent { .. } => "duplicate_content",
        }
    }
}

/// One row of the dedup report
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DedupRow {
    /// Entry key
    pub unique_key: String,
    /// Classification
    pub state: DedupState,
    /// Recorded artifact, if any
    pub file_path: Option<PathBuf>,
}

/// Options for [`dedup`]
#[derive(Clone, Copy, Debug, Default)]
pub struct DedupOptions {
    /// Delete non-canonical duplicate files
    pub remove_duplicates: bool,
}

/// Result of a dedup pass
#[derive(Clone, Debug)]
pub struct DedupReport {
    /// One row per input key, in input order
    pub rows: Vec<DedupRow>,
    /// Where the CSV report was written
    pub report_path: PathBuf,
    /// Files deleted with `remove_duplicates`
    pub removed: Vec<PathBuf>,
    /// Bytes freed by deletion
    pub freed_bytes: u64,
}

impl DedupReport {
    /// Rows whose state has the given tag
    pub fn count(&self, state: &str) -> usize {
        self.rows.iter().filter(|r| r.state.as_str() == state).count()
    }
}

#[derive(Serialize)]
struct CsvRow<'a> {
    unique_key: &'a str,
    state: &'static str,
    file_path: String,
    duplicate_of: &'a str,
}

/// Classify the entries of `input` against the reports in `artifact_dir`
///
/// `input` is an index (`.json`/`.csv`) or a download report, told apart by
/// its header. The CSV report lands in `artifact_dir`.
pub fn dedup(artifact_dir: &Path, input: &Path, options: DedupOptions) -> Result<DedupReport> {
    let mut prior = load_prior(artifact_dir)?;
    let keys = if is_report_file(input) {
        let records = read_report(input)?;
        let keys = unique_keys(records.iter().map(|r| r.unique_key.as_str()));
        for record in records {
            prior.entry(record.unique_key.clone()).or_insert(record);
        }
        keys
    } else {
        let snapshot = load_index(input)?;
        unique_keys(snapshot.entries.iter().map(|e| e.unique_key.as_str()))
    };

    let mut rows: Vec<DedupRow> = keys
        .into_iter()
        .map(|key| {
            let record = prior.get(&key);
            classify(key, record)
        })
        .collect();
    mark_content_duplicates(&mut rows)?;

    let mut removed = Vec::new();
    let mut freed_bytes = 0;
    if options.remove_duplicates {
        for row in &rows {
            if let (DedupState::DuplicateContent { .. }, Some(path)) = (&row.state, &row.file_path) {
                let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                match std::fs::remove_file(path) {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), "removed duplicate artifact");
                        freed_bytes += size;
                        removed.push(path.clone());
                    }
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot remove duplicate"),
                }
            }
        }
    }

    let report_path = artifact_dir.join(format!(
        "dedup_report_{}.csv",
        compact_timestamp(Utc::now())
    ));
    write_dedup_report(&report_path, &rows)?;

    let report = DedupReport {
        rows,
        report_path,
        removed,
        freed_bytes,
    };
    tracing::info!(
        satisfied = report.count("satisfied"),
        missing = report.count("missing"),
        duplicates = report.count("duplicate_content"),
        removed = report.removed.len(),
        freed_bytes,
        report = %report.report_path.display(),
        "dedup finished"
    );
    Ok(report)
}

fn unique_keys<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.filter(|k| seen.insert(*k)).map(String::from).collect()
}

fn classify(key: String, prior: Option<&DownloadRecord>) -> DedupRow {
    match prior.filter(|r| r.is_satisfied()) {
        Some(record) => DedupRow {
            unique_key: key,
            state: DedupState::Satisfied,
            file_path: record.artifact(),
        },
        None => DedupRow {
            unique_key: key,
            state: DedupState::Missing,
            file_path: prior.and_then(|r| r.artifact()),
        },
    }
}

// Group satisfied artifacts by content; the first path in sorted order is canonical
fn mark_content_duplicates(rows: &mut [DedupRow]) -> Result<()> {
    let mut by_hash: HashMap<String, BTreeMap<PathBuf, String>> = HashMap::new();
    for row in rows.iter() {
        let Some(path) = row.file_path.as_ref().filter(|_| row.state == DedupState::Satisfied)
        else {
            continue;
        };
        let size = std::fs::metadata(path)?.len();
        if size < MIN_HASH_BYTES {
            continue;
        }
        let owners = by_hash.entry(sha256_file(path)?).or_default();
        // a path shared by several keys keeps its first owner
        owners.entry(path.clone()).or_insert_with(|| row.unique_key.clone());
    }

    let mut duplicate_of: HashMap<PathBuf, String> = HashMap::new();
    for owners in by_hash.values() {
        let mut paths = owners.iter();
        let Some((_, canonical_key)) = paths.next() else {
            continue;
        };
        for (path, _) in paths {
            duplicate_of.insert(path.clone(), canonical_key.clone());
        }
    }

    for row in rows.iter_mut() {
        if let Some(of) = row.file_path.as_ref().and_then(|p| duplicate_of.get(p))
            && row.state == DedupState::Satisfied
        {
            row.state = DedupState::DuplicateContent { of: of.clone() };
        }
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn write_dedup_report(path: &Path, rows: &[DedupRow]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["unique_key", "state", "file_path", "duplicate_of"])?;
    for row in rows {
        let duplicate_of = match &row.state {
            DedupState::DuplicateContent { of } => of.as_str(),
            _ => "",
        };
        writer.serialize(CsvRow {
            unique_key: &row.unique_key,
            state: row.state.as_str(),
            file_path: row
                .file_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            duplicate_of,
        })?;
    }
    let bytes = writer.into_inner().map_err(|e| Error::ReportWrite {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    atomic_write(path, &bytes)
}
