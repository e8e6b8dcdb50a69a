//! Snapshot persistence
//!
//! Every build writes an immutable timestamped pair (structured JSON plus a
//! tabular CSV) and then repoints the `latest_index.*` aliases at the new
//! content. Aliases are replaced atomically so a concurrent reader never sees a
//! half-written index.

use crate::error::{Error, Result};
use crate::types::{IndexEntry, IndexSnapshot};
use crate::utils::{atomic_write, compact_timestamp, keyword_tag, write_new};
use std::path::{Path, PathBuf};

/// Column order of the tabular index
pub const INDEX_COLUMNS: [&str; 9] = [
    "unique_key",
    "title",
    "publish_date",
    "source_category",
    "entity_code",
    "entity_name",
    "entity_org_id",
    "download_url",
    "file_type",
];

/// Base name of the latest-index aliases
pub const LATEST_INDEX: &str = "latest_index";

/// Files written by [`persist`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotPaths {
    /// Timestamped structured snapshot
    pub json: PathBuf,
    /// Timestamped tabular snapshot
    pub csv: PathBuf,
    /// `latest_index.json`
    pub latest_json: PathBuf,
    /// `latest_index.csv`
    pub latest_csv: PathBuf,
}

/// Write `snapshot` into `dir` and replace the latest aliases
///
/// Timestamped files are never overwritten; a name collision fails with
/// [`Error::ReportWrite`] before any alias is touched.
pub fn persist(snapshot: &IndexSnapshot, dir: &Path, prefix: &str) -> Result<SnapshotPaths> {
    let stem = format!(
        "{}_{}_{}",
        prefix,
        keyword_tag(&snapshot.keyword),
        compact_timestamp(snapshot.generated_at)
    );
    let paths = SnapshotPaths {
        json: dir.join(format!("{}.json", stem)),
        csv: dir.join(format!("{}.csv", stem)),
        latest_json: dir.join(format!("{}.json", LATEST_INDEX)),
        latest_csv: dir.join(format!("{}.csv", LATEST_INDEX)),
    };

    let json = serde_json::to_vec_pretty(snapshot)?;
    let csv = entries_to_csv(&snapshot.entries, &paths.csv)?;

    write_new(&paths.json, &json)?;
    write_new(&paths.csv, &csv)?;
    atomic_write(&paths.latest_json, &json)?;
    atomic_write(&paths.latest_csv, &csv)?;

    tracing::info!(
        entries = snapshot.entries.len(),
        snapshot = %paths.json.display(),
        latest = %paths.latest_json.display(),
        "index snapshot written"
    );
    Ok(paths)
}

/// Render entries as CSV, header included even when empty
fn entries_to_csv(entries: &[IndexEntry], target: &Path) -> Result<Vec<u8>> {
    let write_err = |reason: String| Error::ReportWrite {
        path: target.to_path_buf(),
        reason,
    };
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(INDEX_COLUMNS)?;
    for entry in entries {
        writer.serialize(entry)?;
    }
    writer.into_inner().map_err(|e| write_err(e.to_string()))
}

/// Read an index from `.json` (snapshot object or bare entry array) or `.csv`
pub fn load_index(path: &Path) -> Result<IndexSnapshot> {
    let read_err = |reason: String| Error::IndexRead {
        path: path.to_path_buf(),
        reason,
    };
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let snapshot = match ext.as_str() {
        "json" => {
            let text = std::fs::read_to_string(path).map_err(|e| read_err(e.to_string()))?;
            let value: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| read_err(e.to_string()))?;
            if value.is_array() {
                let entries: Vec<IndexEntry> =
                    serde_json::from_value(value).map_err(|e| read_err(e.to_string()))?;
                IndexSnapshot::from_entries("", entries)
            } else {
                serde_json::from_value(value).map_err(|e| read_err(e.to_string()))?
            }
        }
        "csv" => {
            let mut reader = csv::Reader::from_path(path).map_err(|e| read_err(e.to_string()))?;
            let entries = reader
                .deserialize::<IndexEntry>()
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| read_err(e.to_string()))?;
            IndexSnapshot::from_entries("", entries)
        }
        other => {
            return Err(read_err(format!(
                "unsupported index format '{}', expected .json or .csv",
                other
            )));
        }
    };

    tracing::debug!(path = %path.display(), entries = snapshot.entries.len(), "index loaded");
    Ok(snapshot)
}
