//! Resumable, bounded-concurrency download executor
//!
//! The executor consumes an index snapshot and drives every entry to a terminal
//! state (or leaves it pending when cancelled):
//!
//! 1. Prior reports in the output directory are merged; entries whose recorded
//!    artifact still exists are carried over instead of scheduled.
//! 2. Exactly `workers` tasks pull entries from one shared queue. Each fetch goes
//!    through the global [`RequestPacer`] and the shared retry loop.
//! 3. Workers send terminal records over a channel to a single aggregator, which
//!    owns the report file and checkpoints it every `checkpoint_interval` records.
//!
//! Per-entry failures never abort the batch; they end up as `failed` rows.

use crate::config::{DownloadConfig, RetryConfig};
use crate::error::{Error, FetchError, Result};
use crate::fetch::{Fetcher, validate_body};
use crate::pacing::RequestPacer;
use crate::retry::retry_with_backoff;
use crate::types::{DownloadRecord, DownloadStatus, Event, IndexEntry, IndexSnapshot};
use crate::utils::{atomic_write, safe_filename, short_hash};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

pub mod report;

/// Outcome of one execution
#[derive(Clone, Debug)]
pub struct ExecutionSummary {
    /// Final records, ordered by key
    pub records: Vec<DownloadRecord>,
    /// Report written for this run
    pub report_path: PathBuf,
    /// Cancellation left entries pending
    pub interrupted: bool,
    /// Entries carried over from earlier reports
    pub skipped: usize,
}

impl ExecutionSummary {
    /// Number of records in `status`
    pub fn count(&self, status: DownloadStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }
}

/// Runs downloads for an index snapshot
pub struct DownloadExecutor {
    fetcher: Arc<dyn Fetcher>,
    config: DownloadConfig,
    retry: RetryConfig,
    pacer: RequestPacer,
    cancel: CancellationToken,
    event_tx: broadcast::Sender<Event>,
}

// Everything one worker task needs
struct WorkerContext {
    id: usize,
    queue: Arc<Mutex<VecDeque<IndexEntry>>>,
    results: mpsc::Sender<DownloadRecord>,
    fetcher: Arc<dyn Fetcher>,
    config: DownloadConfig,
    retry: RetryConfig,
    pacer: RequestPacer,
    cancel: CancellationToken,
    event_tx: broadcast::Sender<Event>,
}

impl DownloadExecutor {
    /// Create an executor
    pub fn new(fetcher: Arc<dyn Fetcher>, config: &DownloadConfig, retry: &RetryConfig) -> Self {
        let (event_tx, _rx) = broadcast::channel(1000);
        Self {
            fetcher,
            pacer: RequestPacer::new(config.min_request_interval),
            config: config.clone(),
            retry: retry.clone(),
            cancel: CancellationToken::new(),
            event_tx,
        }
    }

    /// Use an externally owned cancellation token (e.g. wired to SIGINT)
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Use a pacer shared with the fetcher so all requests draw from one schedule
    pub fn with_pacer(mut self, pacer: RequestPacer) -> Self {
        self.pacer = pacer;
        self
    }

    /// Token that stops workers from taking new entries
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    fn emit_event(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine
        self.event_tx.send(event).ok();
    }

    /// Download every entry of `snapshot` with `workers` concurrent workers
    ///
    /// Returns an error only when the output directory or the final report
    /// cannot be written.
    pub async fn execute(
        &self,
        snapshot: &IndexSnapshot,
        workers: usize,
    ) -> Result<ExecutionSummary> {
        if workers == 0 {
            return Err(Error::config("download.workers", "must be greater than 0"));
        }
        // reports store artifact paths, which must resolve from any working directory
        let mut config = self.config.clone();
        config.output_dir =
            std::path::absolute(&config.output_dir).map_err(|e| Error::ReportWrite {
                path: config.output_dir.clone(),
                reason: e.to_string(),
            })?;
        let output_dir = config.output_dir.clone();
        let files_dir = config.files_dir();
        std::fs::create_dir_all(&files_dir).map_err(|e| Error::ReportWrite {
            path: files_dir.clone(),
            reason: e.to_string(),
        })?;

        let prior = report::load_prior(&output_dir)?;
        let report_path = report::report_path(&output_dir, &snapshot.keyword, Utc::now());

        let mut records: BTreeMap<String, DownloadRecord> = BTreeMap::new();
        let mut queue = VecDeque::new();
        let mut skipped = 0;
        let mut seen = HashSet::new();
        // held back until Started so listeners know the scheduled count first
        let mut early_events = Vec::new();

        for entry in &snapshot.entries {
            if !seen.insert(entry.unique_key.as_str()) {
                tracing::debug!(key = %entry.unique_key, "duplicate key in index, scheduled once");
                continue;
            }
            if let Some(done) = prior.get(&entry.unique_key).filter(|r| r.is_satisfied()) {
                skipped += 1;
                records.insert(entry.unique_key.clone(), done.clone());
                early_events.push(Event::EntrySkipped {
                    unique_key: entry.unique_key.clone(),
                });
                continue;
            }
            if entry.download_url.trim().is_empty() {
                let record = DownloadRecord::failed(&entry.unique_key, "missing download url", 0);
                records.insert(entry.unique_key.clone(), record.clone());
                early_events.push(Event::EntryFinished { record });
                continue;
            }
            records.insert(
                entry.unique_key.clone(),
                DownloadRecord::pending(&entry.unique_key),
            );
            queue.push_back(entry.clone());
        }

        let scheduled = queue.len();
        tracing::info!(
            total = records.len(),
            scheduled,
            skipped,
            workers,
            report = %report_path.display(),
            "starting downloads"
        );
        self.emit_event(Event::Started {
            total: records.len(),
            scheduled,
            skipped,
        });
        for event in early_events {
            self.emit_event(event);
        }

        if scheduled > 0 {
            self.run_workers(&config, queue, workers, &mut records, &report_path)
                .await;
        }

        let final_records: Vec<DownloadRecord> = records.into_values().collect();
        report::write_report(&report_path, &final_records)?;
        self.emit_event(Event::ReportWritten {
            path: report_path.clone(),
            is_final: true,
        });

        let summary = ExecutionSummary {
            interrupted: final_records
                .iter()
                .any(|r| r.status == DownloadStatus::Pending),
            records: final_records,
            report_path,
            skipped,
        };
        tracing::info!(
            success = summary.count(DownloadStatus::Success),
            failed = summary.count(DownloadStatus::Failed),
            pending = summary.count(DownloadStatus::Pending),
            skipped,
            report = %summary.report_path.display(),
            "downloads finished"
        );
        Ok(summary)
    }

    // Spawn the pool and aggregate its results into `records`
    async fn run_workers(
        &self,
        config: &DownloadConfig,
        queue: VecDeque<IndexEntry>,
        workers: usize,
        records: &mut BTreeMap<String, DownloadRecord>,
        report_path: &Path,
    ) {
        let queue = Arc::new(Mutex::new(queue));
        let (tx, mut rx) = mpsc::channel(workers * 2);

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let ctx = WorkerContext {
                    id,
                    queue: Arc::clone(&queue),
                    results: tx.clone(),
                    fetcher: Arc::clone(&self.fetcher),
                    config: config.clone(),
                    retry: self.retry.clone(),
                    pacer: self.pacer.clone(),
                    cancel: self.cancel.clone(),
                    event_tx: self.event_tx.clone(),
                };
                tokio::spawn(run_worker(ctx))
            })
            .collect();
        // the channel closes once every worker has dropped its sender
        drop(tx);

        let mut finished = 0;
        while let Some(record) = rx.recv().await {
            finished += 1;
            records.insert(record.unique_key.clone(), record.clone());
            self.emit_event(Event::EntryFinished { record });

            let interval = config.checkpoint_interval;
            if interval > 0 && finished % interval == 0 {
                let snapshot: Vec<DownloadRecord> = records.values().cloned().collect();
                match report::write_report(report_path, &snapshot) {
                    Ok(()) => {
                        tracing::debug!(finished, "report checkpoint written");
                        self.emit_event(Event::ReportWritten {
                            path: report_path.to_path_buf(),
                            is_final: false,
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "report checkpoint failed"),
                }
            }
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "download worker panicked");
            }
        }
    }
}

async fn run_worker(ctx: WorkerContext) {
    loop {
        if ctx.cancel.is_cancelled() {
            tracing::debug!(worker = ctx.id, "cancelled, not taking new entries");
            break;
        }
        let next = ctx.queue.lock().await.pop_front();
        let Some(entry) = next else {
            break;
        };

        if let Some(record) = download_entry(&ctx, &entry).await
            && ctx.results.send(record).await.is_err()
        {
            break;
        }
    }
}

// Drive one entry to a terminal record; None when cancelled mid-retry
async fn download_entry(ctx: &WorkerContext, entry: &IndexEntry) -> Option<DownloadRecord> {
    let path = artifact_path(&ctx.config.files_dir(), entry);
    let key = entry.unique_key.as_str();

    let outcome = retry_with_backoff(&ctx.retry, Some(&ctx.cancel), |attempt| {
        let path = &path;
        async move {
            ctx.pacer.acquire().await;
            let result = fetch_to_disk(ctx, entry, path).await;
            if let Err(e) = &result {
                ctx.event_tx
                    .send(Event::AttemptFailed {
                        unique_key: key.to_string(),
                        attempt,
                        error: e.to_string(),
                    })
                    .ok();
            }
            result
        }
    })
    .await;

    match outcome.result {
        Ok(()) => {
            tracing::info!(key, path = %path.display(), attempts = outcome.attempts, "downloaded");
            Some(DownloadRecord::success(key, &path, outcome.attempts))
        }
        Err(e) if outcome.cancelled => {
            tracing::info!(key, error = %e, "cancelled during backoff, left pending");
            None
        }
        Err(e) => {
            tracing::warn!(key, attempts = outcome.attempts, error = %e, "download failed");
            Some(DownloadRecord::failed(key, e.to_string(), outcome.attempts))
        }
    }
}

async fn fetch_to_disk(
    ctx: &WorkerContext,
    entry: &IndexEntry,
    path: &Path,
) -> std::result::Result<(), FetchError> {
    let fetched = ctx.fetcher.fetch(entry).await?;
    validate_body(
        &fetched,
        ctx.config.min_artifact_bytes,
        ctx.config.html_reject_bytes,
    )?;
    atomic_write(path, &fetched.bytes)
        .map_err(|e| FetchError::permanent(format!("cannot save artifact: {}", e)))
}

/// Artifact location for `entry` under `files_dir`
///
/// `<entity_code>_<entity_name>_<yyyymmdd>_<doc-id><ext>`, each part sanitized.
/// URL-keyed entries use a short hash of the URL as document id.
pub fn artifact_path(files_dir: &Path, entry: &IndexEntry) -> PathBuf {
    let part = |value: Option<&str>, fallback: &str, max: usize| {
        let clean = safe_filename(value.unwrap_or_default().trim(), max).replace(' ', "_");
        if clean.is_empty() {
            fallback.to_string()
        } else {
            clean
        }
    };
    let doc_id = if entry.has_url_key() {
        short_hash(entry.doc_id(), 10)
    } else {
        part(Some(entry.doc_id()), "noid", 40)
    };
    let name = format!(
        "{}_{}_{}_{}{}",
        part(entry.entity_code.as_deref(), "unknown", 20),
        part(entry.entity_name.as_deref(), "unknown", 30),
        entry.publish_date.format("%Y%m%d"),
        doc_id,
        extension(entry)
    );
    files_dir.join(name)
}

// Extension from the URL path, else the entry's type hint, else .pdf
fn extension(entry: &IndexEntry) -> String {
    let from_url = url::Url::parse(&entry.download_url)
        .ok()
        .map(|u| u.path().to_string())
        .unwrap_or_else(|| {
            entry
                .download_url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string()
        });
    let file = from_url.rsplit('/').next().unwrap_or_default();
    let valid = |ext: &str| {
        !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())
    };

    if let Some((_, ext)) = file.rsplit_once('.')
        && valid(ext)
    {
        return format!(".{}", ext.to_ascii_lowercase());
    }
    match entry.file_type.as_deref().map(|t| t.trim().trim_start_matches('.')) {
        Some(t) if valid(t) => format!(".{}", t.to_ascii_lowercase()),
        _ => ".pdf".to_string(),
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Source;
    use chrono::NaiveDate;

    fn entry(key: &str, url: &str) -> IndexEntry {
        IndexEntry {
            unique_key: key.into(),
            title: "t".into(),
            publish_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            source_category: Source::Cninfo,
            entity_code: Some("000001".into()),
            entity_name: Some("平安 银行".into()),
            entity_org_id: None,
            download_url: url.into(),
            file_type: None,
        }
    }

    #[test]
    fn artifact_name_uses_entity_date_and_id() {
        let path = artifact_path(
            Path::new("/out/files"),
            &entry("cninfo:1219", "https://static.cninfo.com.cn/finalpage/2024-01-15/1219.PDF"),
        );
        assert_eq!(
            path,
            PathBuf::from("/out/files/000001_平安_银行_20240115_1219.pdf")
        );
    }

    #[test]
    fn artifact_name_fallbacks() {
        let mut e = entry("sse_inquiry:url:https://www.sse.com.cn/a", "https://www.sse.com.cn/a");
        e.entity_code = None;
        e.entity_name = Some("a/b:c".into());
        e.file_type = Some("DOC".into());
        let name = artifact_path(Path::new("f"), &e)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(name.starts_with("unknown_abc_20240115_"));
        assert!(name.ends_with(".doc"));
        assert_eq!(name.len(), "unknown_abc_20240115_".len() + 10 + ".doc".len());
    }

    #[test]
    fn extension_ignores_query_and_defaults_to_pdf() {
        assert_eq!(
            extension(&entry("k", "https://h/new/announcement/download?bulletinId=1")),
            ".pdf"
        );
        assert_eq!(extension(&entry("k", "/files/report.XLSX?v=2")), ".xlsx");
    }
}
