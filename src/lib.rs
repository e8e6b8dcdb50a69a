//! # filing-dl
//!
//! Index builder and resumable downloader for listed-company disclosure portals.
//!
//! The pipeline has two halves that meet at a file on disk:
//!
//! - **Index building** queries a portal's search API, splits the requested date
//!   range until every piece fits the portal's pagination ceiling, and persists
//!   the de-duplicated entries as a JSON + CSV snapshot.
//! - **Downloading** reads a snapshot, skips entries that earlier runs already
//!   fetched, and drives the rest through a fixed pool of workers with retries,
//!   writing a CSV report that the next run resumes from.
//!
//! ## Quick Start
//!
//! ```no_run
//! use filing_dl::{Config, DateRange, DownloadExecutor, HttpFetcher, IndexBuilder, SearchQuery};
//! use filing_dl::{Source, index, search};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let client = search::client_for(Source::Cninfo, &config.http)?;
//!
//!     let range = DateRange::parse("2024-01-01", "2024-03-31")?;
//!     let outcome = IndexBuilder::new(client.as_ref(), &config.search, &config.retry)
//!         .build(&SearchQuery::new("annual report"), range)
//!         .await?;
//!     index::persist(&outcome.snapshot, &config.download.index_dir(), "cninfo")?;
//!
//!     let fetcher = Arc::new(HttpFetcher::new(&config.http)?);
//!     let executor = DownloadExecutor::new(fetcher, &config.download, &config.retry);
//!     let summary = executor.execute(&outcome.snapshot, config.download.workers).await?;
//!     println!("report: {}", summary.report_path.display());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Content dedup over downloaded artifacts
pub mod dedup;
/// Download executor and reports
pub mod download;
/// Error types
pub mod error;
/// Document fetchers
pub mod fetch;
/// Index building and snapshot persistence
pub mod index;
/// Global request spacing
pub mod pacing;
/// Retry logic with exponential backoff
pub mod retry;
/// Portal search clients
pub mod search;
/// Date-range segmentation
pub mod segment;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

pub use config::{Config, DownloadConfig, HttpConfig, RetryConfig, SearchConfig};
pub use dedup::{DedupOptions, DedupReport, DedupState, dedup};
pub use download::{DownloadExecutor, ExecutionSummary};
pub use error::{Error, FetchError, Result};
pub use fetch::{FallbackFetcher, Fetched, Fetcher, HttpFetcher};
pub use index::{BuildOutcome, IndexBuilder, load_index, persist};
pub use search::{SearchClient, SearchPage, client_for};
pub use segment::{Leaf, segment};
pub use types::{
    DateRange, DownloadRecord, DownloadStatus, Event, IndexEntry, IndexSnapshot, SearchQuery,
    SnapshotWarning, Source,
};

use tokio_util::sync::CancellationToken;

/// Cancel `token` when a termination signal arrives
///
/// Spawns a background task; the executor then stops handing out entries and
/// the report is persisted with the unfinished rows left pending.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => {
                tracing::warn!("stopping after in-flight downloads finish");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

/// Wait for SIGTERM/SIGINT (or Ctrl+C off Unix)
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

/// Wait for SIGTERM/SIGINT (or Ctrl+C off Unix)
#[cfg(not(unix))]
pub async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
