//! Index building over segmented date ranges
//!
//! The [`IndexBuilder`] walks the leaves produced by the range segmenter, pages
//! each leaf through a [`SearchClient`], and folds the normalized records into a
//! deduplicated, ordered [`IndexSnapshot`]. Failures on individual pages leave a
//! partial leaf and a warning on the snapshot; only a build in which no request
//! ever succeeded is an error.

use crate::config::{RetryConfig, SearchConfig};
use crate::error::{Error, Result};
use crate::retry::retry_with_backoff;
use crate::search::SearchClient;
use crate::segment::{Leaf, Segments, segment, unsegmented};
use crate::types::{DateRange, IndexEntry, IndexSnapshot, SearchQuery, SnapshotWarning};
use chrono::Utc;
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod store;

pub use store::{SnapshotPaths, load_index, persist};

/// Result of one build
#[derive(Clone, Debug)]
pub struct BuildOutcome {
    /// The finished snapshot
    pub snapshot: IndexSnapshot,
    /// Leaves examined
    pub leaves: usize,
    /// Pages fetched successfully
    pub pages_fetched: u32,
}

/// Drives segmentation and paging for one search client
pub struct IndexBuilder<'a> {
    client: &'a dyn SearchClient,
    search: SearchConfig,
    retry: RetryConfig,
    cancel: Option<CancellationToken>,
}

// Accumulated state while walking leaves
#[derive(Default)]
struct Progress {
    entries: Vec<IndexEntry>,
    seen: HashSet<String>,
    warnings: Vec<SnapshotWarning>,
    total_observed: u64,
    pages_fetched: u32,
    any_success: bool,
    last_error: Option<Error>,
}

impl Progress {
    fn add(&mut self, entry: IndexEntry) {
        if self.seen.insert(entry.unique_key.clone()) {
            self.entries.push(entry);
        }
    }
}

impl<'a> IndexBuilder<'a> {
    /// Create a builder
    pub fn new(client: &'a dyn SearchClient, search: &SearchConfig, retry: &RetryConfig) -> Self {
        Self {
            client,
            search: search.clone(),
            retry: retry.clone(),
            cancel: None,
        }
    }

    /// Stop paging when `token` is cancelled; the snapshot keeps what was fetched
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Effective page size: the configured one, capped at the portal maximum
    pub fn page_size(&self) -> u32 {
        let max = self.client.max_page_size().max(1);
        self.search.page_size.unwrap_or(max).clamp(1, max)
    }

    /// Build a snapshot for `query` over `range`
    pub async fn build(&self, query: &SearchQuery, range: DateRange) -> Result<BuildOutcome> {
        let page_size = self.page_size();
        let ceiling = self.client.ceiling(page_size);
        let mut segments: Segments<'_> = if self.search.has_explicit_limits() {
            tracing::info!(range = %range, "explicit limits set, range segmentation bypassed");
            unsegmented(self.client, query, range)
        } else {
            segment(self.client, query, range, ceiling).with_retry(self.retry.clone())
        };

        tracing::info!(
            source = %self.client.source(),
            keyword = %query.keyword,
            range = %range,
            page_size,
            ceiling,
            "building index"
        );

        let mut progress = Progress::default();
        let mut leaves = 0;
        while let Some(leaf) = segments.next_leaf().await? {
            leaves += 1;
            if let Some(total) = leaf.reported_total {
                progress.any_success = true;
                progress.total_observed += total;
            }
            if leaf.truncated {
                progress.warnings.push(SnapshotWarning::SegmentationExhausted {
                    range: leaf.range,
                    reported_total: leaf.reported_total.unwrap_or_default(),
                    ceiling,
                });
            }
            if leaf.reported_total == Some(0) {
                continue;
            }
            if !self.page_leaf(query, &leaf, page_size, &mut progress).await {
                break;
            }
        }

        if !progress.any_success {
            return Err(progress
                .last_error
                .unwrap_or_else(|| Error::Search("no search request succeeded".to_string())));
        }

        let mut entries = progress.entries;
        entries.sort_by(|a, b| {
            b.publish_date
                .cmp(&a.publish_date)
                .then_with(|| a.unique_key.cmp(&b.unique_key))
        });
        if let Some(max) = self.search.max_results {
            entries.truncate(max);
        }

        tracing::info!(
            entries = entries.len(),
            leaves,
            pages = progress.pages_fetched,
            total_observed = progress.total_observed,
            warnings = progress.warnings.len(),
            "index built"
        );

        Ok(BuildOutcome {
            snapshot: IndexSnapshot {
                keyword: query.keyword.clone(),
                source: Some(self.client.source()),
                filters: query.filters.clone(),
                date_range: Some(range),
                generated_at: Utc::now(),
                total_observed: progress.total_observed,
                warnings: progress.warnings,
                entries,
            },
            leaves,
            pages_fetched: progress.pages_fetched,
        })
    }

    fn limits_reached(&self, progress: &Progress) -> bool {
        self.search
            .max_pages
            .is_some_and(|max| progress.pages_fetched >= max)
            || self
                .search
                .max_results
                .is_some_and(|max| progress.entries.len() >= max)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    // Page one leaf; returns false when the whole build should stop
    async fn page_leaf(
        &self,
        query: &SearchQuery,
        leaf: &Leaf,
        page_size: u32,
        progress: &mut Progress,
    ) -> bool {
        let mut leaf_pages = 0;
        for page in 1..=self.client.max_pages_per_query() {
            if self.limits_reached(progress) {
                tracing::info!("operator limit reached, stopping");
                return false;
            }
            if self.is_cancelled() {
                progress.warnings.push(SnapshotWarning::LeafIncomplete {
                    range: leaf.range,
                    pages_fetched: leaf_pages,
                    error: "cancelled".to_string(),
                });
                return false;
            }
            if progress.pages_fetched > 0 {
                self.pause().await;
            }

            let client = self.client;
            let range = leaf.range;
            let outcome = retry_with_backoff(&self.retry, self.cancel.as_ref(), |_| {
                client.search(query, range, page, page_size)
            })
            .await;

            let search_page = match outcome.result {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(
                        range = %leaf.range,
                        page,
                        attempts = outcome.attempts,
                        error = %e,
                        "page failed, keeping partial leaf"
                    );
                    progress.warnings.push(SnapshotWarning::LeafIncomplete {
                        range: leaf.range,
                        pages_fetched: leaf_pages,
                        error: e.to_string(),
                    });
                    progress.last_error = Some(e);
                    return !outcome.cancelled;
                }
            };

            progress.any_success = true;
            progress.pages_fetched += 1;
            leaf_pages += 1;
            if page == 1 && leaf.reported_total.is_none() {
                progress.total_observed += search_page.total;
            }

            let count = search_page.records.len();
            for raw in &search_page.records {
                match self.client.normalize(raw) {
                    Some(entry) => progress.add(entry),
                    None => tracing::debug!(range = %leaf.range, page, "record skipped"),
                }
            }
            tracing::debug!(
                range = %leaf.range,
                page,
                records = count,
                collected = progress.entries.len(),
                "page fetched"
            );

            if count < page_size as usize || search_page.has_more == Some(false) {
                break;
            }
        }
        true
    }

    async fn pause(&self) {
        let (min, max) = (self.search.page_delay_min, self.search.page_delay_max);
        if max.is_zero() {
            return;
        }
        let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
        tokio::time::sleep(Duration::from_millis(millis as u64)).await;
    }
}
