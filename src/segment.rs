//! Date-range segmentation under a per-query result ceiling
//!
//! Portals stop paging after a fixed number of records per query, so a broad
//! range has to be split until every sub-range reports a total the portal will
//! actually serve. Splitting is driven by an explicit work stack and evaluated
//! lazily: the caller pulls one leaf at a time with [`Segments::next_leaf`].
//!
//! Leaves come out in chronological order, are adjacent, never overlap, and
//! their union is exactly the requested range.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::retry::retry_with_backoff;
use crate::search::SearchClient;
use crate::types::{DateRange, SearchQuery};

/// A sub-range that will be paged as one query
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Leaf {
    /// Covered dates
    pub range: DateRange,
    /// Total reported by the portal; `None` when counting failed or was skipped
    pub reported_total: Option<u64>,
    /// Single day still over the ceiling; paging will not reach every record
    pub truncated: bool,
}

/// Lazily evaluated sequence of leaves
pub struct Segments<'a> {
    client: &'a dyn SearchClient,
    query: &'a SearchQuery,
    ceiling: u64,
    retry: RetryConfig,
    // (range, is_root); the top of the stack is the next range to examine
    stack: Vec<(DateRange, bool)>,
    counted: bool,
}

/// Segment `range` so that every leaf's reported total is at most `ceiling`
pub fn segment<'a>(
    client: &'a dyn SearchClient,
    query: &'a SearchQuery,
    range: DateRange,
    ceiling: u64,
) -> Segments<'a> {
    Segments {
        client,
        query,
        ceiling,
        retry: RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        },
        stack: vec![(range, true)],
        counted: true,
    }
}

/// A single leaf spanning `range`, without any count query
///
/// Used when the operator set explicit page or result limits.
pub fn unsegmented<'a>(
    client: &'a dyn SearchClient,
    query: &'a SearchQuery,
    range: DateRange,
) -> Segments<'a> {
    Segments {
        counted: false,
        ..segment(client, query, range, u64::MAX)
    }
}

impl<'a> Segments<'a> {
    /// Retry count queries with this policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Next leaf in chronological order, `Ok(None)` when exhausted
    ///
    /// Fails only when the count query for the full range fails; a failing count
    /// on a sub-range yields that sub-range with `reported_total = None`.
    pub async fn next_leaf(&mut self) -> Result<Option<Leaf>> {
        while let Some((range, is_root)) = self.stack.pop() {
            if !self.counted {
                return Ok(Some(Leaf {
                    range,
                    reported_total: None,
                    truncated: false,
                }));
            }

            let (client, query) = (self.client, self.query);
            let outcome =
                retry_with_backoff(&self.retry, None, |_| client.count(query, range)).await;
            let total = match outcome.result {
                Ok(total) => total,
                Err(e) if is_root => {
                    return Err(Error::Search(format!("count for {} failed: {}", range, e)));
                }
                Err(e) => {
                    tracing::warn!(range = %range, error = %e, "count failed, paging range unsplit");
                    return Ok(Some(Leaf {
                        range,
                        reported_total: None,
                        truncated: false,
                    }));
                }
            };

            if total <= self.ceiling {
                tracing::debug!(range = %range, total, "range within ceiling");
                return Ok(Some(Leaf {
                    range,
                    reported_total: Some(total),
                    truncated: false,
                }));
            }

            match range.split() {
                Some((left, right)) => {
                    tracing::debug!(range = %range, total, ceiling = self.ceiling, "splitting range");
                    // right first so the left half is examined next
                    self.stack.push((right, false));
                    self.stack.push((left, false));
                }
                None => {
                    tracing::warn!(
                        date = %range.start,
                        total,
                        ceiling = self.ceiling,
                        "single day exceeds ceiling, results will be truncated"
                    );
                    return Ok(Some(Leaf {
                        range,
                        reported_total: Some(total),
                        truncated: true,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Drain every remaining leaf
    pub async fn collect(mut self) -> Result<Vec<Leaf>> {
        let mut leaves = Vec::new();
        while let Some(leaf) = self.next_leaf().await? {
            leaves.push(leaf);
        }
        Ok(leaves)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchPage;
    use crate::types::{IndexEntry, Source};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Reports `per_day * days` records for any range
    struct UniformCounts {
        per_day: u64,
        failing: HashSet<DateRange>,
        calls: Mutex<Vec<DateRange>>,
    }

    impl UniformCounts {
        fn new(per_day: u64) -> Self {
            Self {
                per_day,
                failing: HashSet::new(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SearchClient for UniformCounts {
        fn source(&self) -> Source {
            Source::Cninfo
        }
        fn max_page_size(&self) -> u32 {
            10
        }
        fn max_pages_per_query(&self) -> u32 {
            10
        }
        async fn search(
            &self,
            _query: &SearchQuery,
            range: DateRange,
            _page: u32,
            _page_size: u32,
        ) -> Result<SearchPage> {
            self.calls.lock().unwrap().push(range);
            if self.failing.contains(&range) {
                return Err(Error::Search("boom".into()));
            }
            Ok(SearchPage {
                records: Vec::new(),
                total: self.per_day * range.days() as u64,
                has_more: None,
            })
        }
        fn normalize(&self, _raw: &serde_json::Value) -> Option<IndexEntry> {
            None
        }
    }

    fn range(start: &str, end: &str) -> DateRange {
        DateRange::parse(start, end).unwrap()
    }

    fn assert_exact_cover(leaves: &[Leaf], full: DateRange) {
        assert_eq!(leaves.first().unwrap().range.start, full.start);
        assert_eq!(leaves.last().unwrap().range.end, full.end);
        for pair in leaves.windows(2) {
            assert_eq!(pair[0].range.end.succ_opt().unwrap(), pair[1].range.start);
        }
    }

    #[tokio::test]
    async fn within_ceiling_is_a_single_leaf() {
        let client = UniformCounts::new(2);
        let query = SearchQuery::new("k");
        let full = range("2024-01-01", "2024-01-31");
        let leaves = segment(&client, &query, full, 100).collect().await.unwrap();

        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].reported_total, Some(62));
        assert_eq!(client.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn over_ceiling_splits_until_every_leaf_fits() {
        let client = UniformCounts::new(10);
        let query = SearchQuery::new("k");
        let full = range("2024-01-01", "2024-03-31");
        let leaves = segment(&client, &query, full, 100).collect().await.unwrap();

        assert!(leaves.len() > 1);
        assert_exact_cover(&leaves, full);
        for leaf in &leaves {
            assert!(!leaf.truncated);
            assert!(leaf.reported_total.unwrap() <= 100);
        }
        let sum: u64 = leaves.iter().map(|l| l.reported_total.unwrap()).sum();
        assert_eq!(sum, 10 * full.days() as u64);
    }

    #[tokio::test]
    async fn dense_single_day_is_truncated() {
        let client = UniformCounts::new(500);
        let query = SearchQuery::new("k");
        let full = range("2024-03-10", "2024-03-11");
        let leaves = segment(&client, &query, full, 100).collect().await.unwrap();

        assert_eq!(leaves.len(), 2);
        assert!(leaves.iter().all(|l| l.truncated && l.range.is_single_day()));
        assert_exact_cover(&leaves, full);
    }

    #[tokio::test]
    async fn root_count_failure_is_fatal() {
        let full = range("2024-01-01", "2024-01-31");
        let mut client = UniformCounts::new(1);
        client.failing.insert(full);
        let query = SearchQuery::new("k");

        let err = segment(&client, &query, full, 100).collect().await.unwrap_err();
        assert_eq!(err.error_code(), "search_failed");
    }

    #[tokio::test]
    async fn sub_range_count_failure_yields_uncounted_leaf() {
        let full = range("2024-01-01", "2024-01-20");
        let (left, right) = full.split().unwrap();
        let mut client = UniformCounts::new(10);
        client.failing.insert(left);
        let query = SearchQuery::new("k");

        let leaves = segment(&client, &query, full, 150).collect().await.unwrap();
        assert_eq!(leaves[0].range, left);
        assert_eq!(leaves[0].reported_total, None);
        assert_eq!(leaves[1].range, right);
        assert_eq!(leaves[1].reported_total, Some(100));
    }

    #[tokio::test]
    async fn unsegmented_skips_counting() {
        let client = UniformCounts::new(1000);
        let query = SearchQuery::new("k");
        let full = range("2023-01-01", "2024-12-31");
        let leaves = unsegmented(&client, &query, full).collect().await.unwrap();

        assert_eq!(
            leaves,
            vec![Leaf {
                range: full,
                reported_total: None,
                truncated: false
            }]
        );
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn leaves_are_pulled_lazily() {
        let client = UniformCounts::new(10);
        let query = SearchQuery::new("k");
        let full = range("2024-01-01", "2024-01-31");
        let mut segments = segment(&client, &query, full, 100);

        let first = segments.next_leaf().await.unwrap().unwrap();
        assert_eq!(first.range.start, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        // only the path down to the first leaf has been counted
        assert!(client.calls.lock().unwrap().len() < 6);
    }
}
