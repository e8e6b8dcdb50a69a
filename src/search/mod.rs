//! Portal search clients
//!
//! Each disclosure portal exposes a paginated search endpoint that caps how many
//! records a single query can reach. A [`SearchClient`] issues one page request for
//! a date range and turns raw records into [`IndexEntry`] values; the range
//! segmenter and index builder are written against this trait only.

use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::types::{DateRange, IndexEntry, SearchQuery, Source};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use reqwest::header::HeaderMap;

pub mod cninfo;
pub mod jsonp;
pub mod sse;

pub use cninfo::CninfoSearch;
pub use sse::{SseInquiry, SseSearch};

/// One page of raw search results
#[derive(Clone, Debug, Default)]
pub struct SearchPage {
    /// Raw records as returned by the portal
    pub records: Vec<serde_json::Value>,
    /// Total records the portal reports for the whole query
    pub total: u64,
    /// Explicit "more pages" signal, when the portal provides one
    pub has_more: Option<bool>,
}

/// Paged search against one disclosure portal
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Portal this client talks to
    fn source(&self) -> Source;

    /// Largest page size the portal honours
    fn max_page_size(&self) -> u32;

    /// Pages reachable for a single query before the portal stops paging
    fn max_pages_per_query(&self) -> u32;

    /// Records retrievable for one query without truncation
    fn ceiling(&self, page_size: u32) -> u64 {
        u64::from(page_size) * u64::from(self.max_pages_per_query())
    }

    /// Fetch one page (1-based) of results for `range`
    async fn search(
        &self,
        query: &SearchQuery,
        range: DateRange,
        page: u32,
        page_size: u32,
    ) -> Result<SearchPage>;

    /// Total records the portal reports for `range`
    async fn count(&self, query: &SearchQuery, range: DateRange) -> Result<u64> {
        Ok(self.search(query, range, 1, 1).await?.total)
    }

    /// Convert a raw record into an entry, or `None` if it lacks required fields
    fn normalize(&self, raw: &serde_json::Value) -> Option<IndexEntry>;
}

/// Build a search client for `source`
pub fn client_for(source: Source, http: &HttpConfig) -> Result<Box<dyn SearchClient>> {
    Ok(match source {
        Source::Cninfo => Box::new(CninfoSearch::new(http)?),
        Source::SseSearch => Box::new(SseSearch::new(http)?),
        Source::SseInquiry => Box::new(SseInquiry::new(http)?),
    })
}

/// HTTP client shared by the portal adapters
pub(crate) fn build_http_client(http: &HttpConfig, headers: HeaderMap) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .cookie_store(true)
        .timeout(http.timeout)
        .user_agent(http.user_agent.clone())
        .default_headers(headers)
        .build()?)
}

/// Check the status of a search response and read its body
pub(crate) async fn read_body(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let url = response.url().to_string();
    if !status.is_success() {
        return Err(Error::Search(format!("HTTP {} from {}", status.as_u16(), url)));
    }
    Ok(response.text().await?)
}

/// String value of a JSON field, accepting numbers and trimming blanks to `None`
pub(crate) fn json_str(raw: &serde_json::Value, key: &str) -> Option<String> {
    match raw.get(key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First non-empty string among several candidate field names
pub(crate) fn json_str_any(raw: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| json_str(raw, k))
}

/// Non-negative integer field, accepting numeric strings
pub(crate) fn json_u64(raw: &serde_json::Value, key: &str) -> Option<u64> {
    match raw.get(key)? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Portal-local (UTC+8) calendar date of a millisecond timestamp
pub(crate) fn date_from_millis(ms: i64) -> Option<NaiveDate> {
    let offset = FixedOffset::east_opt(8 * 3600)?;
    DateTime::from_timestamp_millis(ms).map(|t| t.with_timezone(&offset).date_naive())
}

/// Leading `YYYY-MM-DD` of a date or date-time string
pub(crate) fn date_prefix(text: &str) -> Option<NaiveDate> {
    let head = text.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Base URL with any trailing slash removed
pub(crate) fn trim_base(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}
