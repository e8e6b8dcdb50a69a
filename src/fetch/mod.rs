//! Document fetching
//!
//! A [`Fetcher`] turns an [`IndexEntry`] into document bytes. The executor only
//! depends on this trait, so an embedding application can append its own
//! implementation (for example a browser-driven one for portals that demand a
//! JavaScript challenge) behind the HTTP fetcher with [`FallbackFetcher`].

use crate::error::FetchError;
use crate::types::IndexEntry;
use async_trait::async_trait;
use std::sync::Arc;

pub mod http;

pub use http::{HttpFetcher, SiteBases, resolve_url};

/// Bytes retrieved for one entry
#[derive(Clone, Debug)]
pub struct Fetched {
    /// Response body
    pub bytes: Vec<u8>,
    /// URL the bytes came from
    pub url: String,
    /// `Content-Type` header, when present
    pub content_type: Option<String>,
}

impl Fetched {
    /// Whether the body looks like an HTML page rather than a document
    pub fn is_html(&self) -> bool {
        if self
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
        {
            return true;
        }
        let head_len = self.bytes.len().min(512);
        let head = String::from_utf8_lossy(&self.bytes[..head_len]).to_ascii_lowercase();
        let head = head.trim_start();
        head.starts_with("<!doctype html") || head.starts_with("<html")
    }
}

/// Retrieves document bytes for an entry
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Fetch the document behind `entry`
    async fn fetch(&self, entry: &IndexEntry) -> Result<Fetched, FetchError>;
}

/// Reject bodies that cannot be the requested document
///
/// HTML below `html_reject_bytes` is an anti-bot or error page; anything below
/// `min_bytes` is an incomplete transfer. Both are transient.
pub fn validate_body(
    fetched: &Fetched,
    min_bytes: u64,
    html_reject_bytes: usize,
) -> Result<(), FetchError> {
    let len = fetched.bytes.len();
    if fetched.is_html() && len < html_reject_bytes {
        return Err(FetchError::transient(format!(
            "HTML page instead of document ({} bytes) from {}",
            len, fetched.url
        )));
    }
    if (len as u64) < min_bytes {
        return Err(FetchError::transient(format!(
            "body too small ({} bytes) from {}",
            len, fetched.url
        )));
    }
    Ok(())
}

/// Tries fetchers in order and returns the first success
pub struct FallbackFetcher {
    fetchers: Vec<Arc<dyn Fetcher>>,
}

impl FallbackFetcher {
    /// Chain `fetchers`, first one tried first
    pub fn new(fetchers: Vec<Arc<dyn Fetcher>>) -> Self {
        Self { fetchers }
    }

    /// Append a fetcher to the chain
    pub fn then(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetchers.push(fetcher);
        self
    }
}

#[async_trait]
impl Fetcher for FallbackFetcher {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn fetch(&self, entry: &IndexEntry) -> Result<Fetched, FetchError> {
        let mut last_error = FetchError::permanent("no fetcher configured");
        for fetcher in &self.fetchers {
            match fetcher.fetch(entry).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) => {
                    tracing::debug!(
                        fetcher = fetcher.name(),
                        key = %entry.unique_key,
                        error = %e,
                        "fetcher failed, trying next"
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Source;
    use chrono::NaiveDate;

    fn fetched(bytes: &[u8], content_type: Option<&str>) -> Fetched {
        Fetched {
            bytes: bytes.to_vec(),
            url: "https://files.example/a.pdf".into(),
            content_type: content_type.map(String::from),
        }
    }

    fn entry() -> IndexEntry {
        IndexEntry {
            unique_key: "cninfo:1".into(),
            title: "t".into(),
            publish_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            source_category: Source::Cninfo,
            entity_code: None,
            entity_name: None,
            entity_org_id: None,
            download_url: "https://files.example/a.pdf".into(),
            file_type: None,
        }
    }

    struct Canned(Result<Fetched, FetchError>);

    #[async_trait]
    impl Fetcher for Canned {
        fn name(&self) -> &str {
            "canned"
        }
        async fn fetch(&self, _entry: &IndexEntry) -> Result<Fetched, FetchError> {
            self.0.clone()
        }
    }

    #[test]
    fn html_detection() {
        assert!(fetched(b"%PDF", Some("text/html; charset=utf-8")).is_html());
        assert!(fetched(b"  <!DOCTYPE html><html>", None).is_html());
        assert!(!fetched(b"%PDF-1.7", Some("application/pdf")).is_html());
    }

    #[test]
    fn small_html_is_transient() {
        let err = validate_body(&fetched(&[b'<'; 2000], Some("text/html")), 1024, 50_000)
            .unwrap_err();
        assert!(!err.is_permanent());
        assert!(err.to_string().contains("HTML page"));
    }

    #[test]
    fn short_body_is_transient() {
        let err = validate_body(&fetched(b"%PDF-1.7", None), 1024, 50_000).unwrap_err();
        assert!(err.to_string().contains("too small"));
        assert!(validate_body(&fetched(&[0u8; 2048], None), 1024, 50_000).is_ok());
    }

    #[tokio::test]
    async fn fallback_returns_first_success() {
        let chain = FallbackFetcher::new(vec![Arc::new(Canned(Err(FetchError::permanent(
            "HTTP 403",
        ))))])
        .then(Arc::new(Canned(Ok(fetched(b"%PDF", None)))));
        assert_eq!(chain.fetch(&entry()).await.unwrap().bytes, b"%PDF");
    }

    #[tokio::test]
    async fn fallback_reports_last_error() {
        let chain = FallbackFetcher::new(vec![
            Arc::new(Canned(Err(FetchError::permanent("HTTP 403")))),
            Arc::new(Canned(Err(FetchError::transient("challenge page")))),
        ]);
        assert_eq!(
            chain.fetch(&entry()).await.unwrap_err(),
            FetchError::transient("challenge page")
        );
    }
}
