//! Plain HTTP fetcher with per-portal URL resolution

use super::{Fetched, Fetcher};
use crate::config::HttpConfig;
use crate::error::{FetchError, Result};
use crate::pacing::RequestPacer;
use crate::search::cninfo::{CNINFO_BASE, CNINFO_STATIC_BASE};
use crate::search::sse::SSE_SITE_BASE;
use crate::types::{IndexEntry, Source};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderValue, REFERER};
use std::collections::HashSet;
use url::Url;

/// Hosts used to resolve relative URLs, build alternates and warm up sessions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteBases {
    /// cninfo attachment host
    pub cninfo_static: String,
    /// cninfo portal host
    pub cninfo_portal: String,
    /// SSE public site
    pub sse_site: String,
}

impl Default for SiteBases {
    fn default() -> Self {
        Self {
            cninfo_static: CNINFO_STATIC_BASE.to_string(),
            cninfo_portal: CNINFO_BASE.to_string(),
            sse_site: SSE_SITE_BASE.to_string(),
        }
    }
}

impl SiteBases {
    fn file_base(&self, source: Source) -> &str {
        match source {
            Source::Cninfo => &self.cninfo_static,
            Source::SseSearch | Source::SseInquiry => &self.sse_site,
        }
    }

    fn landing_page(&self, source: Source) -> String {
        match source {
            Source::Cninfo => format!("{}/", self.cninfo_portal.trim_end_matches('/')),
            Source::SseSearch => format!("{}/home/search/", self.sse_site.trim_end_matches('/')),
            Source::SseInquiry => format!(
                "{}/disclosure/credibility/supervision/inquiries/",
                self.sse_site.trim_end_matches('/')
            ),
        }
    }
}

/// Resolve a possibly relative download URL against `base`
///
/// Protocol-relative (`//host/..`) and scheme-less `www.` URLs are normalized to
/// https. Anything that still does not parse as an http(s) URL is a permanent
/// failure.
pub fn resolve_url(base: &str, raw: &str) -> std::result::Result<String, FetchError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(FetchError::permanent("missing download url"));
    }
    let candidate = if raw.starts_with("//") {
        format!("https:{}", raw)
    } else if raw.starts_with("www.") {
        format!("https://{}", raw)
    } else {
        raw.to_string()
    };

    let parsed = match Url::parse(&candidate) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = Url::parse(&format!("{}/", base.trim_end_matches('/')))
                .map_err(|e| FetchError::permanent(format!("bad base url {}: {}", base, e)))?;
            base.join(candidate.trim_start_matches('/'))
                .map_err(|e| FetchError::permanent(format!("malformed url {}: {}", raw, e)))?
        }
        Err(e) => return Err(FetchError::permanent(format!("malformed url {}: {}", raw, e))),
    };

    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        other => Err(FetchError::permanent(format!(
            "unsupported scheme '{}' in {}",
            other, raw
        ))),
    }
}

/// Fetcher backed by a cookie-keeping reqwest client
///
/// The caller takes a pacer slot before each [`fetch`](Fetcher::fetch); that slot
/// covers the first request. The warm-up visit and every alternate candidate
/// take a slot of their own from the pacer given to [`with_pacer`](Self::with_pacer).
pub struct HttpFetcher {
    client: reqwest::Client,
    bases: SiteBases,
    warm_up: bool,
    warmed: tokio::sync::Mutex<HashSet<Source>>,
    pacer: RequestPacer,
}

impl HttpFetcher {
    /// Create a fetcher from the HTTP settings
    pub fn new(http: &HttpConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,application/pdf,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(http.timeout)
            .user_agent(http.user_agent.clone())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            bases: SiteBases::default(),
            warm_up: http.warm_up,
            warmed: tokio::sync::Mutex::new(HashSet::new()),
            pacer: RequestPacer::new(None),
        })
    }

    /// Share the download pacer so extra requests are spaced too
    pub fn with_pacer(mut self, pacer: RequestPacer) -> Self {
        self.pacer = pacer;
        self
    }

    /// Use different portal hosts
    pub fn with_bases(mut self, bases: SiteBases) -> Self {
        self.bases = bases;
        self
    }

    /// URLs to try for `entry`, primary first
    ///
    /// cninfo documents are also served from the `finalpage` path keyed by
    /// announcement id and date, and from the portal's download endpoint.
    pub fn candidates(&self, entry: &IndexEntry) -> std::result::Result<Vec<String>, FetchError> {
        let primary = resolve_url(self.bases.file_base(entry.source_category), &entry.download_url)?;
        let mut urls = vec![primary];

        if entry.source_category == Source::Cninfo && !entry.has_url_key() {
            let id = entry.doc_id();
            if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()) {
                urls.push(format!(
                    "{}/finalpage/{}/{}.PDF",
                    self.bases.cninfo_static.trim_end_matches('/'),
                    entry.publish_date,
                    id
                ));
                urls.push(format!(
                    "{}/new/announcement/download?bulletinId={}&realTime=true",
                    self.bases.cninfo_portal.trim_end_matches('/'),
                    id
                ));
            }
        }

        let mut seen = HashSet::new();
        urls.retain(|u| seen.insert(u.clone()));
        Ok(urls)
    }

    fn referer(&self, source: Source) -> String {
        self.bases.landing_page(source)
    }

    // Visit the portal landing page once per source to pick up session cookies.
    // Returns whether a request was sent.
    async fn ensure_warm(&self, source: Source) -> bool {
        if !self.warm_up || !self.warmed.lock().await.insert(source) {
            return false;
        }
        let landing = self.bases.landing_page(source);
        match self.client.get(&landing).send().await {
            Ok(resp) => {
                tracing::debug!(url = %landing, status = resp.status().as_u16(), "session warmed up")
            }
            Err(e) => tracing::warn!(url = %landing, error = %e, "warm-up request failed"),
        }
        true
    }

    async fn get(&self, url: &str, source: Source) -> std::result::Result<Fetched, FetchError> {
        let response = self
            .client
            .get(url)
            .header(REFERER, self.referer(source))
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(url, status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let final_url = response.url().to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;

        Ok(Fetched {
            bytes: bytes.to_vec(),
            url: final_url,
            content_type,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, entry: &IndexEntry) -> std::result::Result<Fetched, FetchError> {
        let candidates = self.candidates(entry)?;
        // the caller's slot covers the first request only
        let mut slot_used = self.ensure_warm(entry.source_category).await;

        let mut last_error = FetchError::permanent("no candidate url");
        for url in candidates {
            if slot_used {
                self.pacer.acquire().await;
            }
            slot_used = true;
            match self.get(&url, entry.source_category).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) if e.is_permanent() => {
                    tracing::debug!(key = %entry.unique_key, url = %url, error = %e, "candidate failed");
                    last_error = e;
                }
                Err(e) => return Err(e),
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
    use chrono::NaiveDate;
    use std::time::{Duration, Instant};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry(source: Source, key: &str, url: &str) -> IndexEntry {
        IndexEntry {
            unique_key: key.into(),
            title: "t".into(),
            publish_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            source_category: source,
            entity_code: Some("600000".into()),
            entity_name: None,
            entity_org_id: None,
            download_url: url.into(),
            file_type: None,
        }
    }

    fn fetcher(server: &MockServer, warm_up: bool) -> HttpFetcher {
        HttpFetcher::new(&HttpConfig {
            warm_up,
            ..Default::default()
        })
        .unwrap()
        .with_bases(SiteBases {
            cninfo_static: server.uri(),
            cninfo_portal: server.uri(),
            sse_site: server.uri(),
        })
    }

    #[test]
    fn resolve_url_forms() {
        let base = "https://static.cninfo.com.cn";
        assert_eq!(
            resolve_url(base, "finalpage/2024-01-15/1.PDF").unwrap(),
            "https://static.cninfo.com.cn/finalpage/2024-01-15/1.PDF"
        );
        assert_eq!(
            resolve_url(base, "/finalpage/1.PDF").unwrap(),
            "https://static.cninfo.com.cn/finalpage/1.PDF"
        );
        assert_eq!(
            resolve_url(base, "//www.sse.com.cn/a.pdf").unwrap(),
            "https://www.sse.com.cn/a.pdf"
        );
        assert_eq!(
            resolve_url(base, "www.sse.com.cn/a.pdf").unwrap(),
            "https://www.sse.com.cn/a.pdf"
        );
        assert!(resolve_url(base, "").unwrap_err().is_permanent());
        assert!(resolve_url(base, "ftp://host/a.pdf").unwrap_err().is_permanent());
    }

    #[test]
    fn cninfo_entries_get_alternates() {
        let f = HttpFetcher::new(&HttpConfig::default()).unwrap();
        let urls = f
            .candidates(&entry(Source::Cninfo, "cninfo:1219", "finalpage/2024-01-15/1219.PDF"))
            .unwrap();
        assert_eq!(
            urls,
            vec![
                "https://static.cninfo.com.cn/finalpage/2024-01-15/1219.PDF".to_string(),
                "https://www.cninfo.com.cn/new/announcement/download?bulletinId=1219&realTime=true"
                    .to_string(),
            ]
        );

        let sse = f
            .candidates(&entry(Source::SseInquiry, "sse_inquiry:url:/a.pdf", "/a.pdf"))
            .unwrap();
        assert_eq!(sse, vec!["https://www.sse.com.cn/a.pdf".to_string()]);
    }

    #[tokio::test]
    async fn fetch_reads_body_and_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/docs/a.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .set_body_bytes(b"%PDF-1.7 body".to_vec()),
            )
            .mount(&server)
            .await;

        let f = fetcher(&server, false);
        let url = format!("{}/docs/a.pdf", server.uri());
        let fetched = f
            .fetch(&entry(Source::SseSearch, "sse_search:url:x", &url))
            .await
            .unwrap();
        assert_eq!(fetched.bytes, b"%PDF-1.7 body");
        assert_eq!(fetched.content_type.as_deref(), Some("application/pdf"));
    }

    #[tokio::test]
    async fn status_codes_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.pdf"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy.pdf"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let f = fetcher(&server, false);
        let gone = f
            .fetch(&entry(Source::SseSearch, "k", &format!("{}/gone.pdf", server.uri())))
            .await
            .unwrap_err();
        assert!(gone.is_permanent());

        let busy = f
            .fetch(&entry(Source::SseSearch, "k", &format!("{}/busy.pdf", server.uri())))
            .await
            .unwrap_err();
        assert!(!busy.is_permanent());
    }

    #[tokio::test]
    async fn cninfo_falls_through_to_download_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/new/announcement/download"))
            .and(query_param("bulletinId", "1219"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-alt".to_vec()))
            .mount(&server)
            .await;

        let f = fetcher(&server, false);
        let fetched = f
            .fetch(&entry(Source::Cninfo, "cninfo:1219", "missing/1219.PDF"))
            .await
            .unwrap();
        assert_eq!(fetched.bytes, b"%PDF-alt");
    }

    #[tokio::test]
    async fn warm_up_runs_once_per_source() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/disclosure/credibility/supervision/inquiries/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".to_vec()))
            .mount(&server)
            .await;

        let f = fetcher(&server, true);
        for _ in 0..3 {
            f.fetch(&entry(Source::SseInquiry, "k", "/a.pdf")).await.unwrap();
        }
        server.verify().await;
    }

    #[tokio::test]
    async fn slow_warm_up_does_not_hold_back_other_fetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/home/search/"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(600)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".to_vec()))
            .mount(&server)
            .await;

        let f = fetcher(&server, true);
        let f = &f;
        let timed = move |key: &'static str| {
            async move {
                let start = Instant::now();
                f.fetch(&entry(Source::SseSearch, key, "/a.pdf")).await.unwrap();
                start.elapsed()
            }
        };
        let (first, second) = tokio::join!(timed("k1"), timed("k2"));
        assert!(first.max(second) >= Duration::from_millis(600));
        assert!(
            first.min(second) < Duration::from_millis(400),
            "one fetch waited on the other's warm-up"
        );
    }

    #[tokio::test]
    async fn alternate_candidates_take_pacer_slots() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/new/announcement/download"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-alt".to_vec()))
            .mount(&server)
            .await;

        let start = Instant::now();
        let pacer = RequestPacer::new(Some(Duration::from_millis(80)));
        let f = fetcher(&server, false).with_pacer(pacer.clone());
        // the executor's slot for this attempt
        pacer.acquire().await;
        // primary and finalpage 404, the download endpoint answers
        f.fetch(&entry(Source::Cninfo, "cninfo:1219", "missing/1219.PDF"))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(160));
    }
}
