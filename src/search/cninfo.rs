//! cninfo full-text announcement search

use super::{
    SearchClient, SearchPage, build_http_client, date_from_millis, json_str, json_u64, read_body,
    trim_base,
};
use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::types::{DateRange, IndexEntry, SearchQuery, Source};
use crate::utils::strip_html;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, ORIGIN, REFERER};

/// Default portal host
pub const CNINFO_BASE: &str = "https://www.cninfo.com.cn";
/// Host serving announcement attachments
pub const CNINFO_STATIC_BASE: &str = "https://static.cninfo.com.cn";

const QUERY_PATH: &str = "/new/hisAnnouncement/query";
const MAX_PAGE_SIZE: u32 = 30;
const MAX_PAGES_PER_QUERY: u32 = 100;

/// Client for `POST /new/hisAnnouncement/query`
///
/// Recognised filters: `column` (default `szse`), `plate`, `stock`
/// (`<code>,<orgId>`), `category`, `trade`.
pub struct CninfoSearch {
    client: reqwest::Client,
    base_url: String,
}

impl CninfoSearch {
    /// Create a client, honouring `http.base_url` as the portal host
    pub fn new(http: &HttpConfig) -> Result<Self> {
        let base_url = trim_base(http.base_url.as_deref().unwrap_or(CNINFO_BASE));
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));
        if let Ok(origin) = HeaderValue::from_str(&base_url) {
            headers.insert(ORIGIN, origin);
        }
        if let Ok(referer) = HeaderValue::from_str(&format!(
            "{}/new/commonUrl/pageOfSearch?url=disclosure/list/search",
            base_url
        )) {
            headers.insert(REFERER, referer);
        }

        Ok(Self {
            client: build_http_client(http, headers)?,
            base_url,
        })
    }

    fn form(
        query: &SearchQuery,
        range: DateRange,
        page: u32,
        page_size: u32,
    ) -> Vec<(&'static str, String)> {
        let filter = |key: &str| query.filter(key).unwrap_or_default().to_string();
        vec![
            ("pageNum", page.to_string()),
            ("pageSize", page_size.to_string()),
            ("column", query.filter("column").unwrap_or("szse").to_string()),
            ("tabName", "fulltext".to_string()),
            ("plate", filter("plate")),
            ("stock", filter("stock")),
            ("searchkey", query.keyword.clone()),
            ("secid", String::new()),
            ("category", filter("category")),
            ("trade", filter("trade")),
            ("seDate", range.to_string()),
            ("sortName", String::new()),
            ("sortType", String::new()),
            ("isHLtitle", "true".to_string()),
        ]
    }
}

/// Attachment URL on the static host for a relative `adjunctUrl`
pub fn static_url(adjunct: &str) -> String {
    let adjunct = adjunct.trim();
    if adjunct.starts_with("http") {
        adjunct.to_string()
    } else {
        format!("{}/{}", CNINFO_STATIC_BASE, adjunct.trim_start_matches('/'))
    }
}

#[async_trait]
impl SearchClient for CninfoSearch {
    fn source(&self) -> Source {
        Source::Cninfo
    }

    fn max_page_size(&self) -> u32 {
        MAX_PAGE_SIZE
    }

    fn max_pages_per_query(&self) -> u32 {
        MAX_PAGES_PER_QUERY
    }

    async fn search(
        &self,
        query: &SearchQuery,
        range: DateRange,
        page: u32,
        page_size: u32,
    ) -> Result<SearchPage> {
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let url = format!("{}{}", self.base_url, QUERY_PATH);
        tracing::debug!(range = %range, page, page_size, "cninfo query");

        let response = self
            .client
            .post(&url)
            .form(&Self::form(query, range, page, page_size))
            .send()
            .await?;
        let body = read_body(response).await?;
        let data: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| Error::Search(format!("cninfo returned non-JSON body: {}", e)))?;

        let records = data
            .get("announcements")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(SearchPage {
            total: json_u64(&data, "totalAnnouncement").unwrap_or(0),
            has_more: data.get("hasMore").and_then(|v| v.as_bool()),
            records,
        })
    }

    fn normalize(&self, raw: &serde_json::Value) -> Option<IndexEntry> {
        let adjunct = json_str(raw, "adjunctUrl").unwrap_or_default();
        let download_url = if adjunct.is_empty() {
            String::new()
        } else {
            static_url(&adjunct)
        };
        let id = json_str(raw, "announcementId");
        let unique_key = IndexEntry::make_key(Source::Cninfo, id.as_deref(), &download_url)?;

        let publish_date = raw
            .get("announcementTime")
            .and_then(|v| v.as_i64().or_else(|| v.as_str()?.trim().parse().ok()))
            .and_then(date_from_millis);
        let Some(publish_date) = publish_date else {
            tracing::debug!(key = %unique_key, "cninfo record without announcementTime, skipped");
            return None;
        };

        Some(IndexEntry {
            unique_key,
            title: strip_html(&json_str(raw, "announcementTitle").unwrap_or_default()),
            publish_date,
            source_category: Source::Cninfo,
            entity_code: json_str(raw, "secCode"),
            entity_name: json_str(raw, "secName")
                .map(|n| strip_html(&n))
                .filter(|n| !n.is_empty()),
            entity_org_id: json_str(raw, "orgId"),
            download_url,
            file_type: json_str(raw, "adjunctType").map(|t| t.to_ascii_lowercase()),
        })
    }
}
