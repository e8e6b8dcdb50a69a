//! Shanghai Stock Exchange endpoints
//!
//! Both endpoints answer with JSONP and reject requests without a browser-like
//! `Referer`. [`SseSearch`] is the site-wide document search; [`SseInquiry`] is
//! the regulatory inquiry-letter column.

use super::jsonp::{callback_name, parse_jsonp};
use super::{
    SearchClient, SearchPage, build_http_client, date_prefix, json_str, json_str_any, json_u64,
    read_body, trim_base,
};
use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::types::{DateRange, IndexEntry, SearchQuery, Source};
use crate::utils::strip_html;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, ORIGIN, REFERER};
use std::collections::HashMap;

/// Host of the query API
pub const SSE_QUERY_BASE: &str = "https://query.sse.com.cn";
/// Public site, also the base for relative document URLs
pub const SSE_SITE_BASE: &str = "https://www.sse.com.cn";
/// Landing page of the site-wide search
pub const SSE_SEARCH_PAGE: &str = "https://www.sse.com.cn/home/search/";
/// Landing page of the inquiry-letter column
pub const SSE_INQUIRY_PAGE: &str =
    "https://www.sse.com.cn/disclosure/credibility/supervision/inquiries/";

const SEARCH_PATH: &str = "/search/getESSearchDoc.do";
const INQUIRY_PATH: &str = "/commonSoaQuery.do";

/// Absolute document URL on the SSE site
///
/// Handles absolute, `www.`-prefixed, root-relative and bare relative forms.
pub fn absolute_url(url: &str) -> String {
    let url = url.trim();
    if url.is_empty() || url.starts_with("http") {
        url.to_string()
    } else if url.starts_with("//") {
        format!("https:{}", url)
    } else if url.starts_with("www.") {
        format!("https://{}", url)
    } else if url.starts_with('/') {
        format!("{}{}", SSE_SITE_BASE, url)
    } else {
        format!("{}/{}", SSE_SITE_BASE, url)
    }
}

fn sse_headers(referer: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ORIGIN, HeaderValue::from_static(SSE_SITE_BASE));
    headers.insert(REFERER, HeaderValue::from_static(referer));
    headers
}

fn millis_now() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

async fn get_jsonp(
    client: &reqwest::Client,
    url: &str,
    params: &[(&str, String)],
) -> Result<serde_json::Value> {
    let response = client.get(url).query(params).send().await?;
    let body = read_body(response).await?;
    parse_jsonp(&body)
}

/// Client for the SSE site-wide search (`/search/getESSearchDoc.do`)
///
/// Pages are zero-based on the wire; the trait's 1-based page is translated.
pub struct SseSearch {
    client: reqwest::Client,
    base_url: String,
}

impl SseSearch {
    const MAX_PAGE_SIZE: u32 = 20;
    const MAX_PAGES_PER_QUERY: u32 = 240;

    /// Create a client, honouring `http.base_url` as the query host
    pub fn new(http: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(http, sse_headers(SSE_SEARCH_PAGE))?,
            base_url: trim_base(http.base_url.as_deref().unwrap_or(SSE_QUERY_BASE)),
        })
    }
}

#[async_trait]
impl SearchClient for SseSearch {
    fn source(&self) -> Source {
        Source::SseSearch
    }

    fn max_page_size(&self) -> u32 {
        Self::MAX_PAGE_SIZE
    }

    fn max_pages_per_query(&self) -> u32 {
        Self::MAX_PAGES_PER_QUERY
    }

    async fn search(
        &self,
        query: &SearchQuery,
        range: DateRange,
        page: u32,
        page_size: u32,
    ) -> Result<SearchPage> {
        let page_size = page_size.clamp(1, Self::MAX_PAGE_SIZE);
        let wire_page = page.saturating_sub(1);
        let params = [
            ("jsonCallBack", callback_name(6)),
            ("searchword", String::new()),
            ("page", wire_page.to_string()),
            ("limit", page_size.to_string()),
            ("spaceId", "3".to_string()),
            ("orderByDirection", "DESC".to_string()),
            ("orderByKey", "score".to_string()),
            ("searchMode", "precise".to_string()),
            ("keyword", query.keyword.clone()),
            ("siteName", "sse".to_string()),
            ("keywordPosition", "title,paper_content".to_string()),
            ("publishTimeStart", format!("{} 00:00:00", range.start)),
            ("publishTimeEnd", format!("{} 23:59:59", range.end)),
            ("channelId", "10001".to_string()),
            ("_", millis_now()),
        ];
        tracing::debug!(range = %range, page, page_size, "sse search query");

        let url = format!("{}{}", self.base_url, SEARCH_PATH);
        let value = get_jsonp(&self.client, &url, &params).await?;
        let code = json_str(&value, "code").unwrap_or_default();
        if code != "0" {
            return Err(Error::Search(format!("sse search returned code '{}'", code)));
        }

        let data = value.get("data").cloned().unwrap_or_default();
        let records = data
            .get("knowledgeList")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let has_more = json_u64(&data, "totalPage").map(|pages| u64::from(wire_page) + 1 < pages);
        Ok(SearchPage {
            total: json_u64(&data, "totalSize").unwrap_or(0),
            has_more,
            records,
        })
    }

    fn normalize(&self, raw: &serde_json::Value) -> Option<IndexEntry> {
        let extend: HashMap<String, serde_json::Value> = raw
            .get("extend")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let name = item.get("name")?.as_str()?.to_string();
                        Some((name, item.get("value").cloned().unwrap_or_default()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let ext = |key: &str| -> Option<String> {
            match extend.get(key)? {
                serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        };

        let download_url = ext("CURL")
            .map(|c| absolute_url(&c))
            .or_else(|| json_str(raw, "url"))
            .unwrap_or_default();
        let unique_key = IndexEntry::make_key(Source::SseSearch, None, &download_url)?;
        let publish_date = json_str(raw, "createTime").and_then(|t| date_prefix(&t))?;

        Some(IndexEntry {
            unique_key,
            title: strip_html(&json_str(raw, "title").unwrap_or_default()),
            publish_date,
            source_category: Source::SseSearch,
            entity_code: ext("ZQDM"),
            entity_name: ext("GSJC"),
            entity_org_id: None,
            download_url,
            file_type: ext("FILETYPE").map(|t| t.to_ascii_lowercase()),
        })
    }
}

/// Client for the SSE inquiry-letter column (`/commonSoaQuery.do`)
///
/// Recognised filters: `stock` (security code), `board` (`type`, default `4`
/// for the main board, empty for all) and `doc_class` (`extGGDL`, default `1`
/// for inquiry letters, empty for all).
pub struct SseInquiry {
    client: reqwest::Client,
    base_url: String,
}

impl SseInquiry {
    const MAX_PAGE_SIZE: u32 = 25;
    const MAX_PAGES_PER_QUERY: u32 = 400;

    /// Create a client, honouring `http.base_url` as the query host
    pub fn new(http: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(http, sse_headers(SSE_INQUIRY_PAGE))?,
            base_url: trim_base(http.base_url.as_deref().unwrap_or(SSE_QUERY_BASE)),
        })
    }

    fn file_ext(url: &str) -> &'static str {
        let lower = url.to_ascii_lowercase();
        if lower.contains(".doc") {
            "doc"
        } else if lower.contains(".xls") {
            "xls"
        } else {
            "pdf"
        }
    }
}

#[async_trait]
impl SearchClient for SseInquiry {
    fn source(&self) -> Source {
        Source::SseInquiry
    }

    fn max_page_size(&self) -> u32 {
        Self::MAX_PAGE_SIZE
    }

    fn max_pages_per_query(&self) -> u32 {
        Self::MAX_PAGES_PER_QUERY
    }

    async fn search(
        &self,
        query: &SearchQuery,
        range: DateRange,
        page: u32,
        page_size: u32,
    ) -> Result<SearchPage> {
        let page_size = page_size.clamp(1, Self::MAX_PAGE_SIZE);
        let page = page.max(1);
        // An explicitly empty value selects every board / document class
        let raw_filter = |key: &str, default: &str| {
            query
                .filters
                .get(key)
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| default.to_string())
        };
        let params = [
            ("jsonCallBack", callback_name(8)),
            ("isPagination", "true".to_string()),
            ("pageHelp.pageSize", page_size.to_string()),
            ("pageHelp.pageNo", page.to_string()),
            ("pageHelp.beginPage", page.to_string()),
            ("pageHelp.cacheSize", "1".to_string()),
            ("pageHelp.endPage", page.to_string()),
            ("sqlId", "BS_KCB_GGLL_NEW".to_string()),
            ("siteId", "28".to_string()),
            ("channelId", "10012,10743,10744".to_string()),
            ("type", raw_filter("board", "4")),
            ("stockcode", query.filter("stock").unwrap_or_default().to_string()),
            ("extGGDL", raw_filter("doc_class", "1")),
            ("createTime", range.start.to_string()),
            ("createTimeEnd", range.end.to_string()),
            ("order", "createTime|desc,stockcode|asc".to_string()),
            ("_", millis_now()),
        ];
        tracing::debug!(range = %range, page, page_size, "sse inquiry query");

        let url = format!("{}{}", self.base_url, INQUIRY_PATH);
        let value = get_jsonp(&self.client, &url, &params).await?;
        let page_help = value
            .get("pageHelp")
            .cloned()
            .ok_or_else(|| Error::Search("sse inquiry response without pageHelp".to_string()))?;
        let records = value
            .get("result")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(SearchPage {
            total: json_u64(&page_help, "total").unwrap_or(0),
            has_more: json_u64(&page_help, "pageCount").map(|count| u64::from(page) < count),
            records,
        })
    }

    fn normalize(&self, raw: &serde_json::Value) -> Option<IndexEntry> {
        let download_url = json_str_any(raw, &["DOCURL", "docURL"])
            .map(|u| absolute_url(&u))
            .unwrap_or_default();
        let unique_key = IndexEntry::make_key(Source::SseInquiry, None, &download_url)?;
        let publish_date =
            json_str_any(raw, &["CREATETIME", "createTime"]).and_then(|t| date_prefix(&t))?;

        Some(IndexEntry {
            unique_key,
            title: strip_html(&json_str_any(raw, &["TITLE", "docTitle"]).unwrap_or_default()),
            publish_date,
            source_category: Source::SseInquiry,
            entity_code: json_str_any(raw, &["STOCKCODE", "stockcode"]),
            entity_name: json_str_any(raw, &["STOCKNAME", "extGSJC"]),
            entity_org_id: None,
            file_type: Some(Self::file_ext(&download_url).to_string()),
            download_url,
        })
    }
}
