//! Common test utilities for filing-dl integration tests
//!
//! In-memory stand-ins for a disclosure portal and for the document fetcher, so
//! the pipeline can be driven end to end without network access.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use filing_dl::search::SearchPage;
use filing_dl::{
    DateRange, DownloadConfig, Error, FetchError, Fetched, Fetcher, IndexEntry, Result,
    RetryConfig, SearchClient, SearchConfig, SearchQuery, Source,
};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn range(start: &str, end: &str) -> DateRange {
    DateRange::parse(start, end).unwrap()
}

/// Entry with a document-id key and a predictable URL
pub fn entry(id: &str, day: &str) -> IndexEntry {
    IndexEntry {
        unique_key: format!("cninfo:{}", id),
        title: format!("announcement {}", id),
        publish_date: date(day),
        source_category: Source::Cninfo,
        entity_code: Some("600000".into()),
        entity_name: Some("Example Bank".into()),
        entity_org_id: None,
        download_url: format!("https://files.example/{}.pdf", id),
        file_type: Some("pdf".into()),
    }
}

pub fn quiet_search() -> SearchConfig {
    SearchConfig {
        page_delay_min: Duration::ZERO,
        page_delay_max: Duration::ZERO,
        ..SearchConfig::default()
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

pub fn download_config(output_dir: &Path) -> DownloadConfig {
    DownloadConfig {
        output_dir: output_dir.to_path_buf(),
        min_artifact_bytes: 16,
        checkpoint_interval: 3,
        ..DownloadConfig::default()
    }
}

/// Portal serving a fixed record set, newest first
///
/// `count` answers with the number of records in range unless an override is
/// registered for that exact range.
pub struct FakePortal {
    records: Vec<(NaiveDate, String)>,
    page_size: u32,
    pages_per_query: u32,
    total_overrides: Mutex<HashMap<DateRange, u64>>,
    pub requests: AtomicUsize,
}

impl FakePortal {
    pub fn new(records: Vec<(NaiveDate, String)>, page_size: u32, pages_per_query: u32) -> Self {
        let mut records = records;
        records.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Self {
            records,
            page_size,
            pages_per_query,
            total_overrides: Mutex::new(HashMap::new()),
            requests: AtomicUsize::new(0),
        }
    }

    /// `per_day` records on every day of `range`, ids `d<n>`
    pub fn dense(range: DateRange, per_day: usize, page_size: u32, pages_per_query: u32) -> Self {
        let mut records = Vec::new();
        let mut day = range.start;
        let mut n = 0;
        while day <= range.end {
            for _ in 0..per_day {
                records.push((day, format!("d{}", n)));
                n += 1;
            }
            day = day.succ_opt().unwrap();
        }
        Self::new(records, page_size, pages_per_query)
    }

    pub fn report_total(&self, range: DateRange, total: u64) {
        self.total_overrides.lock().unwrap().insert(range, total);
    }

    fn in_range(&self, range: DateRange) -> Vec<&(NaiveDate, String)> {
        self.records
            .iter()
            .filter(|(d, _)| *d >= range.start && *d <= range.end)
            .collect()
    }
}

#[async_trait]
impl SearchClient for FakePortal {
    fn source(&self) -> Source {
        Source::Cninfo
    }

    fn max_page_size(&self) -> u32 {
        self.page_size
    }

    fn max_pages_per_query(&self) -> u32 {
        self.pages_per_query
    }

    async fn search(
        &self,
        _query: &SearchQuery,
        range: DateRange,
        page: u32,
        page_size: u32,
    ) -> Result<SearchPage> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if page == 0 {
            return Err(Error::Search("page numbers start at 1".into()));
        }
        let matching = self.in_range(range);
        let total = self
            .total_overrides
            .lock()
            .unwrap()
            .get(&range)
            .copied()
            .unwrap_or(matching.len() as u64);
        let records = matching
            .iter()
            .skip(((page - 1) * page_size) as usize)
            .take(page_size as usize)
            .map(|(d, id)| json!({"id": id, "date": d.to_string()}))
            .collect();
        Ok(SearchPage {
            records,
            total,
            has_more: None,
        })
    }

    fn normalize(&self, raw: &serde_json::Value) -> Option<IndexEntry> {
        let id = raw["id"].as_str()?;
        let day = raw["date"].as_str()?;
        Some(entry(id, day))
    }
}

/// One scripted fetch result
#[derive(Clone, Debug)]
pub enum Step {
    Ok,
    Transient,
    Permanent,
}

/// Fetcher that serves a small PDF-looking body, following per-key scripts
///
/// Keys without a script always succeed. Each call records the key.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub delay: Duration,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn script(&self, key: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(key.to_string(), steps.into());
    }

    pub fn always(&self, key: &str, step: Step) {
        self.script(key, vec![step; 64]);
    }

    pub fn body_for(&self, key: &str, bytes: Vec<u8>) {
        self.bodies.lock().unwrap().insert(key.to_string(), bytes);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls().iter().filter(|k| k.as_str() == key).count()
    }
}

pub fn pdf_body(tag: &str) -> Vec<u8> {
    let mut body = b"%PDF-1.7\n".to_vec();
    body.extend(tag.as_bytes());
    body.resize(256, b' ');
    body
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, entry: &IndexEntry) -> std::result::Result<Fetched, FetchError> {
        let key = entry.unique_key.clone();
        self.calls.lock().unwrap().push(key.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Ok);
        match step {
            Step::Ok => {
                let bytes = self
                    .bodies
                    .lock()
                    .unwrap()
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| pdf_body(&key));
                Ok(Fetched {
                    bytes,
                    url: entry.download_url.clone(),
                    content_type: Some("application/pdf".into()),
                })
            }
            Step::Transient => Err(FetchError::transient("HTTP 503")),
            Step::Permanent => Err(FetchError::permanent("HTTP 404")),
        }
    }
}
