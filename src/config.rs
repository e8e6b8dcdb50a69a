//! Configuration types for filing-dl
//!
//! Every field has a default so an empty TOML file (or no file at all) yields a
//! working configuration. CLI flags override individual fields after loading.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

/// Search and index-building settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Records requested per page (None = the portal's maximum)
    #[serde(default)]
    pub page_size: Option<u32>,

    /// Operator page limit per build; bypasses range segmentation when set
    #[serde(default)]
    pub max_pages: Option<u32>,

    /// Operator result limit per build; bypasses range segmentation when set
    #[serde(default)]
    pub max_results: Option<usize>,

    /// Lower bound of the random delay between consecutive page requests (default: 500ms)
    #[serde(default = "default_page_delay_min", with = "duration_ms_serde")]
    pub page_delay_min: Duration,

    /// Upper bound of the random delay between consecutive page requests (default: 1000ms)
    #[serde(default = "default_page_delay_max", with = "duration_ms_serde")]
    pub page_delay_max: Duration,

    /// Length of the default date window ending today (default: 30 days)
    #[serde(default = "default_lookback_days")]
    pub default_lookback_days: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            page_size: None,
            max_pages: None,
            max_results: None,
            page_delay_min: default_page_delay_min(),
            page_delay_max: default_page_delay_max(),
            default_lookback_days: default_lookback_days(),
        }
    }
}

impl SearchConfig {
    /// Whether the operator asked for an explicit page/result cap
    pub fn has_explicit_limits(&self) -> bool {
        self.max_pages.is_some() || self.max_results.is_some()
    }
}

/// Download executor settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Output directory for indexes, reports and artifacts (default: "./output")
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Number of concurrent download workers (default: 3)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Global minimum spacing between request starts across all workers (None = unpaced)
    #[serde(default, with = "optional_duration_ms_serde")]
    pub min_request_interval: Option<Duration>,

    /// Bodies smaller than this are rejected as incomplete (default: 1024)
    #[serde(default = "default_min_artifact_bytes")]
    pub min_artifact_bytes: u64,

    /// HTML bodies smaller than this are treated as challenge pages (default: 50000)
    #[serde(default = "default_html_reject_bytes")]
    pub html_reject_bytes: usize,

    /// Rewrite the report after this many finished entries (default: 10, 0 = only at the end)
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            workers: default_workers(),
            min_request_interval: None,
            min_artifact_bytes: default_min_artifact_bytes(),
            html_reject_bytes: default_html_reject_bytes(),
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

impl DownloadConfig {
    /// Directory holding downloaded artifacts
    pub fn files_dir(&self) -> PathBuf {
        self.output_dir.join("files")
    }

    /// Directory holding index snapshots
    pub fn index_dir(&self) -> PathBuf {
        self.output_dir.join("index")
    }
}

/// HTTP client settings shared by search clients and the fetcher
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Request timeout (default: 60 seconds)
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Visit the portal landing page once before the first download (default: true)
    #[serde(default = "default_true")]
    pub warm_up: bool,

    /// Override for the portal base URL (used by tests and mirrors)
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            user_agent: default_user_agent(),
            warm_up: true,
            base_url: None,
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per operation, first try included (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Search and index-building settings
    #[serde(default)]
    pub search: SearchConfig,

    /// Download executor settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Retry policy for page fetches and downloads
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("cannot read {}: {}", path.display(), e),
            key: None,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config {
            message: e.to_string(),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.download.workers == 0 {
            return Err(Error::config("download.workers", "must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts", "must be greater than 0"));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "retry.backoff_multiplier",
                "must be a finite number of at least 1.0",
            ));
        }
        if self.search.page_size == Some(0) {
            return Err(Error::config("search.page_size", "must be greater than 0"));
        }
        if self.search.max_pages == Some(0) {
            return Err(Error::config("search.max_pages", "must be greater than 0"));
        }
        if self.search.max_results == Some(0) {
            return Err(Error::config("search.max_results", "must be greater than 0"));
        }
        if self.search.page_delay_min > self.search.page_delay_max {
            return Err(Error::config(
                "search.page_delay_min",
                "must not exceed search.page_delay_max",
            ));
        }
        Ok(())
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_workers() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_min_artifact_bytes() -> u64 {
    1024
}

fn default_html_reject_bytes() -> usize {
    50_000
}

fn default_checkpoint_interval() -> usize {
    10
}

fn default_page_delay_min() -> Duration {
    Duration::from_millis(500)
}

fn default_page_delay_max() -> Duration {
    Duration::from_millis(1000)
}

fn default_lookback_days() -> i64 {
    30
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
        .to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Optional Duration serialization helper (milliseconds)
mod optional_duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
