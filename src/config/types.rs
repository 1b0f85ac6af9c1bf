use crate::site::CrawlFrequency;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Multicrawl
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(rename = "rate-limit", default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub incremental: IncrementalConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    pub storage: StorageConfig,
    pub sink: SinkConfig,
}

/// Global concurrency and fetch budget
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct OrchestratorConfig {
    /// Maximum number of site coordinators running at once
    pub max_concurrent_sites: u32,

    /// Maximum number of fetches in flight across all sites
    pub max_inflight_fetches: u32,

    /// Upper bound for any site's worker pool
    pub per_site_worker_cap: u32,

    /// Timeout applied to every single fetch (seconds)
    pub fetch_timeout_seconds: u64,

    /// Retries for timeouts and connection failures before a page is skipped
    pub transient_retries: u32,

    /// Delay between transient retries (milliseconds)
    pub transient_retry_delay_ms: u64,

    /// Jobs left `running` for longer than this are considered abandoned (minutes)
    pub stale_job_minutes: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sites: 4,
            max_inflight_fetches: 8,
            per_site_worker_cap: 4,
            fetch_timeout_seconds: 15,
            transient_retries: 2,
            transient_retry_delay_ms: 500,
            stale_job_minutes: 360,
        }
    }
}

impl OrchestratorConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn transient_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transient_retry_delay_ms)
    }
}

/// Adaptive backoff and site status thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitConfig {
    /// Minimum delay between requests to any site (seconds)
    pub floor_seconds: f64,

    /// Ceiling for the persisted per-site delay (seconds)
    pub max_rate_limit_seconds: f64,

    /// Growth factor for exponential backoff
    pub backoff_multiplier: f64,

    /// Ceiling for a single suggested pause (seconds)
    pub backoff_ceiling_seconds: f64,

    /// Consecutive clean fetches needed to step back towards `active`
    pub recovery_threshold: u32,

    /// Delay decay applied on recovery
    pub recovery_multiplier: f64,

    /// Window in which repeated 429s escalate a site to `blocked` (seconds)
    pub repeated_429_window_seconds: u64,

    /// Number of 429s inside the window that counts as "repeated"
    pub repeated_429_threshold: u32,

    /// Consecutive crawl attempts ending `blocked` before a site is `failed`
    pub blocked_attempts_before_failure: u32,

    /// Window used for recent-event frequency when computing backoff (seconds)
    pub event_window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            floor_seconds: 1.0,
            max_rate_limit_seconds: 60.0,
            backoff_multiplier: 2.0,
            backoff_ceiling_seconds: 600.0,
            recovery_threshold: 5,
            recovery_multiplier: 0.8,
            repeated_429_window_seconds: 300,
            repeated_429_threshold: 3,
            blocked_attempts_before_failure: 3,
            event_window_seconds: 3600,
        }
    }
}

impl RateLimitConfig {
    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_ceiling_seconds)
    }

    /// Clamps a delay into `[floor, max]`
    pub fn clamp_rate_limit(&self, seconds: f64) -> f64 {
        if !seconds.is_finite() {
            return self.floor_seconds;
        }
        seconds.clamp(self.floor_seconds, self.max_rate_limit_seconds)
    }
}

/// Incremental tracking configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct IncrementalConfig {
    /// Rows not observed for this many days are swept by a full pass
    pub retention_days: u32,

    /// Listing pages walked by an incremental pass
    pub incremental_max_pages: u32,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            incremental_max_pages: 3,
        }
    }
}

/// Site analysis configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AnalyzerConfig {
    /// Re-inference attempts after a rejected answer
    pub max_retries: u32,

    /// Endpoint of the structure inference service
    pub inference_endpoint: Option<String>,

    /// Timeout for a single inference call (seconds)
    pub inference_timeout_seconds: u64,

    /// Maximum number of pages sent to inference (listing page included)
    pub max_sample_pages: u32,

    /// Delay used when inference does not suggest one (seconds)
    pub default_rate_limit_seconds: f64,

    /// Worker count used when inference does not suggest one
    pub default_workers: u32,

    /// Crawl frequency used when inference does not recommend one
    pub default_frequency: CrawlFrequency,

    /// Pagination depth used when inference does not report one
    pub default_max_pages: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            inference_endpoint: None,
            inference_timeout_seconds: 60,
            max_sample_pages: 3,
            default_rate_limit_seconds: 2.0,
            default_workers: 2,
            default_frequency: CrawlFrequency::Daily,
            default_max_pages: 50,
        }
    }
}

impl AnalyzerConfig {
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_seconds)
    }
}

/// Selector quality tracking
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QualityConfig {
    /// Pages with zero card matches in one job before the score is lowered
    pub parse_miss_threshold: u32,

    /// Amount subtracted from `quality_score` when the threshold is hit
    pub parse_miss_penalty: f64,

    /// Sites scoring below this are flagged for re-analysis
    pub reanalysis_threshold: Option<f64>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            parse_miss_threshold: 2,
            parse_miss_penalty: 1.0,
            reanalysis_threshold: None,
        }
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Formats the user agent header: `Name/Version (+ContactURL; ContactEmail)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,
}

/// Record sink configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// JSON-lines file that receives new and updated records
    pub path: String,
}
