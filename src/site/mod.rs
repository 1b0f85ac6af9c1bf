//! Site model for Multicrawl
//!
//! A site is one listing domain. Its [`SiteConfig`] is produced by the
//! analyzer and generator, persisted by the store and read fresh at the start
//! of every crawl job.

mod analyzer;
mod generator;
mod inference;

pub use analyzer::{score_selectors, QualityBreakdown, SiteAnalyzer};
pub use generator::generate_config;
pub use inference::{
    HttpStructureInference, InferenceError, InferenceRequest, InferredStructure, PageSample,
    StructureInference,
};

use crate::state::SiteStatus;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default locator used to find a card's record link
pub const DEFAULT_LINK_SELECTOR: &str = "a[href]";

/// How often a site should be crawled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlFrequency {
    Hourly,
    Daily,
    Weekly,
}

impl CrawlFrequency {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            _ => None,
        }
    }

    /// Minimum time between two crawls at this frequency
    pub fn interval(&self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::weeks(1),
        }
    }
}

/// Crawl mode of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlMode {
    /// Walks every listing page and sweeps removed records afterwards
    Full,
    /// Walks only the first listing pages and never marks anything removed
    Incremental,
}

impl CrawlMode {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "incremental" => Some(Self::Incremental),
            _ => None,
        }
    }
}

impl std::fmt::Display for CrawlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_db_string())
    }
}

impl std::str::FromStr for CrawlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_string(&s.to_lowercase())
            .ok_or_else(|| format!("unknown crawl mode '{}', expected full or incremental", s))
    }
}

/// A CSS selector with an optional `@attr` suffix
///
/// `h2.title` captures the element text, `img.photo@src` captures the `src`
/// attribute instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator<'a> {
    pub selector: &'a str,
    pub attribute: Option<&'a str>,
}

impl<'a> Locator<'a> {
    pub fn parse(raw: &'a str) -> Self {
        let raw = raw.trim();
        if let Some((selector, attr)) = raw.rsplit_once('@') {
            let is_attr_name = !attr.is_empty()
                && attr
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':');
            if is_attr_name && !selector.trim().is_empty() {
                return Self {
                    selector: selector.trim(),
                    attribute: Some(attr),
                };
            }
        }
        Self {
            selector: raw,
            attribute: None,
        }
    }
}

/// Selectors used to extract records from a site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selectors {
    /// Selects one element per listing card
    pub card: String,

    /// Locator of the record link, relative to the card. Captures `href` unless
    /// another attribute is named.
    #[serde(default = "default_link_selector")]
    pub link: String,

    /// Field locators relative to the card
    #[serde(default)]
    pub fields: BTreeMap<String, String>,

    /// Field locators applied to the record's detail page
    #[serde(default)]
    pub detail: BTreeMap<String, String>,
}

fn default_link_selector() -> String {
    DEFAULT_LINK_SELECTOR.to_string()
}

impl Selectors {
    /// Iterates every raw locator with a label, card selector first
    pub fn all_locators(&self) -> impl Iterator<Item = (String, &str)> {
        std::iter::once(("card".to_string(), self.card.as_str()))
            .chain(std::iter::once(("link".to_string(), self.link.as_str())))
            .chain(
                self.fields
                    .iter()
                    .map(|(name, loc)| (format!("field '{}'", name), loc.as_str())),
            )
            .chain(
                self.detail
                    .iter()
                    .map(|(name, loc)| (format!("detail '{}'", name), loc.as_str())),
            )
    }
}

/// How listing pages follow each other
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaginationPattern {
    /// The base URL is the only listing page
    None,
    /// `?<param>=N`, counting up from `start`
    QueryParam { param: String, start: u32 },
    /// A URL template containing `{page}`, counting up from 1
    PathTemplate { template: String },
    /// Follow the element matched by `selector` (its `href`)
    NextLink { selector: String },
}

impl PaginationPattern {
    /// Short human-readable description
    pub fn describe(&self) -> String {
        match self {
            Self::None => "none".to_string(),
            Self::QueryParam { param, start } => format!("query ?{}={}..", param, start),
            Self::PathTemplate { template } => format!("template {}", template),
            Self::NextLink { selector } => format!("next link {}", selector),
        }
    }
}

/// Pagination pattern plus the maximum number of listing pages to walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub pattern: PaginationPattern,
    pub max_pages: u32,
}

/// Persisted crawl configuration of one site
#[derive(Debug, Clone, PartialEq)]
pub struct SiteConfig {
    pub domain: String,
    pub base_url: String,
    pub selectors: Selectors,
    pub pagination: Pagination,
    pub rate_limit_seconds: f64,
    pub max_workers: u32,
    pub crawl_frequency: CrawlFrequency,
    pub mode: CrawlMode,
    pub enabled: bool,
    pub status: SiteStatus,
    pub quality_score: f64,
    pub quality_history: Vec<f64>,
    pub blocked_attempts: u32,
    pub last_full_crawl_at: Option<DateTime<Utc>>,
    pub last_incremental_crawl_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SiteConfig {
    /// True if the orchestrator may schedule this site at all
    pub fn is_crawlable(&self) -> bool {
        self.enabled && !self.status.is_terminal()
    }

    /// Time of the most recent crawl of either mode
    pub fn last_crawled_at(&self) -> Option<DateTime<Utc>> {
        match (self.last_full_crawl_at, self.last_incremental_crawl_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// True if the site's crawl frequency says it should be crawled at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_crawled_at() {
            Some(last) => now - last >= self.crawl_frequency.interval(),
            None => true,
        }
    }

    /// True if the score has fallen below an operator-configured threshold
    pub fn needs_reanalysis(&self, threshold: Option<f64>) -> bool {
        threshold.is_some_and(|t| self.quality_score < t)
    }
}

/// Result of analyzing a site
#[derive(Debug, Clone, PartialEq)]
pub struct SiteAnalysis {
    pub domain: String,
    pub base_url: String,
    pub property_card_selector: String,
    pub link_selector: String,
    pub field_selectors: BTreeMap<String, String>,
    pub detail_selectors: BTreeMap<String, String>,
    pub pagination_pattern: PaginationPattern,
    pub max_pages: u32,
    pub quality_score: f64,
    pub suggested_rate_limit_seconds: f64,
    pub suggested_workers: u32,
    pub recommended_frequency: CrawlFrequency,
    pub inference_quality_hint: Option<f64>,
}

impl SiteAnalysis {
    pub fn selectors(&self) -> Selectors {
        Selectors {
            card: self.property_card_selector.clone(),
            link: self.link_selector.clone(),
            fields: self.field_selectors.clone(),
            detail: self.detail_selectors.clone(),
        }
    }
}
