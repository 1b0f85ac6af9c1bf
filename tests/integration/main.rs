//! Integration tests for Multicrawl
//!
//! These tests use wiremock to stand up listing sites and an inference
//! service, and drive whole runs against an SQLite store in a temp dir.

mod analysis_tests;
mod crawl_tests;

use chrono::Utc;
use multicrawl::config::{parse_config, Config};
use multicrawl::crawler::{HttpFetcher, Orchestrator};
use multicrawl::output::RecordSink;
use multicrawl::site::{CrawlFrequency, Pagination, PaginationPattern, Selectors};
use multicrawl::storage::SqliteStorage;
use multicrawl::url::site_domain;
use multicrawl::{CrawlMode, SiteConfig, SiteStatus};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Creates a test configuration with short delays
///
/// `extra` is appended verbatim and may hold `[analyzer]`/`[incremental]`
/// tables.
pub fn test_config(dir: &Path, extra: &str) -> Config {
    let content = format!(
        r#"
[orchestrator]
max-concurrent-sites = 4
max-inflight-fetches = 8
transient-retries = 1
transient-retry-delay-ms = 5
fetch-timeout-seconds = 5

[rate-limit]
floor-seconds = 0.001
max-rate-limit-seconds = 2.0
backoff-ceiling-seconds = 2.0

[user-agent]
crawler-name = "TestBot"
crawler-version = "1.0.0"
contact-url = "https://example.com/contact"
contact-email = "test@example.com"

[storage]
database-path = "{db}"

[sink]
path = "{sink}"

{extra}
"#,
        db = dir.join("multicrawl.db").display(),
        sink = dir.join("records.jsonl").display(),
        extra = extra,
    );
    parse_config(&content).expect("test config should be valid")
}

/// Opens a new connection to the test store
pub fn open_store(config: &Config) -> Arc<Mutex<SqliteStorage>> {
    let storage = SqliteStorage::new(Path::new(&config.storage.database_path))
        .expect("Failed to open test store");
    Arc::new(Mutex::new(storage))
}

pub fn orchestrator(
    config: &Config,
    storage: Arc<Mutex<SqliteStorage>>,
    sink: Arc<dyn RecordSink>,
) -> Orchestrator {
    let fetcher = HttpFetcher::new(&config.user_agent).expect("Failed to build fetcher");
    Orchestrator::new(config.clone(), storage, Arc::new(fetcher), sink)
        .expect("Failed to build orchestrator")
}

/// Renders a listing page in the shape [`site_config`] expects
pub fn listing_html(cards: &[(u32, u32)]) -> String {
    let body: String = cards
        .iter()
        .map(|(id, price)| {
            format!(
                r#"<div class="card"><h2>Home {id}</h2><span class="price">${price}</span><a class="more" href="/homes/{id}">Details</a></div>"#
            )
        })
        .collect();
    format!("<html><body><main>{}</main></body></html>", body)
}

/// Cards `(id, price)` with ids in `range` and a price derived from the id
pub fn cards(range: std::ops::RangeInclusive<u32>) -> Vec<(u32, u32)> {
    range.map(|id| (id, 100_000 + id * 1_000)).collect()
}

/// A listing site served by wiremock under `/list?page=N`
///
/// Pages can be swapped between runs. A page past the last one is served
/// empty, which ends a query-param walk.
pub struct ListingSite {
    pub server: MockServer,
    pages: Arc<Mutex<Vec<Vec<(u32, u32)>>>>,
}

impl ListingSite {
    pub async fn start(pages: Vec<Vec<(u32, u32)>>) -> Self {
        Self::start_with_delay(pages, Duration::ZERO).await
    }

    pub async fn start_with_delay(pages: Vec<Vec<(u32, u32)>>, delay: Duration) -> Self {
        let server = MockServer::start().await;
        let pages = Arc::new(Mutex::new(pages));

        let served = pages.clone();
        Mock::given(method("GET"))
            .and(path("/list"))
            .respond_with(move |request: &Request| {
                let page = page_number(request);
                let cards = served
                    .lock()
                    .unwrap()
                    .get(page.saturating_sub(1))
                    .cloned()
                    .unwrap_or_default();
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string(listing_html(&cards))
                    .set_delay(delay)
            })
            .mount(&server)
            .await;

        Self { server, pages }
    }

    pub fn set_pages(&self, pages: Vec<Vec<(u32, u32)>>) {
        *self.pages.lock().unwrap() = pages;
    }

    pub fn base_url(&self) -> String {
        format!("{}/list", self.server.uri())
    }

    pub fn domain(&self) -> String {
        site_domain(&self.server.uri()).unwrap()
    }

    pub fn record_url(&self, id: u32) -> String {
        multicrawl::normalize_url(&format!("{}/homes/{}", self.server.uri(), id))
            .unwrap()
            .to_string()
    }

    /// Number of listing requests the server has seen
    pub async fn listing_hits(&self) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/list")
            .count()
    }
}

/// `?page=N`, 1 when absent
pub fn page_number(request: &Request) -> usize {
    request
        .url
        .query_pairs()
        .find(|(k, _)| k == "page")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(1)
}

/// A site config matching [`listing_html`]
pub fn site_config(domain: &str, base_url: &str) -> SiteConfig {
    let now = Utc::now();
    SiteConfig {
        domain: domain.to_string(),
        base_url: base_url.to_string(),
        selectors: Selectors {
            card: "div.card".to_string(),
            link: "a.more@href".to_string(),
            fields: BTreeMap::from([
                ("price".to_string(), "span.price".to_string()),
                ("title".to_string(), "h2".to_string()),
            ]),
            detail: BTreeMap::new(),
        },
        pagination: Pagination {
            pattern: PaginationPattern::QueryParam {
                param: "page".to_string(),
                start: 1,
            },
            max_pages: 10,
        },
        rate_limit_seconds: 0.001,
        max_workers: 2,
        crawl_frequency: CrawlFrequency::Daily,
        mode: CrawlMode::Full,
        enabled: true,
        status: SiteStatus::Active,
        quality_score: 9.0,
        quality_history: Vec::new(),
        blocked_attempts: 0,
        last_full_crawl_at: None,
        last_incremental_crawl_at: None,
        created_at: now,
        updated_at: now,
    }
}
