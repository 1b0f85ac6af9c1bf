//! Crawler module for fetching, classifying and extracting pages
//!
//! This module contains the core crawling logic, including:
//! - HTTP fetching with retry logic
//! - Rate-limit and block detection
//! - Record extraction from listing and detail pages
//! - Concurrency budgets and per-site pacing
//! - Overall multi-site orchestration

mod detector;
pub mod extractor;
mod fetcher;
mod orchestrator;
mod scheduler;

pub use detector::{parse_retry_after, Classification, EventType, RateLimitDetector};
pub use extractor::{CompiledSelectors, SelectorError};
pub use fetcher::{
    build_http_client, fetch_with_retry, FetchError, FetchResponse, Fetcher, HttpFetcher,
};
pub use orchestrator::{Orchestrator, RunRequest};
pub use scheduler::{Scheduler, SiteGuard, SiteLocks, SitePacer};
