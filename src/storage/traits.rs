//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::crawler::EventType;
use crate::site::{CrawlMode, SiteConfig};
use crate::state::SiteStatus;
use crate::storage::{CrawlJobRecord, CrawlStateRecord, JobCounts, JobStatus, RateLimitEvent, RecordStatus};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Site not found: {0}")]
    SiteNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt value in column {column}: {value}")]
    Corrupt { column: &'static str, value: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// Every write is a single-row upsert or update keyed by `domain` or
/// `(domain, url)`, so concurrent site jobs never contend on the same rows.
pub trait Storage {
    // ===== Site Configs =====

    /// Inserts or replaces a site config, keyed by domain
    fn save_site(&mut self, config: &SiteConfig) -> StorageResult<()>;

    /// Gets a site config by domain
    fn get_site(&self, domain: &str) -> StorageResult<Option<SiteConfig>>;

    /// Lists all site configs, ordered by domain
    fn list_sites(&self) -> StorageResult<Vec<SiteConfig>>;

    /// Operator enable/disable
    ///
    /// Enabling resets the status to `active` and the blocked-attempt counter.
    /// Disabling sets the status to `disabled`.
    ///
    /// # Returns
    ///
    /// The updated config, or `SiteNotFound`
    fn set_site_enabled(&mut self, domain: &str, enabled: bool) -> StorageResult<SiteConfig>;

    /// Persists adaptive health of a site
    ///
    /// The update is skipped when the site has been disabled in the meantime,
    /// so an operator action is never overwritten by a running job.
    ///
    /// # Returns
    ///
    /// `true` if the row was updated
    fn update_site_health(
        &mut self,
        domain: &str,
        status: SiteStatus,
        rate_limit_seconds: f64,
        blocked_attempts: u32,
    ) -> StorageResult<bool>;

    /// Records a finished crawl pass
    ///
    /// A full pass sets `last_full_crawl_at` and switches the site to
    /// incremental mode. An incremental pass sets `last_incremental_crawl_at`.
    fn record_crawl_pass(
        &mut self,
        domain: &str,
        mode: CrawlMode,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Replaces the quality score and its history
    fn update_quality(
        &mut self,
        domain: &str,
        quality_score: f64,
        quality_history: &[f64],
    ) -> StorageResult<()>;

    // ===== Crawl State =====

    /// Gets the state row for a record URL
    fn get_crawl_state(&self, domain: &str, url: &str) -> StorageResult<Option<CrawlStateRecord>>;

    /// Inserts or replaces the state row for a record URL
    fn upsert_crawl_state(&mut self, record: &CrawlStateRecord) -> StorageResult<()>;

    /// Bumps `last_seen_at` only
    fn touch_crawl_state(&mut self, domain: &str, url: &str, at: DateTime<Utc>)
        -> StorageResult<()>;

    /// Flips `active`/`updated` rows last seen before `cutoff` to `removed`
    ///
    /// # Returns
    ///
    /// The URLs that were flipped
    fn mark_removed_before(
        &mut self,
        domain: &str,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Vec<String>>;

    /// Counts state rows for a domain, optionally filtered by status
    fn count_crawl_states(&self, domain: &str, status: Option<RecordStatus>)
        -> StorageResult<u64>;

    // ===== Crawl Jobs =====

    /// Opens a running job unless the domain already has one
    ///
    /// # Returns
    ///
    /// The new job ID, or `None` if another job holds the claim
    fn claim_job(
        &mut self,
        domain: &str,
        mode: CrawlMode,
        started_at: DateTime<Utc>,
    ) -> StorageResult<Option<i64>>;

    /// Closes a job with its final status and counters
    fn finish_job(
        &mut self,
        job_id: i64,
        status: JobStatus,
        counts: &JobCounts,
        error_summary: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Refreshes a running job's heartbeat
    ///
    /// # Returns
    ///
    /// `false` if the job is no longer running (closed here or abandoned by
    /// another process)
    fn touch_job(&mut self, job_id: i64, at: DateTime<Utc>) -> StorageResult<bool>;

    /// Marks `running` jobs whose last heartbeat is before `cutoff` as failed
    ///
    /// A job without a heartbeat is judged by its start time.
    ///
    /// # Returns
    ///
    /// The number of jobs closed
    fn abandon_stale_jobs(&mut self, cutoff: DateTime<Utc>) -> StorageResult<usize>;

    /// Gets a job by ID
    fn get_job(&self, job_id: i64) -> StorageResult<CrawlJobRecord>;

    /// Lists the most recent jobs, newest first
    fn list_jobs(&self, domain: Option<&str>, limit: u32) -> StorageResult<Vec<CrawlJobRecord>>;

    // ===== Rate Limit Events =====

    /// Appends a rate limit event
    fn insert_event(&mut self, event: &RateLimitEvent) -> StorageResult<()>;

    /// Counts events for a domain since `since`, optionally of one type
    fn count_events_since(
        &self,
        domain: &str,
        since: DateTime<Utc>,
        event_type: Option<EventType>,
    ) -> StorageResult<u32>;

    /// Lists the most recent events for a domain, newest first
    fn list_events(&self, domain: &str, limit: u32) -> StorageResult<Vec<RateLimitEvent>>;
}
