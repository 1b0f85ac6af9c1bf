//! Storage module for persisting orchestrator state
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - Site configuration persistence
//! - Per-record incremental crawl state
//! - Crawl job bookkeeping and single-job claims
//! - The append-only rate limit event log

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::crawler::EventType;
use crate::site::CrawlMode;
use crate::MulticrawlError;
use chrono::{DateTime, Utc};
use std::path::Path;

/// Initializes or opens a storage database
pub fn open_storage(path: &Path) -> Result<SqliteStorage, MulticrawlError> {
    SqliteStorage::new(path)
}

/// Status of a tracked record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    Active,
    Updated,
    Removed,
}

impl RecordStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Updated => "updated",
            Self::Removed => "removed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "updated" => Some(Self::Updated),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// Last known state of one record URL
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlStateRecord {
    pub domain: String,
    pub url: String,
    pub content_hash: String,
    pub status: RecordStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Status of a crawl job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Counters collected while a job runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub pages_crawled: u32,
    pub pages_skipped: u32,
    pub parse_misses: u32,
    pub new_count: u32,
    pub updated_count: u32,
    pub unchanged_count: u32,
    pub removed_count: u32,
}

/// A crawl job row
#[derive(Debug, Clone)]
pub struct CrawlJobRecord {
    pub id: i64,
    pub domain: String,
    pub mode: CrawlMode,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: JobCounts,
    pub error_summary: Option<String>,
    /// Last sign of life from the process running the job
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// One detected rate-limit or block signal
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitEvent {
    pub domain: String,
    pub detected_at: DateTime<Utc>,
    pub event_type: EventType,
    pub retry_after_seconds: Option<u64>,
    pub url: Option<String>,
    pub status_code: Option<u16>,
}
