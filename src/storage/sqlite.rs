//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::crawler::EventType;
use crate::site::{CrawlFrequency, CrawlMode, Pagination, Selectors, SiteConfig};
use crate::state::SiteStatus;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    CrawlJobRecord, CrawlStateRecord, JobCounts, JobStatus, RateLimitEvent, RecordStatus,
};
use crate::MulticrawlError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const SITE_COLUMNS: &str = "domain, base_url, selectors, pagination, rate_limit_seconds, max_workers,
     crawl_frequency, mode, enabled, status, quality_score, quality_history, blocked_attempts,
     last_full_crawl_at, last_incremental_crawl_at, created_at, updated_at";

const JOB_COLUMNS: &str = "id, domain, mode, status, started_at, completed_at, pages_crawled,
     pages_skipped, parse_misses, new_count, updated_count, unchanged_count, removed_count,
     error_summary, heartbeat_at";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(MulticrawlError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, MulticrawlError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> Result<Self, MulticrawlError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

/// Formats a timestamp with a fixed width so text order is time order
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn corrupt(idx: usize, column: &'static str, value: String) -> rusqlite::Error {
    conversion_error(idx, StorageError::Corrupt { column, value })
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_ts(idx, &value)
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value.map(|v| parse_ts(idx, &v)).transpose()
}

fn get_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    serde_json::from_str(&value).map_err(|e| conversion_error(idx, e))
}

fn get_enum<T>(
    row: &Row<'_>,
    idx: usize,
    column: &'static str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    parse(&value).ok_or_else(|| corrupt(idx, column, value))
}

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<SiteConfig> {
    let selectors: Selectors = get_json(row, 2)?;
    let pagination: Pagination = get_json(row, 3)?;
    let quality_history: Vec<f64> = get_json(row, 11)?;

    Ok(SiteConfig {
        domain: row.get(0)?,
        base_url: row.get(1)?,
        selectors,
        pagination,
        rate_limit_seconds: row.get(4)?,
        max_workers: row.get(5)?,
        crawl_frequency: get_enum(row, 6, "crawl_frequency", CrawlFrequency::from_db_string)?,
        mode: get_enum(row, 7, "mode", CrawlMode::from_db_string)?,
        enabled: row.get(8)?,
        status: get_enum(row, 9, "status", SiteStatus::from_db_string)?,
        quality_score: row.get(10)?,
        quality_history,
        blocked_attempts: row.get(12)?,
        last_full_crawl_at: get_opt_ts(row, 13)?,
        last_incremental_crawl_at: get_opt_ts(row, 14)?,
        created_at: get_ts(row, 15)?,
        updated_at: get_ts(row, 16)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<CrawlJobRecord> {
    Ok(CrawlJobRecord {
        id: row.get(0)?,
        domain: row.get(1)?,
        mode: get_enum(row, 2, "mode", CrawlMode::from_db_string)?,
        status: get_enum(row, 3, "status", JobStatus::from_db_string)?,
        started_at: get_ts(row, 4)?,
        completed_at: get_opt_ts(row, 5)?,
        counts: JobCounts {
            pages_crawled: row.get(6)?,
            pages_skipped: row.get(7)?,
            parse_misses: row.get(8)?,
            new_count: row.get(9)?,
            updated_count: row.get(10)?,
            unchanged_count: row.get(11)?,
            removed_count: row.get(12)?,
        },
        error_summary: row.get(13)?,
        heartbeat_at: get_opt_ts(row, 14)?,
    })
}

impl Storage for SqliteStorage {
    // ===== Site Configs =====

    fn save_site(&mut self, config: &SiteConfig) -> StorageResult<()> {
        let selectors = serde_json::to_string(&config.selectors)?;
        let pagination = serde_json::to_string(&config.pagination)?;
        let history = serde_json::to_string(&config.quality_history)?;

        self.conn.execute(
            &format!(
                "INSERT INTO site_configs ({SITE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(domain) DO UPDATE SET
                    base_url = excluded.base_url,
                    selectors = excluded.selectors,
                    pagination = excluded.pagination,
                    rate_limit_seconds = excluded.rate_limit_seconds,
                    max_workers = excluded.max_workers,
                    crawl_frequency = excluded.crawl_frequency,
                    mode = excluded.mode,
                    enabled = excluded.enabled,
                    status = excluded.status,
                    quality_score = excluded.quality_score,
                    quality_history = excluded.quality_history,
                    blocked_attempts = excluded.blocked_attempts,
                    last_full_crawl_at = excluded.last_full_crawl_at,
                    last_incremental_crawl_at = excluded.last_incremental_crawl_at,
                    updated_at = excluded.updated_at"
            ),
            params![
                config.domain,
                config.base_url,
                selectors,
                pagination,
                config.rate_limit_seconds,
                config.max_workers,
                config.crawl_frequency.to_db_string(),
                config.mode.to_db_string(),
                config.enabled,
                config.status.to_db_string(),
                config.quality_score,
                history,
                config.blocked_attempts,
                config.last_full_crawl_at.map(ts),
                config.last_incremental_crawl_at.map(ts),
                ts(config.created_at),
                ts(config.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_site(&self, domain: &str) -> StorageResult<Option<SiteConfig>> {
        let site = self
            .conn
            .query_row(
                &format!("SELECT {SITE_COLUMNS} FROM site_configs WHERE domain = ?1"),
                params![domain],
                site_from_row,
            )
            .optional()?;
        Ok(site)
    }

    fn list_sites(&self) -> StorageResult<Vec<SiteConfig>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {SITE_COLUMNS} FROM site_configs ORDER BY domain"))?;
        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sites)
    }

    fn set_site_enabled(&mut self, domain: &str, enabled: bool) -> StorageResult<SiteConfig> {
        let now = ts(Utc::now());
        let changed = if enabled {
            self.conn.execute(
                "UPDATE site_configs SET enabled = 1, status = ?1, blocked_attempts = 0, updated_at = ?2
                 WHERE domain = ?3",
                params![SiteStatus::Active.to_db_string(), now, domain],
            )?
        } else {
            self.conn.execute(
                "UPDATE site_configs SET enabled = 0, status = ?1, updated_at = ?2 WHERE domain = ?3",
                params![SiteStatus::Disabled.to_db_string(), now, domain],
            )?
        };

        if changed == 0 {
            return Err(StorageError::SiteNotFound(domain.to_string()));
        }

        self.get_site(domain)?
            .ok_or_else(|| StorageError::SiteNotFound(domain.to_string()))
    }

    fn update_site_health(
        &mut self,
        domain: &str,
        status: SiteStatus,
        rate_limit_seconds: f64,
        blocked_attempts: u32,
    ) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "UPDATE site_configs
             SET status = ?1, rate_limit_seconds = ?2, blocked_attempts = ?3, updated_at = ?4
             WHERE domain = ?5 AND enabled = 1 AND status != ?6",
            params![
                status.to_db_string(),
                rate_limit_seconds,
                blocked_attempts,
                ts(Utc::now()),
                domain,
                SiteStatus::Disabled.to_db_string(),
            ],
        )?;
        Ok(changed > 0)
    }

    fn record_crawl_pass(
        &mut self,
        domain: &str,
        mode: CrawlMode,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let sql = match mode {
            CrawlMode::Full => {
                "UPDATE site_configs SET last_full_crawl_at = ?1, mode = 'incremental', updated_at = ?1
                 WHERE domain = ?2"
            }
            CrawlMode::Incremental => {
                "UPDATE site_configs SET last_incremental_crawl_at = ?1, updated_at = ?1
                 WHERE domain = ?2"
            }
        };
        self.conn.execute(sql, params![ts(at), domain])?;
        Ok(())
    }

    fn update_quality(
        &mut self,
        domain: &str,
        quality_score: f64,
        quality_history: &[f64],
    ) -> StorageResult<()> {
        let history = serde_json::to_string(quality_history)?;
        let changed = self.conn.execute(
            "UPDATE site_configs SET quality_score = ?1, quality_history = ?2, updated_at = ?3
             WHERE domain = ?4",
            params![quality_score, history, ts(Utc::now()), domain],
        )?;
        if changed == 0 {
            return Err(StorageError::SiteNotFound(domain.to_string()));
        }
        Ok(())
    }

    // ===== Crawl State =====

    fn get_crawl_state(&self, domain: &str, url: &str) -> StorageResult<Option<CrawlStateRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT domain, url, content_hash, status, first_seen_at, last_seen_at
                 FROM crawl_state WHERE domain = ?1 AND url = ?2",
                params![domain, url],
                |row| {
                    Ok(CrawlStateRecord {
                        domain: row.get(0)?,
                        url: row.get(1)?,
                        content_hash: row.get(2)?,
                        status: get_enum(row, 3, "status", RecordStatus::from_db_string)?,
                        first_seen_at: get_ts(row, 4)?,
                        last_seen_at: get_ts(row, 5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_crawl_state(&mut self, record: &CrawlStateRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO crawl_state (domain, url, content_hash, status, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(domain, url) DO UPDATE SET
                content_hash = excluded.content_hash,
                status = excluded.status,
                last_seen_at = excluded.last_seen_at",
            params![
                record.domain,
                record.url,
                record.content_hash,
                record.status.to_db_string(),
                ts(record.first_seen_at),
                ts(record.last_seen_at),
            ],
        )?;
        Ok(())
    }

    fn touch_crawl_state(
        &mut self,
        domain: &str,
        url: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE crawl_state SET last_seen_at = ?1 WHERE domain = ?2 AND url = ?3",
            params![ts(at), domain, url],
        )?;
        Ok(())
    }

    fn mark_removed_before(
        &mut self,
        domain: &str,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Vec<String>> {
        let tx = self.conn.transaction()?;

        let urls = {
            let mut stmt = tx.prepare(
                "SELECT url FROM crawl_state
                 WHERE domain = ?1 AND status IN ('active', 'updated') AND last_seen_at < ?2
                 ORDER BY url",
            )?;
            let urls = stmt
                .query_map(params![domain, ts(cutoff)], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            urls
        };

        tx.execute(
            "UPDATE crawl_state SET status = 'removed'
             WHERE domain = ?1 AND status IN ('active', 'updated') AND last_seen_at < ?2",
            params![domain, ts(cutoff)],
        )?;
        tx.commit()?;

        Ok(urls)
    }

    fn count_crawl_states(
        &self,
        domain: &str,
        status: Option<RecordStatus>,
    ) -> StorageResult<u64> {
        let count: i64 = match status {
            Some(status) => self.conn.query_row(
                "SELECT COUNT(*) FROM crawl_state WHERE domain = ?1 AND status = ?2",
                params![domain, status.to_db_string()],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM crawl_state WHERE domain = ?1",
                params![domain],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }

    // ===== Crawl Jobs =====

    fn claim_job(
        &mut self,
        domain: &str,
        mode: CrawlMode,
        started_at: DateTime<Utc>,
    ) -> StorageResult<Option<i64>> {
        // The partial unique index on running jobs turns a second claim into a no-op
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO crawl_jobs (domain, mode, status, started_at, heartbeat_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                domain,
                mode.to_db_string(),
                JobStatus::Running.to_db_string(),
                ts(started_at)
            ],
        )?;

        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    fn finish_job(
        &mut self,
        job_id: i64,
        status: JobStatus,
        counts: &JobCounts,
        error_summary: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE crawl_jobs SET status = ?1, completed_at = ?2, pages_crawled = ?3,
                pages_skipped = ?4, parse_misses = ?5, new_count = ?6, updated_count = ?7,
                unchanged_count = ?8, removed_count = ?9, error_summary = ?10
             WHERE id = ?11",
            params![
                status.to_db_string(),
                ts(completed_at),
                counts.pages_crawled,
                counts.pages_skipped,
                counts.parse_misses,
                counts.new_count,
                counts.updated_count,
                counts.unchanged_count,
                counts.removed_count,
                error_summary,
                job_id,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::JobNotFound(job_id));
        }
        Ok(())
    }

    fn touch_job(&mut self, job_id: i64, at: DateTime<Utc>) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "UPDATE crawl_jobs SET heartbeat_at = ?1 WHERE id = ?2 AND status = ?3",
            params![ts(at), job_id, JobStatus::Running.to_db_string()],
        )?;
        Ok(changed > 0)
    }

    fn abandon_stale_jobs(&mut self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let closed = self.conn.execute(
            "UPDATE crawl_jobs SET status = ?1, completed_at = ?2,
                error_summary = 'abandoned: process exited while the job was running'
             WHERE status = ?3 AND COALESCE(heartbeat_at, started_at) < ?4",
            params![
                JobStatus::Failed.to_db_string(),
                ts(Utc::now()),
                JobStatus::Running.to_db_string(),
                ts(cutoff),
            ],
        )?;
        Ok(closed)
    }

    fn get_job(&self, job_id: i64) -> StorageResult<CrawlJobRecord> {
        self.conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = ?1"),
                params![job_id],
                job_from_row,
            )
            .optional()?
            .ok_or(StorageError::JobNotFound(job_id))
    }

    fn list_jobs(&self, domain: Option<&str>, limit: u32) -> StorageResult<Vec<CrawlJobRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM crawl_jobs
             WHERE ?1 IS NULL OR domain = ?1
             ORDER BY id DESC LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(params![domain, limit], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    // ===== Rate Limit Events =====

    fn insert_event(&mut self, event: &RateLimitEvent) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO rate_limit_events
                (domain, detected_at, event_type, retry_after_seconds, url, status_code)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.domain,
                ts(event.detected_at),
                event.event_type.to_db_string(),
                event.retry_after_seconds.map(|s| s as i64),
                event.url,
                event.status_code,
            ],
        )?;
        Ok(())
    }

    fn count_events_since(
        &self,
        domain: &str,
        since: DateTime<Utc>,
        event_type: Option<EventType>,
    ) -> StorageResult<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM rate_limit_events
             WHERE domain = ?1 AND detected_at >= ?2 AND (?3 IS NULL OR event_type = ?3)",
            params![domain, ts(since), event_type.map(|e| e.to_db_string())],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    fn list_events(&self, domain: &str, limit: u32) -> StorageResult<Vec<RateLimitEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT domain, detected_at, event_type, retry_after_seconds, url, status_code
             FROM rate_limit_events WHERE domain = ?1
             ORDER BY detected_at DESC, id DESC LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![domain, limit], |row| {
                Ok(RateLimitEvent {
                    domain: row.get(0)?,
                    detected_at: get_ts(row, 1)?,
                    event_type: get_enum(row, 2, "event_type", EventType::from_db_string)?,
                    retry_after_seconds: row.get::<_, Option<i64>>(3)?.map(|s| s.max(0) as u64),
                    url: row.get(4)?,
                    status_code: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}
