//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Multicrawl database.
//! Timestamps are RFC 3339 text with a fixed width, so text comparison orders
//! them chronologically.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- One row per site, never deleted
CREATE TABLE IF NOT EXISTS site_configs (
    domain TEXT PRIMARY KEY,
    base_url TEXT NOT NULL,
    selectors TEXT NOT NULL,
    pagination TEXT NOT NULL,
    rate_limit_seconds REAL NOT NULL,
    max_workers INTEGER NOT NULL CHECK (max_workers >= 1),
    crawl_frequency TEXT NOT NULL,
    mode TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL,
    quality_score REAL NOT NULL,
    quality_history TEXT NOT NULL DEFAULT '[]',
    blocked_attempts INTEGER NOT NULL DEFAULT 0,
    last_full_crawl_at TEXT,
    last_incremental_crawl_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Last known fingerprint of every record URL
CREATE TABLE IF NOT EXISTS crawl_state (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL,
    url TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    UNIQUE(domain, url)
);

CREATE INDEX IF NOT EXISTS idx_crawl_state_sweep ON crawl_state(domain, status, last_seen_at);

-- Crawl job history
CREATE TABLE IF NOT EXISTS crawl_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    heartbeat_at TEXT,
    completed_at TEXT,
    pages_crawled INTEGER NOT NULL DEFAULT 0,
    pages_skipped INTEGER NOT NULL DEFAULT 0,
    parse_misses INTEGER NOT NULL DEFAULT 0,
    new_count INTEGER NOT NULL DEFAULT 0,
    updated_count INTEGER NOT NULL DEFAULT 0,
    unchanged_count INTEGER NOT NULL DEFAULT 0,
    removed_count INTEGER NOT NULL DEFAULT 0,
    error_summary TEXT
);

CREATE INDEX IF NOT EXISTS idx_crawl_jobs_domain ON crawl_jobs(domain, status);

-- At most one running job per site
CREATE UNIQUE INDEX IF NOT EXISTS idx_crawl_jobs_running
    ON crawl_jobs(domain) WHERE status = 'running';

-- Append-only rate limit signal log
CREATE TABLE IF NOT EXISTS rate_limit_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    event_type TEXT NOT NULL,
    retry_after_seconds INTEGER,
    url TEXT,
    status_code INTEGER
);

CREATE INDEX IF NOT EXISTS idx_rate_limit_events_domain ON rate_limit_events(domain, detected_at);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    ensure_column(conn, "crawl_jobs", "heartbeat_at", "TEXT")?;
    Ok(())
}

/// Adds a column that stores created before it existed are missing
fn ensure_column(
    conn: &rusqlite::Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    if !columns.iter().any(|c| c == column) {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    }
    Ok(())
}
