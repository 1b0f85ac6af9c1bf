//! Incremental state tracking
//!
//! Every extracted record is fingerprinted and compared with what the store
//! last saw at the same `(domain, url)`. Only full crawls may conclude that a
//! record is gone.

use crate::storage::{CrawlStateRecord, RecordStatus, Storage, StorageResult};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of observing a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Updated,
    Unchanged,
}

impl ChangeKind {
    /// Returns true if the record must be handed to the sink
    pub fn is_emitted(&self) -> bool {
        matches!(self, Self::New | Self::Updated)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// Fingerprints a record's extracted fields
///
/// The canonical form is one `name=value` line per field, sorted by name, with
/// runs of whitespace in values collapsed to a single space. Cosmetic markup
/// changes therefore do not register as updates.
pub fn content_hash(fields: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in fields {
        let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(collapsed.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Observes a record at the current time
pub fn observe<S: Storage + ?Sized>(
    store: &mut S,
    domain: &str,
    url: &str,
    hash: &str,
) -> StorageResult<ChangeKind> {
    observe_at(store, domain, url, hash, Utc::now())
}

/// Compares `hash` against the stored fingerprint and updates the row
///
/// | stored row | result | row effect |
/// |------------|--------|------------|
/// | none | `New` | insert as `active` |
/// | `removed` | `New` | back to `active` with the new hash |
/// | same hash | `Unchanged` | bump `last_seen_at` only |
/// | other hash | `Updated` | store hash, status `updated` |
pub fn observe_at<S: Storage + ?Sized>(
    store: &mut S,
    domain: &str,
    url: &str,
    hash: &str,
    now: DateTime<Utc>,
) -> StorageResult<ChangeKind> {
    let Some(existing) = store.get_crawl_state(domain, url)? else {
        store.upsert_crawl_state(&CrawlStateRecord {
            domain: domain.to_string(),
            url: url.to_string(),
            content_hash: hash.to_string(),
            status: RecordStatus::Active,
            first_seen_at: now,
            last_seen_at: now,
        })?;
        return Ok(ChangeKind::New);
    };

    if existing.status == RecordStatus::Removed {
        store.upsert_crawl_state(&CrawlStateRecord {
            content_hash: hash.to_string(),
            status: RecordStatus::Active,
            last_seen_at: now,
            ..existing
        })?;
        return Ok(ChangeKind::New);
    }

    if existing.content_hash == hash {
        store.touch_crawl_state(domain, url, now)?;
        return Ok(ChangeKind::Unchanged);
    }

    store.upsert_crawl_state(&CrawlStateRecord {
        content_hash: hash.to_string(),
        status: RecordStatus::Updated,
        last_seen_at: now,
        ..existing
    })?;
    Ok(ChangeKind::Updated)
}

/// Sweeps removed records at the current time
pub fn sweep_removed<S: Storage + ?Sized>(
    store: &mut S,
    domain: &str,
    retention_days: u32,
) -> StorageResult<Vec<String>> {
    sweep_removed_at(store, domain, retention_days, Utc::now())
}

/// Flips records not seen within `retention_days` of `now` to `removed`
///
/// Only the full-crawl path calls this.
pub fn sweep_removed_at<S: Storage + ?Sized>(
    store: &mut S,
    domain: &str,
    retention_days: u32,
    now: DateTime<Utc>,
) -> StorageResult<Vec<String>> {
    let cutoff = now - Duration::days(i64::from(retention_days));
    store.mark_removed_before(domain, cutoff)
}
