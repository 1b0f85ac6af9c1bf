//! Multi-site orchestrator - main crawl orchestration logic
//!
//! This module contains the crawl loop that coordinates every site of a run:
//! - Closing stale jobs and selecting the sites to crawl
//! - Claiming each site (in-process lock plus store-level job claim)
//! - Walking listing pages in pagination order, detail pages through a
//!   per-site worker pool
//! - Classifying every response and adapting the site's delay and status
//! - Observing records and handing new or updated ones to the sink
//! - Closing jobs with their counts and sweeping removed records
//!
//! The store sits behind a blocking mutex. It is locked for one operation at a
//! time and never across an await point.

use crate::config::Config;
use crate::crawler::extractor::{
    extract_detail, extract_listing, listing_page_url, CompiledSelectors, ListingCard,
};
use crate::crawler::scheduler::{Scheduler, SitePacer};
use crate::crawler::{
    fetch_with_retry, EventType, FetchError, FetchResponse, Fetcher, RateLimitDetector,
};
use crate::output::{ExtractedRecord, RecordSink, RunReport, SiteOutcome, SiteReport};
use crate::site::{CrawlMode, PaginationPattern, SiteConfig};
use crate::state::{content_hash, incremental, settle_attempt, ChangeKind, SiteHealth, SiteStatus};
use crate::storage::{
    JobCounts, JobStatus, RateLimitEvent, SqliteStorage, Storage, StorageError, StorageResult,
};
use crate::{MulticrawlError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use url::Url;

/// How many times a listing page is retried after drawing a rate-limit signal
const MAX_SIGNAL_RETRIES: u32 = 2;

/// Minimum spacing between heartbeat writes of a running job
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// What a run should crawl
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Overrides every site's configured mode
    pub mode: Option<CrawlMode>,

    /// Restricts the run to one site
    pub domain: Option<String>,

    /// Skips sites crawled more recently than their frequency allows
    pub due_only: bool,
}

impl RunRequest {
    /// Every crawlable site in its configured mode
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_domain(domain: &str) -> Self {
        Self {
            domain: Some(domain.to_string()),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: CrawlMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Per-job mutable state, owned by the site's coordinating task
struct JobState {
    job_id: i64,
    last_heartbeat: Instant,
    health: SiteHealth,
    blocked_attempts: u32,
    counts: JobCounts,
    unlinked_cards: u32,
    sink_failures: u32,
    last_signal: Option<EventType>,
}

impl JobState {
    fn new(job_id: i64, site: &SiteConfig, config: &Config) -> Self {
        let rate = config.rate_limit.clamp_rate_limit(site.rate_limit_seconds);
        Self {
            job_id,
            last_heartbeat: Instant::now(),
            health: SiteHealth::new(site.status, rate),
            blocked_attempts: site.blocked_attempts,
            counts: JobCounts::default(),
            unlinked_cards: 0,
            sink_failures: 0,
            last_signal: None,
        }
    }
}

/// Result of fetching one listing page
enum PageFetch {
    Page(FetchResponse),
    Skipped,
    Stop(SiteOutcome),
}

/// How a response may be used
enum Verdict {
    Usable,
    Signal,
    Unusable,
}

fn delay(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
}

/// `now` minus a configured number of seconds, saturating at the earliest time
fn window_start(now: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    chrono::Duration::from_std(Duration::from_secs(seconds))
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn round_score(score: f64) -> f64 {
    (score * 10.0).round() / 10.0
}

/// Lowers a site's quality score, keeping the previous one in its history
///
/// # Returns
///
/// The new score, or `None` if the site no longer exists
fn lower_quality(
    store: &mut SqliteStorage,
    domain: &str,
    penalty: f64,
) -> StorageResult<Option<f64>> {
    let Some(site) = store.get_site(domain)? else {
        return Ok(None);
    };

    let score = round_score((site.quality_score - penalty).clamp(0.0, 10.0));
    if score != site.quality_score {
        let mut history = site.quality_history;
        history.push(site.quality_score);
        store.update_quality(domain, score, &history)?;
    }
    Ok(Some(score))
}

/// Main orchestrator structure
///
/// Cheap to clone; every clone shares the same store, budgets and abort flag.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    storage: Arc<Mutex<SqliteStorage>>,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn RecordSink>,
    detector: Arc<RateLimitDetector>,
    scheduler: Scheduler,
    abort: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Creates a new orchestrator
    ///
    /// # Arguments
    ///
    /// * `config` - The validated configuration
    /// * `storage` - The shared store
    /// * `fetcher` - Transport used for every page
    /// * `sink` - Receives new and updated records
    ///
    /// # Returns
    ///
    /// * `Ok(Orchestrator)` - Ready to run
    /// * `Err(MulticrawlError)` - The detector's marker patterns failed to compile
    pub fn new(
        config: Config,
        storage: Arc<Mutex<SqliteStorage>>,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self> {
        let detector = RateLimitDetector::new(config.rate_limit.clone())?;
        let scheduler = Scheduler::new(&config.orchestrator);

        Ok(Self {
            config: Arc::new(config),
            storage,
            fetcher,
            sink,
            detector: Arc::new(detector),
            scheduler,
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Asks every running site task to stop at its next fetch
    ///
    /// Once cancelled, the orchestrator refuses further runs.
    pub fn cancel(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Runs one store operation under the lock
    ///
    /// Any store failure raises the abort flag: it is fatal to the whole run.
    fn with_store<T>(
        &self,
        op: impl FnOnce(&mut SqliteStorage) -> StorageResult<T>,
    ) -> Result<T> {
        let result = match self.storage.lock() {
            Ok(mut store) => op(&mut store),
            Err(_) => Err(StorageError::LockPoisoned),
        };

        result.map_err(|e| {
            if !self.abort.swap(true, Ordering::SeqCst) {
                tracing::error!(error = %e, "Store failure, aborting run");
            }
            MulticrawlError::Store(e)
        })
    }

    /// Runs a crawl over the requested sites
    ///
    /// Sites run concurrently, bounded by the scheduler. Failures are contained
    /// to their site and reported; only a store failure aborts the run, and
    /// that is reported through [`RunReport::aborted`].
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - Per-site summaries
    /// * `Err(MulticrawlError)` - The run could not start (unknown site, store
    ///   unavailable, cancelled orchestrator)
    pub async fn run(&self, request: RunRequest) -> Result<RunReport> {
        if self.is_aborted() {
            return Err(MulticrawlError::Aborted(
                "orchestrator was cancelled".to_string(),
            ));
        }

        let started = Utc::now();
        let stale_seconds = self.config.orchestrator.stale_job_minutes.saturating_mul(60);
        let cutoff = window_start(started, stale_seconds);
        let abandoned_jobs = self.with_store(|s| s.abandon_stale_jobs(cutoff))?;
        if abandoned_jobs > 0 {
            tracing::warn!("Closed {} stale running job(s) as failed", abandoned_jobs);
        }

        let sites = match &request.domain {
            Some(domain) => {
                let site = self
                    .with_store(|s| s.get_site(domain))?
                    .ok_or_else(|| MulticrawlError::UnknownSite(domain.clone()))?;
                vec![site]
            }
            None => self.with_store(|s| s.list_sites())?,
        };

        tracing::info!("Starting crawl run over {} site(s)", sites.len());

        let mut report = RunReport {
            abandoned_jobs,
            ..RunReport::default()
        };
        let mut tasks = Vec::new();

        for site in sites {
            let mode = request.mode.unwrap_or(site.mode);

            if !site.is_crawlable() {
                let reason = if site.enabled {
                    format!("site is {}", site.status)
                } else {
                    "site is disabled".to_string()
                };
                tracing::debug!(domain = %site.domain, "Skipping: {}", reason);
                report.sites.push(SiteReport::skipped(&site.domain, mode, reason));
                continue;
            }

            if request.due_only && !site.is_due(started) {
                tracing::debug!(domain = %site.domain, "Skipping: not due");
                report
                    .sites
                    .push(SiteReport::skipped(&site.domain, mode, "not due"));
                continue;
            }

            let this = self.clone();
            let domain = site.domain.clone();
            let handle = tokio::spawn(async move { this.run_site(&domain, mode).await });
            tasks.push((site.domain, mode, handle));
        }

        for (domain, mode, handle) in tasks {
            match handle.await {
                Ok(Ok(site_report)) => report.sites.push(site_report),
                Ok(Err(e)) => {
                    if e.is_fatal() && report.aborted.is_none() {
                        report.aborted = Some(e.to_string());
                    }
                    report.sites.push(SiteReport::failed(&domain, mode, e.to_string()));
                }
                Err(e) => {
                    tracing::error!(domain = %domain, "Site task panicked: {}", e);
                    report
                        .sites
                        .push(SiteReport::failed(&domain, mode, format!("site task failed: {}", e)));
                }
            }
        }

        if report.aborted.is_none() && self.is_aborted() {
            report.aborted = Some("run cancelled".to_string());
        }

        let totals = report.totals();
        tracing::info!(
            sites = report.sites.len(),
            new = totals.new_count,
            updated = totals.updated_count,
            unchanged = totals.unchanged_count,
            removed = totals.removed_count,
            "Crawl run finished"
        );

        Ok(report)
    }

    /// Runs one site's job from claim to close
    async fn run_site(&self, domain: &str, mode: CrawlMode) -> Result<SiteReport> {
        let Some(_slot) = self.scheduler.acquire_site_slot().await else {
            return Ok(SiteReport::skipped(domain, mode, "scheduler closed"));
        };

        if self.is_aborted() {
            return Err(MulticrawlError::Aborted(
                "run aborted before the site started".to_string(),
            ));
        }

        let Some(_guard) = self.scheduler.try_lock_site(domain) else {
            tracing::info!(domain = %domain, "Job already running in this process, skipping");
            return Ok(SiteReport::skipped(domain, mode, "a job is already running"));
        };

        // The config is read fresh: another job may have adapted it
        let Some(site) = self.with_store(|s| s.get_site(domain))? else {
            return Ok(SiteReport::skipped(domain, mode, "site no longer exists"));
        };
        if !site.is_crawlable() {
            return Ok(SiteReport::skipped(
                domain,
                mode,
                format!("site is {}", site.status),
            ));
        }

        let Some(job_id) = self.with_store(|s| s.claim_job(domain, mode, Utc::now()))? else {
            tracing::info!(domain = %domain, "Another process holds the job claim, skipping");
            return Ok(SiteReport::skipped(domain, mode, "a job is already running"));
        };

        tracing::info!(domain = %domain, job_id, mode = %mode, "Starting crawl job");

        let mut job = JobState::new(job_id, &site, &self.config);
        let outcome = match self.crawl_site(&site, mode, &mut job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.close_aborted_job(job_id, &job, &e);
                return Err(e);
            }
        };

        self.close_job(&site, mode, job_id, outcome, job)
    }

    /// Best-effort close of a job whose run was aborted
    fn close_aborted_job(&self, job_id: i64, job: &JobState, error: &MulticrawlError) {
        let summary = format!("aborted: {}", error);
        let Ok(mut store) = self.storage.lock() else {
            return;
        };
        if let Err(e) = store.finish_job(
            job_id,
            JobStatus::Failed,
            &job.counts,
            Some(&summary),
            Utc::now(),
        ) {
            tracing::warn!(job_id, "Could not close aborted job: {}", e);
        }
    }

    /// Settles the site's health, sweeps, and closes the job
    fn close_job(
        &self,
        site: &SiteConfig,
        mode: CrawlMode,
        job_id: i64,
        outcome: SiteOutcome,
        job: JobState,
    ) -> Result<SiteReport> {
        let domain = site.domain.as_str();
        let now = Utc::now();
        let mut counts = job.counts;

        // Only a finished full walk has seen the whole listing
        if mode == CrawlMode::Full && outcome == SiteOutcome::Completed {
            let retention = self.config.incremental.retention_days;
            let removed = self.with_store(|s| incremental::sweep_removed(s, domain, retention))?;
            if !removed.is_empty() {
                tracing::info!(domain = %domain, "Marked {} record(s) removed", removed.len());
            }
            counts.removed_count = u32::try_from(removed.len()).unwrap_or(u32::MAX);
        }

        let quality = &self.config.quality;
        if quality.parse_miss_threshold > 0 && counts.parse_misses >= quality.parse_miss_threshold {
            let penalty = quality.parse_miss_penalty;
            if let Some(score) = self.with_store(|s| lower_quality(s, domain, penalty))? {
                tracing::warn!(
                    domain = %domain,
                    parse_misses = counts.parse_misses,
                    "Selectors missed repeatedly, quality lowered to {:.1}",
                    score
                );
            }
        }

        let (status, blocked_attempts) = if outcome == SiteOutcome::Cancelled {
            (job.health.status, job.blocked_attempts)
        } else {
            let (status, attempts) =
                settle_attempt(&job.health, job.blocked_attempts, &self.config.rate_limit);
            self.with_store(|s| {
                s.update_site_health(domain, status, job.health.rate_limit_seconds, attempts)
            })?;
            (status, attempts)
        };

        if job.health.status == SiteStatus::Blocked && status == SiteStatus::RateLimited {
            tracing::info!(domain = %domain, "Blocked site crawled without signals, now rate limited");
        }

        if status == SiteStatus::Disabled && outcome != SiteOutcome::Cancelled {
            tracing::warn!(
                domain = %domain,
                blocked_attempts,
                "Site stayed blocked for too many attempts and was disabled"
            );
        }

        if outcome == SiteOutcome::Completed {
            self.with_store(|s| s.record_crawl_pass(domain, mode, now))?;
        }

        let (job_status, summary) = match &outcome {
            SiteOutcome::Completed => (JobStatus::Completed, None),
            SiteOutcome::Cancelled => (
                JobStatus::Completed,
                Some("cancelled: site disabled while the job ran".to_string()),
            ),
            SiteOutcome::Stopped(stopped) => {
                let cause = job
                    .last_signal
                    .map(|e| format!(" after {}", e))
                    .unwrap_or_default();
                let mut summary = format!("stopped early: site {}{}", stopped, cause);
                if status == SiteStatus::Disabled {
                    summary.push_str(&format!(
                        "; disabled after {} blocked attempts",
                        blocked_attempts
                    ));
                }
                (JobStatus::Failed, Some(summary))
            }
            SiteOutcome::Failed(reason) | SiteOutcome::Skipped(reason) => {
                (JobStatus::Failed, Some(reason.clone()))
            }
        };

        self.with_store(|s| s.finish_job(job_id, job_status, &counts, summary.as_deref(), now))?;

        let current = self.with_store(|s| s.get_site(domain))?;
        let quality_score = current.as_ref().map(|s| s.quality_score);
        let needs_reanalysis = current
            .as_ref()
            .is_some_and(|s| s.needs_reanalysis(quality.reanalysis_threshold));

        tracing::info!(
            domain = %domain,
            job_id,
            outcome = %outcome,
            pages = counts.pages_crawled,
            new = counts.new_count,
            updated = counts.updated_count,
            unchanged = counts.unchanged_count,
            removed = counts.removed_count,
            "Crawl job finished"
        );

        Ok(SiteReport {
            domain: domain.to_string(),
            mode,
            job_id: Some(job_id),
            outcome,
            counts,
            unlinked_cards: job.unlinked_cards,
            sink_failures: job.sink_failures,
            status: Some(current.as_ref().map_or(status, |s| s.status)),
            rate_limit_seconds: Some(job.health.rate_limit_seconds),
            quality_score,
            needs_reanalysis,
        })
    }

    /// Walks a site's listing pages
    async fn crawl_site(
        &self,
        site: &SiteConfig,
        mode: CrawlMode,
        job: &mut JobState,
    ) -> Result<SiteOutcome> {
        let domain = site.domain.as_str();
        let pattern = &site.pagination.pattern;

        let compiled = match CompiledSelectors::compile(&site.selectors, pattern) {
            Ok(compiled) => compiled,
            Err(e) => {
                tracing::warn!(domain = %domain, "{}", e);
                return Ok(SiteOutcome::Failed(e.to_string()));
            }
        };

        let base = match Url::parse(&site.base_url) {
            Ok(url) => url,
            Err(e) => {
                return Ok(SiteOutcome::Failed(format!(
                    "invalid base URL {}: {}",
                    site.base_url, e
                )))
            }
        };

        let max_pages = match mode {
            CrawlMode::Full => site.pagination.max_pages,
            CrawlMode::Incremental => site
                .pagination
                .max_pages
                .min(self.config.incremental.incremental_max_pages),
        }
        .max(1);

        let workers = site
            .max_workers
            .clamp(1, self.config.orchestrator.per_site_worker_cap.max(1));
        let pacer = Arc::new(SitePacer::new(delay(job.health.rate_limit_seconds)));
        let mut seen = HashSet::new();
        let mut next_url = Some(base.clone());

        for index in 0..max_pages {
            let Some(page_url) = next_url.take() else {
                break;
            };
            let computed_next = listing_page_url(&base, pattern, index + 1);

            let response = match self.fetch_listing(domain, &page_url, &pacer, job).await? {
                PageFetch::Page(response) => response,
                PageFetch::Skipped => {
                    next_url = computed_next;
                    continue;
                }
                PageFetch::Stop(outcome) => return Ok(outcome),
            };

            let listing = extract_listing(&response.body, &page_url, &compiled);
            let following = match pattern {
                PaginationPattern::NextLink { .. } => listing.next_page.clone(),
                _ => computed_next,
            };

            if listing.cards.is_empty() {
                let counted_walk = matches!(
                    pattern,
                    PaginationPattern::QueryParam { .. } | PaginationPattern::PathTemplate { .. }
                );
                if index > 0 && counted_walk {
                    job.counts.pages_crawled += 1;
                    tracing::debug!(domain = %domain, url = %page_url, "Empty page, end of listing");
                    break;
                }

                job.counts.parse_misses += 1;
                job.counts.pages_skipped += 1;
                tracing::warn!(
                    domain = %domain,
                    url = %page_url,
                    "Card selector matched nothing, skipping page"
                );
                next_url = following;
                continue;
            }

            job.counts.pages_crawled += 1;
            tracing::debug!(
                domain = %domain,
                url = %page_url,
                cards = listing.cards.len(),
                "Listing page extracted"
            );

            if let Some(outcome) = self
                .process_cards(domain, listing.cards, &compiled, &pacer, workers, &mut seen, job)
                .await?
            {
                return Ok(outcome);
            }

            next_url = following;
        }

        Ok(SiteOutcome::Completed)
    }

    /// Fetches a listing page, retrying it after rate-limit pauses
    async fn fetch_listing(
        &self,
        domain: &str,
        url: &Url,
        pacer: &SitePacer,
        job: &mut JobState,
    ) -> Result<PageFetch> {
        let orch = &self.config.orchestrator;
        let mut signal_retries = 0;

        loop {
            if let Some(outcome) = self.check_cancelled(domain, job)? {
                return Ok(PageFetch::Stop(outcome));
            }

            // The site slot is taken only once a global permit is held
            let permit = self.scheduler.acquire_fetch_permit().await;
            pacer.wait_turn().await;
            let result = fetch_with_retry(
                self.fetcher.as_ref(),
                url.as_str(),
                orch.fetch_timeout(),
                orch.transient_retries,
                orch.transient_retry_delay(),
            )
            .await;
            drop(permit);

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(domain = %domain, url = %url, "Skipping page: {}", e);
                    job.counts.pages_skipped += 1;
                    return Ok(PageFetch::Skipped);
                }
            };

            match self.judge(domain, &response, pacer, job)? {
                Verdict::Usable => return Ok(PageFetch::Page(response)),
                Verdict::Unusable => {
                    tracing::warn!(
                        domain = %domain,
                        url = %url,
                        status = response.status,
                        "Skipping page with unusable status"
                    );
                    job.counts.pages_skipped += 1;
                    return Ok(PageFetch::Skipped);
                }
                Verdict::Signal => {
                    if job.health.status.stops_crawl() {
                        return Ok(PageFetch::Stop(SiteOutcome::Stopped(job.health.status)));
                    }
                    if signal_retries < MAX_SIGNAL_RETRIES {
                        signal_retries += 1;
                        continue;
                    }
                    job.counts.pages_skipped += 1;
                    return Ok(PageFetch::Skipped);
                }
            }
        }
    }

    /// Turns a listing page's cards into records, in document order
    #[allow(clippy::too_many_arguments)]
    async fn process_cards(
        &self,
        domain: &str,
        cards: Vec<ListingCard>,
        compiled: &CompiledSelectors,
        pacer: &Arc<SitePacer>,
        workers: u32,
        seen: &mut HashSet<String>,
        job: &mut JobState,
    ) -> Result<Option<SiteOutcome>> {
        let mut records = Vec::with_capacity(cards.len());
        for card in cards {
            let Some(url) = card.url else {
                job.unlinked_cards += 1;
                tracing::debug!(domain = %domain, "Card without a usable link, skipping");
                continue;
            };
            let url = url.to_string();
            if seen.insert(url.clone()) {
                records.push((url, card.fields));
            }
        }

        if !compiled.has_detail_fields() {
            for (url, fields) in records {
                if let Some(outcome) = self.check_cancelled(domain, job)? {
                    return Ok(Some(outcome));
                }
                self.record(domain, url, fields, job).await?;
            }
            return Ok(None);
        }

        let slots = Arc::new(Semaphore::new(workers as usize));
        let handles: Vec<_> = records
            .into_iter()
            .map(|(url, fields)| {
                let handle = self.spawn_detail_fetch(url.clone(), pacer, &slots);
                (url, fields, handle)
            })
            .collect();
        let mut pending = handles.into_iter();

        while let Some((url, mut fields, handle)) = pending.next() {
            let cancelled = match self.check_cancelled(domain, job) {
                Ok(cancelled) => cancelled,
                Err(e) => {
                    pending.by_ref().for_each(|(_, _, h)| h.abort());
                    handle.abort();
                    return Err(e);
                }
            };
            if let Some(outcome) = cancelled {
                pending.by_ref().for_each(|(_, _, h)| h.abort());
                handle.abort();
                return Ok(Some(outcome));
            }

            let response = match handle.await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::warn!(domain = %domain, url = %url, "Skipping record: {}", e);
                    job.counts.pages_skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(domain = %domain, url = %url, "Detail task failed: {}", e);
                    job.counts.pages_skipped += 1;
                    continue;
                }
            };

            match self.judge(domain, &response, pacer, job)? {
                Verdict::Usable => {}
                Verdict::Signal => {
                    job.counts.pages_skipped += 1;
                    if job.health.status.stops_crawl() {
                        pending.by_ref().for_each(|(_, _, h)| h.abort());
                        return Ok(Some(SiteOutcome::Stopped(job.health.status)));
                    }
                    continue;
                }
                Verdict::Unusable => {
                    tracing::debug!(
                        domain = %domain,
                        url = %url,
                        status = response.status,
                        "Skipping record with unusable detail page"
                    );
                    job.counts.pages_skipped += 1;
                    continue;
                }
            }

            job.counts.pages_crawled += 1;
            fields.extend(extract_detail(&response.body, compiled));
            self.record(domain, url, fields, job).await?;
        }

        Ok(None)
    }

    /// Starts a detail fetch on the site's worker pool
    fn spawn_detail_fetch(
        &self,
        url: String,
        pacer: &Arc<SitePacer>,
        slots: &Arc<Semaphore>,
    ) -> JoinHandle<std::result::Result<FetchResponse, FetchError>> {
        let fetcher = Arc::clone(&self.fetcher);
        let scheduler = self.scheduler.clone();
        let pacer = Arc::clone(pacer);
        let slots = Arc::clone(slots);
        let abort = Arc::clone(&self.abort);
        let orch = &self.config.orchestrator;
        let (timeout, retries, retry_delay) = (
            orch.fetch_timeout(),
            orch.transient_retries,
            orch.transient_retry_delay(),
        );

        tokio::spawn(async move {
            let _slot = slots
                .acquire_owned()
                .await
                .map_err(|e| FetchError::Other(e.to_string()))?;
            if abort.load(Ordering::SeqCst) {
                return Err(FetchError::Other("run aborted".to_string()));
            }
            let _permit = scheduler.acquire_fetch_permit().await;
            pacer.wait_turn().await;
            fetch_with_retry(fetcher.as_ref(), &url, timeout, retries, retry_delay).await
        })
    }

    /// Checks the abort flag and the site's own row, and keeps the job's
    /// heartbeat fresh
    ///
    /// # Returns
    ///
    /// * `Ok(Some(Cancelled))` - The site was disabled from elsewhere
    /// * `Ok(None)` - Keep going
    /// * `Err(MulticrawlError)` - The run is aborting
    fn check_cancelled(&self, domain: &str, job: &mut JobState) -> Result<Option<SiteOutcome>> {
        if self.is_aborted() {
            return Err(MulticrawlError::Aborted("run aborted".to_string()));
        }

        self.heartbeat(domain, job)?;

        match self.with_store(|s| s.get_site(domain))? {
            Some(site) if site.is_crawlable() => Ok(None),
            _ => {
                tracing::info!(domain = %domain, "Site disabled while crawling, stopping");
                Ok(Some(SiteOutcome::Cancelled))
            }
        }
    }

    /// Refreshes the job's heartbeat, at most once per [`HEARTBEAT_INTERVAL`]
    fn heartbeat(&self, domain: &str, job: &mut JobState) -> Result<()> {
        if job.last_heartbeat.elapsed() < HEARTBEAT_INTERVAL {
            return Ok(());
        }
        job.last_heartbeat = Instant::now();

        let job_id = job.job_id;
        if !self.with_store(|s| s.touch_job(job_id, Utc::now()))? {
            tracing::warn!(
                domain = %domain,
                job_id,
                "Job is no longer marked running, it may have been abandoned"
            );
        }
        Ok(())
    }

    fn judge(
        &self,
        domain: &str,
        response: &FetchResponse,
        pacer: &SitePacer,
        job: &mut JobState,
    ) -> Result<Verdict> {
        if self.inspect(domain, response, pacer, job)?.is_some() {
            return Ok(Verdict::Signal);
        }
        if !response.is_success() {
            return Ok(Verdict::Unusable);
        }
        Ok(Verdict::Usable)
    }

    /// Classifies a response and adapts the site's pacing and health
    fn inspect(
        &self,
        domain: &str,
        response: &FetchResponse,
        pacer: &SitePacer,
        job: &mut JobState,
    ) -> Result<Option<EventType>> {
        let rl = &self.config.rate_limit;

        if self.detector.detect(response).is_none() {
            if let Some(t) = job.health.record_clean(rl) {
                tracing::info!(
                    domain = %domain,
                    from = %t.from,
                    to = %t.to,
                    delay = job.health.rate_limit_seconds,
                    "Site recovering"
                );
                pacer.set_interval(delay(job.health.rate_limit_seconds));
                self.persist_health(domain, job)?;
            }
            return Ok(None);
        }

        let now = Utc::now();
        let since = window_start(now, rl.event_window_seconds);
        let recent = self.with_store(|s| s.count_events_since(domain, since, None))?;

        let classification =
            self.detector
                .classify_at(response, job.health.rate_limit_seconds, recent, now);
        let Some(event) = classification.event else {
            return Ok(None);
        };

        self.with_store(|s| {
            s.insert_event(&RateLimitEvent {
                domain: domain.to_string(),
                detected_at: now,
                event_type: event,
                retry_after_seconds: classification.retry_after_seconds,
                url: Some(response.url.clone()),
                status_code: Some(response.status),
            })
        })?;

        let recent_429s = if event == EventType::Http429 {
            let since = window_start(now, rl.repeated_429_window_seconds);
            self.with_store(|s| s.count_events_since(domain, since, Some(EventType::Http429)))?
        } else {
            0
        };

        let transition = job.health.record_signal(event, recent_429s, rl);
        job.last_signal = Some(event);

        let backoff = classification.backoff.unwrap_or_default();
        pacer.set_interval(delay(job.health.rate_limit_seconds));
        pacer.pause_for(backoff);

        tracing::warn!(
            domain = %domain,
            event = %event,
            status = response.status,
            backoff_secs = backoff.as_secs_f64(),
            delay = job.health.rate_limit_seconds,
            "Rate limit signal"
        );
        if let Some(t) = transition {
            tracing::warn!(domain = %domain, from = %t.from, to = %t.to, "Site status changed");
        }

        self.persist_health(domain, job)?;
        Ok(Some(event))
    }

    fn persist_health(&self, domain: &str, job: &JobState) -> Result<()> {
        let applied = self.with_store(|s| {
            s.update_site_health(
                domain,
                job.health.status,
                job.health.rate_limit_seconds,
                job.blocked_attempts,
            )
        })?;
        if !applied {
            tracing::debug!(domain = %domain, "Health not persisted, site was disabled");
        }
        Ok(())
    }

    /// Observes a record and hands it to the sink if it is new or changed
    async fn record(
        &self,
        domain: &str,
        url: String,
        fields: BTreeMap<String, String>,
        job: &mut JobState,
    ) -> Result<()> {
        let hash = content_hash(&fields);
        let kind = self.with_store(|s| incremental::observe(s, domain, &url, &hash))?;

        match kind {
            ChangeKind::New => job.counts.new_count += 1,
            ChangeKind::Updated => job.counts.updated_count += 1,
            ChangeKind::Unchanged => job.counts.unchanged_count += 1,
        }
        if !kind.is_emitted() {
            return Ok(());
        }

        tracing::trace!(domain = %domain, url = %url, kind = %kind, "Emitting record");
        let record = ExtractedRecord {
            domain: domain.to_string(),
            url,
            fields,
            change_kind: kind,
        };

        match self.sink.emit(&record).await {
            Ok(true) => {}
            Ok(false) => {
                job.sink_failures += 1;
                tracing::warn!(domain = %domain, url = %record.url, "Sink declined record");
            }
            Err(e) => {
                job.sink_failures += 1;
                tracing::warn!(domain = %domain, url = %record.url, "Sink failed: {}", e);
            }
        }
        Ok(())
    }
}
