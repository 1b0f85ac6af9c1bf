//! Run reports and operator listings
//!
//! This module provides the per-site summaries produced by an orchestrator
//! run and the plain-text listings printed by the CLI.

use crate::site::{CrawlMode, SiteConfig};
use crate::state::SiteStatus;
use crate::storage::{CrawlJobRecord, JobCounts, RateLimitEvent};
use std::fmt;

/// How a site's part of a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum SiteOutcome {
    /// The walk finished
    Completed,
    /// The site was disabled while its job ran
    Cancelled,
    /// The walk stopped because the site became blocked or failed
    Stopped(SiteStatus),
    /// The job could not run (bad selectors, aborted run)
    Failed(String),
    /// No job was started
    Skipped(String),
}

impl SiteOutcome {
    /// Returns true if the outcome counts against the run's exit code
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Stopped(_) | Self::Failed(_))
    }
}

impl fmt::Display for SiteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Stopped(status) => write!(f, "stopped ({})", status),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            Self::Skipped(reason) => write!(f, "skipped: {}", reason),
        }
    }
}

/// Summary of one site within a run
#[derive(Debug, Clone)]
pub struct SiteReport {
    pub domain: String,
    pub mode: CrawlMode,
    pub job_id: Option<i64>,
    pub outcome: SiteOutcome,
    pub counts: JobCounts,

    /// Cards skipped because their record link could not be resolved
    pub unlinked_cards: u32,

    /// Records the sink failed or declined to take
    pub sink_failures: u32,

    /// Status after the job settled, if it ran
    pub status: Option<SiteStatus>,

    pub rate_limit_seconds: Option<f64>,
    pub quality_score: Option<f64>,
    pub needs_reanalysis: bool,
}

impl SiteReport {
    /// A site for which no job was started
    pub fn skipped(domain: &str, mode: CrawlMode, reason: impl Into<String>) -> Self {
        Self {
            domain: domain.to_string(),
            mode,
            job_id: None,
            outcome: SiteOutcome::Skipped(reason.into()),
            counts: JobCounts::default(),
            unlinked_cards: 0,
            sink_failures: 0,
            status: None,
            rate_limit_seconds: None,
            quality_score: None,
            needs_reanalysis: false,
        }
    }

    /// A site whose task ended without a usable job result
    pub fn failed(domain: &str, mode: CrawlMode, reason: impl Into<String>) -> Self {
        Self {
            outcome: SiteOutcome::Failed(reason.into()),
            ..Self::skipped(domain, mode, "")
        }
    }
}

/// Overall result of a run, mapped to the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    PartialSuccess,
    TotalFailure,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::PartialSuccess => 2,
            Self::TotalFailure => 1,
        }
    }
}

/// Everything a run produced
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub sites: Vec<SiteReport>,

    /// Set when a store failure aborted the run
    pub aborted: Option<String>,

    /// Stale `running` jobs closed before the run started
    pub abandoned_jobs: usize,
}

impl RunReport {
    pub fn site(&self, domain: &str) -> Option<&SiteReport> {
        self.sites.iter().find(|s| s.domain == domain)
    }

    /// Sums the counters of every site
    pub fn totals(&self) -> JobCounts {
        self.sites.iter().fold(JobCounts::default(), |mut acc, s| {
            acc.pages_crawled += s.counts.pages_crawled;
            acc.pages_skipped += s.counts.pages_skipped;
            acc.parse_misses += s.counts.parse_misses;
            acc.new_count += s.counts.new_count;
            acc.updated_count += s.counts.updated_count;
            acc.unchanged_count += s.counts.unchanged_count;
            acc.removed_count += s.counts.removed_count;
            acc
        })
    }

    /// Classifies the run
    ///
    /// Only an orchestrator-level fault (an aborted run) is a total failure.
    /// Site failures under a healthy orchestrator make the run a partial
    /// success, even when every attempted site failed.
    pub fn outcome(&self) -> RunOutcome {
        if self.aborted.is_some() {
            return RunOutcome::TotalFailure;
        }

        if self.sites.iter().any(|s| s.outcome.is_failure()) {
            RunOutcome::PartialSuccess
        } else {
            RunOutcome::Success
        }
    }
}

/// Prints a run report to stdout
pub fn print_run_report(report: &RunReport) {
    println!("=== Crawl Run ===\n");

    if report.abandoned_jobs > 0 {
        println!("Closed {} stale running job(s)\n", report.abandoned_jobs);
    }

    for site in &report.sites {
        println!("{} [{}]: {}", site.domain, site.mode, site.outcome);
        if site.job_id.is_none() {
            continue;
        }

        let c = &site.counts;
        println!(
            "  pages: {} crawled, {} skipped, {} parse misses",
            c.pages_crawled, c.pages_skipped, c.parse_misses
        );
        println!(
            "  records: {} new, {} updated, {} unchanged, {} removed",
            c.new_count, c.updated_count, c.unchanged_count, c.removed_count
        );
        if site.unlinked_cards > 0 {
            println!("  cards without a usable link: {}", site.unlinked_cards);
        }
        if site.sink_failures > 0 {
            println!("  sink failures: {}", site.sink_failures);
        }
        if let (Some(status), Some(delay)) = (site.status, site.rate_limit_seconds) {
            println!("  status: {} (delay {:.1}s)", status, delay);
        }
        if site.needs_reanalysis {
            println!(
                "  quality {:.1} is below the re-analysis threshold; run `reanalyze {}`",
                site.quality_score.unwrap_or_default(),
                site.domain
            );
        }
    }

    let totals = report.totals();
    println!();
    println!(
        "Totals: {} pages, {} new, {} updated, {} unchanged, {} removed",
        totals.pages_crawled,
        totals.new_count,
        totals.updated_count,
        totals.unchanged_count,
        totals.removed_count
    );

    if let Some(reason) = &report.aborted {
        println!("Run aborted: {}", reason);
    }
}

/// Prints the site table
///
/// # Arguments
///
/// * `sites` - Site configs, in display order
/// * `reanalysis_threshold` - Flags sites scoring below it
pub fn print_sites(sites: &[SiteConfig], reanalysis_threshold: Option<f64>) {
    if sites.is_empty() {
        println!("No sites configured");
        return;
    }

    println!(
        "{:<32} {:<8} {:<13} {:<12} {:>7} {:>7}  {}",
        "DOMAIN", "ENABLED", "STATUS", "MODE", "DELAY", "QUALITY", "LAST CRAWL"
    );
    for site in sites {
        let last = site
            .last_crawled_at()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        let flag = if site.needs_reanalysis(reanalysis_threshold) {
            "  (re-analysis suggested)"
        } else {
            ""
        };
        println!(
            "{:<32} {:<8} {:<13} {:<12} {:>6.1}s {:>7.1}  {}{}",
            site.domain,
            if site.enabled { "yes" } else { "no" },
            site.status.to_string(),
            site.mode.to_string(),
            site.rate_limit_seconds,
            site.quality_score,
            last,
            flag
        );
    }
}

/// Prints recent crawl jobs
pub fn print_jobs(jobs: &[CrawlJobRecord]) {
    if jobs.is_empty() {
        println!("No crawl jobs recorded");
        return;
    }

    for job in jobs {
        let finished = job
            .completed_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "#{} {} [{}] {} started {} finished {}",
            job.id,
            job.domain,
            job.mode,
            job.status.to_db_string(),
            job.started_at.format("%Y-%m-%d %H:%M:%S"),
            finished
        );
        println!(
            "    pages {} (+{} skipped), new {}, updated {}, unchanged {}, removed {}",
            job.counts.pages_crawled,
            job.counts.pages_skipped,
            job.counts.new_count,
            job.counts.updated_count,
            job.counts.unchanged_count,
            job.counts.removed_count
        );
        if let Some(summary) = &job.error_summary {
            println!("    {}", summary);
        }
    }
}

/// Prints rate limit events, newest first
pub fn print_events(domain: &str, events: &[RateLimitEvent]) {
    if events.is_empty() {
        println!("No rate limit events for {}", domain);
        return;
    }

    println!("Rate limit events for {} ({}):", domain, events.len());
    for event in events {
        let retry_after = event
            .retry_after_seconds
            .map(|s| format!(" retry-after={}s", s))
            .unwrap_or_default();
        let status = event
            .status_code
            .map(|c| format!(" status={}", c))
            .unwrap_or_default();
        println!(
            "  {} {}{}{} {}",
            event.detected_at.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            status,
            retry_after,
            event.url.as_deref().unwrap_or("")
        );
    }
}
