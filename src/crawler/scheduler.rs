//! Scheduling primitives for the orchestrator
//!
//! This module handles:
//! - Global concurrency limiting via semaphores (site coordinators and fetches)
//! - The in-process single-job-per-site lock
//! - Per-site request pacing and backoff pauses

use crate::config::OrchestratorConfig;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Global budgets shared by every site task of a run
///
/// The scheduler coordinates:
/// - How many site coordinators run at once
/// - How many fetches are in flight across all sites
/// - Which sites currently have a job in this process
#[derive(Clone)]
pub struct Scheduler {
    /// Limits concurrently running site coordinators
    site_slots: Arc<Semaphore>,

    /// Limits in-flight fetches across all sites
    fetch_permits: Arc<Semaphore>,

    locks: SiteLocks,
}

impl Scheduler {
    /// Creates a new scheduler
    ///
    /// # Arguments
    ///
    /// * `config` - The orchestrator configuration
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            site_slots: Arc::new(Semaphore::new(config.max_concurrent_sites.max(1) as usize)),
            fetch_permits: Arc::new(Semaphore::new(config.max_inflight_fetches.max(1) as usize)),
            locks: SiteLocks::default(),
        }
    }

    /// Waits for a site coordinator slot
    ///
    /// Returns `None` only if the semaphore was closed.
    pub async fn acquire_site_slot(&self) -> Option<OwnedSemaphorePermit> {
        self.site_slots.clone().acquire_owned().await.ok()
    }

    /// Waits for a global fetch permit
    pub async fn acquire_fetch_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.fetch_permits.clone().acquire_owned().await.ok()
    }

    /// Number of fetch permits currently free
    pub fn available_fetch_permits(&self) -> usize {
        self.fetch_permits.available_permits()
    }

    /// Takes the in-process lock for `domain`, if no other job holds it
    pub fn try_lock_site(&self, domain: &str) -> Option<SiteGuard> {
        self.locks.try_acquire(domain)
    }
}

/// Set of domains with a job running in this process
#[derive(Clone, Default)]
pub struct SiteLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

fn lock_set(held: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    // The set stays consistent even if a holder panicked mid-insert
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SiteLocks {
    pub fn try_acquire(&self, domain: &str) -> Option<SiteGuard> {
        let mut held = lock_set(&self.held);
        if !held.insert(domain.to_string()) {
            return None;
        }
        Some(SiteGuard {
            held: Arc::clone(&self.held),
            domain: domain.to_string(),
        })
    }

    pub fn is_locked(&self, domain: &str) -> bool {
        lock_set(&self.held).contains(domain)
    }
}

/// Releases the site lock when dropped
pub struct SiteGuard {
    held: Arc<Mutex<HashSet<String>>>,
    domain: String,
}

impl SiteGuard {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Drop for SiteGuard {
    fn drop(&mut self) {
        lock_set(&self.held).remove(&self.domain);
    }
}

#[derive(Debug)]
struct PacerState {
    interval: Duration,
    last_request: Option<Instant>,
    paused_until: Option<Instant>,
}

/// Spaces the requests of one site
///
/// Shared by the site's coordinator and its detail workers, so the delay holds
/// across the whole site pipeline and not per worker. A backoff pause applies
/// to every request of the site issued after it.
#[derive(Debug)]
pub struct SitePacer {
    state: Mutex<PacerState>,
}

impl SitePacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Mutex::new(PacerState {
                interval,
                last_request: None,
                paused_until: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PacerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Earliest instant at which the next request may start
    pub fn ready_at(&self, now: Instant) -> Instant {
        let state = self.state();
        let mut ready = now;
        if let Some(last) = state.last_request {
            ready = ready.max(last + state.interval);
        }
        if let Some(paused_until) = state.paused_until {
            ready = ready.max(paused_until);
        }
        ready
    }

    /// Reserves a request slot at `now`, or reports how long to wait
    fn try_reserve(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.state();
        let mut ready = now;
        if let Some(last) = state.last_request {
            ready = ready.max(last + state.interval);
        }
        if let Some(paused_until) = state.paused_until {
            ready = ready.max(paused_until);
        }

        if ready > now {
            return Err(ready - now);
        }
        state.last_request = Some(now);
        Ok(())
    }

    /// Waits until the site may be requested again and takes the slot
    pub async fn wait_turn(&self) {
        loop {
            match self.try_reserve(Instant::now()) {
                Ok(()) => return,
                Err(wait) => {
                    tracing::trace!(wait_ms = wait.as_millis() as u64, "Pacing site request");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Pauses the site for at least `duration` from `now`
    ///
    /// An existing longer pause is kept.
    pub fn pause_at(&self, now: Instant, duration: Duration) {
        let mut state = self.state();
        let until = now + duration;
        state.paused_until = Some(state.paused_until.map_or(until, |p| p.max(until)));
    }

    pub fn pause_for(&self, duration: Duration) {
        self.pause_at(Instant::now(), duration);
    }

    /// Changes the spacing between requests
    pub fn set_interval(&self, interval: Duration) {
        self.state().interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.state().interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_lock_is_exclusive() {
        let locks = SiteLocks::default();
        let guard = locks.try_acquire("a.com").unwrap();
        assert_eq!(guard.domain(), "a.com");
        assert!(locks.try_acquire("a.com").is_none());
        assert!(locks.try_acquire("b.com").is_some());
        assert!(locks.is_locked("a.com"));

        drop(guard);
        assert!(!locks.is_locked("a.com"));
        assert!(locks.try_acquire("a.com").is_some());
    }

    #[test]
    fn test_pacer_spaces_requests() {
        let pacer = SitePacer::new(Duration::from_secs(2));
        let now = Instant::now();

        assert_eq!(pacer.ready_at(now), now);
        assert!(pacer.try_reserve(now).is_ok());

        assert_eq!(pacer.ready_at(now), now + Duration::from_secs(2));
        assert_eq!(pacer.try_reserve(now), Err(Duration::from_secs(2)));

        let later = now + Duration::from_secs(2);
        assert!(pacer.try_reserve(later).is_ok());
    }

    #[test]
    fn test_pause_delays_next_request() {
        let pacer = SitePacer::new(Duration::from_secs(1));
        let now = Instant::now();
        pacer.try_reserve(now).unwrap();

        pacer.pause_at(now, Duration::from_secs(30));
        assert!(pacer.ready_at(now) >= now + Duration::from_secs(30));

        // A shorter pause does not cut the longer one short
        pacer.pause_at(now, Duration::from_secs(5));
        assert_eq!(pacer.ready_at(now), now + Duration::from_secs(30));
    }

    #[test]
    fn test_set_interval() {
        let pacer = SitePacer::new(Duration::from_secs(1));
        let now = Instant::now();
        pacer.try_reserve(now).unwrap();
        pacer.set_interval(Duration::from_secs(4));
        assert_eq!(pacer.interval(), Duration::from_secs(4));
        assert_eq!(pacer.ready_at(now), now + Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_wait_turn_with_tiny_interval() {
        let pacer = SitePacer::new(Duration::from_millis(5));
        let start = Instant::now();
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_fetch_permits() {
        let config = OrchestratorConfig {
            max_inflight_fetches: 2,
            ..OrchestratorConfig::default()
        };
        let scheduler = Scheduler::new(&config);
        let a = scheduler.acquire_fetch_permit().await.unwrap();
        let _b = scheduler.acquire_fetch_permit().await.unwrap();
        assert_eq!(scheduler.available_fetch_permits(), 0);
        drop(a);
        assert_eq!(scheduler.available_fetch_permits(), 1);
    }
}
