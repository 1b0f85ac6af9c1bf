use crate::config::RateLimitConfig;
use crate::crawler::EventType;
use crate::state::site_status::{SiteStatus, StatusSignal};

/// A status change produced by [`SiteHealth`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SiteStatus,
    pub to: SiteStatus,
}

/// Tracks a site's health for the duration of one crawl job
///
/// Seeded from the persisted config at job start. Every classified response is
/// fed in; the resulting status and delay are written back to the store by the
/// orchestrator after each change.
#[derive(Debug, Clone)]
pub struct SiteHealth {
    /// Current status
    pub status: SiteStatus,

    /// Current delay between requests (seconds)
    pub rate_limit_seconds: f64,

    /// Clean fetches since the last signal or recovery step
    pub consecutive_clean: u32,

    /// Signals observed during this job
    pub signals: u32,

    /// Signals of this job that counted as hard (challenge, CAPTCHA, IP block,
    /// repeated 429s)
    pub hard_signals: u32,
}

impl SiteHealth {
    pub fn new(status: SiteStatus, rate_limit_seconds: f64) -> Self {
        Self {
            status,
            rate_limit_seconds,
            consecutive_clean: 0,
            signals: 0,
            hard_signals: 0,
        }
    }

    /// Records a clean response
    ///
    /// After `recovery_threshold` clean fetches in a row a rate-limited site
    /// steps back to active (and a blocked one to rate-limited), and the delay
    /// decays by `recovery_multiplier`.
    pub fn record_clean(&mut self, config: &RateLimitConfig) -> Option<Transition> {
        self.consecutive_clean += 1;

        if self.consecutive_clean < config.recovery_threshold {
            return None;
        }
        self.consecutive_clean = 0;

        if !matches!(self.status, SiteStatus::RateLimited | SiteStatus::Blocked) {
            return None;
        }

        self.rate_limit_seconds =
            config.clamp_rate_limit(self.rate_limit_seconds * config.recovery_multiplier);
        self.apply(StatusSignal::CleanStreak)
    }

    /// Records a rate-limit signal
    ///
    /// # Arguments
    ///
    /// * `event` - The classified event
    /// * `recent_429s` - 429 events for the site inside the repeated-429
    ///   window, this one included
    /// * `config` - Rate limit thresholds
    pub fn record_signal(
        &mut self,
        event: EventType,
        recent_429s: u32,
        config: &RateLimitConfig,
    ) -> Option<Transition> {
        self.consecutive_clean = 0;
        self.signals += 1;
        self.rate_limit_seconds =
            config.clamp_rate_limit(self.rate_limit_seconds * config.backoff_multiplier);

        let repeated_429 =
            event == EventType::Http429 && recent_429s >= config.repeated_429_threshold;
        let signal = if event.is_hard() || repeated_429 {
            self.hard_signals += 1;
            StatusSignal::Hard
        } else {
            StatusSignal::Soft
        };

        self.apply(signal)
    }

    fn apply(&mut self, signal: StatusSignal) -> Option<Transition> {
        let from = self.status;
        let to = from.next(signal);
        if from == to {
            return None;
        }
        self.status = to;
        Some(Transition { from, to })
    }
}

/// Status and blocked-attempt counter after a crawl attempt ends
///
/// Only an attempt that ends blocked after drawing a hard signal counts as a
/// blocked attempt; reaching `blocked_attempts_before_failure` fails the site,
/// which is then disabled. A blocked site whose attempt drew no signal at all
/// steps back to rate-limited. Soft signals alone leave a blocked site and its
/// counter as they are. Any ending other than blocked resets the counter.
pub fn settle_attempt(
    health: &SiteHealth,
    blocked_attempts: u32,
    config: &RateLimitConfig,
) -> (SiteStatus, u32) {
    let status = health.status;
    if status != SiteStatus::Blocked {
        return (status, 0);
    }
    if health.hard_signals == 0 {
        if health.signals == 0 {
            return (status.next(StatusSignal::CleanStreak), 0);
        }
        return (status, blocked_attempts);
    }

    let attempts = blocked_attempts + 1;
    if attempts < config.blocked_attempts_before_failure {
        return (status, attempts);
    }

    let failed = status.next(StatusSignal::BlockedAttemptsExhausted);
    (failed.next(StatusSignal::AutoDisable), attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig::default()
    }

    #[test]
    fn test_single_429_rate_limits() {
        let cfg = config();
        let mut health = SiteHealth::new(SiteStatus::Active, 2.0);
        let t = health.record_signal(EventType::Http429, 1, &cfg).unwrap();
        assert_eq!(t.from, SiteStatus::Active);
        assert_eq!(t.to, SiteStatus::RateLimited);
        assert_eq!(health.rate_limit_seconds, 4.0);
    }

    #[test]
    fn test_repeated_429s_block() {
        let cfg = config();
        let mut health = SiteHealth::new(SiteStatus::RateLimited, 4.0);
        let t = health.record_signal(EventType::Http429, 3, &cfg).unwrap();
        assert_eq!(t.to, SiteStatus::Blocked);
    }

    #[test]
    fn test_captcha_blocks_active_site() {
        let cfg = config();
        let mut health = SiteHealth::new(SiteStatus::Active, 2.0);
        let t = health.record_signal(EventType::Captcha, 0, &cfg).unwrap();
        assert_eq!(t.to, SiteStatus::Blocked);
    }

    #[test]
    fn test_delay_capped_at_max() {
        let cfg = config();
        let mut health = SiteHealth::new(SiteStatus::RateLimited, 50.0);
        health.record_signal(EventType::SoftSlowdown, 0, &cfg);
        assert_eq!(health.rate_limit_seconds, cfg.max_rate_limit_seconds);
    }

    #[test]
    fn test_recovery_after_clean_streak() {
        let cfg = config();
        let mut health = SiteHealth::new(SiteStatus::RateLimited, 10.0);

        for _ in 0..4 {
            assert!(health.record_clean(&cfg).is_none());
        }
        let t = health.record_clean(&cfg).unwrap();
        assert_eq!(t.to, SiteStatus::Active);
        assert_eq!(health.rate_limit_seconds, 8.0);
        assert_eq!(health.consecutive_clean, 0);
    }

    #[test]
    fn test_signal_resets_clean_streak() {
        let cfg = config();
        let mut health = SiteHealth::new(SiteStatus::RateLimited, 2.0);
        for _ in 0..4 {
            health.record_clean(&cfg);
        }
        health.record_signal(EventType::SoftSlowdown, 0, &cfg);
        assert_eq!(health.consecutive_clean, 0);
        assert!(health.record_clean(&cfg).is_none());
    }

    #[test]
    fn test_recovery_never_below_floor() {
        let cfg = config();
        let mut health = SiteHealth::new(SiteStatus::RateLimited, 1.0);
        for _ in 0..5 {
            health.record_clean(&cfg);
        }
        assert_eq!(health.status, SiteStatus::Active);
        assert_eq!(health.rate_limit_seconds, cfg.floor_seconds);
    }

    #[test]
    fn test_active_site_clean_streak_changes_nothing() {
        let cfg = config();
        let mut health = SiteHealth::new(SiteStatus::Active, 3.0);
        for _ in 0..10 {
            assert!(health.record_clean(&cfg).is_none());
        }
        assert_eq!(health.rate_limit_seconds, 3.0);
    }

    fn blocked_by(event: EventType) -> SiteHealth {
        let mut health = SiteHealth::new(SiteStatus::Active, 2.0);
        health.record_signal(event, 0, &config());
        health
    }

    #[test]
    fn test_settle_attempt_counts_blocked_endings() {
        let cfg = config();
        let health = blocked_by(EventType::Captcha);
        assert_eq!(health.hard_signals, 1);
        assert_eq!(settle_attempt(&health, 0, &cfg), (SiteStatus::Blocked, 1));
        assert_eq!(settle_attempt(&health, 1, &cfg), (SiteStatus::Blocked, 2));
        assert_eq!(settle_attempt(&health, 2, &cfg), (SiteStatus::Disabled, 3));
    }

    #[test]
    fn test_settle_attempt_resets_on_other_endings() {
        let cfg = config();
        let limited = SiteHealth::new(SiteStatus::RateLimited, 4.0);
        assert_eq!(settle_attempt(&limited, 2, &cfg), (SiteStatus::RateLimited, 0));
        let active = SiteHealth::new(SiteStatus::Active, 2.0);
        assert_eq!(settle_attempt(&active, 1, &cfg), (SiteStatus::Active, 0));
    }

    #[test]
    fn test_clean_attempt_on_blocked_site_is_not_counted() {
        let cfg = config();
        let mut health = SiteHealth::new(SiteStatus::Blocked, 8.0);
        health.record_clean(&cfg);
        assert_eq!(settle_attempt(&health, 2, &cfg), (SiteStatus::RateLimited, 0));
    }

    #[test]
    fn test_soft_signals_keep_blocked_attempts() {
        let cfg = config();
        let mut health = SiteHealth::new(SiteStatus::Blocked, 8.0);
        health.record_signal(EventType::SoftSlowdown, 0, &cfg);
        assert_eq!(health.hard_signals, 0);
        assert_eq!(settle_attempt(&health, 2, &cfg), (SiteStatus::Blocked, 2));
    }
}
