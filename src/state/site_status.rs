/// Site status definitions and the transitions between them
///
/// A site's status is persisted with its config and drives scheduling: the
/// orchestrator skips terminal sites and stops a running job early once the
/// site is blocked.
use std::fmt;

/// Health status of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteStatus {
    /// Crawled normally
    Active,

    /// Soft rate limit observed, crawled with a longer delay
    RateLimited,

    /// Hard block observed; the next run tries the site once more
    Blocked,

    /// Blocked for too many consecutive crawl attempts
    Failed,

    /// Not crawled until an operator enables the site again
    Disabled,
}

/// Inputs that move a site between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
    /// `soft_slowdown` or a single 429
    Soft,

    /// Challenge, CAPTCHA, IP block or repeated 429s
    Hard,

    /// The recovery threshold of consecutive clean fetches was reached
    CleanStreak,

    /// Too many consecutive crawl attempts ended blocked
    BlockedAttemptsExhausted,

    /// A failed site is taken out of rotation
    AutoDisable,

    OperatorDisable,
    OperatorEnable,
}

impl SiteStatus {
    /// Returns the status after `signal`
    ///
    /// `Disabled` only leaves through [`StatusSignal::OperatorEnable`], and
    /// `Failed` only moves on to `Disabled`.
    pub fn next(self, signal: StatusSignal) -> SiteStatus {
        use SiteStatus::*;
        use StatusSignal::*;

        match (self, signal) {
            (_, OperatorEnable) => Active,
            (_, OperatorDisable) => Disabled,
            (Disabled, _) => Disabled,
            (Failed, AutoDisable) => Disabled,
            (Failed, _) => Failed,

            (Active, Soft) => RateLimited,
            (RateLimited, Soft) => RateLimited,
            (Blocked, Soft) => Blocked,

            (Active | RateLimited | Blocked, Hard) => Blocked,

            (Active, CleanStreak) => Active,
            (RateLimited, CleanStreak) => Active,
            (Blocked, CleanStreak) => RateLimited,

            (Blocked, BlockedAttemptsExhausted) => Failed,
            (status, BlockedAttemptsExhausted) => status,
            (status, AutoDisable) => status,
        }
    }

    /// Returns true if the orchestrator never schedules a site in this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Disabled)
    }

    /// Returns true if a running job must stop once the site reaches this status
    pub fn stops_crawl(&self) -> bool {
        matches!(self, Self::Blocked | Self::Failed | Self::Disabled)
    }

    /// Converts the status to a database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::RateLimited => "rate_limited",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Disabled => "disabled",
        }
    }

    /// Parses a status from a database string representation
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "rate_limited" => Some(Self::RateLimited),
            "blocked" => Some(Self::Blocked),
            "failed" => Some(Self::Failed),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }

    pub fn all_statuses() -> [Self; 5] {
        [
            Self::Active,
            Self::RateLimited,
            Self::Blocked,
            Self::Failed,
            Self::Disabled,
        ]
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}
