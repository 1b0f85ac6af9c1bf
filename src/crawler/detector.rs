//! Rate limit and block detection
//!
//! Classifies fetched responses into rate-limit events and suggests how long a
//! site's pipeline should pause. The detector is synchronous and keeps no
//! per-site state: the caller passes the site's current delay and the number
//! of recent events, and records the event itself.

use crate::config::RateLimitConfig;
use crate::crawler::fetcher::FetchResponse;
use chrono::{DateTime, Utc};
use regex::RegexSet;
use std::fmt;
use std::time::Duration;

/// Only the start of a body is scanned for markers
const MAX_SCAN_BYTES: usize = 64 * 1024;

const CLOUDFLARE_MARKERS: &[&str] = &[
    r"cf-browser-verification",
    r"challenge-platform",
    r"cf_chl_",
    r"just a moment\.\.\.",
    r"checking (if the site connection is secure|your browser)",
    r"attention required! \| cloudflare",
];

const CAPTCHA_MARKERS: &[&str] = &[
    r"g-recaptcha",
    r"h-captcha",
    r"hcaptcha\.com/1/api\.js",
    r"recaptcha/api\.js",
    r"verify (that )?you are (a )?human",
    r"are you a robot",
    r"px-captcha",
];

const IP_BLOCK_MARKERS: &[&str] = &[
    r"access denied",
    r"your ip( address)?\b.{0,40}\b(has been |is )?(blocked|banned|blacklisted)",
    r"request (was )?blocked",
    r"forbidden: you don't have permission",
];

const SLOWDOWN_MARKERS: &[&str] = &[
    r"slow down",
    r"too many requests",
    r"rate limit(ed)? exceeded",
    r"you are being rate limited",
];

/// Kind of rate-limit or block signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Http429,
    CloudflareChallenge,
    Captcha,
    IpBlock,
    SoftSlowdown,
}

impl EventType {
    /// Returns true for signals that block a site outright
    pub fn is_hard(&self) -> bool {
        matches!(self, Self::CloudflareChallenge | Self::Captcha | Self::IpBlock)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Http429 => "http_429",
            Self::CloudflareChallenge => "cloudflare_challenge",
            Self::Captcha => "captcha",
            Self::IpBlock => "ip_block",
            Self::SoftSlowdown => "soft_slowdown",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "http_429" => Some(Self::Http429),
            "cloudflare_challenge" => Some(Self::CloudflareChallenge),
            "captcha" => Some(Self::Captcha),
            "ip_block" => Some(Self::IpBlock),
            "soft_slowdown" => Some(Self::SoftSlowdown),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// Outcome of classifying one response
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// `None` for a clean response
    pub event: Option<EventType>,
    /// Pause suggested for the site, set whenever `event` is
    pub backoff: Option<Duration>,
    /// Parsed `Retry-After`, in whole seconds
    pub retry_after_seconds: Option<u64>,
}

impl Classification {
    pub fn clean() -> Self {
        Self {
            event: None,
            backoff: None,
            retry_after_seconds: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.event.is_none()
    }
}

/// Classifies responses with precompiled marker sets
pub struct RateLimitDetector {
    config: RateLimitConfig,
    cloudflare: RegexSet,
    captcha: RegexSet,
    ip_block: RegexSet,
    slowdown: RegexSet,
}

impl RateLimitDetector {
    pub fn new(config: RateLimitConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            config,
            cloudflare: marker_set(CLOUDFLARE_MARKERS)?,
            captcha: marker_set(CAPTCHA_MARKERS)?,
            ip_block: marker_set(IP_BLOCK_MARKERS)?,
            slowdown: marker_set(SLOWDOWN_MARKERS)?,
        })
    }

    /// Returns the event type a response represents, if any
    ///
    /// Rules are checked in order: 429, Cloudflare challenge, CAPTCHA, IP block,
    /// soft slowdown. Text markers for CAPTCHAs, blocks and slowdowns only
    /// count on error statuses, so a listing that embeds a reCAPTCHA contact
    /// form or happens to say "slow down" is not a signal.
    pub fn detect(&self, response: &FetchResponse) -> Option<EventType> {
        if response.status == 429 {
            return Some(EventType::Http429);
        }

        let body = scan_window(&response.body).to_lowercase();
        let is_error = response.status >= 400;

        if is_cloudflare_challenge(response, &body, &self.cloudflare) {
            return Some(EventType::CloudflareChallenge);
        }

        if is_error && self.captcha.is_match(&body) {
            return Some(EventType::Captcha);
        }

        if is_error && self.ip_block.is_match(&body) {
            return Some(EventType::IpBlock);
        }

        let throttled_503 = response.status == 503 && response.header("retry-after").is_some();
        if throttled_503 || (is_error && self.slowdown.is_match(&body)) {
            return Some(EventType::SoftSlowdown);
        }

        None
    }

    /// Classifies a response and suggests a backoff
    ///
    /// # Arguments
    ///
    /// * `response` - The fetched response
    /// * `seed_seconds` - The site's current `rate_limit_seconds`
    /// * `recent_events` - Events recorded for the site inside the event window
    pub fn classify(
        &self,
        response: &FetchResponse,
        seed_seconds: f64,
        recent_events: u32,
    ) -> Classification {
        self.classify_at(response, seed_seconds, recent_events, Utc::now())
    }

    /// Same as [`classify`](Self::classify) with an explicit clock for HTTP-date `Retry-After`
    pub fn classify_at(
        &self,
        response: &FetchResponse,
        seed_seconds: f64,
        recent_events: u32,
        now: DateTime<Utc>,
    ) -> Classification {
        let Some(event) = self.detect(response) else {
            return Classification::clean();
        };

        let retry_after = response
            .header("retry-after")
            .and_then(|value| parse_retry_after(value, now));

        let backoff = match retry_after {
            Some(seconds) => Duration::from_secs(seconds).min(self.config.backoff_ceiling()),
            None => {
                let steps = recent_events + u32::from(event.is_hard());
                self.suggest_backoff(seed_seconds, steps)
            }
        };

        Classification {
            event: Some(event),
            backoff: Some(backoff),
            retry_after_seconds: retry_after,
        }
    }

    /// `min(seed × multiplier^(k+1), ceiling)` with the seed raised to the floor
    ///
    /// Non-decreasing in `recent_events`.
    pub fn suggest_backoff(&self, seed_seconds: f64, recent_events: u32) -> Duration {
        let seed = if seed_seconds.is_finite() {
            seed_seconds.max(self.config.floor_seconds)
        } else {
            self.config.floor_seconds
        };
        let exponent = recent_events.saturating_add(1).min(64) as i32;
        let seconds = seed * self.config.backoff_multiplier.powi(exponent);
        let ceiling = self.config.backoff_ceiling_seconds;
        let seconds = if seconds.is_finite() {
            seconds.min(ceiling)
        } else {
            ceiling
        };
        Duration::from_secs_f64(seconds)
    }
}

fn marker_set(patterns: &[&str]) -> Result<RegexSet, regex::Error> {
    RegexSet::new(patterns.iter().map(|p| format!("(?i){}", p)))
}

fn scan_window(body: &str) -> &str {
    if body.len() <= MAX_SCAN_BYTES {
        return body;
    }
    let mut end = MAX_SCAN_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

fn is_cloudflare_challenge(response: &FetchResponse, body: &str, markers: &RegexSet) -> bool {
    if response
        .header("cf-mitigated")
        .is_some_and(|v| v.eq_ignore_ascii_case("challenge"))
    {
        return true;
    }

    let behind_cloudflare = response.header("cf-ray").is_some()
        || response.header("cf-mitigated").is_some()
        || response
            .header("server")
            .is_some_and(|v| v.to_ascii_lowercase().contains("cloudflare"));

    behind_cloudflare && markers.is_match(body)
}

/// Parses `Retry-After` as delta-seconds or an HTTP-date
///
/// Dates in the past yield zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - now;
    Some(delta.num_seconds().max(0) as u64)
}
