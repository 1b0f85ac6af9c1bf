//! Turns a site analysis into a persisted crawl configuration

use crate::config::Config;
use crate::site::{CrawlMode, Pagination, SiteAnalysis, SiteConfig};
use crate::state::SiteStatus;
use chrono::{DateTime, Utc};

/// Generates the crawl configuration of an analyzed site
///
/// # Arguments
///
/// * `analysis` - The accepted analysis
/// * `existing` - The site's current configuration, when re-analyzing
/// * `config` - Global configuration (rate-limit floor, per-site worker cap)
/// * `now` - Timestamp for `created_at`/`updated_at`
///
/// # Returns
///
/// A new configuration. For an existing site only the structural fields are
/// replaced; operator and health state is carried over. Pure: the same inputs
/// always give the same output.
pub fn generate_config(
    analysis: &SiteAnalysis,
    existing: Option<&SiteConfig>,
    config: &Config,
    now: DateTime<Utc>,
) -> SiteConfig {
    let floor = config.rate_limit.floor_seconds;
    let suggested = analysis.suggested_rate_limit_seconds;
    let rate_limit_seconds = if suggested.is_nan() {
        floor
    } else {
        suggested.max(floor)
    };

    let max_workers = analysis
        .suggested_workers
        .min(config.orchestrator.per_site_worker_cap)
        .max(1);

    let pagination = Pagination {
        pattern: analysis.pagination_pattern.clone(),
        max_pages: analysis.max_pages.max(1),
    };

    match existing {
        None => SiteConfig {
            domain: analysis.domain.clone(),
            base_url: analysis.base_url.clone(),
            selectors: analysis.selectors(),
            pagination,
            rate_limit_seconds,
            max_workers,
            crawl_frequency: analysis.recommended_frequency,
            mode: CrawlMode::Full,
            enabled: true,
            status: SiteStatus::Active,
            quality_score: analysis.quality_score,
            quality_history: Vec::new(),
            blocked_attempts: 0,
            last_full_crawl_at: None,
            last_incremental_crawl_at: None,
            created_at: now,
            updated_at: now,
        },
        Some(current) => {
            let mut quality_history = current.quality_history.clone();
            if current.quality_score != analysis.quality_score {
                quality_history.push(current.quality_score);
            }

            let mode = if current.last_full_crawl_at.is_some() {
                CrawlMode::Incremental
            } else {
                CrawlMode::Full
            };

            SiteConfig {
                domain: current.domain.clone(),
                base_url: analysis.base_url.clone(),
                selectors: analysis.selectors(),
                pagination,
                rate_limit_seconds,
                max_workers,
                crawl_frequency: analysis.recommended_frequency,
                mode,
                enabled: current.enabled,
                status: current.status,
                quality_score: analysis.quality_score,
                quality_history,
                blocked_attempts: current.blocked_attempts,
                last_full_crawl_at: current.last_full_crawl_at,
                last_incremental_crawl_at: current.last_incremental_crawl_at,
                created_at: current.created_at,
                updated_at: now,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::fast_config;
    use crate::site::{CrawlFrequency, PaginationPattern};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn analysis() -> SiteAnalysis {
        SiteAnalysis {
            domain: "homes.example".to_string(),
            base_url: "https://homes.example/list".to_string(),
            property_card_selector: "li.listing".to_string(),
            link_selector: "a@href".to_string(),
            field_selectors: BTreeMap::from([("price".to_string(), ".price".to_string())]),
            detail_selectors: BTreeMap::new(),
            pagination_pattern: PaginationPattern::QueryParam {
                param: "p".to_string(),
                start: 1,
            },
            max_pages: 30,
            quality_score: 9.2,
            suggested_rate_limit_seconds: 1.5,
            suggested_workers: 12,
            recommended_frequency: CrawlFrequency::Hourly,
            inference_quality_hint: None,
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_first_generation() {
        let config = fast_config();
        let site = generate_config(&analysis(), None, &config, at(8));

        assert_eq!(site.domain, "homes.example");
        assert_eq!(site.mode, CrawlMode::Full);
        assert_eq!(site.status, SiteStatus::Active);
        assert!(site.enabled);
        assert_eq!(site.rate_limit_seconds, 1.5);
        assert_eq!(site.max_workers, config.orchestrator.per_site_worker_cap);
        assert_eq!(site.pagination.max_pages, 30);
        assert_eq!(site.crawl_frequency, CrawlFrequency::Hourly);
        assert_eq!(site.created_at, at(8));
    }

    #[test]
    fn test_rate_limit_never_below_floor() {
        let config = fast_config();
        let mut a = analysis();
        a.suggested_rate_limit_seconds = 0.0;
        assert_eq!(
            generate_config(&a, None, &config, at(8)).rate_limit_seconds,
            config.rate_limit.floor_seconds
        );

        a.suggested_rate_limit_seconds = f64::NAN;
        assert_eq!(
            generate_config(&a, None, &config, at(8)).rate_limit_seconds,
            config.rate_limit.floor_seconds
        );
    }

    #[test]
    fn test_workers_at_least_one() {
        let mut a = analysis();
        a.suggested_workers = 0;
        assert_eq!(
            generate_config(&a, None, &fast_config(), at(8)).max_workers,
            1
        );
    }

    #[test]
    fn test_generation_is_idempotent() {
        let config = fast_config();
        let first = generate_config(&analysis(), None, &config, at(8));
        let again = generate_config(&analysis(), None, &config, at(8));
        assert_eq!(first, again);

        let regenerated = generate_config(&analysis(), Some(&first), &config, at(8));
        assert_eq!(regenerated, first);
    }

    #[test]
    fn test_regeneration_preserves_operator_state() {
        let config = fast_config();
        let mut current = generate_config(&analysis(), None, &config, at(8));
        current.enabled = false;
        current.status = SiteStatus::Blocked;
        current.blocked_attempts = 2;
        current.quality_score = 6.0;
        current.quality_history = vec![7.0];
        current.last_full_crawl_at = Some(at(9));

        let mut a = analysis();
        a.property_card_selector = "article.listing".to_string();
        let site = generate_config(&a, Some(&current), &config, at(10));

        assert_eq!(site.selectors.card, "article.listing");
        assert!(!site.enabled);
        assert_eq!(site.status, SiteStatus::Blocked);
        assert_eq!(site.blocked_attempts, 2);
        assert_eq!(site.quality_score, 9.2);
        assert_eq!(site.quality_history, vec![7.0, 6.0]);
        assert_eq!(site.mode, CrawlMode::Incremental);
        assert_eq!(site.last_full_crawl_at, Some(at(9)));
        assert_eq!(site.created_at, at(8));
        assert_eq!(site.updated_at, at(10));
    }
}
