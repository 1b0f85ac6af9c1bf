//! Site analysis
//!
//! Fetches a listing page and a few samples, asks the inference collaborator
//! for a structure, validates the answer against the samples and scores it.
//! Rejected answers are retried a bounded number of times with feedback.

use crate::config::{AnalyzerConfig, Config, OrchestratorConfig};
use crate::crawler::extractor::{capture_cards, extract_detail, CardCaptures, Capture};
use crate::crawler::{fetch_with_retry, CompiledSelectors, Fetcher, RateLimitDetector};
use crate::site::inference::{InferenceRequest, InferredStructure, PageSample, StructureInference};
use crate::site::{PaginationPattern, SiteAnalysis};
use crate::url::{normalize_url, site_domain};
use crate::{MulticrawlError, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// Components of a quality score
#[derive(Debug, Clone, PartialEq)]
pub struct QualityBreakdown {
    /// Cards matched by the card selector on the listing sample
    pub cards: usize,
    pub match_rate: f64,
    pub field_coverage: f64,
    pub cleanliness: f64,
    /// `10 × (0.4·match_rate + 0.3·field_coverage + 0.3·cleanliness)`, one decimal
    pub score: f64,
}

/// Scores a site's selectors against its samples
///
/// # Arguments
///
/// * `listing_html` - The listing page sample
/// * `detail_htmls` - Detail page samples, used for detail-field coverage
/// * `compiled` - The selectors under test
/// * `reported_fields` - Fields inference considers extractable; when empty,
///   the selector field names stand in
///
/// Deterministic: the same inputs always give the same score.
pub fn score_selectors(
    listing_html: &str,
    detail_htmls: &[&str],
    compiled: &CompiledSelectors,
    reported_fields: &[String],
) -> QualityBreakdown {
    let cards = capture_cards(listing_html, compiled);
    let field_names: Vec<&str> = compiled.field_names().collect();

    if cards.is_empty() {
        return QualityBreakdown {
            cards: 0,
            match_rate: 0.0,
            field_coverage: 0.0,
            cleanliness: 0.0,
            score: 0.0,
        };
    }

    let match_rate = match_rate(&cards, &field_names);

    let mut detail_matched: HashSet<String> = HashSet::new();
    for html in detail_htmls {
        detail_matched.extend(extract_detail(html, compiled).into_keys());
    }
    let card_matched: HashSet<&str> = field_names
        .iter()
        .copied()
        .filter(|name| {
            cards
                .iter()
                .any(|card| card.fields.get(*name).is_some_and(Capture::is_match))
        })
        .collect();

    let reported: Vec<&str> = if reported_fields.is_empty() {
        field_names.clone()
    } else {
        reported_fields.iter().map(String::as_str).collect()
    };
    let field_coverage = if reported.is_empty() {
        0.0
    } else {
        let covered = reported
            .iter()
            .filter(|name| card_matched.contains(*name) || detail_matched.contains(**name))
            .count();
        covered as f64 / reported.len() as f64
    };

    let cleanliness = cleanliness(&cards, &field_names);

    let raw = 10.0 * (0.4 * match_rate + 0.3 * field_coverage + 0.3 * cleanliness);
    QualityBreakdown {
        cards: cards.len(),
        match_rate,
        field_coverage,
        cleanliness,
        score: ((raw * 10.0).round() / 10.0).clamp(0.0, 10.0),
    }
}

/// Mean over fields of the fraction of cards in which the field matched
fn match_rate(cards: &[CardCaptures], field_names: &[&str]) -> f64 {
    if field_names.is_empty() {
        return 0.0;
    }

    let total: f64 = field_names
        .iter()
        .map(|name| {
            let matched = cards
                .iter()
                .filter(|card| card.fields.get(*name).is_some_and(Capture::is_match))
                .count();
            matched as f64 / cards.len() as f64
        })
        .sum();
    total / field_names.len() as f64
}

/// `1 − (empty_captures + duplicate_cards) / total_captures`
fn cleanliness(cards: &[CardCaptures], field_names: &[&str]) -> f64 {
    let total_captures = cards.len() * field_names.len();
    if total_captures == 0 {
        return 0.0;
    }

    let empty_captures = cards
        .iter()
        .flat_map(|card| card.fields.values())
        .filter(|capture| matches!(capture, Capture::Empty))
        .count();

    let mut seen = HashSet::new();
    let duplicate_cards = cards
        .iter()
        .filter(|card| {
            let tuple: Vec<Option<&str>> = field_names
                .iter()
                .map(|name| card.fields.get(*name).and_then(Capture::value))
                .collect();
            !seen.insert(tuple)
        })
        .count();

    let dirty = (empty_captures + duplicate_cards) as f64 / total_captures as f64;
    (1.0 - dirty).clamp(0.0, 1.0)
}

/// Discovers a site's structure
pub struct SiteAnalyzer {
    config: AnalyzerConfig,
    fetch: OrchestratorConfig,
    fetcher: Arc<dyn Fetcher>,
    inference: Arc<dyn StructureInference>,
    detector: RateLimitDetector,
}

impl SiteAnalyzer {
    /// Creates a new analyzer
    ///
    /// # Arguments
    ///
    /// * `config` - The full configuration (analyzer, fetch and detector settings)
    /// * `fetcher` - Transport for the samples
    /// * `inference` - The structure inference collaborator
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        inference: Arc<dyn StructureInference>,
    ) -> Result<Self> {
        Ok(Self {
            config: config.analyzer.clone(),
            fetch: config.orchestrator.clone(),
            fetcher,
            inference,
            detector: RateLimitDetector::new(config.rate_limit.clone())?,
        })
    }

    /// Analyzes a site from its listing URL
    ///
    /// # Arguments
    ///
    /// * `seed_url` - The listing page
    /// * `sample_urls` - Extra pages (usually detail pages) to show inference
    ///
    /// # Returns
    ///
    /// * `Ok(SiteAnalysis)` - A validated, scored structure
    /// * `Err(MulticrawlError::AnalysisFailed)` - The listing could not be
    ///   fetched, or no answer survived validation within the retry budget
    pub async fn analyze(&self, seed_url: &str, sample_urls: &[String]) -> Result<SiteAnalysis> {
        let seed = normalize_url(seed_url)?;
        let domain = site_domain(seed.as_str())?;
        let failed = |reason: String| MulticrawlError::AnalysisFailed {
            domain: domain.clone(),
            reason,
        };

        tracing::info!(domain = %domain, "Analyzing {}", seed);

        let listing_html = self
            .fetch_sample(seed.as_str())
            .await
            .map_err(|reason| failed(format!("listing page: {}", reason)))?;

        let mut samples = vec![PageSample {
            url: seed.to_string(),
            html: listing_html.clone(),
        }];
        let extra = self.config.max_sample_pages.saturating_sub(1) as usize;
        for url in sample_urls.iter().take(extra) {
            match self.fetch_sample(url).await {
                Ok(html) => samples.push(PageSample {
                    url: url.clone(),
                    html,
                }),
                Err(reason) => {
                    tracing::warn!(domain = %domain, url = %url, "Ignoring sample: {}", reason)
                }
            }
        }

        let attempts = self.config.max_retries + 1;
        let mut feedback: Option<String> = None;

        for attempt in 1..=attempts {
            let request = InferenceRequest {
                domain: domain.clone(),
                samples: samples.clone(),
                attempt,
                feedback: feedback.clone(),
            };

            let structure = match self.inference.infer(&request).await {
                Ok(structure) => structure,
                Err(e) => {
                    tracing::warn!(domain = %domain, attempt, "Inference failed: {}", e);
                    feedback = Some(format!("inference failed: {}", e));
                    continue;
                }
            };

            match self.evaluate(&domain, &seed, &samples, structure) {
                Ok(analysis) => {
                    tracing::info!(
                        domain = %domain,
                        attempt,
                        quality = analysis.quality_score,
                        "Analysis accepted"
                    );
                    return Ok(analysis);
                }
                Err(reason) => {
                    tracing::warn!(domain = %domain, attempt, "Inference answer rejected: {}", reason);
                    feedback = Some(reason);
                }
            }
        }

        Err(failed(format!(
            "no valid structure after {} attempt(s): {}",
            attempts,
            feedback.unwrap_or_default()
        )))
    }

    /// Fetches one sample page, rejecting errors and rate-limit signals
    async fn fetch_sample(&self, url: &str) -> std::result::Result<String, String> {
        let response = fetch_with_retry(
            self.fetcher.as_ref(),
            url,
            self.fetch.fetch_timeout(),
            self.fetch.transient_retries,
            self.fetch.transient_retry_delay(),
        )
        .await
        .map_err(|e| e.to_string())?;

        if let Some(event) = self.detector.detect(&response) {
            return Err(format!("{} detected", event));
        }
        if !response.is_success() {
            return Err(format!("HTTP {}", response.status));
        }
        Ok(response.body)
    }

    /// Validates an inferred structure against the samples
    ///
    /// The `Err` string is fed back to inference on the next attempt.
    fn evaluate(
        &self,
        domain: &str,
        seed: &url::Url,
        samples: &[PageSample],
        structure: InferredStructure,
    ) -> std::result::Result<SiteAnalysis, String> {
        match &structure.pagination {
            PaginationPattern::PathTemplate { template } if !template.contains("{page}") => {
                return Err(format!(
                    "pagination template '{}' has no {{page}} placeholder",
                    template
                ));
            }
            PaginationPattern::QueryParam { param, .. } if param.trim().is_empty() => {
                return Err("pagination query parameter is empty".to_string());
            }
            _ => {}
        }

        let compiled = CompiledSelectors::compile(&structure.selectors, &structure.pagination)
            .map_err(|e| e.to_string())?;

        let listing_html = samples.first().map(|s| s.html.as_str()).unwrap_or_default();
        let details: Vec<&str> = samples.iter().skip(1).map(|s| s.html.as_str()).collect();
        let quality = score_selectors(listing_html, &details, &compiled, &structure.fields);

        if quality.cards == 0 {
            return Err(format!(
                "card selector '{}' matched no element on the listing page",
                structure.selectors.card
            ));
        }

        tracing::debug!(
            domain = %domain,
            cards = quality.cards,
            match_rate = quality.match_rate,
            field_coverage = quality.field_coverage,
            cleanliness = quality.cleanliness,
            "Scored selectors"
        );

        let max_pages = match structure.pagination {
            PaginationPattern::None => 1,
            _ => structure
                .max_pages
                .filter(|p| *p > 0)
                .unwrap_or(self.config.default_max_pages),
        };

        let selectors = structure.selectors;
        Ok(SiteAnalysis {
            domain: domain.to_string(),
            base_url: seed.to_string(),
            property_card_selector: selectors.card,
            link_selector: selectors.link,
            field_selectors: selectors.fields,
            detail_selectors: selectors.detail,
            pagination_pattern: structure.pagination,
            max_pages,
            quality_score: quality.score,
            suggested_rate_limit_seconds: structure
                .suggested_rate_limit_seconds
                .filter(|s| s.is_finite() && *s > 0.0)
                .unwrap_or(self.config.default_rate_limit_seconds),
            suggested_workers: structure
                .suggested_workers
                .filter(|w| *w > 0)
                .unwrap_or(self.config.default_workers),
            recommended_frequency: structure
                .recommended_frequency
                .unwrap_or(self.config.default_frequency),
            inference_quality_hint: structure.quality_hint,
        })
    }
}
