//! Integration tests for site analysis
//!
//! The inference service is a wiremock server answering per attempt number.

use super::*;
use multicrawl::crawler::RunRequest;
use multicrawl::output::MemorySink;
use multicrawl::site::{generate_config, HttpStructureInference, SiteAnalyzer};
use multicrawl::storage::Storage;
use multicrawl::MulticrawlError;
use serde_json::json;
use wiremock::matchers::body_string_contains;

fn answer(card: &str) -> serde_json::Value {
    json!({
        "selectors": {
            "card": card,
            "link": "a.more@href",
            "fields": {"price": "span.price", "title": "h2"}
        },
        "pagination": {"type": "query_param", "param": "page", "start": 1},
        "fields": ["price", "title"],
        "quality_hint": 9.0,
        "suggested_rate_limit_seconds": 0.0001,
        "suggested_workers": 3,
        "recommended_frequency": "daily",
        "max_pages": 10
    })
}

fn analyzer(config: &Config, inference_endpoint: String) -> SiteAnalyzer {
    let inference = HttpStructureInference::new(
        reqwest::Client::new(),
        inference_endpoint,
        Duration::from_secs(5),
    );
    let fetcher = HttpFetcher::new(&config.user_agent).unwrap();
    SiteAnalyzer::new(config, Arc::new(fetcher), Arc::new(inference)).unwrap()
}

#[tokio::test]
async fn test_add_site_then_crawl() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");
    let site = ListingSite::start(vec![cards(1..=12)]).await;

    let inference = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/infer"))
        .and(body_string_contains("\"attempt\":1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer("div.listing-card")))
        .expect(1)
        .mount(&inference)
        .await;
    Mock::given(method("POST"))
        .and(path("/infer"))
        .and(body_string_contains("\"attempt\":2"))
        .and(body_string_contains("div.listing-card"))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer("div.card")))
        .expect(1)
        .mount(&inference)
        .await;

    let analysis = analyzer(&config, format!("{}/infer", inference.uri()))
        .analyze(&site.base_url(), &[])
        .await
        .unwrap();
    assert_eq!(analysis.domain, site.domain());
    assert_eq!(analysis.property_card_selector, "div.card");
    assert!(analysis.quality_score >= 9.0);
    assert_eq!(analysis.inference_quality_hint, Some(9.0));

    let generated = generate_config(&analysis, None, &config, Utc::now());
    assert_eq!(generated.mode, CrawlMode::Full);
    assert_eq!(generated.status, SiteStatus::Active);
    assert_eq!(generated.rate_limit_seconds, config.rate_limit.floor_seconds);
    assert_eq!(generated.max_workers, 3);

    let storage = open_store(&config);
    storage.lock().unwrap().save_site(&generated).unwrap();

    let sink = Arc::new(MemorySink::new());
    let orchestrator = orchestrator(&config, storage, sink.clone());
    let report = orchestrator.run(RunRequest::all()).await.unwrap();
    assert_eq!(report.site(&site.domain()).unwrap().counts.new_count, 12);
    assert_eq!(sink.records().len(), 12);
}

#[tokio::test]
async fn test_analysis_gives_up_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "[analyzer]\nmax-retries = 2\n");
    let site = ListingSite::start(vec![cards(1..=4)]).await;

    let inference = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer("table.rows")))
        .expect(3)
        .mount(&inference)
        .await;

    let err = analyzer(&config, inference.uri())
        .analyze(&site.base_url(), &[])
        .await
        .unwrap_err();
    match err {
        MulticrawlError::AnalysisFailed { domain, reason } => {
            assert_eq!(domain, site.domain());
            assert!(reason.contains("3 attempt(s)"), "reason: {}", reason);
        }
        other => panic!("expected AnalysisFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_blocked_listing_fails_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(403)
                .set_body_string("<html><h1>Access denied</h1><p>Your IP has been blocked</p></html>"),
        )
        .mount(&server)
        .await;

    let inference = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer("div.card")))
        .expect(0)
        .mount(&inference)
        .await;

    let err = analyzer(&config, inference.uri())
        .analyze(&format!("{}/list", server.uri()), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, MulticrawlError::AnalysisFailed { .. }));
    assert!(err.to_string().contains("ip_block"), "error: {}", err);
}

#[tokio::test]
async fn test_detail_samples_reach_inference() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");
    let site = ListingSite::start(vec![cards(1..=4)]).await;
    Mock::given(method("GET"))
        .and(path("/homes/1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("<html><span class=\"beds\">3</span></html>"),
        )
        .mount(&site.server)
        .await;

    let inference = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("class=\\\"beds\\\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer("div.card")))
        .expect(1)
        .mount(&inference)
        .await;

    let analysis = analyzer(&config, inference.uri())
        .analyze(&site.base_url(), &[format!("{}/homes/1", site.server.uri())])
        .await
        .unwrap();
    assert_eq!(analysis.property_card_selector, "div.card");
}
