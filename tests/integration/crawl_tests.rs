//! Integration tests for crawl runs
//!
//! Each test serves one or more listing sites with wiremock and runs the
//! orchestrator end-to-end against a store in a temp dir.

use super::*;
use chrono::Duration as ChronoDuration;
use multicrawl::crawler::{EventType, RunRequest};
use multicrawl::output::{JsonLinesSink, MemorySink, RunOutcome, SiteOutcome};
use multicrawl::storage::{CrawlStateRecord, JobStatus, RecordStatus, Storage};
use multicrawl::ChangeKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

fn save(storage: &Arc<Mutex<SqliteStorage>>, site: &SiteConfig) {
    storage.lock().unwrap().save_site(site).unwrap();
}

fn stored_site(storage: &Arc<Mutex<SqliteStorage>>, domain: &str) -> SiteConfig {
    storage.lock().unwrap().get_site(domain).unwrap().unwrap()
}

#[tokio::test]
async fn test_full_then_incremental_pass() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");
    let site = ListingSite::start(vec![cards(1..=10), cards(11..=20)]).await;

    let storage = open_store(&config);
    save(&storage, &site_config(&site.domain(), &site.base_url()));
    let sink = Arc::new(MemorySink::new());
    let orchestrator = orchestrator(&config, storage.clone(), sink.clone());

    let report = orchestrator.run(RunRequest::all()).await.unwrap();
    assert_eq!(report.outcome(), RunOutcome::Success);
    let first = report.site(&site.domain()).unwrap();
    assert_eq!(first.outcome, SiteOutcome::Completed);
    assert_eq!(first.mode, CrawlMode::Full);
    assert_eq!(first.counts.new_count, 20);
    assert_eq!(sink.records().len(), 20);

    let after_full = stored_site(&storage, &site.domain());
    assert_eq!(after_full.mode, CrawlMode::Incremental);
    assert!(after_full.last_full_crawl_at.is_some());

    // Five new homes appear at the top of the first page
    let mut first_page = cards(101..=105);
    first_page.extend(cards(1..=10));
    site.set_pages(vec![first_page, cards(11..=20)]);

    let report = orchestrator.run(RunRequest::all()).await.unwrap();
    let second = report.site(&site.domain()).unwrap();
    assert_eq!(second.mode, CrawlMode::Incremental);
    assert_eq!(second.counts.new_count, 5);
    assert_eq!(second.counts.updated_count, 0);
    assert_eq!(second.counts.unchanged_count, 20);
    assert_eq!(second.counts.removed_count, 0);

    let records = sink.records();
    assert_eq!(records.len(), 25);
    assert!(records[20..]
        .iter()
        .all(|r| r.change_kind == ChangeKind::New && r.domain == site.domain()));
    assert!(stored_site(&storage, &site.domain())
        .last_incremental_crawl_at
        .is_some());
}

#[tokio::test]
async fn test_retry_after_pauses_site() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");

    let server = MockServer::start().await;
    let first_page_hits = Arc::new(AtomicUsize::new(0));
    let hits = first_page_hits.clone();
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(move |request: &Request| {
            if page_number(request) > 1 {
                return ResponseTemplate::new(200).set_body_string(listing_html(&[]));
            }
            if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "1")
                    .set_body_string("Too Many Requests")
            } else {
                ResponseTemplate::new(200).set_body_string(listing_html(&cards(1..=3)))
            }
        })
        .mount(&server)
        .await;

    let domain = site_domain(&server.uri()).unwrap();
    let storage = open_store(&config);
    save(&storage, &site_config(&domain, &format!("{}/list", server.uri())));
    let orchestrator = orchestrator(&config, storage.clone(), Arc::new(MemorySink::new()));

    let started = Instant::now();
    let report = orchestrator.run(RunRequest::all()).await.unwrap();
    let elapsed = started.elapsed();

    let site_report = report.site(&domain).unwrap();
    assert_eq!(site_report.outcome, SiteOutcome::Completed);
    assert_eq!(site_report.counts.new_count, 3);
    assert_eq!(first_page_hits.load(Ordering::SeqCst), 2);
    assert!(
        elapsed >= Duration::from_secs(1),
        "retried after {:?}, before Retry-After elapsed",
        elapsed
    );

    let stored = stored_site(&storage, &domain);
    assert_eq!(stored.status, SiteStatus::RateLimited);
    assert!(stored.rate_limit_seconds > 0.001);

    let events = storage.lock().unwrap().list_events(&domain, 10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Http429);
    assert_eq!(events[0].retry_after_seconds, Some(1));
    assert_eq!(events[0].status_code, Some(429));
}

#[tokio::test]
async fn test_captcha_site_ends_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_string(
            r#"<html><body><p>Please verify you are human</p><div class="g-recaptcha"></div></body></html>"#,
        ))
        .mount(&server)
        .await;

    let domain = site_domain(&server.uri()).unwrap();
    let storage = open_store(&config);
    save(&storage, &site_config(&domain, &format!("{}/list", server.uri())));
    let orchestrator = orchestrator(&config, storage.clone(), Arc::new(MemorySink::new()));

    let report = orchestrator.run(RunRequest::all()).await.unwrap();
    assert_eq!(
        report.site(&domain).unwrap().outcome,
        SiteOutcome::Stopped(SiteStatus::Blocked)
    );
    assert_eq!(report.outcome(), RunOutcome::PartialSuccess);
    assert_eq!(report.outcome().exit_code(), 2);
    assert_eq!(stored_site(&storage, &domain).status, SiteStatus::Blocked);

    for _ in 0..2 {
        orchestrator.run(RunRequest::all()).await.unwrap();
    }
    let stored = stored_site(&storage, &domain);
    assert_eq!(stored.status, SiteStatus::Disabled);
    assert_eq!(stored.blocked_attempts, 3);

    // Later runs skip the site without touching it
    let report = orchestrator.run(RunRequest::all()).await.unwrap();
    assert!(matches!(
        report.site(&domain).unwrap().outcome,
        SiteOutcome::Skipped(_)
    ));
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);

    {
        let store = storage.lock().unwrap();
        let jobs = store.list_jobs(Some(&domain), 10).unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Failed));
        assert!(jobs
            .iter()
            .all(|j| j.error_summary.as_deref().unwrap().contains("captcha")));
        let events = store.list_events(&domain, 10).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.event_type == EventType::Captcha));
    }

    let enabled = storage
        .lock()
        .unwrap()
        .set_site_enabled(&domain, true)
        .unwrap();
    assert_eq!(enabled.status, SiteStatus::Active);
    assert_eq!(enabled.blocked_attempts, 0);

    orchestrator.run(RunRequest::all()).await.unwrap();
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_full_sweep_removes_only_stale_records() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");
    let site = ListingSite::start(vec![cards(11..=13)]).await;
    let domain = site.domain();

    let storage = open_store(&config);
    save(&storage, &site_config(&domain, &site.base_url()));

    let now = Utc::now();
    {
        let mut store = storage.lock().unwrap();
        let mut seed = |id: u32, days_ago: i64| {
            let seen = now - ChronoDuration::days(days_ago);
            store
                .upsert_crawl_state(&CrawlStateRecord {
                    domain: domain.clone(),
                    url: site.record_url(id),
                    content_hash: format!("hash-{}", id),
                    status: RecordStatus::Active,
                    first_seen_at: seen,
                    last_seen_at: seen,
                })
                .unwrap();
        };
        // Gone from the site for longer than the retention window
        for id in 1..=10 {
            seed(id, 10);
        }
        // Still listed
        for id in 11..=13 {
            seed(id, 10);
        }
        // Not listed, but seen recently
        seed(50, 2);
    }

    let orchestrator = orchestrator(&config, storage.clone(), Arc::new(MemorySink::new()));
    let report = orchestrator
        .run(RunRequest::all().with_mode(CrawlMode::Full))
        .await
        .unwrap();
    assert_eq!(report.site(&domain).unwrap().counts.removed_count, 10);

    let store = storage.lock().unwrap();
    assert_eq!(
        store
            .count_crawl_states(&domain, Some(RecordStatus::Removed))
            .unwrap(),
        10
    );
    for id in 1..=10 {
        let state = store
            .get_crawl_state(&domain, &site.record_url(id))
            .unwrap()
            .unwrap();
        assert_eq!(state.status, RecordStatus::Removed);
    }
    let recent = store
        .get_crawl_state(&domain, &site.record_url(50))
        .unwrap()
        .unwrap();
    assert_eq!(recent.status, RecordStatus::Active);
    let listed = store
        .get_crawl_state(&domain, &site.record_url(12))
        .unwrap()
        .unwrap();
    assert_ne!(listed.status, RecordStatus::Removed);
}

#[tokio::test]
async fn test_incremental_pass_never_sweeps() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");
    let site = ListingSite::start(vec![cards(1..=2)]).await;
    let domain = site.domain();

    let storage = open_store(&config);
    save(&storage, &site_config(&domain, &site.base_url()));
    {
        let old = Utc::now() - ChronoDuration::days(30);
        storage
            .lock()
            .unwrap()
            .upsert_crawl_state(&CrawlStateRecord {
                domain: domain.clone(),
                url: site.record_url(99),
                content_hash: "old".to_string(),
                status: RecordStatus::Active,
                first_seen_at: old,
                last_seen_at: old,
            })
            .unwrap();
    }

    let orchestrator = orchestrator(&config, storage.clone(), Arc::new(MemorySink::new()));
    let report = orchestrator
        .run(RunRequest::all().with_mode(CrawlMode::Incremental))
        .await
        .unwrap();
    assert_eq!(report.site(&domain).unwrap().counts.removed_count, 0);

    let store = storage.lock().unwrap();
    assert_eq!(
        store
            .count_crawl_states(&domain, Some(RecordStatus::Removed))
            .unwrap(),
        0
    );
    // An incremental pass does not count as the site's full crawl
    assert!(store.get_site(&domain).unwrap().unwrap().last_full_crawl_at.is_none());
}

#[tokio::test]
async fn test_one_job_per_site_across_processes() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");
    let site =
        ListingSite::start_with_delay(vec![cards(1..=3)], Duration::from_millis(300)).await;
    let domain = site.domain();

    let first_store = open_store(&config);
    save(&first_store, &site_config(&domain, &site.base_url()));
    // A second connection stands in for another orchestrator process
    let second_store = open_store(&config);

    let first = orchestrator(&config, first_store.clone(), Arc::new(MemorySink::new()));
    let second = orchestrator(&config, second_store, Arc::new(MemorySink::new()));

    let (a, b) = tokio::join!(
        first.run(RunRequest::for_domain(&domain)),
        second.run(RunRequest::for_domain(&domain))
    );
    let outcomes = [
        a.unwrap().site(&domain).unwrap().outcome.clone(),
        b.unwrap().site(&domain).unwrap().outcome.clone(),
    ];

    let completed = outcomes
        .iter()
        .filter(|o| **o == SiteOutcome::Completed)
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, SiteOutcome::Skipped(_)))
        .count();
    assert_eq!((completed, skipped), (1, 1), "outcomes: {:?}", outcomes);

    let jobs = first_store
        .lock()
        .unwrap()
        .list_jobs(Some(&domain), 10)
        .unwrap();
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn test_one_job_per_site_in_process() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");
    let site =
        ListingSite::start_with_delay(vec![cards(1..=3)], Duration::from_millis(200)).await;
    let domain = site.domain();

    let storage = open_store(&config);
    save(&storage, &site_config(&domain, &site.base_url()));
    let orchestrator = orchestrator(&config, storage.clone(), Arc::new(MemorySink::new()));

    let (a, b) = tokio::join!(
        orchestrator.run(RunRequest::all()),
        orchestrator.run(RunRequest::all())
    );
    let skipped = [a.unwrap(), b.unwrap()]
        .iter()
        .filter(|r| matches!(r.site(&domain).unwrap().outcome, SiteOutcome::Skipped(_)))
        .count();
    assert_eq!(skipped, 1);
}

#[tokio::test]
async fn test_operator_disable_cancels_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");
    let pages: Vec<_> = (0..8).map(|p| cards(p * 10 + 1..=p * 10 + 2)).collect();
    let site = ListingSite::start_with_delay(pages, Duration::from_millis(150)).await;
    let domain = site.domain();

    let storage = open_store(&config);
    save(&storage, &site_config(&domain, &site.base_url()));
    let orchestrator = orchestrator(&config, storage.clone(), Arc::new(MemorySink::new()));

    let operator = open_store(&config);
    let operator_domain = domain.clone();
    let disable = async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        operator
            .lock()
            .unwrap()
            .set_site_enabled(&operator_domain, false)
            .unwrap();
    };

    let (report, ()) = tokio::join!(orchestrator.run(RunRequest::all()), disable);
    let site_report = report.unwrap();
    let site_report = site_report.site(&domain).unwrap();
    assert_eq!(site_report.outcome, SiteOutcome::Cancelled);
    assert!(site_report.counts.pages_crawled < 8);

    let store = storage.lock().unwrap();
    let stored = store.get_site(&domain).unwrap().unwrap();
    assert!(!stored.enabled);
    assert_eq!(stored.status, SiteStatus::Disabled);

    let jobs = store.list_jobs(Some(&domain), 1).unwrap();
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert!(jobs[0].error_summary.as_deref().unwrap().contains("cancelled"));
    // A cancelled pass is not a completed crawl
    assert!(stored.last_full_crawl_at.is_none());
}

#[tokio::test]
async fn test_records_written_as_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");
    let site = ListingSite::start(vec![cards(1..=3)]).await;
    let domain = site.domain();

    let storage = open_store(&config);
    save(&storage, &site_config(&domain, &site.base_url()));

    let out = dir.path().join("out").join("records.jsonl");
    let sink = JsonLinesSink::open(&out).await.unwrap();
    let orchestrator = orchestrator(&config, storage, Arc::new(sink));
    orchestrator.run(RunRequest::all()).await.unwrap();

    let content = std::fs::read_to_string(&out).unwrap();
    let lines: Vec<serde_json::Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);

    let first = &lines[0];
    assert_eq!(first["domain"], domain.as_str());
    assert_eq!(first["url"], site.record_url(1).as_str());
    assert_eq!(first["change_kind"], "new");
    assert_eq!(first["fields"]["title"], "Home 1");
    assert_eq!(first["fields"]["price"], "$101000");
}

#[tokio::test]
async fn test_one_failing_site_is_partial_success() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");
    let good = ListingSite::start(vec![cards(1..=2)]).await;
    let bad = ListingSite::start(vec![cards(1..=2)]).await;

    let storage = open_store(&config);
    save(&storage, &site_config(&good.domain(), &good.base_url()));
    let mut broken = site_config(&bad.domain(), &bad.base_url());
    broken.selectors.card = "div[".to_string();
    save(&storage, &broken);

    let orchestrator = orchestrator(&config, storage, Arc::new(MemorySink::new()));
    let report = orchestrator.run(RunRequest::all()).await.unwrap();

    assert_eq!(report.outcome(), RunOutcome::PartialSuccess);
    assert_eq!(report.outcome().exit_code(), 2);
    assert_eq!(
        report.site(&good.domain()).unwrap().outcome,
        SiteOutcome::Completed
    );
    assert!(report.site(&bad.domain()).unwrap().outcome.is_failure());
    assert_eq!(bad.listing_hits().await, 0);
}
