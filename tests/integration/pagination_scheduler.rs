//! A paginated listing feeding the scheduler against a mock server

use futures::StreamExt;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use wiremock::matchers::{header, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bulk_runner::engine::scheduler::FnOperation;
use bulk_runner::engine::{EngineConfig, EngineError, ProgressTracker, RateLimiter, Scheduler};
use bulk_runner::fetcher::{
    ApiHttpClient, ApiRequest, CursorPosition, HttpOperation, JsonPageFetcher, Page, PageCursor,
    PageFetcher, PaginationStyle, Paginator,
};
use bulk_runner::output::MemoryResultSink;
use bulk_runner::{AttemptReport, Candidate, FailureKind, ResultStatus, WorkItem};

fn config(server: &MockServer) -> EngineConfig {
    EngineConfig::new(server.uri())
        .with_token("test_token")
        .with_concurrency(3)
        .with_rate_limit(1_000, Duration::from_secs(60))
        .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
}

/// One audit request per listed account
fn audit_candidate(account: Value) -> Candidate<ApiRequest> {
    let id = account["id"].as_str().unwrap_or_default().to_string();
    let request = ApiRequest::new(Method::POST, format!("/accounts/{id}/audit"))
        .with_body(json!({ "account": id }));
    Candidate::checked(id, request)
}

async fn mount_account_pages(server: &MockServer) {
    let pages = [
        ("0", json!({"data": [{"id": "a1"}, {"id": "a2"}]})),
        ("2", json!({"data": [{"id": "a3"}, {"id": "a4"}]})),
        ("4", json!({"data": [{"id": "a5"}]})),
    ];
    for (offset, body) in pages {
        Mock::given(method("GET"))
            .and(path("/accounts"))
            .and(query_param("offset", offset))
            .and(query_param("limit", "2"))
            .and(header("authorization", "Bearer test_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(server)
            .await;
    }
}

fn account_paginator(
    client: Arc<ApiHttpClient>,
    config: &EngineConfig,
    limiter: Arc<RateLimiter>,
) -> Paginator<Value, JsonPageFetcher> {
    let style = PaginationStyle::offset(2);
    let page_size = style.page_size().unwrap_or(2);
    let fetcher = JsonPageFetcher::new(client, ApiRequest::get("/accounts"), style)
        .with_items_pointer("/data");
    Paginator::new(fetcher, config)
        .with_rate_limiter(limiter)
        .with_page_size(page_size)
}

#[tokio::test]
async fn test_listing_streams_into_scheduler() {
    let server = MockServer::start().await;
    mount_account_pages(&server).await;

    Mock::given(method("POST"))
        .and(path("/accounts/a3/audit"))
        .respond_with(ResponseTemplate::new(503).set_body_string("audit backend busy"))
        .expect(3)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/accounts/a[0-9]+/audit$"))
        .and(header("authorization", "Bearer test_token"))
        .respond_with(ResponseTemplate::new(202))
        .expect(4)
        .mount(&server)
        .await;

    let config = config(&server);
    let client = Arc::new(ApiHttpClient::from_config(&config).unwrap());
    let limiter = Arc::new(RateLimiter::new(config.max_requests, config.rate_window));

    let source = account_paginator(client.clone(), &config, limiter.clone())
        .into_stream()
        .map(|account| account.map(audit_candidate));

    let mut sink = MemoryResultSink::new();
    let mut tracker = ProgressTracker::default();
    let summary = Scheduler::new(&config)
        .with_rate_limiter(limiter.clone())
        .run_to_sink(source, Arc::new(HttpOperation::new(client)), &mut sink, &mut tracker)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failed, 1);

    let failed = sink
        .results()
        .iter()
        .find(|r| r.status == ResultStatus::Error)
        .unwrap();
    assert_eq!(failed.key, "a3");
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.failure_kind, Some(FailureKind::ServerError));
    assert!(failed.message.contains("audit backend busy"));

    // Pages and item attempts draw from the same window: 3 pages, 4 + 3 attempts
    assert_eq!(limiter.snapshot().await.permits_issued_in_window, 10);
}

#[tokio::test]
async fn test_page_failure_keeps_recorded_items() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .and(query_param("offset", "0"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": [{"id": "a1"}, {"id": "a2"}]})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/accounts/a[0-9]+/audit$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = config(&server);
    let client = Arc::new(ApiHttpClient::from_config(&config).unwrap());
    let limiter = Arc::new(RateLimiter::new(config.max_requests, config.rate_window));
    let source = account_paginator(client.clone(), &config, limiter.clone())
        .into_stream()
        .map(|account| account.map(audit_candidate));

    let mut sink = MemoryResultSink::new();
    let mut tracker = ProgressTracker::default();
    let result = Scheduler::new(&config)
        .with_rate_limiter(limiter)
        .run_to_sink(source, Arc::new(HttpOperation::new(client)), &mut sink, &mut tracker)
        .await;

    match result {
        Err(EngineError::PageFetch { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected a page fetch error, got {other:?}"),
    }
    let mut keys: Vec<_> = sink.results().iter().map(|r| r.key.as_str()).collect();
    keys.sort();
    assert_eq!(keys, vec!["a1", "a2"]);
}

#[tokio::test]
async fn test_rejected_first_page_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
        .expect(1)
        .mount(&server)
        .await;

    let config = config(&server);
    let client = Arc::new(ApiHttpClient::from_config(&config).unwrap());
    let limiter = Arc::new(RateLimiter::new(config.max_requests, config.rate_window));
    let source = account_paginator(client.clone(), &config, limiter)
        .into_stream()
        .map(|account| account.map(audit_candidate));

    let mut sink = MemoryResultSink::new();
    let mut tracker = ProgressTracker::default();
    let result = Scheduler::new(&config)
        .run_to_sink(source, Arc::new(HttpOperation::new(client)), &mut sink, &mut tracker)
        .await;

    assert!(matches!(result, Err(EngineError::Unauthorized(_))));
    assert!(sink.results().is_empty());
}

#[tokio::test]
async fn test_link_pagination_collects_all_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/events"))
        .and(query_param("status", "open"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"id": 1}, {"id": 2}],
            "next_page": "/events/page/2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/events/page/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"id": 3}],
            "next_page": null
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = config(&server);
    let client = Arc::new(ApiHttpClient::from_config(&config).unwrap());
    let fetcher = JsonPageFetcher::new(
        client,
        ApiRequest::get("/events").with_query("status", "open"),
        PaginationStyle::Link {
            next_pointer: "/next_page".to_string(),
        },
    )
    .with_items_pointer("/items");

    let items = Paginator::new(fetcher, &config).collect_all().await.unwrap();
    let ids: Vec<_> = items.iter().map(|v| v["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

/// Three pages of two items, each page taking ten seconds to arrive.
#[derive(Default)]
struct SlowPages {
    fetch_started: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait::async_trait]
impl PageFetcher<u32> for SlowPages {
    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Page<u32>, AttemptReport> {
        self.fetch_started.lock().unwrap().push(Instant::now());
        tokio::time::sleep(Duration::from_secs(10)).await;
        let offset = match cursor.position {
            CursorPosition::Offset(offset) => offset,
            _ => 0,
        };
        let items = vec![offset as u32, offset as u32 + 1];
        Ok(if offset >= 4 {
            Page::last(items)
        } else {
            Page::new(items, Some(CursorPosition::Offset(offset + 2)))
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_items_run_while_later_pages_load() {
    let config = EngineConfig::new("https://api.example.com")
        .with_concurrency(4)
        .with_rate_limit(1_000, Duration::from_secs(60));
    let pages = SlowPages::default();
    let fetch_started = pages.fetch_started.clone();
    let executed = Arc::new(Mutex::new(Vec::new()));

    let recorder = executed.clone();
    let operation = Arc::new(FnOperation::new(move |item: WorkItem<u32>| {
        recorder.lock().unwrap().push((item.payload, Instant::now()));
        async { AttemptReport::ok() }
    }));
    let source = Paginator::new(pages, &config)
        .into_stream()
        .map(|n| n.map(|n: u32| Candidate::Ready(WorkItem::new(format!("item-{n}"), n))));

    let started = Instant::now();
    let mut sink = MemoryResultSink::new();
    let mut tracker = ProgressTracker::default();
    let summary = Scheduler::new(&config)
        .run_to_sink(source, operation, &mut sink, &mut tracker)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 6);

    let fetch_started = fetch_started.lock().unwrap().clone();
    let executed = executed.lock().unwrap().clone();
    assert_eq!(fetch_started.len(), 3);
    let first_execution = executed.iter().map(|(_, at)| *at).min().unwrap();
    let last_fetch = *fetch_started.last().unwrap();

    // The first page's items run before the last page is even requested
    assert!(first_execution < last_fetch);
    assert!(first_execution - started >= Duration::from_secs(10));
    assert!(first_execution - started < Duration::from_secs(20));
    assert!(executed
        .iter()
        .filter(|(n, _)| *n < 2)
        .all(|(_, at)| *at < last_fetch));
}
