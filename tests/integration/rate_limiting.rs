//! Integration tests for rate limiting

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use bulk_runner::engine::scheduler::{candidates_from, FnOperation};
use bulk_runner::engine::{EngineConfig, ProgressTracker, RateLimiter, Scheduler};
use bulk_runner::output::MemoryResultSink;
use bulk_runner::{AttemptReport, Candidate, ResultStatus, WorkItem};

fn items(n: usize) -> Vec<Candidate<usize>> {
    (0..n)
        .map(|i| Candidate::Ready(WorkItem::new(format!("item-{i:04}"), i)))
        .collect()
}

#[test]
fn test_rate_limiter_headroom_initialization() {
    let limiter = RateLimiter::with_headroom(100, 0.8, Duration::from_secs(1));
    assert_eq!(limiter.max_permits(), 80);
    assert_eq!(limiter.window(), Duration::from_secs(1));

    // A zero ceiling would deadlock every caller
    assert_eq!(RateLimiter::new(0, Duration::from_secs(1)).max_permits(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limiter_headroom_spreads_requests() {
    let limiter = RateLimiter::with_headroom(100, 0.8, Duration::from_secs(1));
    let started = Instant::now();
    for _ in 0..200 {
        limiter.acquire().await;
    }
    // 80 at 0s, 80 at 1s, the last 40 at 2s
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_1000_items_at_500_per_minute() {
    let issued = Arc::new(Mutex::new(Vec::with_capacity(1_000)));
    let recorder = issued.clone();
    let operation = Arc::new(FnOperation::new(move |_item: WorkItem<usize>| {
        recorder.lock().unwrap().push(Instant::now());
        async { AttemptReport::ok() }
    }));

    let config = EngineConfig::new("https://api.example.com")
        .with_concurrency(12)
        .with_rate_limit(500, Duration::from_secs(60));
    let mut sink = MemoryResultSink::new();
    let mut tracker = ProgressTracker::default().with_total(Some(1_000));

    let started = Instant::now();
    let summary = Scheduler::new(&config)
        .run_to_sink(candidates_from(items(1_000)), operation, &mut sink, &mut tracker)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summary.succeeded, 1_000);
    assert_eq!(sink.results().len(), 1_000);
    assert!(elapsed >= Duration::from_secs(60), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(120), "elapsed {elapsed:?}");

    let mut issued = issued.lock().unwrap().clone();
    issued.sort();
    assert_eq!(issued.len(), 1_000);
    for i in 500..issued.len() {
        assert!(
            issued[i] - issued[i - 500] >= Duration::from_secs(60),
            "more than 500 calls within 60s ending at call {i}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_bound_is_respected() {
    let active = Arc::new(AtomicU64::new(0));
    let peak = Arc::new(AtomicU64::new(0));
    let (active_op, peak_op) = (active.clone(), peak.clone());
    let operation = Arc::new(FnOperation::new(move |_item: WorkItem<usize>| {
        let active = active_op.clone();
        let peak = peak_op.clone();
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(250)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            AttemptReport::ok()
        }
    }));

    let config = EngineConfig::new("https://api.example.com")
        .with_concurrency(5)
        .with_rate_limit(10_000, Duration::from_secs(60));
    let mut sink = MemoryResultSink::new();
    let mut tracker = ProgressTracker::default();
    let summary = Scheduler::new(&config)
        .run_to_sink(candidates_from(items(60)), operation, &mut sink, &mut tracker)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 60);
    assert_eq!(peak.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn test_server_cooldown_pauses_other_workers() {
    let started = Instant::now();
    let calls: Arc<Mutex<HashMap<String, Vec<Duration>>>> = Arc::new(Mutex::new(HashMap::new()));
    let recorder = calls.clone();
    let operation = Arc::new(FnOperation::new(move |item: WorkItem<usize>| {
        let offset = started.elapsed();
        let attempt = {
            let mut calls = recorder.lock().unwrap();
            let entry = calls.entry(item.key.clone()).or_default();
            entry.push(offset);
            entry.len()
        };
        async move {
            match (item.payload, attempt) {
                (0, 1) => AttemptReport::Response {
                    status: 429,
                    retry_after: Some(Duration::from_secs(5)),
                    message: None,
                },
                (1, _) => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    AttemptReport::ok()
                }
                _ => AttemptReport::ok(),
            }
        }
    }));

    let config = EngineConfig::new("https://api.example.com")
        .with_concurrency(2)
        .with_rate_limit(1_000, Duration::from_secs(60));
    let mut sink = MemoryResultSink::new();
    let mut tracker = ProgressTracker::default();
    let summary = Scheduler::new(&config)
        .run_to_sink(candidates_from(items(3)), operation, &mut sink, &mut tracker)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 3);
    assert!(sink.results().iter().all(|r| r.status == ResultStatus::Success));

    let calls = calls.lock().unwrap();
    // item-0002 waited for the slot held by item-0001, then for the cool-down
    let third = calls["item-0002"][0];
    assert!(third >= Duration::from_secs(5), "third item started at {third:?}");
    assert!(calls["item-0000"][1] >= Duration::from_secs(5));
}
