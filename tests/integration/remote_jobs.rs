//! Start-then-poll operations driven by the scheduler
//!
//! Each item submits an export job and polls it until a download URL is
//! ready. Time is paused, so the ten minute polling deadline runs on the
//! virtual clock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use bulk_runner::engine::scheduler::candidates_from;
use bulk_runner::engine::{
    EngineConfig, PollConfig, PollStatus, PollingOperation, ProgressTracker, RemoteJob, Scheduler,
};
use bulk_runner::output::MemoryResultSink;
use bulk_runner::{AttemptReport, Candidate, FailureKind, ResultStatus, TerminalResult, WorkItem};

/// How the export for one inspection behaves.
#[derive(Debug, Clone, Copy)]
enum Export {
    /// Done on the given (1-based) status check
    ReadyOnCheck(u32),
    /// Stays in progress forever
    Stuck,
    /// The remote side reports failure on the first check
    Fails,
    /// Submission answers 503 once, then the job is ready immediately
    SubmitUnavailableOnce,
    /// The first status check errors, the second reports done
    FlakyStatus,
}

#[derive(Default)]
struct Calls {
    submissions: AtomicU32,
    checks: AtomicU32,
}

#[derive(Clone, Default)]
struct ExportService {
    calls: Arc<Calls>,
}

#[async_trait]
impl RemoteJob<Export> for ExportService {
    type Ticket = AtomicU32;

    async fn start(&self, item: &WorkItem<Export>) -> Result<AtomicU32, AttemptReport> {
        self.calls.submissions.fetch_add(1, Ordering::SeqCst);
        if matches!(item.payload, Export::SubmitUnavailableOnce) && item.attempt_count == 1 {
            return Err(AttemptReport::status(503));
        }
        Ok(AtomicU32::new(0))
    }

    async fn check(
        &self,
        item: &WorkItem<Export>,
        ticket: &AtomicU32,
    ) -> Result<PollStatus<String>, AttemptReport> {
        self.calls.checks.fetch_add(1, Ordering::SeqCst);
        let check = ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let url = format!("https://files.example.com/{}.pdf", item.key);
        Ok(match item.payload {
            Export::ReadyOnCheck(n) if check >= n => PollStatus::Done(url),
            Export::ReadyOnCheck(_) | Export::Stuck => PollStatus::Pending,
            Export::Fails => PollStatus::Failed("renderer crashed".to_string()),
            Export::SubmitUnavailableOnce => PollStatus::Done(url),
            Export::FlakyStatus if check == 1 => return Err(AttemptReport::status(500)),
            Export::FlakyStatus => PollStatus::Done(url),
        })
    }
}

fn config() -> EngineConfig {
    EngineConfig::new("https://api.example.com")
        .with_concurrency(4)
        .with_rate_limit(1_000, Duration::from_secs(60))
}

async fn run(
    exports: Vec<(&str, Export)>,
    operation: Arc<PollingOperation<ExportService>>,
) -> HashMap<String, TerminalResult> {
    let items: Vec<_> = exports
        .into_iter()
        .map(|(key, export)| Candidate::Ready(WorkItem::new(key, export)))
        .collect();
    let mut sink = MemoryResultSink::new();
    let mut tracker = ProgressTracker::default();
    Scheduler::new(&config())
        .run_to_sink(candidates_from(items), operation, &mut sink, &mut tracker)
        .await
        .expect("a stuck export must not abort the run");
    sink.results()
        .iter()
        .map(|result| (result.key.clone(), result.clone()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_stuck_export_fails_only_its_own_item() {
    let service = ExportService::default();
    let operation = Arc::new(PollingOperation::new(service.clone()));

    let started = Instant::now();
    let results = run(
        vec![
            ("INSP-1", Export::ReadyOnCheck(3)),
            ("INSP-2", Export::Stuck),
            ("INSP-3", Export::Fails),
        ],
        operation,
    )
    .await;

    assert_eq!(results.len(), 3);

    let ready = &results["INSP-1"];
    assert_eq!(ready.status, ResultStatus::Success);
    assert_eq!(ready.attempts, 1);
    assert_eq!(ready.message, "https://files.example.com/INSP-1.pdf");

    // Polled well past the 120s request timeout, then given up without a retry
    let stuck = &results["INSP-2"];
    assert_eq!(stuck.status, ResultStatus::Error);
    assert_eq!(stuck.attempts, 1);
    assert_eq!(stuck.failure_kind, Some(FailureKind::DeadlineExceeded));
    assert!(stuck.message.contains("remote job not done"));
    assert!(started.elapsed() >= Duration::from_secs(570));

    let failed = &results["INSP-3"];
    assert_eq!(failed.status, ResultStatus::Error);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.failure_kind, Some(FailureKind::Validation));
    assert!(failed.message.contains("renderer crashed"));

    assert_eq!(service.calls.submissions.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_submission_is_retried() {
    let service = ExportService::default();
    let operation = Arc::new(PollingOperation::new(service.clone()));

    let results = run(vec![("INSP-7", Export::SubmitUnavailableOnce)], operation).await;

    let result = &results["INSP-7"];
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.attempts, 2);
    assert_eq!(service.calls.submissions.load(Ordering::SeqCst), 2);
    assert_eq!(service.calls.checks.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_status_check_keeps_polling() {
    let service = ExportService::default();
    let operation = Arc::new(PollingOperation::new(service.clone()));

    let started = Instant::now();
    let results = run(vec![("INSP-9", Export::FlakyStatus)], operation).await;

    let result = &results["INSP-9"];
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.attempts, 1);
    assert_eq!(service.calls.submissions.load(Ordering::SeqCst), 1);
    assert_eq!(service.calls.checks.load(Ordering::SeqCst), 2);
    // One poll interval between the two checks
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_custom_poll_deadline() {
    let service = ExportService::default();
    let operation = Arc::new(PollingOperation::new(service.clone()).with_poll_config(PollConfig {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(4),
        deadline: Duration::from_secs(20),
    }));

    let started = Instant::now();
    let results = run(vec![("INSP-4", Export::Stuck)], operation).await;

    assert_eq!(
        results["INSP-4"].failure_kind,
        Some(FailureKind::DeadlineExceeded)
    );
    assert!(started.elapsed() <= Duration::from_secs(20));
}
