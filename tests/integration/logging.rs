//! Integration tests for logging and tracing

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bulk_runner::engine::scheduler::{candidates_from, FnOperation};
use bulk_runner::engine::{EngineConfig, ProgressTracker, Scheduler};
use bulk_runner::output::MemoryResultSink;
use bulk_runner::{AttemptReport, Candidate, WorkItem};

/// Writer collecting formatted log lines in memory
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_tracing_subscriber_initialization() {
    // Either succeeds or fails because already initialized (both are OK)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bulk_runner=debug")),
        )
        .with_test_writer()
        .try_init();

    info!("This is an info message");
    warn!("This is a warning message");
    error!("This is an error message");
}

#[test]
fn test_env_filter_parsing() {
    for directive in [
        "info",
        "bulk_runner=debug",
        "warn,bulk_runner=trace",
        "bulk_runner::engine::scheduler=debug,bulk_runner=info",
    ] {
        assert!(
            EnvFilter::try_new(directive).is_ok(),
            "directive {directive:?} should parse"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_logs_retries_and_summary() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("bulk_runner=info"))
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let operation = Arc::new(FnOperation::new(|item: WorkItem<u32>| async move {
        if item.payload == 1 {
            AttemptReport::status(503)
        } else {
            AttemptReport::ok()
        }
    }));
    let items: Vec<_> = (0..3u32)
        .map(|i| Candidate::Ready(WorkItem::new(format!("INV-{i}"), i)))
        .collect();

    let config = EngineConfig::new("https://api.example.com")
        .with_token("do-not-log-me")
        .with_rate_limit(1_000, Duration::from_secs(60));
    let mut sink = MemoryResultSink::new();
    let mut tracker = ProgressTracker::default();
    Scheduler::new(&config)
        .run_to_sink(candidates_from(items), operation, &mut sink, &mut tracker)
        .await
        .unwrap();

    let text = logs.text();
    assert!(text.contains("Bulk run started"));
    assert!(text.contains("Retrying (attempt 1/3) after service unavailable"));
    assert!(text.contains("INV-1"));
    assert!(text.contains("[FAILED] INV-1 failed after 3 attempt(s)"));
    assert!(text.contains("Bulk run finished"));
    assert!(!text.contains("do-not-log-me"));
}

#[test]
fn test_json_format_fields() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new("info"))
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        info!(key = "INV-9", attempts = 2, "Item finished");
    });

    let line = logs.text();
    let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(value["fields"]["message"], "Item finished");
    assert_eq!(value["fields"]["key"], "INV-9");
    assert_eq!(value["fields"]["attempts"], 2);
    assert_eq!(value["level"], "INFO");
}
