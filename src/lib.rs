//! # Bulk Runner Library
//!
//! A bulk-operation engine for driving large sets of work items through a
//! remote, paginated, rate-limited HTTP API without losing completed work.
//!
//! ## Features
//!
//! - **Bounded Concurrency**: A fixed pool of worker slots executes items in parallel
//! - **Rate Limiting**: Sliding-window permits that absorb server `Retry-After` cool-downs
//! - **Retry Policy**: One parameterized classifier with exponential backoff
//! - **Pagination**: Lazy traversal of offset, token and link paginated endpoints
//! - **Resume Capability**: Append-only CSV results that double as the resume log
//! - **Progress**: Running counts with a trailing-window ETA
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bulk_runner::engine::{EngineConfig, ProgressTracker, Scheduler};
//! use bulk_runner::engine::scheduler::candidates_from;
//! use bulk_runner::fetcher::{ApiHttpClient, ApiRequest, HttpOperation};
//! use bulk_runner::output::csv::CsvResultSink;
//! use bulk_runner::{Candidate, WorkItem};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::new("https://api.example.com").with_concurrency(12);
//! let client = Arc::new(ApiHttpClient::from_config(&config)?);
//! let operation = Arc::new(HttpOperation::new(client));
//!
//! let items = ["A-1", "A-2"].into_iter().map(|key| {
//!     Candidate::Ready(WorkItem::new(key, ApiRequest::get(format!("/audits/{key}"))))
//! });
//!
//! let mut sink = CsvResultSink::open("./results.csv")?;
//! let mut tracker = ProgressTracker::default();
//! let summary = Scheduler::new(&config)
//!     .run_to_sink(candidates_from(items), operation, &mut sink, &mut tracker)
//!     .await?;
//! println!("{} succeeded, {} failed", summary.succeeded, summary.failed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - Scheduler, retry policy, rate limiter and progress tracking
//! - [`fetcher`] - HTTP adapter and pagination
//! - [`output`] - Result sinks and export writers
//! - [`resume`] - Reading back recorded results for resume and verification
//!
//! ## Data Types
//!
//! - [`WorkItem`] - One unit of work with an opaque key and payload
//! - [`Candidate`] - A work item or a locally rejected row
//! - [`AttemptReport`] - Raw result of one execution attempt
//! - [`AttemptOutcome`] - A classified attempt
//! - [`TerminalResult`] - The final SUCCESS/ERROR record for a key

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// CLI command implementations
pub mod cli;

/// Scheduling, retry and rate limiting
pub mod engine;

/// HTTP adapter and pagination
pub mod fetcher;

/// Production observability metrics
pub mod metrics;

/// Result sinks and export writers
pub mod output;

/// Reading recorded results back for resume
pub mod resume;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

pub use engine::{EngineConfig, EngineError};

/// Timestamp format used in result rows (UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Maximum number of characters of remote error text kept in a result message.
pub const MAX_MESSAGE_CHARS: usize = 200;

/// One unit of work flowing through the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<P> {
    /// Opaque key, unique within a run
    pub key: String,
    /// Opaque operation input
    pub payload: P,
    /// Number of attempts started so far
    pub attempt_count: u32,
}

impl<P> WorkItem<P> {
    /// Create a fresh work item with no attempts.
    pub fn new(key: impl Into<String>, payload: P) -> Self {
        Self {
            key: key.into(),
            payload,
            attempt_count: 0,
        }
    }

    /// Validate a key before scheduling.
    ///
    /// Keys end up as the first column of the result file, so they must be
    /// non-blank and single-line.
    pub fn validate_key(key: &str) -> Result<(), String> {
        if key.trim().is_empty() {
            return Err("key is empty".to_string());
        }
        if key.contains(['\n', '\r']) {
            return Err(format!("key {key:?} contains a line break"));
        }
        Ok(())
    }
}

/// A row rejected by local validation before it ever reached the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedItem {
    /// Key of the rejected row (may be a synthetic row label)
    pub key: String,
    /// Why the row was rejected
    pub reason: String,
}

/// Input to the scheduler: either a runnable item or a rejected row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate<P> {
    /// Valid work item
    Ready(WorkItem<P>),
    /// Row that failed local validation; recorded as ERROR without executing
    Rejected(RejectedItem),
}

impl<P> Candidate<P> {
    /// Build a candidate, rejecting keys that fail [`WorkItem::validate_key`].
    pub fn checked(key: impl Into<String>, payload: P) -> Self {
        let key = key.into();
        match WorkItem::<P>::validate_key(&key) {
            Ok(()) => Candidate::Ready(WorkItem::new(key, payload)),
            Err(reason) => Candidate::Rejected(RejectedItem {
                key: single_line(&key),
                reason,
            }),
        }
    }

    /// Key of the candidate.
    pub fn key(&self) -> &str {
        match self {
            Candidate::Ready(item) => &item.key,
            Candidate::Rejected(rejected) => &rejected.key,
        }
    }
}

/// Coarse category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Request or connect timeout
    Timeout,
    /// Connection refused, reset or DNS failure
    Connect,
    /// Any other transport error
    Other,
}

/// Raw, unclassified result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptReport {
    /// The server answered with an HTTP status
    Response {
        /// HTTP status code
        status: u16,
        /// Parsed `Retry-After` header, if present
        retry_after: Option<Duration>,
        /// Body excerpt or operation-supplied detail
        message: Option<String>,
    },
    /// The request never produced a response
    Network {
        /// Failure category
        kind: NetworkErrorKind,
        /// Error text
        message: String,
    },
    /// Local failure such as an undecodable body
    Invalid(String),
    /// The operation gave up waiting on the remote side (e.g. a job that never finished)
    Expired(String),
}

impl AttemptReport {
    /// A bare `200 OK` report.
    pub fn ok() -> Self {
        Self::status(200)
    }

    /// A report for `status` with no extra detail.
    pub fn status(status: u16) -> Self {
        AttemptReport::Response {
            status,
            retry_after: None,
            message: None,
        }
    }

    /// HTTP status code, if the server answered.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            AttemptReport::Response { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Server-specified wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AttemptReport::Response { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Human-readable message for the result row.
    pub fn describe(&self) -> String {
        match self {
            AttemptReport::Response {
                status,
                message: Some(text),
                ..
            } => truncate_message(&format!("HTTP {status}: {text}")),
            AttemptReport::Response { status, .. } => format!("HTTP {status}"),
            AttemptReport::Network { message, .. } => truncate_message(message),
            AttemptReport::Invalid(message) | AttemptReport::Expired(message) => {
                truncate_message(message)
            }
        }
    }
}

/// Outcome class assigned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    /// Attempt succeeded
    Success,
    /// Attempt failed but may succeed if repeated
    RetryableFailure,
    /// Attempt failed and repeating it will not help
    FatalFailure,
}

impl Classification {
    /// Lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Success => "success",
            Classification::RetryableFailure => "retryable",
            Classification::FatalFailure => "fatal",
        }
    }
}

/// Why an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Timeout, connection reset or other transport error
    TransientNetwork,
    /// HTTP 429
    RateLimited,
    /// HTTP 5xx
    ServerError,
    /// HTTP 4xx other than 429
    ClientError,
    /// Rejected locally or response could not be interpreted
    Validation,
    /// The per-item deadline or an operation's own wait limit elapsed
    DeadlineExceeded,
}

impl FailureKind {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::ServerError => "server_error",
            FailureKind::ClientError => "client_error",
            FailureKind::Validation => "validation",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    /// Item key
    pub key: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Policy classification
    pub classification: Classification,
    /// Failure category, `None` on success
    pub failure_kind: Option<FailureKind>,
    /// HTTP status, if the server answered
    pub http_status: Option<u16>,
    /// Detail for the result row
    pub message: Option<String>,
    /// Server-specified wait, if any
    pub retry_after: Option<Duration>,
    /// Wall time spent executing the attempt
    pub elapsed: Duration,
}

/// Final status of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    /// Operation succeeded
    #[serde(rename = "SUCCESS")]
    Success,
    /// Operation failed permanently or exhausted its attempts
    #[serde(rename = "ERROR")]
    Error,
}

impl ResultStatus {
    /// Column value written to the result file.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "SUCCESS",
            ResultStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(ResultStatus::Success),
            "ERROR" => Ok(ResultStatus::Error),
            _ => Err(format!("Invalid result status: {s}")),
        }
    }
}

/// The single terminal record emitted for each key that entered the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalResult {
    /// Item key
    pub key: String,
    /// SUCCESS or ERROR
    pub status: ResultStatus,
    /// Empty on success unless the operation supplied detail
    pub message: String,
    /// When the result was produced
    pub timestamp: DateTime<Utc>,
    /// Attempts made before the result was final
    pub attempts: u32,
    /// Failure category for ERROR rows
    pub failure_kind: Option<FailureKind>,
}

impl TerminalResult {
    /// Successful result.
    pub fn success(key: impl Into<String>, attempts: u32, message: Option<String>) -> Self {
        Self {
            key: key.into(),
            status: ResultStatus::Success,
            message: message.map(|m| truncate_message(&m)).unwrap_or_default(),
            timestamp: Utc::now(),
            attempts,
            failure_kind: None,
        }
    }

    /// Failed result.
    pub fn error(
        key: impl Into<String>,
        attempts: u32,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            status: ResultStatus::Error,
            message: truncate_message(&message.into()),
            timestamp: Utc::now(),
            attempts,
            failure_kind: Some(kind),
        }
    }

    /// Result for a candidate rejected before scheduling.
    ///
    /// Line breaks in the key are replaced so the row stays on one line.
    pub fn rejected(rejected: &RejectedItem) -> Self {
        Self::error(
            single_line(&rejected.key),
            0,
            FailureKind::Validation,
            format!("ValidationError: {}", rejected.reason),
        )
    }

    /// Terminal result from the last attempt of an item.
    pub fn from_outcome(outcome: &AttemptOutcome) -> Self {
        match outcome.classification {
            Classification::Success => {
                Self::success(outcome.key.clone(), outcome.attempt, outcome.message.clone())
            }
            _ => Self::error(
                outcome.key.clone(),
                outcome.attempt,
                outcome.failure_kind.unwrap_or(FailureKind::ClientError),
                outcome.message.clone().unwrap_or_default(),
            ),
        }
    }

    /// Whether the key succeeded.
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Timestamp formatted as `YYYY-MM-DD HH:MM:SS`.
    pub fn timestamp_string(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

/// Truncate remote error text to [`MAX_MESSAGE_CHARS`] characters on a char boundary.
pub fn truncate_message(message: &str) -> String {
    let line = single_line(message);
    match line.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => line[..cut].to_string(),
        None => line,
    }
}
