//! Bulk execution engine
//!
//! This module provides the core execution engine that drives work items
//! through a remote API under a rate limit and a concurrency budget.
//!
//! # Overview
//!
//! 1. **Configuration**: Describe the run with [`config::EngineConfig`]
//! 2. **Scheduling**: Execute items with [`scheduler::Scheduler`]
//! 3. **Rate Limiting**: Sliding-window permits via [`rate_limit::RateLimiter`]
//! 4. **Retries**: Classification and backoff via [`retry::RetryPolicy`]
//! 5. **Progress Tracking**: Counts and ETA with [`progress::ProgressTracker`]
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bulk_runner::engine::scheduler::{candidates_from, FnOperation};
//! use bulk_runner::engine::{EngineConfig, Scheduler};
//! use bulk_runner::{AttemptReport, Candidate, WorkItem};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::new("https://api.example.com");
//! let operation = Arc::new(FnOperation::new(|_item: WorkItem<u32>| async {
//!     AttemptReport::ok()
//! }));
//! let items = (0..10).map(|n| Candidate::Ready(WorkItem::new(n.to_string(), n)));
//!
//! let mut handle = Scheduler::new(&config).spawn(candidates_from(items), operation);
//! while let Some(result) = handle.results.recv().await {
//!     println!("{} {}", result.key, result.status);
//! }
//! handle.join().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Components
//!
//! - [`scheduler`] - Bounded-concurrency driver producing one result per item
//! - [`retry`] - Outcome classification and backoff computation
//! - [`retry_formatter`] - Retry and failure log messages
//! - [`rate_limit`] - Rolling-window permits and server cool-downs
//! - [`item`] - Per-item state machine
//! - [`progress`] - Running counts, throughput and ETA
//! - [`poll`] - Polling helper for remote jobs that complete asynchronously
//! - [`config`] - Configuration defaults and validation
//!
//! # Error Handling
//!
//! A single item's failure never fails the run: it becomes an ERROR row.
//! [`EngineError`] is reserved for conditions that stop the whole run:
//! - Invalid credentials seen before any success
//! - A page fetch that exhausted its retries
//! - The pagination safety cap
//! - Result sink I/O failures

pub mod config;
pub mod item;
pub mod poll;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod retry_formatter;
pub mod scheduler;

pub use config::EngineConfig;
pub use item::ItemState;
pub use poll::{PollConfig, PollStatus, PollingOperation, RemoteJob};
pub use progress::ProgressTracker;
pub use rate_limit::{Permit, RateLimitWindow, RateLimiter};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{Operation, RunSummary, Scheduler, SchedulerHandle};

use crate::output::OutputError;

/// Run-level errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Credentials rejected before any request succeeded
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A page could not be fetched after all retries
    #[error("page fetch failed after {attempts} attempt(s): {message}")]
    PageFetch {
        /// Attempts made for the page
        attempts: u32,
        /// Last failure
        message: String,
    },

    /// Pagination did not terminate within the page cap
    #[error("page limit of {max_pages} exceeded at cursor {cursor}")]
    PageLimitExceeded {
        /// Configured cap
        max_pages: usize,
        /// Cursor that would have been fetched next
        cursor: String,
    },

    /// An overall deadline elapsed
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A remote job reported failure
    #[error("remote job failed: {0}")]
    RemoteFailed(String),

    /// HTTP client construction failed
    #[error("HTTP client error: {0}")]
    HttpClientError(String),

    /// Result sink error
    #[error("output error: {0}")]
    OutputError(#[from] OutputError),

    /// Internal task failure
    #[error("task error: {0}")]
    TaskError(String),
}
