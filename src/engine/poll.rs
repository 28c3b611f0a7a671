//! Polling for remote jobs that complete asynchronously
//!
//! Some operations start a job (an export, a report) and return before it is
//! ready. [`poll_until_done`] checks it with a doubling interval until it
//! finishes, fails, or an overall deadline passes. [`PollingOperation`] runs
//! the same loop as a scheduler [`Operation`], so a job that never finishes
//! becomes an ERROR row for its item instead of stopping the run.

use async_trait::async_trait;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use super::config::DEFAULT_REQUEST_TIMEOUT;
use super::rate_limit::RateLimiter;
use super::scheduler::Operation;
use super::EngineError;
use crate::{AttemptReport, NetworkErrorKind, WorkItem};

/// Default first polling interval.
pub const DEFAULT_POLL_INITIAL: Duration = Duration::from_secs(2);
/// Default polling interval cap.
pub const DEFAULT_POLL_MAX: Duration = Duration::from_secs(30);
/// Default overall deadline.
pub const DEFAULT_POLL_DEADLINE: Duration = Duration::from_secs(600);

/// Status reported by one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    /// Not done yet
    Pending,
    /// Finished with a value
    Done(T),
    /// The remote side reported failure
    Failed(String),
}

/// Polling cadence and deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Wait before the second check
    pub initial_interval: Duration,
    /// Interval cap
    pub max_interval: Duration,
    /// Overall deadline measured from the first check
    pub deadline: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_POLL_INITIAL,
            max_interval: DEFAULT_POLL_MAX,
            deadline: DEFAULT_POLL_DEADLINE,
        }
    }
}

enum PollEnd<T, E> {
    Done(T),
    Failed(String),
    Expired { polls: u32, waited: Duration },
    Error(E),
}

async fn poll_loop<T, E, F, Fut>(config: &PollConfig, mut check: F) -> PollEnd<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, E>>,
{
    let started = Instant::now();
    let give_up_at = started + config.deadline;
    let mut interval = config.initial_interval;
    let mut poll = 0u32;

    loop {
        poll += 1;
        match check(poll).await {
            Ok(PollStatus::Done(value)) => return PollEnd::Done(value),
            Ok(PollStatus::Failed(reason)) => return PollEnd::Failed(reason),
            Ok(PollStatus::Pending) => {}
            Err(e) => return PollEnd::Error(e),
        }

        let now = Instant::now();
        if now + interval > give_up_at {
            return PollEnd::Expired {
                polls: poll,
                waited: now.saturating_duration_since(started),
            };
        }

        debug!(poll = poll, wait_secs = interval.as_secs_f64(), "Remote job pending");
        sleep(interval).await;
        interval = (interval * 2).min(config.max_interval);
    }
}

/// Call `check` until it reports `Done` or `Failed`, doubling the wait in between.
///
/// `check` receives the 1-based poll number. Errors from `check` abort polling.
pub async fn poll_until_done<T, F, Fut>(config: &PollConfig, check: F) -> Result<T, EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, EngineError>>,
{
    match poll_loop(config, check).await {
        PollEnd::Done(value) => Ok(value),
        PollEnd::Failed(reason) => Err(EngineError::RemoteFailed(reason)),
        PollEnd::Expired { polls, waited } => Err(EngineError::DeadlineExceeded(format!(
            "remote job not done after {} polls in {:.0}s",
            polls,
            waited.as_secs_f64()
        ))),
        PollEnd::Error(e) => Err(e),
    }
}

/// A remote job started once per attempt and then checked until it settles.
#[async_trait]
pub trait RemoteJob<P: Send + Sync>: Send + Sync {
    /// Whatever identifies the started job to later checks
    type Ticket: Send + Sync;

    /// Submit the job for `item`.
    async fn start(&self, item: &WorkItem<P>) -> Result<Self::Ticket, AttemptReport>;

    /// Check the job once; `Done` carries detail for the result row (may be empty).
    async fn check(
        &self,
        item: &WorkItem<P>,
        ticket: &Self::Ticket,
    ) -> Result<PollStatus<String>, AttemptReport>;
}

/// [`Operation`] that starts a [`RemoteJob`] and polls it to completion.
///
/// A failed submission is reported as-is, so the scheduler retries it like
/// any other call. Failed status checks count as "still pending". Running
/// out of time yields [`AttemptReport::Expired`], which is final for the item.
pub struct PollingOperation<J> {
    job: J,
    config: PollConfig,
    start_timeout: Duration,
    limiter: Option<Arc<RateLimiter>>,
}

impl<J> PollingOperation<J> {
    /// Poll `job` with the default cadence and 10 minute deadline.
    pub fn new(job: J) -> Self {
        Self {
            job,
            config: PollConfig::default(),
            start_timeout: DEFAULT_REQUEST_TIMEOUT,
            limiter: None,
        }
    }

    /// Replace the polling cadence and deadline
    pub fn with_poll_config(mut self, config: PollConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound the submission call
    pub fn with_start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self
    }

    /// Take a permit from `limiter` before every status check
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }
}

#[async_trait]
impl<P, J> Operation<P> for PollingOperation<J>
where
    P: Send + Sync + 'static,
    J: RemoteJob<P>,
{
    async fn execute(&self, item: &WorkItem<P>) -> AttemptReport {
        let ticket = match timeout(self.start_timeout, self.job.start(item)).await {
            Ok(Ok(ticket)) => ticket,
            Ok(Err(report)) => return report,
            Err(_) => {
                return AttemptReport::Network {
                    kind: NetworkErrorKind::Timeout,
                    message: format!(
                        "job submission timed out after {:.0}s",
                        self.start_timeout.as_secs_f64()
                    ),
                }
            }
        };

        let job = &self.job;
        let ticket = &ticket;
        let limiter = self.limiter.as_deref();
        let checks = poll_loop(&self.config, move |poll| async move {
            if let Some(limiter) = limiter {
                let _permit = limiter.acquire().await;
            }
            match job.check(item, ticket).await {
                Ok(status) => Ok::<_, Infallible>(status),
                Err(report) => {
                    debug!(poll = poll, error = %report.describe(), "Status check failed, polling on");
                    Ok(PollStatus::Pending)
                }
            }
        });

        match timeout(self.config.deadline, checks).await {
            Ok(PollEnd::Done(detail)) => AttemptReport::Response {
                status: 200,
                retry_after: None,
                message: Some(detail).filter(|d| !d.is_empty()),
            },
            Ok(PollEnd::Failed(reason)) => {
                AttemptReport::Invalid(format!("remote job failed: {reason}"))
            }
            Ok(PollEnd::Expired { polls, waited }) => AttemptReport::Expired(format!(
                "remote job not done after {} polls in {:.0}s",
                polls,
                waited.as_secs_f64()
            )),
            Ok(PollEnd::Error(never)) => match never {},
            Err(_) => AttemptReport::Expired(format!(
                "remote job not done within {:.0}s",
                self.config.deadline.as_secs_f64()
            )),
        }
    }

    fn attempt_timeout(&self) -> Option<Duration> {
        Some(self.start_timeout + self.config.deadline + self.config.max_interval)
    }
}
