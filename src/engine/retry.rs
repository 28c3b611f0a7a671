//! Attempt classification and backoff
//!
//! One parameterized policy replaces per-endpoint retry loops. Endpoint quirks
//! (a 409 that clears on retry, a 503 that never will) are expressed as status
//! overrides rather than new code paths.

use std::collections::HashSet;
use std::time::Duration;

use super::config::{calculate_backoff, EngineConfig, DEFAULT_MAX_ATTEMPTS, INITIAL_BACKOFF_MS, MAX_BACKOFF_MS};
use crate::{AttemptOutcome, AttemptReport, Classification, FailureKind};

/// What to do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the delay, then try again on the same slot
    Retry(Duration),
    /// The outcome is terminal
    Finish,
}

/// Classifies attempts and schedules retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    retry_statuses: HashSet<u16>,
    fatal_statuses: HashSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            retry_statuses: HashSet::new(),
            fatal_statuses: HashSet::new(),
        }
    }
}

impl RetryPolicy {
    /// Policy with default attempts and backoff
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy matching a run configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new()
            .with_max_attempts(config.max_attempts)
            .with_backoff(config.initial_backoff, config.max_backoff)
    }

    /// Set max attempts (the first try included)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set backoff base and cap
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Treat `status` as retryable even though it would otherwise be fatal
    pub fn with_retry_status(mut self, status: u16) -> Self {
        self.fatal_statuses.remove(&status);
        self.retry_statuses.insert(status);
        self
    }

    /// Treat `status` as fatal even though it would otherwise be retried
    pub fn with_fatal_status(mut self, status: u16) -> Self {
        self.retry_statuses.remove(&status);
        self.fatal_statuses.insert(status);
        self
    }

    /// Attempts allowed per item
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Classify a raw attempt report.
    pub fn classify(&self, report: &AttemptReport) -> Classification {
        match report {
            AttemptReport::Response { status, .. } => {
                let status = *status;
                if self.fatal_statuses.contains(&status) {
                    Classification::FatalFailure
                } else if self.retry_statuses.contains(&status) {
                    Classification::RetryableFailure
                } else if (200..300).contains(&status) {
                    Classification::Success
                } else if status == 429 || (500..600).contains(&status) {
                    Classification::RetryableFailure
                } else {
                    Classification::FatalFailure
                }
            }
            AttemptReport::Network { .. } => Classification::RetryableFailure,
            AttemptReport::Invalid(_) | AttemptReport::Expired(_) => Classification::FatalFailure,
        }
    }

    /// Failure category for a report, `None` for success.
    pub fn failure_kind(&self, report: &AttemptReport) -> Option<FailureKind> {
        if self.classify(report) == Classification::Success {
            return None;
        }
        Some(match report {
            AttemptReport::Response { status: 429, .. } => FailureKind::RateLimited,
            AttemptReport::Response { status, .. } if *status >= 500 => FailureKind::ServerError,
            AttemptReport::Response { .. } => FailureKind::ClientError,
            AttemptReport::Network { .. } => FailureKind::TransientNetwork,
            AttemptReport::Invalid(_) => FailureKind::Validation,
            AttemptReport::Expired(_) => FailureKind::DeadlineExceeded,
        })
    }

    /// Computed delay before the retry that follows attempt `attempt_count` (1-based).
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        calculate_backoff(attempt_count, self.initial_backoff, self.max_backoff)
    }

    /// Delay for a specific outcome; a server `Retry-After` wins and is not capped.
    pub fn delay_for(&self, outcome: &AttemptOutcome) -> Duration {
        outcome
            .retry_after
            .unwrap_or_else(|| self.next_delay(outcome.attempt))
    }

    /// Turn a report into an immutable outcome record.
    pub fn evaluate(
        &self,
        key: &str,
        attempt: u32,
        report: &AttemptReport,
        elapsed: Duration,
    ) -> AttemptOutcome {
        let classification = self.classify(report);
        let message = match (classification, report) {
            (Classification::Success, AttemptReport::Response { message, .. }) => message.clone(),
            _ => Some(report.describe()),
        };
        AttemptOutcome {
            key: key.to_string(),
            attempt,
            classification,
            failure_kind: self.failure_kind(report),
            http_status: report.http_status(),
            message,
            retry_after: report.retry_after(),
            elapsed,
        }
    }

    /// Decide whether to retry after `outcome`.
    ///
    /// Retryable failures on the last allowed attempt are final.
    pub fn decide(&self, outcome: &AttemptOutcome) -> RetryDecision {
        match outcome.classification {
            Classification::RetryableFailure if outcome.attempt < self.max_attempts => {
                RetryDecision::Retry(self.delay_for(outcome))
            }
            _ => RetryDecision::Finish,
        }
    }
}
