//! Retry message formatting for scheduler and pagination logs.
//!
//! Turns an [`AttemptOutcome`] into consistent, user-friendly messages for
//! retries and final failures.

use std::time::Duration;

use crate::{AttemptOutcome, FailureKind};

/// Classification of retry errors for user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryErrorType {
    /// Network timeout or attempt timeout
    NetworkTimeout,
    /// Connection refused, DNS failure, or other transport errors
    NetworkOffline,
    /// HTTP 429 rate limit exceeded
    RateLimit,
    /// HTTP 5xx server error
    ServerError(u16),
    /// HTTP 400 invalid request
    InvalidRequest,
    /// Authentication failures (401/403)
    AuthFailed(u16),
    /// Other client errors (4xx, except 429)
    ClientError(u16),
    /// Response could not be interpreted or the row was rejected locally
    Validation,
    /// The per-item deadline elapsed
    Deadline,
}

impl RetryErrorType {
    /// Derive the message category from a classified attempt.
    pub fn from_outcome(outcome: &AttemptOutcome) -> Self {
        match (outcome.failure_kind, outcome.http_status) {
            (Some(FailureKind::RateLimited), _) => Self::RateLimit,
            (Some(FailureKind::DeadlineExceeded), _) => Self::Deadline,
            (Some(FailureKind::Validation), _) => Self::Validation,
            (_, Some(400)) => Self::InvalidRequest,
            (_, Some(code @ (401 | 403))) => Self::AuthFailed(code),
            (_, Some(code)) if code >= 500 => Self::ServerError(code),
            (_, Some(code)) => Self::ClientError(code),
            (_, None) => {
                let timed_out = outcome
                    .message
                    .as_deref()
                    .is_some_and(|m| m.contains("timed out") || m.contains("timeout"));
                if timed_out {
                    Self::NetworkTimeout
                } else {
                    Self::NetworkOffline
                }
            }
        }
    }

    /// User-friendly description string used inside retry log messages.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network timeout",
            Self::NetworkOffline => "connection failed",
            Self::RateLimit => "rate limit exceeded",
            Self::ServerError(code) => match code {
                500 => "internal server error",
                502 => "bad gateway",
                503 => "service unavailable",
                504 => "gateway timeout",
                _ => "server error",
            },
            Self::InvalidRequest => "invalid request",
            Self::AuthFailed(code) => match code {
                401 => "authentication failed (401)",
                403 => "permission denied (403)",
                _ => "authentication failed",
            },
            Self::ClientError(code) => match code {
                404 => "resource not found",
                409 => "conflict",
                422 => "unprocessable entity",
                _ => "client error",
            },
            Self::Validation => "invalid response or input",
            Self::Deadline => "item deadline exceeded",
        }
    }

    /// Suggested remediation presented after final failures.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "Check network latency or raise the request timeout",
            Self::NetworkOffline => "Verify connectivity and DNS resolution for the API host",
            Self::RateLimit => "Lower --rate-limit or --concurrency",
            Self::ServerError(_) => "The API may be degraded, rerun later; completed rows are kept",
            Self::InvalidRequest => "Check the request template and the input row",
            Self::AuthFailed(_) => "Verify the API token and its permissions",
            Self::ClientError(_) => "Review the key and request parameters",
            Self::Validation => "Inspect the input row or the response format",
            Self::Deadline => "Raise --item-deadline-secs or reduce retries",
        }
    }
}

/// Context for formatting retry messages.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Current attempt number (1-based)
    pub attempt: u32,
    /// Maximum number of attempts configured
    pub max_attempts: u32,
    /// Type of error that triggered the retry
    pub error_type: RetryErrorType,
    /// Backoff duration until next attempt
    pub backoff_duration: Duration,
    /// Key of the item (or cursor of the page) being retried
    pub key: String,
    /// Original error message for details
    pub error_message: String,
}

impl RetryContext {
    /// Build a context from a failed attempt.
    pub fn from_outcome(outcome: &AttemptOutcome, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            attempt: outcome.attempt,
            max_attempts,
            error_type: RetryErrorType::from_outcome(outcome),
            backoff_duration: backoff,
            key: outcome.key.clone(),
            error_message: outcome.message.clone().unwrap_or_default(),
        }
    }

    /// Format standardized retry message with attempt counters and context.
    pub fn format_retry(&self) -> String {
        let mut message = format!(
            "Retrying (attempt {}/{}) after {} - waiting {:.1} seconds...",
            self.attempt,
            self.max_attempts,
            self.error_type.description(),
            self.backoff_duration.as_secs_f64()
        );
        append_key(&mut message, &self.key);
        message
    }

    /// Format final failure summary with an actionable suggestion.
    pub fn format_failure(&self) -> String {
        let key = if self.key.is_empty() {
            "unknown"
        } else {
            &self.key
        };
        [
            format!("[FAILED] {key} failed after {} attempt(s)", self.attempt),
            format!("  Last error: {}", self.error_message),
            format!("  Cause: {}", self.error_type.description()),
            format!("  Suggestion: {}", self.error_type.suggestion()),
        ]
        .join("\n")
    }
}

fn append_key(buffer: &mut String, key: &str) {
    if !key.is_empty() {
        buffer.push_str(" (");
        buffer.push_str(key);
        buffer.push(')');
    }
}
