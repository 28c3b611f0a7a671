use std::time::Duration;

use bulk_runner::engine::retry_formatter::{RetryContext, RetryErrorType};
use bulk_runner::engine::RetryPolicy;
use bulk_runner::{AttemptOutcome, AttemptReport, NetworkErrorKind};

fn evaluated(attempt: u32, report: AttemptReport) -> AttemptOutcome {
    RetryPolicy::new().evaluate("INV-2024-0042", attempt, &report, Duration::from_millis(80))
}

#[test]
fn format_retry_captures_attempt_and_wait() {
    let outcome = evaluated(
        2,
        AttemptReport::Response {
            status: 429,
            retry_after: Some(Duration::from_secs(4)),
            message: Some("too many requests".to_string()),
        },
    );
    let ctx = RetryContext::from_outcome(&outcome, 5, Duration::from_secs(4));
    let message = ctx.format_retry();
    assert!(message.contains("attempt 2/5"));
    assert!(message.contains("rate limit exceeded"));
    assert!(message.contains("4.0 seconds"));
    assert!(message.contains("INV-2024-0042"));
}

#[test]
fn format_failure_lists_suggestions() {
    let outcome = evaluated(5, AttemptReport::status(502));
    let output = RetryContext::from_outcome(&outcome, 5, Duration::ZERO).format_failure();
    assert!(output.contains("INV-2024-0042 failed after 5 attempt(s)"));
    assert!(output.contains("bad gateway"));
    assert!(output.contains("Last error: HTTP 502"));
    assert!(output.contains("completed rows are kept"));
}

#[test]
fn error_type_follows_classification() {
    let timeout = evaluated(
        1,
        AttemptReport::Network {
            kind: NetworkErrorKind::Timeout,
            message: "attempt timed out after 120s".to_string(),
        },
    );
    assert_eq!(RetryErrorType::from_outcome(&timeout), RetryErrorType::NetworkTimeout);

    let refused = evaluated(
        1,
        AttemptReport::Network {
            kind: NetworkErrorKind::Connect,
            message: "network error: connection refused".to_string(),
        },
    );
    assert_eq!(RetryErrorType::from_outcome(&refused), RetryErrorType::NetworkOffline);

    let auth = evaluated(1, AttemptReport::status(403));
    assert_eq!(RetryErrorType::from_outcome(&auth), RetryErrorType::AuthFailed(403));
    assert!(auth.failure_kind.is_some());

    let invalid = evaluated(1, AttemptReport::Invalid("invalid JSON response".to_string()));
    assert_eq!(RetryErrorType::from_outcome(&invalid), RetryErrorType::Validation);

    let server = evaluated(1, AttemptReport::status(500));
    assert_eq!(RetryErrorType::from_outcome(&server), RetryErrorType::ServerError(500));
}

#[test]
fn suggestions_name_the_relevant_flag() {
    assert!(RetryErrorType::RateLimit.suggestion().contains("--rate-limit"));
    assert!(RetryErrorType::Deadline.suggestion().contains("--item-deadline-secs"));
    assert!(RetryErrorType::AuthFailed(401).suggestion().contains("token"));
}
