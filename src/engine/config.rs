//! Engine configuration defaults and the explicit run configuration

use secrecy::SecretString;
use std::time::Duration;

use super::EngineError;

/// Default number of concurrent worker slots.
/// 12 keeps well under typical per-token connection caps while saturating a
/// 500 requests/minute budget with sub-second responses.
pub const DEFAULT_CONCURRENCY: usize = 12;

/// Upper bound accepted for concurrency.
pub const MAX_CONCURRENCY: usize = 64;

/// Default permits per rate window.
pub const DEFAULT_MAX_REQUESTS: usize = 500;

/// Default rolling window for the rate limit.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Fraction of a documented limit used when deriving permits with headroom.
pub const DEFAULT_HEADROOM: f64 = 0.8;

/// Default attempts per item, the first try included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Initial backoff delay in milliseconds.
/// The first retry waits 2s, the second 4s.
pub const INITIAL_BACKOFF_MS: u64 = 2_000;

/// Maximum backoff delay in milliseconds.
/// Server-specified `Retry-After` values are not subject to this cap.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Total timeout for one attempt.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Connect timeout for one attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Safety cap on pages fetched by one paginator.
pub const DEFAULT_MAX_PAGES: usize = 10_000;

/// Capacity of the result channel between workers and the consumer.
pub const RESULT_CHANNEL_CAPACITY: usize = 256;

/// Calculate exponential backoff delay for the retry following attempt `attempt_count`.
///
/// `attempt_count` is 1-based: after the first failed attempt the delay is
/// `initial`, then it doubles, capped at `max`.
pub fn calculate_backoff(attempt_count: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt_count.saturating_sub(1).min(31);
    let factor = 2u32.saturating_pow(exponent);
    initial.saturating_mul(factor).min(max)
}

/// Explicit configuration for one bulk run.
#[derive(Debug)]
pub struct EngineConfig {
    /// API base URL (no trailing slash)
    pub base_url: String,
    /// Bearer token; never logged
    pub token: Option<SecretString>,
    /// Concurrent worker slots
    pub concurrency: usize,
    /// Permits per rate window
    pub max_requests: usize,
    /// Rolling rate window
    pub rate_window: Duration,
    /// Attempts per item, the first try included
    pub max_attempts: u32,
    /// First backoff delay
    pub initial_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
    /// Total timeout per attempt
    pub request_timeout: Duration,
    /// Connect timeout per attempt
    pub connect_timeout: Duration,
    /// Overall deadline per item, retries included
    pub item_deadline: Option<Duration>,
    /// Pagination safety cap
    pub max_pages: usize,
}

impl EngineConfig {
    /// Configuration with defaults for `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            concurrency: DEFAULT_CONCURRENCY,
            max_requests: DEFAULT_MAX_REQUESTS,
            rate_window: DEFAULT_RATE_WINDOW,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            item_deadline: None,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Set the bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(SecretString::from(token.into()));
        self
    }

    /// Set concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the rate limit as permits per window
    pub fn with_rate_limit(mut self, max_requests: usize, window: Duration) -> Self {
        self.max_requests = max_requests;
        self.rate_window = window;
        self
    }

    /// Derive the rate limit from a documented ceiling, keeping `fraction` of it.
    pub fn with_rate_limit_headroom(
        mut self,
        documented_limit: usize,
        fraction: f64,
        window: Duration,
    ) -> Self {
        self.max_requests = permits_with_headroom(documented_limit, fraction);
        self.rate_window = window;
        self
    }

    /// Set max attempts per item
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set backoff base and cap
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set per-attempt timeouts
    pub fn with_timeouts(mut self, request: Duration, connect: Duration) -> Self {
        self.request_timeout = request;
        self.connect_timeout = connect;
        self
    }

    /// Set the overall per-item deadline
    pub fn with_item_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.item_deadline = deadline;
        self
    }

    /// Set the pagination safety cap
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(EngineError::ConfigError(format!(
                "concurrency must be between 1 and {MAX_CONCURRENCY}, got {}",
                self.concurrency
            )));
        }
        if self.max_requests == 0 {
            return Err(EngineError::ConfigError(
                "rate limit must allow at least one request per window".to_string(),
            ));
        }
        if self.rate_window.is_zero() {
            return Err(EngineError::ConfigError(
                "rate window must be non-zero".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(EngineError::ConfigError(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(EngineError::ConfigError(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        if self.max_pages == 0 {
            return Err(EngineError::ConfigError(
                "max pages must be at least 1".to_string(),
            ));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(EngineError::ConfigError(format!(
                "base URL must start with http:// or https://, got {:?}",
                self.base_url
            )));
        }
        Ok(())
    }
}

/// Permits left after keeping `fraction` of a documented limit, never below one.
pub fn permits_with_headroom(documented_limit: usize, fraction: f64) -> usize {
    let fraction = fraction.clamp(0.0, 1.0);
    ((documented_limit as f64 * fraction).floor() as usize).max(1)
}
