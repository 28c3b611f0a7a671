//! Lazy pagination over list endpoints
//!
//! A [`Paginator`] walks a [`PageFetcher`] page by page and yields items as
//! they arrive, so the scheduler can start work before the listing is done.
//! Page fetches go through the same retry policy and rate limiter as item
//! operations. Traversal ends on:
//! - an exhausted or empty page
//! - a page shorter than the configured page size
//! - a page with no next position
//!
//! A failed page fetch is an error, never an early end. A safety cap on the
//! number of pages stops a listing that never exhausts.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::engine::retry_formatter::RetryContext;
use crate::engine::{EngineConfig, EngineError, RateLimiter, RetryDecision, RetryPolicy};
use crate::metrics;
use crate::shutdown::SharedShutdown;
use crate::AttemptReport;

/// Where the next page starts
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CursorPosition {
    /// First page
    #[default]
    Start,
    /// Item offset
    Offset(u64),
    /// Opaque continuation token
    Token(String),
    /// Absolute URL of the next page
    Link(String),
}

/// Position in a paginated listing
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageCursor {
    /// Next page position
    pub position: CursorPosition,
    /// No pages remain
    pub exhausted: bool,
}

impl PageCursor {
    /// Cursor at the first page
    pub fn start() -> Self {
        Self::default()
    }

    /// Cursor at `position`
    pub fn at(position: CursorPosition) -> Self {
        Self {
            position,
            exhausted: false,
        }
    }
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.position {
            CursorPosition::Start => f.write_str("start"),
            CursorPosition::Offset(offset) => write!(f, "offset={offset}"),
            CursorPosition::Token(token) => write!(f, "token={token}"),
            CursorPosition::Link(link) => write!(f, "link={link}"),
        }
    }
}

/// One fetched page
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Position of the following page, if the server gave one
    pub next: Option<CursorPosition>,
    /// The server says this is the last page
    pub exhausted: bool,
}

impl<T> Page<T> {
    /// Page followed by `next`
    pub fn new(items: Vec<T>, next: Option<CursorPosition>) -> Self {
        Self {
            items,
            next,
            exhausted: false,
        }
    }

    /// Final page
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next: None,
            exhausted: true,
        }
    }
}

/// Fetches a single page; one call is one remote exchange.
#[async_trait]
pub trait PageFetcher<T>: Send + Sync {
    /// Fetch the page at `cursor`.
    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Page<T>, AttemptReport>;
}

/// Lazy, restartable traversal of a [`PageFetcher`]
pub struct Paginator<T, F> {
    fetcher: F,
    cursor: PageCursor,
    policy: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
    shutdown: Option<SharedShutdown>,
    page_size: Option<usize>,
    max_pages: usize,
    pages_fetched: usize,
    _items: PhantomData<fn() -> T>,
}

impl<T, F> Paginator<T, F>
where
    T: Send + 'static,
    F: PageFetcher<T> + 'static,
{
    /// Paginator starting at the first page
    pub fn new(fetcher: F, config: &EngineConfig) -> Self {
        Self {
            fetcher,
            cursor: PageCursor::start(),
            policy: RetryPolicy::from_config(config),
            limiter: None,
            shutdown: None,
            page_size: None,
            max_pages: config.max_pages,
            pages_fetched: 0,
            _items: PhantomData,
        }
    }

    /// Resume from a previously saved cursor
    pub fn starting_at(mut self, cursor: PageCursor) -> Self {
        self.cursor = cursor;
        self
    }

    /// Replace the retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Take a permit from `limiter` before every page fetch
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Treat a page shorter than `page_size` as the last one
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size).filter(|n| *n > 0);
        self
    }

    /// Set the safety cap on pages
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Stop fetching once shutdown is requested
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Cursor of the next page
    pub fn cursor(&self) -> &PageCursor {
        &self.cursor
    }

    /// Pages fetched so far
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Fetch the next page of items; `None` once the listing is done.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>, EngineError> {
        if self.cursor.exhausted {
            return Ok(None);
        }
        if self.shutdown_requested() {
            info!(cursor = %self.cursor, "Shutdown requested - pagination stopped");
            return Ok(None);
        }
        if self.pages_fetched >= self.max_pages {
            return Err(EngineError::PageLimitExceeded {
                max_pages: self.max_pages,
                cursor: self.cursor.to_string(),
            });
        }

        let Some(page) = self.fetch_with_retry().await? else {
            return Ok(None);
        };
        self.pages_fetched += 1;

        let short = self.page_size.is_some_and(|n| page.items.len() < n);
        debug!(
            page = self.pages_fetched,
            cursor = %self.cursor,
            items = page.items.len(),
            "Page fetched"
        );

        match page.next {
            Some(next) if !page.exhausted && !page.items.is_empty() && !short => {
                self.cursor.position = next;
            }
            _ => {
                self.cursor.exhausted = true;
                info!(pages = self.pages_fetched, "Pagination complete");
            }
        }

        if page.items.is_empty() {
            return Ok(None);
        }
        Ok(Some(page.items))
    }

    /// Fetch every remaining item.
    pub async fn collect_all(mut self) -> Result<Vec<T>, EngineError> {
        let mut all = Vec::new();
        while let Some(items) = self.next_page().await? {
            all.extend(items);
        }
        Ok(all)
    }

    /// Items as a stream; a page failure is yielded once and ends the stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, EngineError>> + Send + 'static {
        stream::unfold(Some(self), |state| async move {
            let mut paginator = state?;
            match paginator.next_page().await {
                Ok(Some(items)) => Some((Ok(items), Some(paginator))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .flat_map(|page| {
            let items: Vec<Result<T, EngineError>> = match page {
                Ok(items) => items.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|s| s.is_shutdown_requested())
    }

    async fn fetch_with_retry(&self) -> Result<Option<Page<T>>, EngineError> {
        let label = self.cursor.to_string();
        let mut attempt = 0u32;

        loop {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            attempt += 1;
            let started = Instant::now();
            let report = match self.fetcher.fetch_page(&self.cursor).await {
                Ok(page) => {
                    metrics::record_page_fetch("success");
                    return Ok(Some(page));
                }
                Err(report) => report,
            };
            metrics::record_page_fetch("failure");

            let outcome = self
                .policy
                .evaluate(&label, attempt, &report, started.elapsed());
            if outcome.http_status == Some(401) && self.pages_fetched == 0 {
                return Err(EngineError::Unauthorized(report.describe()));
            }
            if outcome.http_status == Some(429) {
                metrics::record_rate_limited();
                if let (Some(limiter), Some(wait)) = (&self.limiter, outcome.retry_after) {
                    limiter.observe_server_cooldown(wait).await;
                }
            }

            match self.policy.decide(&outcome) {
                RetryDecision::Finish => {
                    return Err(EngineError::PageFetch {
                        attempts: attempt,
                        message: report.describe(),
                    });
                }
                RetryDecision::Retry(delay) => {
                    let retry =
                        RetryContext::from_outcome(&outcome, self.policy.max_attempts(), delay);
                    warn!("{}", retry.format_retry());
                    sleep(delay).await;
                    if self.shutdown_requested() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}
