//! Bounded-concurrency scheduler
//!
//! The driver pulls candidates from a source stream only when a worker slot
//! is free, so lazily paginated sources interleave page fetches with
//! execution. Each admitted item runs its whole attempt loop on one slot:
//! acquire a rate-limit permit, execute with a timeout, classify, then either
//! back off and retry or emit its single terminal result.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::config::{EngineConfig, RESULT_CHANNEL_CAPACITY};
use super::item::ItemState;
use super::progress::ProgressTracker;
use super::rate_limit::RateLimiter;
use super::retry::{RetryDecision, RetryPolicy};
use super::retry_formatter::RetryContext;
use super::EngineError;
use crate::metrics;
use crate::output::ResultSink;
use crate::shutdown::SharedShutdown;
use crate::{
    AttemptReport, Candidate, Classification, FailureKind, NetworkErrorKind, TerminalResult,
    WorkItem,
};

/// One remote call per attempt.
///
/// Implementations perform exactly one exchange and report what happened;
/// retries, rate limiting and timeouts belong to the scheduler.
#[async_trait]
pub trait Operation<P: Send + Sync>: Send + Sync {
    /// Execute one attempt for `item`.
    async fn execute(&self, item: &WorkItem<P>) -> AttemptReport;

    /// Bound for one attempt, replacing the scheduler's per-attempt timeout.
    ///
    /// Operations that wait on the remote side enforce their own limit and
    /// return a bound above it here.
    fn attempt_timeout(&self) -> Option<Duration> {
        None
    }
}

/// [`Operation`] backed by an async closure over a cloned item.
pub struct FnOperation<F> {
    f: F,
}

impl<F> FnOperation<F> {
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<P, F, Fut> Operation<P> for FnOperation<F>
where
    P: Clone + Send + Sync + 'static,
    F: Fn(WorkItem<P>) -> Fut + Send + Sync,
    Fut: Future<Output = AttemptReport> + Send,
{
    async fn execute(&self, item: &WorkItem<P>) -> AttemptReport {
        (self.f)(item.clone()).await
    }
}

/// Turn a finite list of candidates into a scheduler source.
pub fn candidates_from<P, I>(
    items: I,
) -> impl Stream<Item = Result<Candidate<P>, EngineError>> + Send + 'static
where
    P: Send + 'static,
    I: IntoIterator<Item = Candidate<P>>,
    I::IntoIter: Send + 'static,
{
    stream::iter(items.into_iter().map(Ok))
}

/// Intake statistics reported by the driver once it finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverReport {
    /// Items handed to a worker
    pub scheduled: u64,
    /// Candidates rejected by local validation
    pub rejected: u64,
    /// Keys skipped because a previous run recorded them
    pub skipped_recorded: u64,
    /// Keys skipped because they already appeared in this run
    pub skipped_duplicate: u64,
    /// Intake stopped because shutdown was requested
    pub interrupted: bool,
}

impl DriverReport {
    /// All skipped keys.
    pub fn skipped(&self) -> u64 {
        self.skipped_recorded + self.skipped_duplicate
    }
}

/// Final summary of a run written to a sink.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Keys seen (recorded in this run plus skipped)
    pub total: u64,
    /// SUCCESS rows written in this run
    pub succeeded: u64,
    /// ERROR rows written in this run
    pub failed: u64,
    /// Keys skipped as already recorded or duplicate
    pub skipped: u64,
    /// Wall time of the run
    pub elapsed: Duration,
    /// Whether shutdown interrupted intake
    pub interrupted: bool,
    /// Where results were written
    pub output: Option<PathBuf>,
}

impl RunSummary {
    /// Successful share of the rows written in this run, in percent.
    pub fn success_rate(&self) -> f64 {
        let processed = self.succeeded + self.failed;
        if processed == 0 {
            0.0
        } else {
            self.succeeded as f64 / processed as f64 * 100.0
        }
    }
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    /// Terminal results in completion order
    pub results: mpsc::Receiver<TerminalResult>,
    driver: JoinHandle<Result<DriverReport, EngineError>>,
}

impl SchedulerHandle {
    /// Wait for the driver and all workers to finish.
    ///
    /// Drains nothing: results still buffered in [`SchedulerHandle::results`]
    /// are dropped, so read them before joining.
    pub async fn join(self) -> Result<DriverReport, EngineError> {
        let SchedulerHandle { results, driver } = self;
        drop(results);
        driver
            .await
            .map_err(|e| EngineError::TaskError(format!("scheduler driver failed: {e}")))?
    }

    /// Stop the driver and every worker immediately.
    pub fn abort(&self) {
        self.driver.abort();
    }
}

/// Bounded-concurrency bulk scheduler
#[derive(Clone)]
pub struct Scheduler {
    concurrency: usize,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    item_deadline: Option<Duration>,
    shutdown: Option<SharedShutdown>,
    recorded: Arc<HashSet<String>>,
}

impl Scheduler {
    /// Scheduler with its own rate limiter built from `config`
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            limiter: Arc::new(RateLimiter::new(config.max_requests, config.rate_window)),
            policy: RetryPolicy::from_config(config),
            attempt_timeout: config.request_timeout,
            item_deadline: config.item_deadline,
            shutdown: None,
            recorded: Arc::new(HashSet::new()),
        }
    }

    /// Share a rate limiter (e.g. with a paginator feeding this scheduler)
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Replace the retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the per-attempt timeout
    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Set the overall per-item deadline
    pub fn with_item_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.item_deadline = deadline;
        self
    }

    /// Attach shutdown coordinator
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Keys to skip because a previous run already recorded them
    pub fn with_recorded_keys<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut recorded: HashSet<String> = self.recorded.as_ref().clone();
        recorded.extend(keys);
        self.recorded = Arc::new(recorded);
        self
    }

    /// Shared rate limiter
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    /// Start executing `source` with `operation`.
    ///
    /// Must be called inside a tokio runtime. Results arrive on the returned
    /// handle in completion order; exactly one per distinct admitted key.
    pub fn spawn<P, S, O>(&self, source: S, operation: Arc<O>) -> SchedulerHandle
    where
        P: Send + Sync + 'static,
        S: Stream<Item = Result<Candidate<P>, EngineError>> + Send + 'static,
        O: Operation<P> + 'static,
    {
        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let ctx = Arc::new(RunContext {
            operation,
            limiter: self.limiter.clone(),
            policy: self.policy.clone(),
            attempt_timeout: self.attempt_timeout,
            item_deadline: self.item_deadline,
            shutdown: self.shutdown.clone(),
            any_success: AtomicBool::new(false),
            unauthorized: OnceCell::new(),
        });

        let span = info_span!(
            "bulk_run",
            concurrency = self.concurrency,
            max_permits = self.limiter.max_permits(),
            max_attempts = self.policy.max_attempts(),
        );
        let driver = tokio::spawn(
            drive(ctx, source, self.concurrency, self.recorded.clone(), tx).instrument(span),
        );

        SchedulerHandle {
            results: rx,
            driver,
        }
    }

    /// Run `source` to completion, recording every result in `sink`.
    pub async fn run_to_sink<P, S, O, K>(
        &self,
        source: S,
        operation: Arc<O>,
        sink: &mut K,
        tracker: &mut ProgressTracker,
    ) -> Result<RunSummary, EngineError>
    where
        P: Send + Sync + 'static,
        S: Stream<Item = Result<Candidate<P>, EngineError>> + Send + 'static,
        O: Operation<P> + 'static,
        K: ResultSink,
    {
        self.run_to_sink_with(source, operation, sink, tracker, |_| {})
            .await
    }

    /// [`Scheduler::run_to_sink`] with a callback invoked for each newly recorded result.
    pub async fn run_to_sink_with<P, S, O, K, C>(
        &self,
        source: S,
        operation: Arc<O>,
        sink: &mut K,
        tracker: &mut ProgressTracker,
        mut on_result: C,
    ) -> Result<RunSummary, EngineError>
    where
        P: Send + Sync + 'static,
        S: Stream<Item = Result<Candidate<P>, EngineError>> + Send + 'static,
        O: Operation<P> + 'static,
        K: ResultSink,
        C: FnMut(&TerminalResult),
    {
        let started = Instant::now();
        let previously_recorded = sink.recorded_keys().len();
        let scheduler = self
            .clone()
            .with_recorded_keys(sink.recorded_keys().iter().cloned());
        let mut handle = scheduler.spawn(source, operation);

        info!(
            previously_recorded = previously_recorded,
            output = ?sink.location(),
            "Bulk run started"
        );

        let mut summary = RunSummary {
            output: sink.location().map(|p| p.to_path_buf()),
            ..RunSummary::default()
        };

        while let Some(result) = handle.results.recv().await {
            match sink.record(&result) {
                Ok(true) => {
                    if result.is_success() {
                        summary.succeeded += 1;
                    } else {
                        summary.failed += 1;
                    }
                    tracker.observe(&result);
                    on_result(&result);
                }
                Ok(false) => debug!(key = %result.key, "Result already recorded, ignoring"),
                Err(e) => {
                    error!(key = %result.key, error = %e, "Failed to record result, aborting run");
                    handle.abort();
                    return Err(e.into());
                }
            }

            let now = Instant::now();
            if tracker.should_emit_update_at(now) {
                info!("{}", tracker.format_progress_at(now));
                tracker.mark_emitted_at(now);
            }
        }

        sink.flush()?;
        let report = handle.join().await?;
        tracker.record_skipped(report.skipped());

        summary.skipped = report.skipped();
        summary.total = summary.succeeded + summary.failed + summary.skipped;
        summary.elapsed = started.elapsed();
        summary.interrupted = report.interrupted;

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            interrupted = summary.interrupted,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "Bulk run finished"
        );
        Ok(summary)
    }
}

struct RunContext<O> {
    operation: Arc<O>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    item_deadline: Option<Duration>,
    shutdown: Option<SharedShutdown>,
    any_success: AtomicBool,
    unauthorized: OnceCell<String>,
}

impl<O> RunContext<O> {
    fn aborted(&self) -> bool {
        self.unauthorized.get().is_some()
    }
}

enum ItemExit {
    Finished(TerminalResult),
    Abandoned,
}

async fn wait_for_shutdown(shutdown: &Option<SharedShutdown>) {
    match shutdown {
        Some(shutdown) => shutdown.wait_for_shutdown().await,
        None => std::future::pending().await,
    }
}

async fn drive<P, S, O>(
    ctx: Arc<RunContext<O>>,
    source: S,
    concurrency: usize,
    recorded: Arc<HashSet<String>>,
    tx: mpsc::Sender<TerminalResult>,
) -> Result<DriverReport, EngineError>
where
    P: Send + Sync + 'static,
    S: Stream<Item = Result<Candidate<P>, EngineError>> + Send + 'static,
    O: Operation<P> + 'static,
{
    let slots = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut report = DriverReport::default();
    let mut source = Box::pin(source);
    let mut source_error = None;

    loop {
        while let Some(joined) = tasks.try_join_next() {
            log_join_error(joined);
        }
        if ctx.aborted() {
            break;
        }

        let slot = tokio::select! {
            biased;
            _ = wait_for_shutdown(&ctx.shutdown) => {
                report.interrupted = true;
                break;
            }
            slot = slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
        };
        if ctx.aborted() {
            break;
        }

        let next = tokio::select! {
            biased;
            _ = wait_for_shutdown(&ctx.shutdown) => {
                report.interrupted = true;
                break;
            }
            next = source.next() => next,
        };

        let candidate = match next {
            None => break,
            Some(Err(e)) => {
                error!(error = %e, "Work source failed, no further items will be scheduled");
                source_error = Some(e);
                break;
            }
            Some(Ok(candidate)) => candidate,
        };

        let key = candidate.key().to_string();
        if recorded.contains(&key) {
            report.skipped_recorded += 1;
            metrics::record_skipped("recorded");
            debug!(key = %key, "Already recorded, skipping");
            continue;
        }
        if !seen.insert(key.clone()) {
            report.skipped_duplicate += 1;
            metrics::record_skipped("duplicate");
            warn!(key = %key, "Duplicate key in input, skipping");
            continue;
        }

        match candidate {
            Candidate::Rejected(rejected) => {
                report.rejected += 1;
                warn!(key = %rejected.key, reason = %rejected.reason, "Rejected before scheduling");
                let result = TerminalResult::rejected(&rejected);
                metrics::record_item_completed(&result);
                drop(slot);
                if tx.send(result).await.is_err() {
                    debug!("Result receiver dropped, stopping intake");
                    break;
                }
            }
            Candidate::Ready(item) => {
                report.scheduled += 1;
                let ctx = ctx.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    let _slot = slot;
                    run_item(ctx, item, tx).await;
                });
            }
        }
    }

    if report.interrupted {
        info!(
            in_flight = tasks.len(),
            "Shutdown requested - finishing in-flight attempts"
        );
    }
    while let Some(joined) = tasks.join_next().await {
        log_join_error(joined);
    }

    if let Some(reason) = ctx.unauthorized.get() {
        return Err(EngineError::Unauthorized(reason.clone()));
    }
    if let Some(e) = source_error {
        return Err(e);
    }
    Ok(report)
}

fn log_join_error(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Worker task panicked");
        }
    }
}

async fn run_item<P, O>(ctx: Arc<RunContext<O>>, mut item: WorkItem<P>, tx: mpsc::Sender<TerminalResult>)
where
    P: Send + Sync + 'static,
    O: Operation<P> + 'static,
{
    let span = info_span!("item", key = %item.key);
    async move {
        let mut state = ItemState::Pending;
        let exit = match ctx.item_deadline {
            Some(limit) => {
                let deadline = Instant::now() + limit;
                let bounded = timeout_at(deadline, attempt_loop(&ctx, &mut item, &mut state)).await;
                match bounded {
                    Ok(exit) => exit,
                    Err(_) => {
                        transition(&mut state, ItemState::Failed, &item.key);
                        warn!(
                            attempts = item.attempt_count,
                            deadline_secs = limit.as_secs_f64(),
                            "Item deadline exceeded"
                        );
                        ItemExit::Finished(TerminalResult::error(
                            item.key.clone(),
                            item.attempt_count,
                            FailureKind::DeadlineExceeded,
                            format!(
                                "deadline of {:.0}s exceeded after {} attempt(s)",
                                limit.as_secs_f64(),
                                item.attempt_count
                            ),
                        ))
                    }
                }
            }
            None => attempt_loop(&ctx, &mut item, &mut state).await,
        };

        match exit {
            ItemExit::Finished(result) => {
                metrics::record_item_completed(&result);
                if tx.send(result).await.is_err() {
                    debug!("Result receiver dropped before result was delivered");
                }
            }
            ItemExit::Abandoned => info!(
                attempts = item.attempt_count,
                "Shutdown requested - item left unrecorded for the next run"
            ),
        }
    }
    .instrument(span)
    .await
}

async fn attempt_loop<P, O>(
    ctx: &RunContext<O>,
    item: &mut WorkItem<P>,
    state: &mut ItemState,
) -> ItemExit
where
    P: Send + Sync + 'static,
    O: Operation<P> + 'static,
{
    loop {
        let permit = tokio::select! {
            biased;
            _ = wait_for_shutdown(&ctx.shutdown) => return ItemExit::Abandoned,
            permit = ctx.limiter.acquire() => permit,
        };

        transition(state, ItemState::Executing, &item.key);
        item.attempt_count += 1;
        let started = Instant::now();
        let limit = ctx
            .operation
            .attempt_timeout()
            .unwrap_or(ctx.attempt_timeout);
        let report = match timeout(limit, ctx.operation.execute(item)).await {
            Ok(report) => report,
            Err(_) => AttemptReport::Network {
                kind: NetworkErrorKind::Timeout,
                message: format!("attempt timed out after {:.0}s", limit.as_secs_f64()),
            },
        };
        let outcome = ctx
            .policy
            .evaluate(&item.key, item.attempt_count, &report, started.elapsed());

        metrics::record_attempt(outcome.classification, outcome.http_status);
        debug!(
            attempt = outcome.attempt,
            classification = outcome.classification.as_str(),
            status = ?outcome.http_status,
            permit_wait_ms = permit.waited.as_millis(),
            elapsed_ms = outcome.elapsed.as_millis(),
            "Attempt finished"
        );

        if outcome.classification == Classification::Success {
            ctx.any_success.store(true, Ordering::SeqCst);
        } else if outcome.http_status == Some(401) && !ctx.any_success.load(Ordering::SeqCst) {
            let reason = outcome
                .message
                .clone()
                .unwrap_or_else(|| "HTTP 401".to_string());
            if ctx.unauthorized.set(reason).is_ok() {
                error!("Credentials rejected before any success - stopping intake");
            }
        }

        if outcome.http_status == Some(429) {
            metrics::record_rate_limited();
            if let Some(wait) = outcome.retry_after {
                ctx.limiter.observe_server_cooldown(wait).await;
            }
        }

        match ctx.policy.decide(&outcome) {
            RetryDecision::Finish => {
                let result = TerminalResult::from_outcome(&outcome);
                if result.is_success() {
                    transition(state, ItemState::Succeeded, &item.key);
                } else {
                    transition(state, ItemState::Failed, &item.key);
                    let failure = RetryContext::from_outcome(
                        &outcome,
                        ctx.policy.max_attempts(),
                        Duration::ZERO,
                    );
                    if outcome.classification == Classification::RetryableFailure {
                        warn!("{}", failure.format_failure());
                    } else {
                        debug!("{}", failure.format_failure());
                    }
                }
                return ItemExit::Finished(result);
            }
            RetryDecision::Retry(delay) => {
                transition(state, ItemState::RetryScheduled, &item.key);
                let retry = RetryContext::from_outcome(&outcome, ctx.policy.max_attempts(), delay);
                warn!(
                    attempt = outcome.attempt,
                    backoff_ms = delay.as_millis(),
                    "{}",
                    retry.format_retry()
                );
                metrics::record_retry_backoff(delay, outcome.attempt);

                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&ctx.shutdown) => return ItemExit::Abandoned,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

fn transition(state: &mut ItemState, next: ItemState, key: &str) {
    if let Err(from) = state.advance(next) {
        warn!(key = %key, from = ?from, to = ?next, "Unexpected item state transition");
        *state = next;
    }
}
