//! Run command: one request per input row or listed item

use clap::Parser;
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::Method;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::args::{create_progress_bar, Cli, OutputFormat, ResumeMode};
use super::export::{list_request, parse_query_pair, PageArgs};
use super::CliError;
use crate::engine::progress::format_duration;
use crate::engine::scheduler::candidates_from;
use crate::engine::{EngineError, ProgressTracker, RateLimiter, RunSummary, Scheduler};
use crate::fetcher::{ApiHttpClient, ApiRequest, HttpOperation, JsonPageFetcher, Paginator};
use crate::output::csv::CsvResultSink;
use crate::output::ResultSink;
use crate::resume;
use crate::shutdown::SharedShutdown;
use crate::{Candidate, RejectedItem, WorkItem};

/// Placeholder replaced by each row's key.
pub const KEY_PLACEHOLDER: &str = "{key}";

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Input CSV file with one row per item
    #[arg(long, required_unless_present = "list_path", conflicts_with = "list_path")]
    pub input: Option<PathBuf>,

    /// Column of the input file holding the item key
    #[arg(long, default_value = "key")]
    pub key_column: String,

    /// List endpoint whose items are run instead of an input file (e.g. /users)
    #[arg(long)]
    pub list_path: Option<String>,

    /// Extra query parameter for the list endpoint, repeatable
    #[arg(long = "list-query", value_parser = parse_query_pair)]
    pub list_query: Vec<(String, String)>,

    /// JSON pointer to each listed item's key
    #[arg(long, default_value = "/id")]
    pub key_pointer: String,

    #[command(flatten)]
    pub pages: PageArgs,

    /// Result file; rerunning with the same file skips recorded keys
    #[arg(long, default_value = "results.csv")]
    pub output: PathBuf,

    /// HTTP method
    #[arg(long, default_value = "GET")]
    pub method: String,

    /// Request path template (e.g. /audits/{key})
    #[arg(long)]
    pub path: String,

    /// JSON body template; {key} is replaced inside string values
    #[arg(long)]
    pub body: Option<String>,

    /// fsync the result file after every row
    #[arg(long, default_value_t = false)]
    pub sync_each: bool,
}

/// Turns a key into the request for it
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    method: Method,
    path: String,
    body: Option<Value>,
}

impl RequestTemplate {
    /// Parse the method, path and optional body template.
    ///
    /// # Errors
    /// Returns `CliError::InvalidArgument` for an unknown method, a body that
    /// is not JSON, or a template with no `{key}` placeholder at all
    pub fn parse(method: &str, path: &str, body: Option<&str>) -> Result<Self, CliError> {
        let method = Method::from_str(&method.to_uppercase())
            .map_err(|_| CliError::InvalidArgument(format!("Invalid HTTP method: {method}")))?;
        let body = body
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(|e| CliError::InvalidArgument(format!("Body template is not JSON: {e}")))?;

        let body_has_key = body
            .as_ref()
            .is_some_and(|b| b.to_string().contains(KEY_PLACEHOLDER));
        if !path.contains(KEY_PLACEHOLDER) && !body_has_key {
            return Err(CliError::InvalidArgument(format!(
                "neither --path nor --body contains {KEY_PLACEHOLDER}; every row would send the same request"
            )));
        }

        Ok(Self {
            method,
            path: path.to_string(),
            body,
        })
    }

    /// Request for `key`
    pub fn request_for(&self, key: &str) -> ApiRequest {
        let mut request = ApiRequest::new(self.method.clone(), self.path.replace(KEY_PLACEHOLDER, key));
        if let Some(body) = &self.body {
            request = request.with_body(substitute_key(body, key));
        }
        request
    }
}

fn substitute_key(value: &Value, key: &str) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace(KEY_PLACEHOLDER, key)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_key(v, key)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_key(v, key)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Label for a rejected row or item, e.g. `<row 3>`.
///
/// Suffixed with `#2`, `#3`... while it equals a key in `taken`.
fn rejected_label(kind: &str, number: usize, taken: &HashSet<String>) -> String {
    let base = format!("<{kind} {number}>");
    let mut label = base.clone();
    let mut suffix = 1;
    while taken.contains(&label) {
        suffix += 1;
        label = format!("{base}#{suffix}");
    }
    label
}

/// Read the input file into scheduler candidates.
///
/// Rows with an unusable key are kept as rejected candidates labelled
/// `<row N>` (1-based data row) so they get an ERROR row of their own.
/// Labels never reuse a key that appears in the file.
pub fn read_candidates(
    path: &Path,
    key_column: &str,
    template: &RequestTemplate,
) -> Result<Vec<Candidate<ApiRequest>>, CliError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| CliError::InputError(format!("Failed to open {}: {}", path.display(), e)))?;

    let headers = reader
        .headers()
        .map_err(|e| CliError::InputError(format!("Failed to read header: {}", e)))?
        .clone();
    let column = headers.iter().position(|h| h == key_column).ok_or_else(|| {
        CliError::InvalidArgument(format!(
            "input has no {key_column:?} column (found: {})",
            headers.iter().collect::<Vec<_>>().join(", ")
        ))
    })?;

    let rows: Vec<Result<String, String>> = reader
        .records()
        .map(|row| {
            let row = row.map_err(|e| format!("unreadable row: {e}"))?;
            let key = row.get(column).unwrap_or_default();
            WorkItem::<ApiRequest>::validate_key(key)?;
            Ok(key.to_string())
        })
        .collect();

    let mut taken: HashSet<String> = rows.iter().filter_map(|row| row.clone().ok()).collect();
    let mut candidates = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        let candidate = match row {
            Ok(key) => {
                let request = template.request_for(&key);
                Candidate::Ready(WorkItem::new(key, request))
            }
            Err(reason) => {
                let label = rejected_label("row", index + 1, &taken);
                taken.insert(label.clone());
                Candidate::Rejected(RejectedItem { key: label, reason })
            }
        };
        candidates.push(candidate);
    }

    info!(path = %path.display(), rows = candidates.len(), "Input loaded");
    Ok(candidates)
}

/// Candidate for one listed item, keyed by the value at `key_pointer`.
///
/// String and numeric keys are accepted. Anything else is rejected under
/// the label `<item N>` (1-based position in the listing).
pub fn listed_candidate(
    number: usize,
    item: &Value,
    key_pointer: &str,
    template: &RequestTemplate,
) -> Candidate<ApiRequest> {
    let key = match item.pointer(key_pointer) {
        Some(Value::String(key)) => key.clone(),
        Some(Value::Number(key)) => key.to_string(),
        _ => {
            return Candidate::Rejected(RejectedItem {
                key: format!("<item {number}>"),
                reason: format!("item has no string or numeric key at {key_pointer:?}"),
            })
        }
    };
    match WorkItem::<ApiRequest>::validate_key(&key) {
        Ok(()) => {
            let request = template.request_for(&key);
            Candidate::Ready(WorkItem::new(key, request))
        }
        Err(reason) => Candidate::Rejected(RejectedItem {
            key: format!("<item {number}>"),
            reason,
        }),
    }
}

/// Candidates for every item of a listing, fetched page by page as the run needs them.
pub fn listed_candidates(
    paginator: Paginator<Value, JsonPageFetcher>,
    key_pointer: String,
    template: RequestTemplate,
) -> impl Stream<Item = Result<Candidate<ApiRequest>, EngineError>> + Send + 'static {
    paginator
        .into_stream()
        .enumerate()
        .map(move |(index, item)| {
            item.map(|item| listed_candidate(index + 1, &item, &key_pointer, &template))
        })
}

type CandidateStream = BoxStream<'static, Result<Candidate<ApiRequest>, EngineError>>;

impl RunArgs {
    /// Execute the run command
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<(), CliError> {
        let config = cli.engine_config()?;
        let template = RequestTemplate::parse(&self.method, &self.path, self.body.as_deref())?;

        if cli.resume == ResumeMode::Reset {
            resume::reset(&self.output)?;
        }

        let mut sink = CsvResultSink::open(&self.output)?.with_sync_each(self.sync_each);
        let client = Arc::new(ApiHttpClient::from_config(&config)?);
        // Page fetches and item requests draw from the same budget
        let limiter = Arc::new(RateLimiter::new(config.max_requests, config.rate_window));

        let (source, pending): (CandidateStream, Option<u64>) = match &self.list_path {
            Some(list_path) => {
                let paginator = self
                    .pages
                    .paginator(
                        client.clone(),
                        list_request(list_path, &self.list_query),
                        &config,
                        limiter.clone(),
                    )
                    .with_shutdown(shutdown.clone());
                info!(
                    list = %list_path,
                    key_pointer = %self.key_pointer,
                    output = %self.output.display(),
                    "Starting run over listed items"
                );
                let source =
                    listed_candidates(paginator, self.key_pointer.clone(), template.clone());
                (source.boxed(), None)
            }
            None => {
                let input = self.input.as_deref().ok_or_else(|| {
                    CliError::InvalidArgument("either --input or --list-path is required".to_string())
                })?;
                let candidates = read_candidates(input, &self.key_column, &template)?;

                let mut seen = HashSet::new();
                let pending = candidates
                    .iter()
                    .filter(|c| !sink.already_recorded(c.key()) && seen.insert(c.key().to_string()))
                    .count() as u64;
                info!(
                    input = candidates.len(),
                    pending = pending,
                    output = %self.output.display(),
                    "Starting run"
                );
                (candidates_from(candidates).boxed(), Some(pending))
            }
        };

        let operation = Arc::new(HttpOperation::new(client));
        let scheduler = Scheduler::new(&config)
            .with_rate_limiter(limiter)
            .with_shutdown(shutdown);
        let mut tracker = ProgressTracker::default().with_total(pending);

        let pb = create_progress_bar(pending, format!("{} {}", template.method, self.path));
        let result = scheduler
            .run_to_sink_with(
                source,
                operation,
                &mut sink,
                &mut tracker,
                |result| {
                    pb.inc(1);
                    if !result.is_success() {
                        pb.set_message(format!("last error: {} ({})", result.key, result.message));
                    }
                },
            )
            .await;
        pb.finish_and_clear();

        let closed = sink.close();
        match cli.output_format {
            OutputFormat::Json => output_json(&self.output, &result),
            OutputFormat::Human => output_human(&self.output, &result),
        }

        let summary = result?;
        closed?;
        if summary.interrupted {
            warn!("Run interrupted - rerun the same command to continue");
        }
        Ok(())
    }
}

/// Output result as JSON
fn output_json(output: &Path, result: &Result<RunSummary, EngineError>) {
    let value = match result {
        Ok(summary) => serde_json::json!({
            "success": true,
            "interrupted": summary.interrupted,
            "output_path": output.display().to_string(),
            "total": summary.total,
            "succeeded": summary.succeeded,
            "failed": summary.failed,
            "skipped": summary.skipped,
            "success_rate": summary.success_rate(),
            "elapsed_secs": summary.elapsed.as_secs_f64(),
            "error": null,
        }),
        Err(e) => serde_json::json!({
            "success": false,
            "output_path": output.display().to_string(),
            "error": e.to_string(),
        }),
    };
    println!("{value}");
}

/// Output result in human-readable format
fn output_human(output: &Path, result: &Result<RunSummary, EngineError>) {
    match result {
        Ok(summary) => {
            if summary.interrupted {
                println!("\nRun interrupted - completed work is saved.");
            } else {
                println!("\nRun completed!");
            }
            println!("Output: {}", output.display());
            println!(
                "Total: {}  Success: {}  Error: {}  Skipped: {}",
                summary.total, summary.succeeded, summary.failed, summary.skipped
            );
            println!("Success rate: {:.1}%", summary.success_rate());
            println!("Elapsed: {}", format_duration(summary.elapsed));
        }
        Err(e) => {
            eprintln!("\nRun failed!");
            eprintln!("Error: {e}");
            eprintln!("Results recorded so far remain in {}", output.display());
            error!("Run failed: {}", e);
        }
    }
}
