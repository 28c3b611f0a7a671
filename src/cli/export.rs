//! Export command: page through a list endpoint into a CSV file

use clap::{Args, Parser};
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info};

use super::args::{create_progress_bar, Cli, OutputFormat};
use super::CliError;
use crate::engine::progress::format_duration;
use crate::engine::{EngineConfig, RateLimiter};
use crate::fetcher::{ApiHttpClient, ApiRequest, JsonPageFetcher, PaginationStyle, Paginator};
use crate::output::export::CsvExportWriter;
use crate::output::OutputWriter;
use crate::shutdown::SharedShutdown;

/// Pagination style selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleArg {
    /// Next-page link in the body
    Link,
    /// Continuation token in the body
    Token,
    /// Offset/limit query parameters
    Offset,
}

impl FromStr for StyleArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "link" => Ok(StyleArg::Link),
            "token" => Ok(StyleArg::Token),
            "offset" => Ok(StyleArg::Offset),
            _ => Err(format!(
                "Invalid pagination style: {s}. Valid options: link, token, offset"
            )),
        }
    }
}

/// Parse a `name=value` query parameter
pub(crate) fn parse_query_pair(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("'{s}' is not in name=value form"))?;
    if name.is_empty() {
        return Err(format!("'{s}' has an empty parameter name"));
    }
    Ok((name.to_string(), value.to_string()))
}

/// How to walk a JSON list endpoint; shared by `export` and `run --list-path`
#[derive(Args, Debug, Clone)]
pub struct PageArgs {
    /// Pagination style: link, token or offset
    #[arg(long, default_value = "link")]
    pub style: StyleArg,

    /// JSON pointer to the item array (empty: the whole body)
    #[arg(long, default_value = "")]
    pub items_pointer: String,

    /// JSON pointer to the next-page link (link style)
    #[arg(long, default_value = "/next_page")]
    pub next_pointer: String,

    /// JSON pointer to the continuation token (token style)
    #[arg(long, default_value = "/next_page_token")]
    pub token_pointer: String,

    /// Query parameter the token is sent back in (token style)
    #[arg(long, default_value = "page_token")]
    pub token_param: String,

    /// Items per page (offset style)
    #[arg(long, default_value_t = 100)]
    pub page_size: u64,

    /// JSON pointer to a boolean marking the last page
    #[arg(long)]
    pub done_pointer: Option<String>,
}

impl PageArgs {
    /// Pagination style described by the flags
    pub fn pagination_style(&self) -> PaginationStyle {
        match self.style {
            StyleArg::Link => PaginationStyle::Link {
                next_pointer: self.next_pointer.clone(),
            },
            StyleArg::Token => PaginationStyle::Token {
                token_pointer: self.token_pointer.clone(),
                param: self.token_param.clone(),
            },
            StyleArg::Offset => PaginationStyle::offset(self.page_size.max(1)),
        }
    }

    /// Paginator over `request`, drawing permits from `limiter`
    pub fn paginator(
        &self,
        client: Arc<ApiHttpClient>,
        request: ApiRequest,
        config: &EngineConfig,
        limiter: Arc<RateLimiter>,
    ) -> Paginator<Value, JsonPageFetcher> {
        let style = self.pagination_style();
        let page_size = style.page_size();

        let mut fetcher =
            JsonPageFetcher::new(client, request, style).with_items_pointer(&self.items_pointer);
        if let Some(pointer) = &self.done_pointer {
            fetcher = fetcher.with_done_pointer(pointer);
        }

        let paginator = Paginator::new(fetcher, config).with_rate_limiter(limiter);
        match page_size {
            Some(size) => paginator.with_page_size(size),
            None => paginator,
        }
    }
}

/// GET `path` with the given query parameters
pub fn list_request(path: &str, query: &[(String, String)]) -> ApiRequest {
    query
        .iter()
        .fold(ApiRequest::get(path), |request, (name, value)| {
            request.with_query(name, value)
        })
}

/// Arguments for the export command
#[derive(Parser, Debug)]
pub struct ExportArgs {
    /// List endpoint path (e.g. /users)
    #[arg(long)]
    pub path: String,

    /// Extra query parameter, repeatable (e.g. --query status=open)
    #[arg(long = "query", value_parser = parse_query_pair)]
    pub query: Vec<(String, String)>,

    #[command(flatten)]
    pub pages: PageArgs,

    /// Skip items whose value in this field was already exported
    #[arg(long)]
    pub dedup_field: Option<String>,

    /// Comma-separated columns (default: keys of the first item)
    #[arg(long, value_delimiter = ',')]
    pub columns: Vec<String>,

    /// Export file
    #[arg(long, default_value = "export.csv")]
    pub output: PathBuf,
}

/// Totals of an export
#[derive(Debug, Clone, Copy, Default)]
struct ExportSummary {
    items: u64,
    pages: usize,
    duplicates: u64,
    interrupted: bool,
}

impl ExportArgs {
    /// Execute the export command
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<(), CliError> {
        let config = cli.engine_config()?;
        let client = Arc::new(ApiHttpClient::from_config(&config)?);

        let limiter = Arc::new(RateLimiter::new(config.max_requests, config.rate_window));
        let mut paginator = self
            .pages
            .paginator(client, list_request(&self.path, &self.query), &config, limiter)
            .with_shutdown(shutdown.clone());

        let mut writer = CsvExportWriter::new(&self.output)?.with_columns(self.columns.clone());
        if let Some(field) = &self.dedup_field {
            writer = writer.with_dedup_field(field);
        }

        info!(path = %self.path, output = %self.output.display(), "Starting export");
        let started = Instant::now();
        let pb = create_progress_bar(None, format!("Exporting {}", self.path));

        let mut summary = ExportSummary::default();
        let result = loop {
            match paginator.next_page().await {
                Ok(Some(items)) => {
                    for item in &items {
                        writer.write_item(item)?;
                    }
                    pb.inc(items.len() as u64);
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        pb.finish_and_clear();

        summary.items = writer.items_written();
        summary.duplicates = writer.duplicates_skipped();
        summary.pages = paginator.pages_fetched();
        summary.interrupted = shutdown.is_shutdown_requested();
        writer.close()?;

        let elapsed = started.elapsed();
        match cli.output_format {
            OutputFormat::Json => {
                let value = serde_json::json!({
                    "success": result.is_ok(),
                    "interrupted": summary.interrupted,
                    "output_path": self.output.display().to_string(),
                    "items": summary.items,
                    "pages": summary.pages,
                    "duplicates_skipped": summary.duplicates,
                    "elapsed_secs": elapsed.as_secs_f64(),
                    "error": result.as_ref().err().map(|e| e.to_string()),
                });
                println!("{value}");
            }
            OutputFormat::Human => match &result {
                Ok(()) => {
                    if summary.interrupted {
                        println!("\nExport interrupted - the file holds the pages fetched so far.");
                    } else {
                        println!("\nExport completed!");
                    }
                    println!("Output: {}", self.output.display());
                    println!("Items: {}  Pages: {}", summary.items, summary.pages);
                    if summary.duplicates > 0 {
                        println!("Duplicates skipped: {}", summary.duplicates);
                    }
                    println!("Elapsed: {}", format_duration(elapsed));
                }
                Err(e) => {
                    eprintln!("\nExport failed!");
                    eprintln!("Error: {e}");
                    error!("Export failed after {} pages: {}", summary.pages, e);
                }
            },
        }

        result.map_err(CliError::from)
    }
}
