//! Command-line arguments shared by every subcommand

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use super::export::ExportArgs;
use super::run::RunArgs;
use super::verify::VerifyArgs;
use super::CliError;
use crate::engine::config::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_PAGES, DEFAULT_MAX_REQUESTS,
    MAX_CONCURRENCY,
};
use crate::engine::EngineConfig;

/// Parse and validate concurrency value
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENCY {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENCY}"
        ));
    }
    Ok(value)
}

/// Parse a headroom fraction in (0, 1]
fn parse_headroom(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid fraction"))?;
    if !(value > 0.0 && value <= 1.0) {
        return Err(format!("headroom {value} must be in (0, 1]"));
    }
    Ok(value)
}

/// What to do with results recorded by an earlier run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Skip keys already in the output file
    On,
    /// Delete the output file and start fresh
    Reset,
}

impl FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" => Ok(ResumeMode::On),
            "reset" => Ok(ResumeMode::Reset),
            _ => Err(format!("Invalid resume mode: {s}. Valid options: on, reset")),
        }
    }
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// Bulk Runner CLI
#[derive(Parser, Debug)]
#[command(name = "bulk-runner")]
#[command(about = "Drive bulk operations through a paginated, rate-limited HTTP API", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// API base URL
    #[arg(long, global = true, env = "BULK_RUNNER_BASE_URL")]
    pub base_url: Option<String>,

    /// API bearer token
    #[arg(long, global = true, env = "BULK_RUNNER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,

    /// Resume mode: on or reset
    #[arg(long, global = true, default_value = "on")]
    pub resume: ResumeMode,

    /// Number of items executed in parallel (max: 64)
    #[arg(long, global = true, default_value_t = DEFAULT_CONCURRENCY, value_parser = parse_concurrency)]
    pub concurrency: usize,

    /// Requests allowed per rate window
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_REQUESTS)]
    pub rate_limit: usize,

    /// Length of the rate window in seconds
    #[arg(long, global = true, default_value_t = 60)]
    pub rate_window_secs: u64,

    /// Use only this fraction of --rate-limit (e.g. 0.8)
    #[arg(long, global = true, value_parser = parse_headroom)]
    pub rate_headroom: Option<f64>,

    /// Attempts per item, the first one included (range: 1-20)
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_attempts: u32,

    /// Per-attempt timeout in seconds
    #[arg(long, global = true, default_value_t = 120)]
    pub request_timeout_secs: u64,

    /// Overall deadline per item in seconds, retries included
    #[arg(long, global = true)]
    pub item_deadline_secs: Option<u64>,

    /// Safety cap on pages fetched from a listing
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_PAGES)]
    pub max_pages: usize,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9090)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute one request per input row and record every result
    Run(RunArgs),

    /// Page through a list endpoint and write every item to CSV
    Export(ExportArgs),

    /// Check a result file and print its counts
    Verify(VerifyArgs),
}

impl Cli {
    /// Build the engine configuration from global flags.
    ///
    /// # Errors
    /// Returns an error if no base URL is given or the result fails validation
    pub fn engine_config(&self) -> Result<EngineConfig, CliError> {
        let base_url = self.base_url.as_deref().ok_or_else(|| {
            CliError::ConfigurationError(
                "no API base URL: pass --base-url or set BULK_RUNNER_BASE_URL".to_string(),
            )
        })?;

        let window = Duration::from_secs(self.rate_window_secs);
        let mut config = EngineConfig::new(base_url)
            .with_concurrency(self.concurrency)
            .with_max_attempts(self.max_attempts)
            .with_timeouts(
                Duration::from_secs(self.request_timeout_secs),
                crate::engine::config::DEFAULT_CONNECT_TIMEOUT,
            )
            .with_item_deadline(self.item_deadline_secs.map(Duration::from_secs))
            .with_max_pages(self.max_pages);
        config = match self.rate_headroom {
            Some(fraction) => config.with_rate_limit_headroom(self.rate_limit, fraction, window),
            None => config.with_rate_limit(self.rate_limit, window),
        };
        if let Some(token) = self.token.as_deref().filter(|t| !t.trim().is_empty()) {
            config = config.with_token(token.trim());
        }

        config.validate()?;
        Ok(config)
    }
}

/// Progress bar for a run of `total` items; a spinner when the total is unknown.
pub(crate) fn create_progress_bar(total: Option<u64>, message: String) -> ProgressBar {
    let pb = match total {
        Some(total) => {
            let pb = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::default_bar().template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
            ) {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) =
                ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {pos} {msg}")
            {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(120));
            pb
        }
    };
    pb.set_message(message);
    pb
}
