//! CLI error types and conversions

use crate::engine::EngineError;
use crate::metrics::MetricsError;
use crate::output::OutputError;
use crate::resume::ResumeError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Engine error
    #[error("engine error: {0}")]
    EngineError(#[from] EngineError),

    /// Output error
    #[error("output error: {0}")]
    OutputError(#[from] OutputError),

    /// Resume error
    #[error("resume error: {0}")]
    ResumeError(#[from] ResumeError),

    /// Metrics exporter error
    #[error("metrics error: {0}")]
    MetricsError(#[from] MetricsError),

    /// Input file could not be read
    #[error("input error: {0}")]
    InputError(String),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}
