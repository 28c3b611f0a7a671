//! Result sinks and export writers

use std::collections::HashSet;
use std::path::Path;

use crate::resume::ResumeError;
use crate::TerminalResult;

pub mod csv;
pub mod export;

/// Output writer errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// CSV write error
    #[error("CSV error: {0}")]
    CsvError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Buffer flush error
    #[error("flush error: {0}")]
    FlushError(String),

    /// Existing results could not be read back
    #[error("resume error: {0}")]
    ResumeError(#[from] ResumeError),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Durable, append-only recorder of terminal results.
///
/// A sink is the single writer for its destination. Recording a key that is
/// already present is a no-op that returns `Ok(false)`.
pub trait ResultSink: Send {
    /// Append `result`; returns whether it was newly recorded.
    fn record(&mut self, result: &TerminalResult) -> OutputResult<bool>;

    /// Whether `key` already has a terminal result.
    fn already_recorded(&self, key: &str) -> bool {
        self.recorded_keys().contains(key)
    }

    /// Every key with a terminal result, from previous runs included.
    fn recorded_keys(&self) -> &HashSet<String>;

    /// Make everything recorded so far durable.
    fn flush(&mut self) -> OutputResult<()>;

    /// Where results are written, if on disk.
    fn location(&self) -> Option<&Path> {
        None
    }
}

/// Generic buffered writer lifecycle
pub trait OutputWriter {
    /// Flush any buffered data to disk
    fn flush(&mut self) -> OutputResult<()>;

    /// Close the writer and finalize output
    fn close(self) -> OutputResult<()>;
}

/// In-memory sink for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryResultSink {
    results: Vec<TerminalResult>,
    keys: HashSet<String>,
}

impl MemoryResultSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that treats `keys` as already recorded
    pub fn with_recorded<I: IntoIterator<Item = String>>(keys: I) -> Self {
        Self {
            results: Vec::new(),
            keys: keys.into_iter().collect(),
        }
    }

    /// Results recorded by this sink, in arrival order
    pub fn results(&self) -> &[TerminalResult] {
        &self.results
    }
}

impl ResultSink for MemoryResultSink {
    fn record(&mut self, result: &TerminalResult) -> OutputResult<bool> {
        if !self.keys.insert(result.key.clone()) {
            return Ok(false);
        }
        self.results.push(result.clone());
        Ok(true)
    }

    fn recorded_keys(&self) -> &HashSet<String> {
        &self.keys
    }

    fn flush(&mut self) -> OutputResult<()> {
        Ok(())
    }
}
