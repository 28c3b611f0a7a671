//! Append-only CSV result sink
//!
//! Every result becomes one complete line written with a single `write_all`
//! and flushed immediately, so an interruption loses at most the line being
//! written. On open, an existing file is read back once to learn which keys
//! are already done; a torn trailing line is cut off.

use csv::WriterBuilder;
use fd_lock::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{OutputError, OutputResult, ResultSink};
use crate::resume;
use crate::TerminalResult;

/// Column names of the result file.
pub const RESULT_HEADER: [&str; 5] = ["key", "status", "message", "timestamp", "attempts"];

/// CSV record for a terminal result
#[derive(Debug, Serialize)]
struct ResultRecord<'a> {
    key: &'a str,
    status: &'static str,
    message: &'a str,
    timestamp: String,
    attempts: u32,
}

impl<'a> From<&'a TerminalResult> for ResultRecord<'a> {
    fn from(result: &'a TerminalResult) -> Self {
        Self {
            key: &result.key,
            status: result.status.as_str(),
            message: &result.message,
            timestamp: result.timestamp_string(),
            attempts: result.attempts,
        }
    }
}

/// Append-only CSV sink doubling as the resume log
pub struct CsvResultSink {
    path: PathBuf,
    file: RwLock<File>,
    recorded: HashSet<String>,
    rows_written: u64,
    sync_each: bool,
}

impl CsvResultSink {
    /// Open (or create) the result file at `path`
    ///
    /// # Arguments
    /// * `path` - Output file path; parent directories are created
    ///
    /// # Returns
    /// A sink whose recorded keys include every key already in the file
    pub fn open<P: AsRef<Path>>(path: P) -> OutputResult<Self> {
        let path = path.as_ref();
        info!("Opening CSV result sink: path={}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| OutputError::IoError(format!("Failed to create directory: {}", e)))?;
        }

        let existing = resume::scan(path)?;
        if existing.torn_tail_bytes > 0 {
            warn!(
                path = %path.display(),
                bytes = existing.torn_tail_bytes,
                "Discarding incomplete trailing line from an interrupted run"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|e| OutputError::IoError(format!("Failed to open file: {}", e)))?;
            file.set_len(existing.complete_len)
                .map_err(|e| OutputError::IoError(format!("Failed to truncate file: {}", e)))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| OutputError::IoError(format!("Failed to open file: {}", e)))?;

        if existing.complete_len == 0 {
            let mut header = RESULT_HEADER.join(",");
            header.push('\n');
            file.write_all(header.as_bytes())
                .and_then(|_| file.flush())
                .map_err(|e| OutputError::IoError(format!("Failed to write header: {}", e)))?;
            debug!("Wrote result header to new file");
        } else {
            info!(
                recorded = existing.keys.len(),
                succeeded = existing.succeeded,
                failed = existing.failed,
                "Resuming: keys already recorded will be skipped"
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            recorded: existing.keys,
            rows_written: 0,
            sync_each: false,
        })
    }

    /// Also `fsync` after every record
    pub fn with_sync_each(mut self, sync_each: bool) -> Self {
        self.sync_each = sync_each;
        self
    }

    /// Rows appended through this sink
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and `fsync` the file.
    pub fn close(mut self) -> OutputResult<()> {
        ResultSink::flush(&mut self)?;
        let guard = self
            .file
            .write()
            .map_err(|e| OutputError::IoError(format!("Failed to lock file: {}", e)))?;
        guard
            .sync_all()
            .map_err(|e| OutputError::IoError(format!("Failed to sync file: {}", e)))?;
        info!(
            "CSV result sink closed: {} rows written to {}",
            self.rows_written,
            self.path.display()
        );
        Ok(())
    }
}

/// Serialize one result into a complete CSV line.
fn encode_row(result: &TerminalResult) -> OutputResult<Vec<u8>> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(128));
    writer
        .serialize(ResultRecord::from(result))
        .map_err(|e| OutputError::CsvError(format!("Failed to encode result: {}", e)))?;
    writer
        .into_inner()
        .map_err(|e| OutputError::SerializationError(format!("Failed to finish row: {}", e)))
}

impl ResultSink for CsvResultSink {
    fn record(&mut self, result: &TerminalResult) -> OutputResult<bool> {
        if self.recorded.contains(&result.key) {
            return Ok(false);
        }

        let line = encode_row(result)?;
        {
            // One locked append per row
            let mut guard = self
                .file
                .write()
                .map_err(|e| OutputError::IoError(format!("Failed to lock file: {}", e)))?;
            guard
                .write_all(&line)
                .map_err(|e| OutputError::IoError(format!("Failed to write result: {}", e)))?;
            guard
                .flush()
                .map_err(|e| OutputError::FlushError(format!("Failed to flush: {}", e)))?;
            if self.sync_each {
                guard
                    .sync_data()
                    .map_err(|e| OutputError::IoError(format!("Failed to sync file: {}", e)))?;
            }
        }

        self.recorded.insert(result.key.clone());
        self.rows_written += 1;
        Ok(true)
    }

    fn recorded_keys(&self) -> &HashSet<String> {
        &self.recorded
    }

    fn flush(&mut self) -> OutputResult<()> {
        let mut guard = self
            .file
            .write()
            .map_err(|e| OutputError::IoError(format!("Failed to lock file: {}", e)))?;
        guard
            .flush()
            .map_err(|e| OutputError::FlushError(format!("Failed to flush: {}", e)))
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
