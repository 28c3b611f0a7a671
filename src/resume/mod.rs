//! Resume capability backed by the result file
//!
//! The append-only result file is the resume state: a key with a SUCCESS or
//! ERROR row is done. This module reads a result file back, reports what it
//! holds, and resets it on request.

use csv::{ByteRecord, ReaderBuilder, StringRecord};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::output::csv::RESULT_HEADER;
use crate::ResultStatus;

/// Resume errors
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// The file is not a result file written by this tool
    #[error("unexpected header in {path}: {found}")]
    HeaderMismatch {
        /// File path
        path: String,
        /// Header line actually found
        found: String,
    },
}

/// What an existing result file contains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordedResults {
    /// Keys with a terminal row
    pub keys: HashSet<String>,
    /// SUCCESS rows
    pub succeeded: u64,
    /// ERROR rows
    pub failed: u64,
    /// Rows that could not be interpreted
    pub malformed: u64,
    /// Rows repeating an earlier key
    pub duplicates: u64,
    /// Length of the file up to the end of its last complete row
    pub complete_len: u64,
    /// Bytes of a row left incomplete by an interrupted write
    pub torn_tail_bytes: u64,
}

impl RecordedResults {
    /// Whether the file is free of malformed, duplicate and torn rows.
    pub fn is_clean(&self) -> bool {
        self.malformed == 0 && self.duplicates == 0 && self.torn_tail_bytes == 0
    }
}

/// Read a result file; a missing or empty file yields an empty result.
pub fn scan(path: &Path) -> Result<RecordedResults, ResumeError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No previous results");
            return Ok(RecordedResults::default());
        }
        Err(e) => {
            return Err(ResumeError::IoError(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_reader(bytes.as_slice());
    let mut raw = ByteRecord::new();
    let mut header: Option<ByteRecord> = None;
    let mut rows = Vec::new();
    let mut complete_len = 0usize;

    loop {
        let start = reader.position().byte() as usize;
        let more = reader
            .read_byte_record(&mut raw)
            .map_err(|e| ResumeError::IoError(format!("Failed to read {}: {}", path.display(), e)))?;
        if !more {
            break;
        }
        let end = reader.position().byte() as usize;
        // A row cut off mid-write either lacks its newline or ends inside an open quote
        let span = &bytes[start..end];
        let quotes = span.iter().filter(|b| **b == b'"').count();
        if span.last() != Some(&b'\n') || quotes % 2 != 0 {
            break;
        }
        complete_len = end;
        match header {
            None => header = Some(raw.clone()),
            Some(_) => rows.push(raw.clone()),
        }
    }

    let mut recorded = RecordedResults {
        complete_len: complete_len as u64,
        torn_tail_bytes: (bytes.len() - complete_len) as u64,
        ..RecordedResults::default()
    };
    let Some(header) = header else {
        return Ok(recorded);
    };

    if header.iter().ne(RESULT_HEADER.iter().map(|h| h.as_bytes())) {
        return Err(ResumeError::HeaderMismatch {
            path: path.display().to_string(),
            found: header
                .iter()
                .map(|field| String::from_utf8_lossy(field).into_owned())
                .collect::<Vec<_>>()
                .join(","),
        });
    }

    for raw in rows {
        let Ok(row) = StringRecord::from_byte_record(raw) else {
            recorded.malformed += 1;
            continue;
        };
        let key = row.get(0).filter(|k| !k.is_empty());
        let status = row.get(1).and_then(|s| ResultStatus::from_str(s).ok());
        match (key, status) {
            (Some(key), Some(status)) if row.len() == RESULT_HEADER.len() => {
                if !recorded.keys.insert(key.to_string()) {
                    recorded.duplicates += 1;
                    continue;
                }
                match status {
                    ResultStatus::Success => recorded.succeeded += 1,
                    ResultStatus::Error => recorded.failed += 1,
                }
            }
            _ => recorded.malformed += 1,
        }
    }

    Ok(recorded)
}

/// Delete a result file so the next run starts fresh; returns whether one existed.
pub fn reset(path: &Path) -> Result<bool, ResumeError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!("Reset mode: deleted previous results at {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ResumeError::IoError(format!(
            "Failed to delete {}: {}",
            path.display(),
            e
        ))),
    }
}
