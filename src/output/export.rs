//! CSV export of paginated JSON items
//!
//! Each item becomes one row. Columns are fixed up front or taken from the
//! keys of the first object written; keys missing from a later item leave an
//! empty cell and keys not among the columns are dropped.

use csv::Writer;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{OutputError, OutputResult, OutputWriter};

const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Column used when items are not JSON objects.
pub const SCALAR_COLUMN: &str = "value";

/// Flush every this many rows.
const FLUSH_EVERY: u64 = 1000;

/// CSV writer for exported JSON items
pub struct CsvExportWriter {
    writer: Writer<BufWriter<File>>,
    path: PathBuf,
    columns: Option<Vec<String>>,
    dedup_field: Option<String>,
    seen_ids: HashSet<String>,
    items_written: u64,
    duplicates_skipped: u64,
}

impl CsvExportWriter {
    /// Create (or truncate) an export file
    ///
    /// # Arguments
    /// * `path` - Output file path; parent directories are created
    pub fn new<P: AsRef<Path>>(path: P) -> OutputResult<Self> {
        let path = path.as_ref();
        info!("Creating CSV export writer: path={}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| OutputError::IoError(format!("Failed to create directory: {}", e)))?;
        }

        let file = File::create(path)
            .map_err(|e| OutputError::IoError(format!("Failed to create file: {}", e)))?;

        Ok(Self {
            writer: Writer::from_writer(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, file)),
            path: path.to_path_buf(),
            columns: None,
            dedup_field: None,
            seen_ids: HashSet::new(),
            items_written: 0,
            duplicates_skipped: 0,
        })
    }

    /// Use these columns instead of the first item's keys
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if !columns.is_empty() {
            self.columns = Some(columns);
        }
        self
    }

    /// Skip items whose `field` value was already written
    pub fn with_dedup_field(mut self, field: impl Into<String>) -> Self {
        self.dedup_field = Some(field.into());
        self
    }

    /// Rows written so far
    pub fn items_written(&self) -> u64 {
        self.items_written
    }

    /// Items skipped as duplicates
    pub fn duplicates_skipped(&self) -> u64 {
        self.duplicates_skipped
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one item.
    pub fn write_item(&mut self, item: &Value) -> OutputResult<()> {
        if let Some(field) = &self.dedup_field {
            if let Some(id) = item.get(field) {
                if !self.seen_ids.insert(cell(id)) {
                    self.duplicates_skipped += 1;
                    debug!(field = %field, id = %id, "Skipping duplicate item");
                    return Ok(());
                }
            }
        }

        if self.columns.is_none() {
            let columns = match item {
                Value::Object(map) => map.keys().cloned().collect(),
                _ => vec![SCALAR_COLUMN.to_string()],
            };
            self.writer
                .write_record(&columns)
                .map_err(|e| OutputError::CsvError(format!("Failed to write header: {}", e)))?;
            debug!(columns = columns.len(), "Export header written");
            self.columns = Some(columns);
        } else if self.items_written == 0 {
            let columns = self.columns.as_deref().unwrap_or_default();
            self.writer
                .write_record(columns)
                .map_err(|e| OutputError::CsvError(format!("Failed to write header: {}", e)))?;
        }

        let columns = self.columns.as_deref().unwrap_or_default();
        let row: Vec<String> = match item {
            Value::Object(map) => columns
                .iter()
                .map(|column| map.get(column).map(cell).unwrap_or_default())
                .collect(),
            other => {
                if columns.len() != 1 {
                    warn!("Non-object item exported into a multi-column file");
                }
                let mut row = vec![String::new(); columns.len().max(1)];
                row[0] = cell(other);
                row
            }
        };

        self.writer
            .write_record(&row)
            .map_err(|e| OutputError::CsvError(format!("Failed to write item: {}", e)))?;
        self.items_written += 1;

        if self.items_written % FLUSH_EVERY == 0 {
            self.flush()?;
            debug!("Progress: {} items exported", self.items_written);
        }
        Ok(())
    }
}

/// Render one JSON value as a CSV cell.
fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl OutputWriter for CsvExportWriter {
    fn flush(&mut self) -> OutputResult<()> {
        self.writer
            .flush()
            .map_err(|e| OutputError::FlushError(format!("Failed to flush: {}", e)))
    }

    fn close(mut self) -> OutputResult<()> {
        self.flush()?;

        let buf_writer = self
            .writer
            .into_inner()
            .map_err(|e| OutputError::IoError(format!("Failed to get inner writer: {}", e)))?;
        let file = buf_writer
            .into_inner()
            .map_err(|e| OutputError::IoError(format!("Failed to get file handle: {}", e)))?;
        file.sync_all()
            .map_err(|e| OutputError::IoError(format!("Failed to sync file: {}", e)))?;

        info!(
            "CSV export closed: {} items written, {} duplicates skipped",
            self.items_written, self.duplicates_skipped
        );
        Ok(())
    }
}
