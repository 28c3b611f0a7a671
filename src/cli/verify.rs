//! Verify command: check a result file

use clap::Parser;
use std::path::PathBuf;

use super::args::{Cli, OutputFormat};
use super::CliError;
use crate::resume::{self, RecordedResults};

/// Arguments for the verify command
#[derive(Parser, Debug)]
pub struct VerifyArgs {
    /// Result file to check
    #[arg(long, default_value = "results.csv")]
    pub output: PathBuf,
}

impl VerifyArgs {
    /// Execute the verify command
    ///
    /// Fails when the file holds malformed rows, repeated keys or a torn
    /// trailing line.
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        if !self.output.exists() {
            return Err(CliError::InvalidArgument(format!(
                "{} does not exist",
                self.output.display()
            )));
        }

        let recorded = resume::scan(&self.output)?;
        match cli.output_format {
            OutputFormat::Json => self.output_json(&recorded),
            OutputFormat::Human => self.output_human(&recorded),
        }

        if !recorded.is_clean() {
            return Err(CliError::InvalidArgument(format!(
                "{} has {} malformed row(s), {} duplicate key(s) and {} torn byte(s)",
                self.output.display(),
                recorded.malformed,
                recorded.duplicates,
                recorded.torn_tail_bytes
            )));
        }
        Ok(())
    }

    fn output_json(&self, recorded: &RecordedResults) {
        let value = serde_json::json!({
            "valid": recorded.is_clean(),
            "output_path": self.output.display().to_string(),
            "keys": recorded.keys.len(),
            "succeeded": recorded.succeeded,
            "failed": recorded.failed,
            "malformed": recorded.malformed,
            "duplicates": recorded.duplicates,
            "torn_tail_bytes": recorded.torn_tail_bytes,
        });
        println!("{value}");
    }

    fn output_human(&self, recorded: &RecordedResults) {
        println!("Result file: {}", self.output.display());
        println!("  Keys recorded: {}", recorded.keys.len());
        println!("  Success: {}", recorded.succeeded);
        println!("  Error: {}", recorded.failed);
        if recorded.is_clean() {
            println!("\nFile is valid");
            return;
        }
        if recorded.malformed > 0 {
            println!("  Malformed rows: {}", recorded.malformed);
        }
        if recorded.duplicates > 0 {
            println!("  Duplicate keys: {}", recorded.duplicates);
        }
        if recorded.torn_tail_bytes > 0 {
            println!(
                "  Incomplete trailing line: {} bytes (dropped on the next run)",
                recorded.torn_tail_bytes
            );
        }
    }
}
