//! CLI command implementations

pub mod args;
pub mod error;
pub mod export;
pub mod run;
pub mod verify;

pub use args::{Cli, Commands, OutputFormat, ResumeMode};
pub use error::CliError;
pub use export::ExportArgs;
pub use run::RunArgs;
pub use verify::VerifyArgs;
