//! CLI-level errors (wraps infrastructure errors)

use thiserror::Error;

use crate::application::ScheduleError;
use crate::infrastructure::InfraError;

/// CLI errors are the top-level error type.
/// These are what get displayed to the user.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Infra(#[from] InfraError),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("{0}")]
    Usage(String),

    #[error("{failed} of {total} region(s) failed")]
    RunFailed { failed: usize, total: usize },
}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

impl CliError {
    /// Get the appropriate exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::InvalidArgs(_) | CliError::Usage(_) => crate::exitcode::USAGE,
            CliError::RunFailed { .. } => crate::exitcode::SOFTWARE,
            CliError::Infra(e) => match e {
                InfraError::Io { .. } => crate::exitcode::IOERR,
                InfraError::Parse { .. } | InfraError::Analysis { .. } => crate::exitcode::DATAERR,
                InfraError::Backend(_) => crate::exitcode::DATAERR,
                InfraError::Config { .. } => crate::exitcode::CONFIG,
                InfraError::Schedule(ScheduleError::Build(_)) => crate::exitcode::DATAERR,
                InfraError::Schedule(ScheduleError::Deadlock { .. }) => crate::exitcode::SOFTWARE,
            },
        }
    }
}
