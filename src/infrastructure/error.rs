//! Infrastructure-level errors (wraps application errors)

use std::path::PathBuf;

use thiserror::Error;

use crate::application::ScheduleError;
use crate::domain::BuildError;
use crate::infrastructure::traits::BackendError;

/// Infrastructure errors wrap schedule errors and add I/O-level concerns.
#[derive(Error, Debug)]
pub enum InfraError {
    #[error("{0}")]
    Schedule(#[from] ScheduleError),

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid analysis {}: {message}", .path.display())]
    Analysis { path: PathBuf, message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("dataset error: {0}")]
    Backend(#[from] BackendError),
}

impl InfraError {
    /// Create an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn analysis(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Analysis {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<BuildError> for InfraError {
    fn from(e: BuildError) -> Self {
        Self::Schedule(e.into())
    }
}

/// Result type for infrastructure layer operations.
pub type InfraResult<T> = Result<T, InfraError>;
