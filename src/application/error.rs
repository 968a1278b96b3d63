//! Application-level errors (wraps domain errors)

use thiserror::Error;

use crate::application::graph::{Action, ActionId};
use crate::domain::BuildError;
use crate::infrastructure::traits::{BackendError, WriteError};

/// Fatal errors of a schedule build.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("{0}")]
    Build(#[from] BuildError),

    #[error("scheduler deadlock: {pending} action(s) pending but none ready (first pending: {first})")]
    Deadlock { pending: usize, first: String },
}

impl ScheduleError {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleError::Build(e) => e.kind(),
            ScheduleError::Deadlock { .. } => "SchedulerDeadlockError",
        }
    }
}

/// Where a failing action sits, enough to rerun it in isolation.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionContext {
    pub action: ActionId,
    pub label: String,
    pub path: String,
    pub systematic: String,
}

impl From<&Action> for ActionContext {
    fn from(action: &Action) -> Self {
        Self {
            action: action.id(),
            label: action.label(),
            path: action.path().to_string(),
            systematic: action.systematic().to_string(),
        }
    }
}

/// Backend failure while constructing or realizing an action.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RealizationError {
    #[error("action {} '{}' at '{}' under '{}' failed: {source}", .context.action, .context.label, .context.path, .context.systematic)]
    Backend {
        context: ActionContext,
        #[source]
        source: BackendError,
    },

    #[error("action {} '{}' not realized: {cause}", .context.action, .context.label)]
    Upstream {
        context: ActionContext,
        /// The original backend failure further up the chain
        cause: Box<RealizationError>,
    },
}

impl RealizationError {
    pub fn backend(action: &Action, source: BackendError) -> Self {
        RealizationError::Backend {
            context: action.into(),
            source,
        }
    }

    /// Propagate `cause` to `action`, keeping only the root failure.
    pub fn upstream(action: &Action, cause: RealizationError) -> Self {
        RealizationError::Upstream {
            context: action.into(),
            cause: Box::new(cause.root_cause().clone()),
        }
    }

    pub fn context(&self) -> &ActionContext {
        match self {
            RealizationError::Backend { context, .. } | RealizationError::Upstream { context, .. } => {
                context
            }
        }
    }

    pub fn root_cause(&self) -> &RealizationError {
        match self {
            RealizationError::Backend { .. } => self,
            RealizationError::Upstream { cause, .. } => cause.root_cause(),
        }
    }
}

/// Per-output failure reported after a run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("{0}")]
    Realization(#[from] RealizationError),

    #[error("{0}")]
    Write(#[from] WriteError),

    #[error("region '{region}' aborted after an earlier realization failure")]
    Aborted { region: String },
}

/// Result type for application layer operations.
pub type ScheduleResult<T> = Result<T, ScheduleError>;
