//! Domain-level errors (no external dependencies)
//!
//! Everything raised while a schedule is being built is a [`BuildError`]:
//! a malformed graph is never partially executed.

use thiserror::Error;

use crate::domain::expr::ExprError;

/// Naming policy violations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NamingError {
    #[error("systematic name '{name}' violates naming policy: {reason}")]
    InvalidSystematic { name: String, reason: String },

    #[error("column name '{name}' violates naming policy: {reason}")]
    InvalidColumn { name: String, reason: String },

    #[error("physical column '{physical}' assigned to both {first} and {second}")]
    Collision {
        physical: String,
        first: String,
        second: String,
    },

    #[error("column '{name}' is already defined on the path to '{path}'")]
    DuplicateDefinition { name: String, path: String },
}

/// Errors raised while building the node tree or the action graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("naming error: {0}")]
    Naming(#[from] NamingError),

    #[error("{0}")]
    Expression(#[from] ExprError),

    #[error(
        "cannot resolve '{missing}' for '{variable}' under systematic '{systematic}' at '{path}'"
    )]
    SystematicResolution {
        variable: String,
        systematic: String,
        missing: String,
        path: String,
    },

    #[error("region '{region}' requests unknown systematic '{systematic}' (target '{path}')")]
    UnknownSystematic {
        region: String,
        systematic: String,
        path: String,
    },

    #[error(
        "cyclic dependency: '{column}' read by '{consumer}' under '{systematic}' is not produced upstream of '{path}'"
    )]
    CyclicDependency {
        column: String,
        consumer: String,
        systematic: String,
        path: String,
    },

    #[error("invalid node '{name}': {reason}")]
    InvalidNode { name: String, reason: String },

    #[error("node handle does not belong to this tree: {context}")]
    ForeignNode { context: String },

    #[error("invalid region '{name}': {reason}")]
    InvalidRegion { name: String, reason: String },

    #[error("duplicate region name: {0}")]
    DuplicateRegion(String),

    #[error("invalid cost {cost} for '{owner}': must be finite and non-negative")]
    InvalidCost { owner: String, cost: f64 },
}

impl BuildError {
    /// Short category name, used in reports and the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::Naming(_) => "NamingError",
            BuildError::Expression(_) => "ExpressionError",
            BuildError::SystematicResolution { .. } => "SystematicResolutionError",
            BuildError::UnknownSystematic { .. } => "UnknownSystematicError",
            BuildError::CyclicDependency { .. } => "CyclicDependencyError",
            BuildError::InvalidNode { .. } | BuildError::ForeignNode { .. } => "NodeError",
            BuildError::InvalidRegion { .. } | BuildError::DuplicateRegion(_) => "RegionError",
            BuildError::InvalidCost { .. } => "CostError",
        }
    }
}

/// Result type for domain operations.
pub type BuildResult<T> = Result<T, BuildError>;
