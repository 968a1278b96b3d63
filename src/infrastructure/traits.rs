//! I/O boundary traits
//!
//! The scheduler only ever talks to these:
//! - [`LazyBackend`]: deferred filter/define/count/materialize plus pulls
//! - [`OutputWriter`]: persists one materialized result
//! - [`RunMonitor`]: observes construction and realization

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::application::graph::{ActionId, ActionKind};
use crate::application::error::RealizationError;
use crate::application::scheduler::RunReport;
use crate::domain::{Definition, NodeId, Systematic};

/// Failure inside a lazy backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("column '{column}' is not available")]
    MissingColumn { column: String },

    #[error("column '{column}' has {actual} rows, expected {expected}")]
    RaggedColumn {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("cannot construct '{name}': {reason}")]
    Construction { name: String, reason: String },

    #[error("evaluation of '{name}' failed: {reason}")]
    Evaluation { name: String, reason: String },
}

/// Columns an output asks for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterializeRequest {
    /// `(logical, physical)` pairs
    pub columns: Vec<(String, String)>,
    /// Physical weight column; unit weights if absent
    pub weight: Option<String>,
}

/// Concrete result of an output action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Materialized {
    pub entries: u64,
    pub sum_weights: f64,
    pub sum_weights2: f64,
    /// Selected values keyed by logical column name
    pub columns: BTreeMap<String, Vec<f64>>,
}

/// Deferred dataframe engine.
///
/// Construction calls only build the lazy graph; nothing runs until one of
/// the `pull_*` calls asks for a concrete value.
pub trait LazyBackend {
    type Handle: Clone;
    type Count;
    type Result;

    /// Handle on the unfiltered dataset.
    fn source(&self) -> Self::Handle;

    fn apply_filter(
        &self,
        parent: &Self::Handle,
        name: &str,
        predicate: &Definition,
    ) -> Result<Self::Handle, BackendError>;

    fn define_column(
        &self,
        parent: &Self::Handle,
        name: &str,
        definition: &Definition,
    ) -> Result<Self::Handle, BackendError>;

    fn count(&self, handle: &Self::Handle) -> Self::Count;

    fn materialize(&self, handle: &Self::Handle, request: &MaterializeRequest) -> Self::Result;

    fn pull_count(&self, count: &Self::Count) -> Result<u64, BackendError>;

    fn pull(&self, result: &Self::Result) -> Result<Materialized, BackendError>;
}

/// Failure persisting one output.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("writer '{writer}' failed for region '{region}' under '{systematic}': {reason}")]
pub struct WriteError {
    pub writer: String,
    pub region: String,
    pub systematic: String,
    pub path: Option<PathBuf>,
    pub reason: String,
}

/// One row of the selection path leading to a region.
#[derive(Debug)]
pub struct CutflowStep<'a, D> {
    pub node: &'a str,
    pub detail: &'a D,
    pub events: u64,
    /// Sum of the node weight over the passing events; `events` if unweighted
    pub sum_weights: f64,
    pub sum_weights2: f64,
}

/// Everything a writer learns about the output it persists.
#[derive(Debug)]
pub struct WriteContext<'a, D> {
    pub region: &'a str,
    pub systematic: &'a Systematic,
    pub target: NodeId,
    pub detail: &'a D,
    /// Root first, region target last
    pub cutflow: Vec<CutflowStep<'a, D>>,
}

impl<D> WriteContext<'_, D> {
    pub fn error(&self, writer: &str, path: Option<PathBuf>, reason: impl fmt::Display) -> WriteError {
        WriteError {
            writer: writer.to_string(),
            region: self.region.to_string(),
            systematic: self.systematic.to_string(),
            path,
            reason: reason.to_string(),
        }
    }
}

pub trait OutputWriter<D>: Send + Sync {
    fn name(&self) -> &str;

    /// Logical columns to materialize for this writer.
    fn columns(&self) -> &[String] {
        &[]
    }

    /// Logical weight column.
    fn weight(&self) -> Option<&str> {
        None
    }

    fn write(&self, context: &WriteContext<'_, D>, result: &Materialized) -> Result<(), WriteError>;
}

/// What a monitor is told about an action.
#[derive(Debug, Clone, Copy)]
pub struct ActionEvent<'a> {
    pub id: ActionId,
    pub kind: ActionKind,
    pub path: &'a str,
    pub systematic: &'a Systematic,
}

/// Observer of a schedule run; nothing it does influences scheduling.
pub trait RunMonitor {
    fn schedule_started(&self, _actions: usize) {}

    fn action_constructed(&self, _event: &ActionEvent<'_>, _outcome: Result<(), &RealizationError>) {}

    fn action_realized(&self, _event: &ActionEvent<'_>, _outcome: Result<(), &RealizationError>) {}

    fn schedule_finished(&self, _report: &RunReport) {}
}

/// Monitor that ignores everything.
impl RunMonitor for () {}
