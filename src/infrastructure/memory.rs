//! In-memory lazy backend
//!
//! Frames form a chain back to the source table. Nothing is evaluated while
//! the schedule constructs; the first pull evaluates a frame (and its
//! ancestors) once and caches the selected rows and defined columns.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::domain::{Definition, Expression};
use crate::infrastructure::traits::{BackendError, LazyBackend, MaterializeRequest, Materialized};

/// Named `f64` columns of equal length.
#[derive(Debug, Clone, Default)]
pub struct EventTable {
    rows: Option<usize>,
    columns: BTreeMap<String, Arc<Vec<f64>>>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(
        mut self,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<Self, BackendError> {
        self.insert(name, values)?;
        Ok(self)
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<(), BackendError> {
        let name = name.into();
        match self.rows {
            Some(expected) if expected != values.len() => {
                return Err(BackendError::RaggedColumn {
                    column: name,
                    expected,
                    actual: values.len(),
                })
            }
            _ => self.rows = Some(values.len()),
        }
        self.columns.insert(name, Arc::new(values));
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows.unwrap_or(0)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|c| c.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[derive(Debug)]
enum Step {
    Source,
    Filter { name: String, predicate: Definition },
    Define { name: String, definition: Definition },
}

#[derive(Debug, Clone)]
struct FrameData {
    /// Selected row indices into the table, ascending
    rows: Arc<Vec<usize>>,
    /// Defined columns, table-length, NaN outside the selection they were
    /// computed on
    defined: BTreeMap<String, Arc<Vec<f64>>>,
}

/// A lazy node of the in-memory dataframe.
#[derive(Debug)]
pub struct Frame {
    step: Step,
    parent: Option<Arc<Frame>>,
    data: OnceLock<Result<FrameData, BackendError>>,
}

impl Frame {
    fn new(step: Step, parent: Option<Arc<Frame>>) -> Arc<Self> {
        Arc::new(Self {
            step,
            parent,
            data: OnceLock::new(),
        })
    }

    pub fn is_evaluated(&self) -> bool {
        self.data.get().is_some()
    }
}

/// [`LazyBackend`] over an [`EventTable`].
#[derive(Debug)]
pub struct MemoryBackend {
    table: Arc<EventTable>,
    parallel: bool,
    evaluations: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(table: EventTable) -> Self {
        Self {
            table: Arc::new(table),
            parallel: false,
            evaluations: AtomicUsize::new(0),
        }
    }

    /// Evaluate rows with rayon.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn table(&self) -> &EventTable {
        &self.table
    }

    /// Number of frames evaluated so far.
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::Relaxed)
    }

    fn evaluate<'f>(&self, frame: &'f Frame) -> Result<&'f FrameData, BackendError> {
        frame
            .data
            .get_or_init(|| {
                self.evaluations.fetch_add(1, Ordering::Relaxed);
                self.compute(frame)
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    fn compute(&self, frame: &Frame) -> Result<FrameData, BackendError> {
        let parent = match &frame.parent {
            Some(parent) => Some(self.evaluate(parent)?),
            None => None,
        };
        match (&frame.step, parent) {
            (Step::Source, _) => Ok(FrameData {
                rows: Arc::new((0..self.table.rows()).collect()),
                defined: BTreeMap::new(),
            }),
            (Step::Filter { name, predicate }, Some(parent)) => {
                let inputs = self.inputs(parent, predicate)?;
                let keep = |row: usize| {
                    let values: Vec<f64> = inputs.iter().map(|c| c[row]).collect();
                    Expression::is_truthy(predicate.eval(&values))
                };
                let rows: Vec<usize> = if self.parallel {
                    parent.rows.par_iter().copied().filter(|r| keep(*r)).collect()
                } else {
                    parent.rows.iter().copied().filter(|r| keep(*r)).collect()
                };
                trace!("filter {}: {} -> {} rows", name, parent.rows.len(), rows.len());
                Ok(FrameData {
                    rows: Arc::new(rows),
                    defined: parent.defined.clone(),
                })
            }
            (Step::Define { name, definition }, Some(parent)) => {
                let inputs = self.inputs(parent, definition)?;
                let value = |row: usize| {
                    let values: Vec<f64> = inputs.iter().map(|c| c[row]).collect();
                    definition.eval(&values)
                };
                let computed: Vec<f64> = if self.parallel {
                    parent.rows.par_iter().map(|r| value(*r)).collect()
                } else {
                    parent.rows.iter().map(|r| value(*r)).collect()
                };
                let mut column = vec![f64::NAN; self.table.rows()];
                for (row, v) in parent.rows.iter().zip(computed) {
                    column[*row] = v;
                }
                trace!("define {} over {} rows", name, parent.rows.len());
                let mut defined = parent.defined.clone();
                defined.insert(name.clone(), Arc::new(column));
                Ok(FrameData {
                    rows: Arc::clone(&parent.rows),
                    defined,
                })
            }
            (_, None) => Err(BackendError::Construction {
                name: "frame".to_string(),
                reason: "non-source frame without parent".to_string(),
            }),
        }
    }

    fn lookup<'d>(&'d self, data: &'d FrameData, name: &str) -> Result<&'d [f64], BackendError> {
        data.defined
            .get(name)
            .map(|c| c.as_slice())
            .or_else(|| self.table.column(name))
            .ok_or_else(|| BackendError::MissingColumn {
                column: name.to_string(),
            })
    }

    fn inputs<'d>(
        &'d self,
        data: &'d FrameData,
        definition: &Definition,
    ) -> Result<Vec<&'d [f64]>, BackendError> {
        definition
            .inputs()
            .iter()
            .map(|name| self.lookup(data, name))
            .collect()
    }
}

impl LazyBackend for MemoryBackend {
    type Handle = Arc<Frame>;
    type Count = Arc<Frame>;
    type Result = (Arc<Frame>, MaterializeRequest);

    fn source(&self) -> Self::Handle {
        Frame::new(Step::Source, None)
    }

    fn apply_filter(
        &self,
        parent: &Self::Handle,
        name: &str,
        predicate: &Definition,
    ) -> Result<Self::Handle, BackendError> {
        Ok(Frame::new(
            Step::Filter {
                name: name.to_string(),
                predicate: predicate.clone(),
            },
            Some(Arc::clone(parent)),
        ))
    }

    fn define_column(
        &self,
        parent: &Self::Handle,
        name: &str,
        definition: &Definition,
    ) -> Result<Self::Handle, BackendError> {
        if self.table.column(name).is_some() {
            return Err(BackendError::Construction {
                name: name.to_string(),
                reason: "a dataset column with this name exists".to_string(),
            });
        }
        Ok(Frame::new(
            Step::Define {
                name: name.to_string(),
                definition: definition.clone(),
            },
            Some(Arc::clone(parent)),
        ))
    }

    fn count(&self, handle: &Self::Handle) -> Self::Count {
        Arc::clone(handle)
    }

    fn materialize(&self, handle: &Self::Handle, request: &MaterializeRequest) -> Self::Result {
        (Arc::clone(handle), request.clone())
    }

    fn pull_count(&self, count: &Self::Count) -> Result<u64, BackendError> {
        Ok(self.evaluate(count)?.rows.len() as u64)
    }

    fn pull(&self, result: &Self::Result) -> Result<Materialized, BackendError> {
        let (frame, request) = result;
        let data = self.evaluate(frame)?;
        let mut columns = BTreeMap::new();
        for (logical, physical) in &request.columns {
            let values = self.lookup(data, physical)?;
            columns.insert(
                logical.clone(),
                data.rows.iter().map(|r| values[*r]).collect(),
            );
        }
        let (sum_weights, sum_weights2) = match &request.weight {
            Some(weight) => {
                let values = self.lookup(data, weight)?;
                data.rows.iter().fold((0.0, 0.0), |(w, w2), r| {
                    let v = values[*r];
                    (w + v, w2 + v * v)
                })
            }
            None => (data.rows.len() as f64, data.rows.len() as f64),
        };
        debug!("materialized {} rows, {} columns", data.rows.len(), columns.len());
        Ok(Materialized {
            entries: data.rows.len() as u64,
            sum_weights,
            sum_weights2,
            columns,
        })
    }
}
