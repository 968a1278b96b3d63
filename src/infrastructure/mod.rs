//! Infrastructure layer: I/O implementations and DI container
//!
//! This layer implements the backend and writer traits and wires up services.

pub mod analysis;
pub mod di;
pub mod error;
pub mod memory;
pub mod monitor;
pub mod traits;
pub mod writers;

pub use analysis::{load_analysis, parse_analysis, Analysis};
pub use error::{InfraError, InfraResult};
pub use memory::{EventTable, MemoryBackend};
pub use monitor::{ProgressMonitor, TracingMonitor};
pub use traits::{
    ActionEvent, BackendError, CutflowStep, LazyBackend, MaterializeRequest, Materialized,
    OutputWriter, RunMonitor, WriteContext, WriteError,
};
pub use writers::{CutflowWriter, ObjectWriter};
