//! Application layer: graph building and scheduling
//!
//! Depends on the domain model and on the I/O boundary traits only.

pub mod dot;
pub mod error;
pub mod graph;
pub mod region;
pub mod scheduler;
pub mod scope;

pub use error::{ActionContext, RealizationError, RunError, ScheduleError, ScheduleResult};
pub use graph::{
    Action, ActionGraph, ActionId, ActionKind, BuildOptions, GraphBuilder, Operation, RegionPlan,
    SkippedRegion, SystematicPlan, UnknownSystematicPolicy,
};
pub use region::Region;
pub use scheduler::{
    order, ActionState, Execution, OutputOutcome, Realized, RegionReport, RunReport, Schedule,
    Scheduler,
};
