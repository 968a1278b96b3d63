//! Domain layer: node tree, systematic variables and naming policy
//!
//! This layer is independent of external concerns (no I/O, no backend, no config loading).

pub mod detail;
pub mod error;
pub mod expr;
pub mod namer;
pub mod node;
pub mod sysvar;

pub use detail::{CutflowDetail, CutflowLabel};
pub use error::{BuildError, BuildResult, NamingError};
pub use expr::{ExprError, Expression};
pub use namer::{BranchNamer, DefaultNamer, NameRegistry, ScheduleNamer, Systematic};
pub use node::{Node, NodeId, NodeIter, NodeTree, TreeId, WeightStrategy, ROOT_NAME};
pub use sysvar::{ColumnFn, Definition, DefinitionSpec, SystematicVariable, VariableKind};
