//! cutgraph: compile a selection tree with systematic variations and a set of
//! output regions into a deduplicated, cost-ordered lazy action graph.

pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod exitcode;
pub mod infrastructure;
pub mod util;
