//! Node detail payloads
//!
//! The core threads a caller-chosen `D` through every node and hands it to
//! output writers untouched. Writers that need something from it say so
//! with a trait bound.

/// Row label used by cutflow-style writers.
pub trait CutflowLabel {
    /// `None` falls back to the node name.
    fn cutflow_label(&self) -> Option<&str>;
}

/// Per-node cutflow bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CutflowDetail {
    pub label: Option<String>,
}

impl CutflowDetail {
    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
        }
    }
}

impl CutflowLabel for CutflowDetail {
    fn cutflow_label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl CutflowLabel for () {
    fn cutflow_label(&self) -> Option<&str> {
        None
    }
}
