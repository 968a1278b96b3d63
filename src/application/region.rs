//! Regions: named requests to materialize one node

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::domain::{NodeId, Systematic};
use crate::infrastructure::traits::OutputWriter;

/// Materialize the selection ending at `target` under a set of systematics,
/// handing each result to every writer.
pub struct Region<D> {
    name: String,
    target: NodeId,
    systematics: BTreeSet<Systematic>,
    writers: Vec<Arc<dyn OutputWriter<D>>>,
}

impl<D> Region<D> {
    /// New region requesting only the nominal systematic.
    pub fn new(name: impl Into<String>, target: NodeId) -> Self {
        Self {
            name: name.into(),
            target,
            systematics: BTreeSet::from([Systematic::Nominal]),
            writers: Vec::new(),
        }
    }

    pub fn with_systematic(mut self, systematic: Systematic) -> Self {
        self.systematics.insert(systematic);
        self
    }

    pub fn with_systematics<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.systematics
            .extend(names.into_iter().map(|s| Systematic::Variation(s.into())));
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn OutputWriter<D>>) -> Self {
        self.writers.push(writer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Requested systematics, nominal first.
    pub fn systematics(&self) -> &BTreeSet<Systematic> {
        &self.systematics
    }

    pub fn writers(&self) -> &[Arc<dyn OutputWriter<D>>] {
        &self.writers
    }
}

impl<D> Clone for Region<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            target: self.target,
            systematics: self.systematics.clone(),
            writers: self.writers.clone(),
        }
    }
}

impl<D> fmt::Debug for Region<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("systematics", &self.systematics)
            .field(
                "writers",
                &self.writers.iter().map(|w| w.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
