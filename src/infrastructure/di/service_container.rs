//! Service container for dependency injection
//!
//! Wires settings into the namer, backend and monitor a run needs.

use std::sync::Arc;

use crate::application::BuildOptions;
use crate::config::Settings;
use crate::domain::BranchNamer;
use crate::infrastructure::memory::{EventTable, MemoryBackend};
use crate::infrastructure::monitor::{ProgressMonitor, TracingMonitor};
use crate::infrastructure::traits::RunMonitor;

/// Container holding the services shared by all commands.
pub struct ServiceContainer {
    /// Application settings
    pub settings: Arc<Settings>,

    /// Branch namer selected by `[naming]`
    pub namer: Arc<dyn BranchNamer>,
}

impl ServiceContainer {
    pub fn new(settings: Settings) -> Self {
        let namer = settings.naming.namer();
        Self::with_namer(settings, namer)
    }

    /// Create a container with a custom namer (for testing).
    pub fn with_namer(settings: Settings, namer: Arc<dyn BranchNamer>) -> Self {
        Self {
            settings: Arc::new(settings),
            namer,
        }
    }

    pub fn build_options(&self) -> BuildOptions {
        self.settings.scheduling.build_options()
    }

    pub fn backend(&self, table: EventTable) -> MemoryBackend {
        MemoryBackend::new(table).with_parallel(self.settings.execution.parallel)
    }

    /// Progress lines when `progress_every` is set, tracing otherwise.
    pub fn monitor(&self) -> Box<dyn RunMonitor> {
        match self.settings.execution.progress_every {
            0 => Box::new(TracingMonitor),
            every => Box::new(ProgressMonitor::new(every)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamingScheme;

    #[test]
    fn given_default_settings_when_creating_container_then_backend_follows_execution_config() {
        let mut settings = Settings::default();
        settings.execution.parallel = false;
        let services = ServiceContainer::new(settings);

        let backend = services.backend(EventTable::new());

        assert_eq!(backend.evaluations(), 0);
        assert_eq!(services.build_options().default_cost, 1.0);
    }

    #[test]
    fn given_default_scheme_when_creating_container_then_namer_keeps_nominal_names() {
        let mut settings = Settings::default();
        settings.naming.scheme = NamingScheme::Default;
        let services = ServiceContainer::new(settings);

        let name = services
            .namer
            .physical_name("pt", &crate::domain::Systematic::variation("JES_up"));
        assert_eq!(name, "pt");
    }
}
