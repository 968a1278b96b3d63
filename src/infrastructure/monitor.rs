//! Run monitors

use std::sync::atomic::{AtomicU64, Ordering};

use colored::Colorize;
use tracing::{debug, info, warn};

use crate::application::error::RealizationError;
use crate::application::scheduler::RunReport;
use crate::infrastructure::traits::{ActionEvent, RunMonitor};

/// Reports construction and realization through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMonitor;

impl RunMonitor for TracingMonitor {
    fn schedule_started(&self, actions: usize) {
        info!("constructing {} actions", actions);
    }

    fn action_constructed(&self, event: &ActionEvent<'_>, outcome: Result<(), &RealizationError>) {
        match outcome {
            Ok(()) => debug!(
                "constructed {} {} at {} [{}]",
                event.kind, event.id, event.path, event.systematic
            ),
            Err(e) => warn!("construction of {} failed: {}", event.id, e),
        }
    }

    fn action_realized(&self, event: &ActionEvent<'_>, outcome: Result<(), &RealizationError>) {
        match outcome {
            Ok(()) => debug!(
                "realized {} {} at {} [{}]",
                event.kind, event.id, event.path, event.systematic
            ),
            Err(e) => warn!("realization of {} failed: {}", event.id, e),
        }
    }

    fn schedule_finished(&self, report: &RunReport) {
        info!(
            "finished: {} regions, {} failed outputs, {} skipped regions",
            report.regions.len(),
            report.failures().len(),
            report.skipped.len()
        );
    }
}

/// Prints a progress line to stderr every `every` realized actions.
#[derive(Debug)]
pub struct ProgressMonitor {
    every: u64,
    total: AtomicU64,
    realized: AtomicU64,
    failed: AtomicU64,
}

impl ProgressMonitor {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            total: AtomicU64::new(0),
            realized: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn realized(&self) -> u64 {
        self.realized.load(Ordering::Relaxed)
    }

    /// Actions that failed to construct or realize.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl RunMonitor for ProgressMonitor {
    fn schedule_started(&self, actions: usize) {
        self.total.store(actions as u64, Ordering::Relaxed);
        self.realized.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }

    fn action_constructed(&self, event: &ActionEvent<'_>, outcome: Result<(), &RealizationError>) {
        if let Err(e) = outcome {
            self.failed.fetch_add(1, Ordering::Relaxed);
            eprintln!("{} {} {}: {}", "✗".red(), event.id, event.path, e);
        }
    }

    fn action_realized(&self, event: &ActionEvent<'_>, outcome: Result<(), &RealizationError>) {
        let done = self.realized.fetch_add(1, Ordering::Relaxed) + 1;
        if let Err(e) = outcome {
            self.failed.fetch_add(1, Ordering::Relaxed);
            eprintln!("{} {} {}: {}", "✗".red(), event.id, event.path, e);
        }
        if done % self.every == 0 {
            eprintln!(
                "{} realized {} / {} actions",
                "…".cyan(),
                done,
                self.total.load(Ordering::Relaxed)
            );
        }
    }

    fn schedule_finished(&self, report: &RunReport) {
        let failed = report.failures().len();
        let line = format!(
            "realized {} actions, {} failed outputs",
            self.realized(),
            failed
        );
        if failed == 0 {
            eprintln!("{} {}", "✓".green(), line);
        } else {
            eprintln!("{} {}", "✗".red(), line.red());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::graph::{ActionId, ActionKind};
    use crate::domain::Systematic;

    #[test]
    fn given_progress_monitor_when_actions_realize_then_counts_them() {
        let monitor = ProgressMonitor::new(0);
        let systematic = Systematic::Nominal;
        let event = ActionEvent {
            id: ActionId::from_index(3),
            kind: ActionKind::FilterApply,
            path: "ROOT/sel",
            systematic: &systematic,
        };

        monitor.schedule_started(2);
        monitor.action_realized(&event, Ok(()));
        monitor.action_realized(&event, Ok(()));

        assert_eq!(monitor.realized(), 2);
    }

    #[test]
    fn given_progress_monitor_when_construction_fails_then_failure_is_counted() {
        let monitor = ProgressMonitor::new(10);
        let systematic = Systematic::Nominal;
        let event = ActionEvent {
            id: ActionId::from_index(1),
            kind: ActionKind::VariableDefine,
            path: "ROOT",
            systematic: &systematic,
        };
        let error = RealizationError::Backend {
            context: crate::application::error::ActionContext {
                action: event.id,
                label: "define ghost2 = ghost_pt * 2 @ ROOT".to_string(),
                path: "ROOT".to_string(),
                systematic: "nominal".to_string(),
            },
            source: crate::infrastructure::traits::BackendError::Construction {
                name: "ghost2".to_string(),
                reason: "unknown column 'ghost_pt'".to_string(),
            },
        };

        monitor.schedule_started(3);
        monitor.action_constructed(&event, Ok(()));
        monitor.action_constructed(&event, Err(&error));

        assert_eq!(monitor.failed(), 1);
        assert_eq!(monitor.realized(), 0);
    }
}
