//! Construction order and execution of an action graph
//!
//! Construction walks the graph in a deterministic topological order and asks
//! the backend for lazy handles only. Realization happens afterwards, pulled
//! by the outputs, and every action is realized at most once.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::application::error::{
    ActionContext, RealizationError, RunError, ScheduleError, ScheduleResult,
};
use crate::application::graph::{
    Action, ActionGraph, ActionId, BuildOptions, GraphBuilder, Operation, RegionPlan,
    SkippedRegion, SystematicPlan,
};
use crate::application::region::Region;
use crate::domain::{BranchNamer, NodeTree, Systematic};
use crate::infrastructure::traits::{
    ActionEvent, BackendError, CutflowStep, LazyBackend, Materialized, OutputWriter, RunMonitor,
    WriteContext, WriteError,
};

/// Position of a ready action in the construction queue.
#[derive(Debug, Clone, Copy)]
struct ReadyKey {
    rank: u8,
    cost: f64,
    id: ActionId,
}

impl ReadyKey {
    fn new(action: &Action) -> Self {
        Self {
            rank: action.kind().rank(),
            cost: action.cost(),
            id: action.id(),
        }
    }
}

impl PartialEq for ReadyKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyKey {}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| self.cost.total_cmp(&other.cost))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Construction order: dependencies first, then filters before anything
/// else, cheaper before dearer, older before newer.
pub fn order(graph: &ActionGraph) -> ScheduleResult<Vec<ActionId>> {
    let actions = graph.actions();
    let mut missing: Vec<usize> = actions.iter().map(|a| a.dependencies().len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); actions.len()];
    for (index, action) in actions.iter().enumerate() {
        for dependency in action.dependencies() {
            if let Some(list) = dependents.get_mut(dependency.index()) {
                list.push(index);
            }
        }
    }

    let mut ready: BTreeSet<ReadyKey> = actions
        .iter()
        .zip(&missing)
        .filter(|(_, count)| **count == 0)
        .map(|(action, _)| ReadyKey::new(action))
        .collect();
    let mut order = Vec::with_capacity(actions.len());
    while let Some(next) = ready.pop_first() {
        order.push(next.id);
        let Some(waiting) = dependents.get(next.id.index()) else {
            continue;
        };
        for &index in waiting {
            missing[index] -= 1;
            if missing[index] == 0 {
                ready.insert(ReadyKey::new(&actions[index]));
            }
        }
    }

    if order.len() < actions.len() {
        let placed: BTreeSet<ActionId> = order.iter().copied().collect();
        let first = actions
            .iter()
            .find(|a| !placed.contains(&a.id()))
            .map(|a| format!("{} {}", a.id(), a.label()))
            .unwrap_or_default();
        return Err(ScheduleError::Deadlock {
            pending: actions.len() - order.len(),
            first,
        });
    }
    Ok(order)
}

/// Builds and orders the action graph for a set of regions.
pub struct Scheduler<'a, D> {
    tree: &'a NodeTree<D>,
    namer: &'a dyn BranchNamer,
    options: BuildOptions,
}

impl<'a, D> Scheduler<'a, D> {
    pub fn new(tree: &'a NodeTree<D>, namer: &'a dyn BranchNamer) -> Self {
        Self {
            tree,
            namer,
            options: BuildOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    #[instrument(level = "debug", skip_all)]
    pub fn build(&self, regions: &[Region<D>]) -> ScheduleResult<Schedule<'a, D>> {
        let graph = GraphBuilder::new(self.tree, self.namer)
            .with_options(self.options)
            .build(regions)?;
        let order = order(&graph)?;
        let writers = regions
            .iter()
            .filter(|r| graph.region(r.name()).is_some())
            .map(|r| (r.name().to_string(), r.writers().to_vec()))
            .collect();
        info!(
            "schedule: {} actions for {} regions ({} skipped)",
            graph.len(),
            graph.regions().len(),
            graph.skipped().len()
        );
        Ok(Schedule {
            tree: self.tree,
            graph,
            order,
            writers,
        })
    }
}

/// An ordered action graph, ready to run against a backend.
///
/// Borrows the tree, which stays frozen for the schedule's lifetime.
pub struct Schedule<'a, D> {
    tree: &'a NodeTree<D>,
    graph: ActionGraph,
    order: Vec<ActionId>,
    writers: BTreeMap<String, Vec<Arc<dyn OutputWriter<D>>>>,
}

impl<'a, D> Schedule<'a, D> {
    pub fn tree(&self) -> &'a NodeTree<D> {
        self.tree
    }

    pub fn graph(&self) -> &ActionGraph {
        &self.graph
    }

    /// Construction order.
    pub fn order(&self) -> &[ActionId] {
        &self.order
    }

    pub fn ordered_actions(&self) -> impl Iterator<Item = &Action> {
        self.order.iter().filter_map(|id| self.graph.get(*id))
    }

    /// SHA-256 over the ordered action labels; equal inputs give equal digests.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for action in self.ordered_actions() {
            hasher.update(action.label().as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Construct every action, leaving realization to the caller.
    #[instrument(level = "debug", skip_all)]
    pub fn construct<'s, B: LazyBackend>(
        &'s self,
        backend: &'s B,
        monitor: &'s dyn RunMonitor,
    ) -> Execution<'s, 'a, D, B> {
        let size = self.graph.len();
        let mut execution = Execution {
            schedule: self,
            backend,
            monitor,
            built: (0..size).map(|_| None).collect(),
            slots: (0..size).map(|_| OnceLock::new()).collect(),
        };
        monitor.schedule_started(size);
        for id in &self.order {
            let Some(action) = self.graph.get(*id) else {
                continue;
            };
            let outcome = execution.construct_action(action);
            if let Err(e) = &outcome {
                debug!("construction of {} failed: {}", action.id(), e);
            }
            monitor.action_constructed(&event(action), outcome.as_ref().map(|_| ()));
            execution.built[id.index()] = Some(outcome);
        }
        execution
    }

    /// Construct everything, then realize and write every output.
    pub fn execute<B: LazyBackend>(&self, backend: &B, monitor: &dyn RunMonitor) -> RunReport {
        let execution = self.construct(backend, monitor);
        let report = execution.run();
        monitor.schedule_finished(&report);
        report
    }
}

fn event(action: &Action) -> ActionEvent<'_> {
    ActionEvent {
        id: action.id(),
        kind: action.kind(),
        path: action.path(),
        systematic: action.systematic(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    /// Waiting on a dependency
    Pending,
    /// All dependencies constructed
    Ready,
    Constructed,
    Realized,
    Failed,
}

/// Concrete value held by an action's result slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Realized {
    /// Events passing a filter (or in the source)
    Count(u64),
    /// Column defined; its values live in the backend
    Defined,
    Output(Materialized),
}

enum Built<B: LazyBackend> {
    Frame {
        handle: B::Handle,
        count: Option<B::Count>,
    },
    Output(B::Result),
}

/// A constructed schedule with one result slot per action.
pub struct Execution<'s, 'a, D, B: LazyBackend> {
    schedule: &'s Schedule<'a, D>,
    backend: &'s B,
    monitor: &'s dyn RunMonitor,
    built: Vec<Option<Result<Built<B>, RealizationError>>>,
    slots: Vec<OnceLock<Result<Realized, RealizationError>>>,
}

impl<'s, 'a, D, B: LazyBackend> Execution<'s, 'a, D, B> {
    fn construct_action(&self, action: &Action) -> Result<Built<B>, RealizationError> {
        let fail = |reason: String| {
            RealizationError::backend(
                action,
                BackendError::Construction {
                    name: action.label(),
                    reason,
                },
            )
        };
        for dependency in action.dependencies() {
            match self.built.get(dependency.index()) {
                Some(Some(Ok(_))) => {}
                Some(Some(Err(cause))) => return Err(RealizationError::upstream(action, cause.clone())),
                _ => return Err(fail(format!("dependency {dependency} is not constructed"))),
            }
        }
        let parent = match action.input() {
            Some(input) => match self.built.get(input.index()) {
                Some(Some(Ok(Built::Frame { handle, .. }))) => Some(handle),
                _ => return Err(fail(format!("input {input} is not a frame"))),
            },
            None => None,
        };
        let backend = self.backend;
        match (action.operation(), parent) {
            (Operation::Source, _) => {
                let handle = backend.source();
                let count = backend.count(&handle);
                Ok(Built::Frame {
                    handle,
                    count: Some(count),
                })
            }
            (Operation::Filter { predicate }, Some(parent)) => {
                let handle = backend
                    .apply_filter(parent, action.path(), predicate)
                    .map_err(|e| RealizationError::backend(action, e))?;
                let count = backend.count(&handle);
                Ok(Built::Frame {
                    handle,
                    count: Some(count),
                })
            }
            (
                Operation::Define {
                    column, definition, ..
                },
                Some(parent),
            ) => {
                let handle = backend
                    .define_column(parent, column, definition)
                    .map_err(|e| RealizationError::backend(action, e))?;
                Ok(Built::Frame {
                    handle,
                    count: None,
                })
            }
            (
                Operation::Output { request, .. } | Operation::Statistics { request },
                Some(parent),
            ) => Ok(Built::Output(backend.materialize(parent, request))),
            (_, None) => Err(fail("action has no input frame".to_string())),
        }
    }

    pub fn state(&self, id: ActionId) -> ActionState {
        match self.built.get(id.index()) {
            None => ActionState::Pending,
            Some(None) => {
                let ready = self.schedule.graph.get(id).is_some_and(|action| {
                    action
                        .dependencies()
                        .iter()
                        .all(|d| matches!(self.built.get(d.index()), Some(Some(Ok(_)))))
                });
                if ready {
                    ActionState::Ready
                } else {
                    ActionState::Pending
                }
            }
            Some(Some(Err(_))) => ActionState::Failed,
            Some(Some(Ok(_))) => match self.slots.get(id.index()).and_then(OnceLock::get) {
                None => ActionState::Constructed,
                Some(Ok(_)) => ActionState::Realized,
                Some(Err(_)) => ActionState::Failed,
            },
        }
    }

    /// Realize `id` and everything it depends on, once.
    pub fn realize(&self, id: ActionId) -> Result<&Realized, RealizationError> {
        let (Some(action), Some(slot)) = (self.schedule.graph.get(id), self.slots.get(id.index())) else {
            return Err(RealizationError::Backend {
                context: ActionContext {
                    action: id,
                    label: "<unknown>".to_string(),
                    path: String::new(),
                    systematic: String::new(),
                },
                source: BackendError::Construction {
                    name: id.to_string(),
                    reason: "no such action".to_string(),
                },
            });
        };
        slot.get_or_init(|| self.realize_action(action))
            .as_ref()
            .map_err(Clone::clone)
    }

    fn realize_action(&self, action: &Action) -> Result<Realized, RealizationError> {
        for dependency in action.dependencies() {
            if let Err(cause) = self.realize(*dependency) {
                let error = RealizationError::upstream(action, cause);
                self.monitor.action_realized(&event(action), Err(&error));
                return Err(error);
            }
        }
        let outcome = match self.built.get(action.id().index()) {
            Some(Some(Ok(Built::Frame {
                count: Some(count), ..
            }))) => self.backend.pull_count(count).map(Realized::Count),
            Some(Some(Ok(Built::Frame { count: None, .. }))) => Ok(Realized::Defined),
            Some(Some(Ok(Built::Output(result)))) => self.backend.pull(result).map(Realized::Output),
            Some(Some(Err(error))) => return Err(error.clone()),
            _ => Err(BackendError::Construction {
                name: action.label(),
                reason: "action was never constructed".to_string(),
            }),
        }
        .map_err(|e| RealizationError::backend(action, e));
        self.monitor
            .action_realized(&event(action), outcome.as_ref().map(|_| ()));
        outcome
    }

    /// Realize every output and hand it to its writer, region by region.
    pub fn run(&self) -> RunReport {
        let graph = &self.schedule.graph;
        let mut report = RunReport {
            regions: BTreeMap::new(),
            skipped: graph.skipped().to_vec(),
        };
        for (name, plan) in graph.regions() {
            let writers = self.schedule.writers.get(name).map(Vec::as_slice).unwrap_or(&[]);
            report
                .regions
                .insert(name.clone(), self.run_region(plan, writers));
        }
        info!(
            "run finished: {} regions, {} failed outputs",
            report.regions.len(),
            report.failures().len()
        );
        report
    }

    fn run_region(&self, plan: &RegionPlan, writers: &[Arc<dyn OutputWriter<D>>]) -> RegionReport {
        let mut region = RegionReport::default();
        let mut aborted = false;
        for (systematic, paths) in &plan.systematics {
            for (index, output) in &paths.outputs {
                let writer = writers.get(*index);
                let mut outcome = OutputOutcome {
                    systematic: systematic.clone(),
                    writer: writer.map(|w| w.name().to_string()),
                    events: None,
                    result: Ok(()),
                };
                if aborted {
                    outcome.result = Err(RunError::Aborted {
                        region: plan.name.clone(),
                    });
                    region.outcomes.push(outcome);
                    continue;
                }
                match self.realize(*output) {
                    Ok(Realized::Output(result)) => {
                        outcome.events = Some(result.entries);
                        if let Some(writer) = writer {
                            outcome.result = self
                                .write(plan, systematic, paths, &**writer, result)
                                .map_err(RunError::from);
                        }
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!("region '{}' failed: {}", plan.name, error);
                        aborted = true;
                        outcome.result = Err(RunError::Realization(error));
                    }
                }
                if let Err(RunError::Write(e)) = &outcome.result {
                    warn!("{}", e);
                }
                region.outcomes.push(outcome);
            }
        }
        region
    }

    fn write(
        &self,
        plan: &RegionPlan,
        systematic: &Systematic,
        paths: &SystematicPlan,
        writer: &dyn OutputWriter<D>,
        result: &Materialized,
    ) -> Result<(), WriteError> {
        let tree = self.schedule.tree;
        let missing = |reason: String| WriteError {
            writer: writer.name().to_string(),
            region: plan.name.clone(),
            systematic: systematic.to_string(),
            path: None,
            reason,
        };
        let target = tree
            .node(plan.target)
            .map_err(|e| missing(e.to_string()))?;
        let mut cutflow = Vec::with_capacity(paths.filters.len());
        for (node_id, filter) in &paths.filters {
            let node = tree.node(*node_id).map_err(|e| missing(e.to_string()))?;
            let events = match self.realize(*filter) {
                Ok(Realized::Count(events)) => *events,
                Ok(_) => 0,
                Err(e) => return Err(missing(e.to_string())),
            };
            // unweighted nodes count every event once
            let (mut sum_weights, mut sum_weights2) = (events as f64, events as f64);
            if let Some((_, statistics)) = paths.statistics.iter().find(|(n, _)| n == node_id) {
                match self.realize(*statistics) {
                    Ok(Realized::Output(stats)) => {
                        sum_weights = stats.sum_weights;
                        sum_weights2 = stats.sum_weights2;
                    }
                    Ok(_) => {}
                    Err(e) => return Err(missing(e.to_string())),
                }
            }
            cutflow.push(CutflowStep {
                node: node.name(),
                detail: node.detail(),
                events,
                sum_weights,
                sum_weights2,
            });
        }
        let context = WriteContext {
            region: &plan.name,
            systematic,
            target: plan.target,
            detail: target.detail(),
            cutflow,
        };
        writer.write(&context, result)
    }
}

/// What happened to one `(systematic, writer)` output of a region.
#[derive(Debug, Clone)]
pub struct OutputOutcome {
    pub systematic: Systematic,
    pub writer: Option<String>,
    /// Events that reached the output, if it was realized
    pub events: Option<u64>,
    pub result: Result<(), RunError>,
}

#[derive(Debug, Clone, Default)]
pub struct RegionReport {
    pub outcomes: Vec<OutputOutcome>,
}

impl RegionReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

/// Per-region outcome of [`Schedule::execute`].
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub regions: BTreeMap<String, RegionReport>,
    /// Regions left out at build time
    pub skipped: Vec<SkippedRegion>,
}

impl RunReport {
    /// `true` if every output of every built region succeeded.
    pub fn is_success(&self) -> bool {
        self.regions.values().all(RegionReport::is_success)
    }

    pub fn failures(&self) -> Vec<(&str, &OutputOutcome)> {
        self.regions
            .iter()
            .flat_map(|(name, region)| {
                region
                    .outcomes
                    .iter()
                    .filter(|o| o.result.is_err())
                    .map(move |o| (name.as_str(), o))
            })
            .collect()
    }

    pub fn region(&self, name: &str) -> Option<&RegionReport> {
        self.regions.get(name)
    }
}
