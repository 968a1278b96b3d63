//! Action graph construction
//!
//! Turns a node tree plus regions into a deduplicated graph of lazy actions.
//! The build runs in two phases:
//!
//! 1. Requirements: walk every `(region, systematic)` path and record which
//!    filters are needed, keyed structurally.
//! 2. Creation: visit nodes in preorder and create each required filter
//!    once. Each filter, output and statistics action gets its own chain of
//!    defines on top of its parent filter, holding only the columns it
//!    reads.
//!
//! A systematic only forks the filter chain at the first filter it can
//! change. Until then, and for columns it does not touch, it shares the
//! nominal actions. Since requirements are sets, region order never matters.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::application::region::Region;
use crate::application::scope::{ColumnRef, ScopeIndex, Site};
use crate::domain::{
    BranchNamer, BuildError, BuildResult, Definition, DefinitionSpec, NameRegistry, NodeId,
    NodeTree, Systematic,
};
use crate::infrastructure::traits::MaterializeRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId(usize);

impl ActionId {
    pub fn index(self) -> usize {
        self.0
    }

    pub fn from_index(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    FilterApply,
    VariableDefine,
    OutputWrite,
}

impl ActionKind {
    /// Filters construct first so events are pruned as early as possible.
    pub fn rank(self) -> u8 {
        match self {
            ActionKind::FilterApply => 0,
            ActionKind::VariableDefine | ActionKind::OutputWrite => 1,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::FilterApply => "filter",
            ActionKind::VariableDefine => "define",
            ActionKind::OutputWrite => "output",
        })
    }
}

/// What the backend is asked to do.
#[derive(Debug, Clone)]
pub enum Operation {
    /// The unfiltered dataset; the schedule's root sentinel
    Source,
    Filter {
        predicate: Definition,
    },
    Define {
        column: String,
        variable: String,
        definition: Definition,
    },
    Output {
        region: String,
        writer: usize,
        writer_name: String,
        request: MaterializeRequest,
    },
    /// Sum of the node weight (and its square) over the events passing the
    /// filter this reads from
    Statistics {
        request: MaterializeRequest,
    },
}

#[derive(Debug, Clone)]
pub struct Action {
    id: ActionId,
    kind: ActionKind,
    node: NodeId,
    path: String,
    systematic: Systematic,
    input: Option<ActionId>,
    dependencies: BTreeSet<ActionId>,
    cost: f64,
    operation: Operation,
    consumers: BTreeSet<String>,
}

impl Action {
    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Node path, `ROOT/...`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Filters: the chain systematic. Defines: the systematic the column is
    /// computed for. Outputs: the systematic the region requested.
    pub fn systematic(&self) -> &Systematic {
        &self.systematic
    }

    /// Backend frame this action builds on.
    pub fn input(&self) -> Option<ActionId> {
        self.input
    }

    pub fn dependencies(&self) -> &BTreeSet<ActionId> {
        &self.dependencies
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Regions that need this action.
    pub fn consumers(&self) -> &BTreeSet<String> {
        &self.consumers
    }

    /// Stable one-line description.
    pub fn label(&self) -> String {
        match &self.operation {
            Operation::Source => format!("source {}", self.path),
            Operation::Filter { predicate } => {
                format!("filter {} [{}] {}", self.path, self.systematic, predicate)
            }
            Operation::Define {
                column, definition, ..
            } => format!("define {} = {} @ {}", column, definition, self.path),
            Operation::Output {
                region,
                writer_name,
                ..
            } => format!("output {}/{} [{}]", region, writer_name, self.systematic),
            Operation::Statistics { request } => format!(
                "statistics {} [{}] {}",
                self.path,
                self.systematic,
                request.weight.as_deref().unwrap_or("-")
            ),
        }
    }
}

/// How one region resolves under one systematic.
#[derive(Debug, Clone, Default)]
pub struct SystematicPlan {
    /// Root sentinel first, region target last
    pub filters: Vec<(NodeId, ActionId)>,
    /// `(writer index, output action)`
    pub outputs: Vec<(usize, ActionId)>,
    /// Weighted statistics of the path nodes that carry a weight
    pub statistics: Vec<(NodeId, ActionId)>,
}

#[derive(Debug, Clone)]
pub struct RegionPlan {
    pub name: String,
    pub target: NodeId,
    pub systematics: BTreeMap<Systematic, SystematicPlan>,
}

/// A region left out of the graph.
#[derive(Debug, Clone)]
pub struct SkippedRegion {
    pub name: String,
    pub error: BuildError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownSystematicPolicy {
    /// Fail the whole build
    #[default]
    Error,
    /// Leave the region out and report it as skipped
    SkipRegion,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuildOptions {
    pub default_cost: f64,
    pub on_unknown_systematic: UnknownSystematicPolicy,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            default_cost: 1.0,
            on_unknown_systematic: UnknownSystematicPolicy::Error,
        }
    }
}

/// Deduplicated actions, in creation order.
#[derive(Debug, Clone)]
pub struct ActionGraph {
    actions: Vec<Action>,
    regions: BTreeMap<String, RegionPlan>,
    skipped: Vec<SkippedRegion>,
}

impl ActionGraph {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn get(&self, id: ActionId) -> Option<&Action> {
        self.actions.get(id.0)
    }

    /// The source sentinel every chain starts from.
    pub fn root(&self) -> ActionId {
        ActionId(0)
    }

    pub fn regions(&self) -> &BTreeMap<String, RegionPlan> {
        &self.regions
    }

    pub fn region(&self, name: &str) -> Option<&RegionPlan> {
        self.regions.get(name)
    }

    pub fn skipped(&self) -> &[SkippedRegion] {
        &self.skipped
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }

    /// All actions `id` transitively depends on, `id` included.
    pub fn closure(&self, id: ActionId) -> BTreeSet<ActionId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(action) = self.get(current) {
                stack.extend(action.dependencies.iter().copied());
            }
        }
        seen
    }

    #[cfg(test)]
    pub(crate) fn from_parts(actions: Vec<Action>) -> Self {
        Self {
            actions,
            regions: BTreeMap::new(),
            skipped: Vec::new(),
        }
    }
}

#[cfg(test)]
impl Action {
    pub(crate) fn stub(id: usize, kind: ActionKind, node: NodeId, cost: f64, deps: &[usize]) -> Self {
        Self {
            id: ActionId(id),
            kind,
            node,
            path: format!("stub{id}"),
            systematic: Systematic::Nominal,
            input: deps.first().map(|d| ActionId(*d)),
            dependencies: deps.iter().map(|d| ActionId(*d)).collect(),
            cost,
            operation: Operation::Source,
            consumers: BTreeSet::new(),
        }
    }
}

/// A backend frame lineage: the action at its end and the columns defined
/// along it.
#[derive(Debug, Clone, Default)]
struct Frame {
    tip: Option<ActionId>,
    produced: HashMap<(ColumnRef, Systematic), ActionId>,
}

struct Output<'r> {
    region: &'r str,
    target: NodeId,
    systematic: Systematic,
    writer: usize,
    writer_name: &'r str,
    columns: Vec<String>,
    weight: Option<String>,
}

/// Builds an [`ActionGraph`] from a tree and its regions.
pub struct GraphBuilder<'a, D> {
    tree: &'a NodeTree<D>,
    namer: &'a dyn BranchNamer,
    options: BuildOptions,
}

impl<'a, D> GraphBuilder<'a, D> {
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

    #[instrument(level = "debug", skip_all, fields(regions = regions.len()))]
    pub fn build(&self, regions: &[Region<D>]) -> BuildResult<ActionGraph> {
        if !self.options.default_cost.is_finite() || self.options.default_cost < 0.0 {
            return Err(BuildError::InvalidCost {
                owner: "default cost".to_string(),
                cost: self.options.default_cost,
            });
        }
        let mut regions: Vec<&Region<D>> = regions.iter().collect();
        regions.sort_by(|a, b| a.name().cmp(b.name()));
        self.validate_regions(&regions)?;

        let scope = ScopeIndex::build(self.tree)?;
        self.validate_names(&scope)?;

        let mut skipped = Vec::new();
        let mut accepted = Vec::new();
        for region in regions {
            match self.check_systematics(&scope, region) {
                Ok(()) => accepted.push(region),
                Err(error) => match self.options.on_unknown_systematic {
                    UnknownSystematicPolicy::Error => return Err(error),
                    UnknownSystematicPolicy::SkipRegion => {
                        warn!("skipping region '{}': {}", region.name(), error);
                        skipped.push(SkippedRegion {
                            name: region.name().to_string(),
                            error,
                        });
                    }
                },
            }
        }

        let mut outputs: Vec<Output<'_>> = Vec::new();
        for region in &accepted {
            // writers without a weight of their own use the node's
            let node_weight = self.tree.weight(region.target())?;
            for systematic in region.systematics() {
                for (writer, w) in region.writers().iter().enumerate() {
                    outputs.push(Output {
                        region: region.name(),
                        target: region.target(),
                        systematic: systematic.clone(),
                        writer,
                        writer_name: w.name(),
                        columns: w.columns().to_vec(),
                        weight: w.weight().or(node_weight).map(str::to_string),
                    });
                }
            }
        }
        for output in &outputs {
            for column in output.columns.iter().chain(output.weight.iter()) {
                if scope.lookup(Site::Node(output.target), column).is_none() {
                    return Err(BuildError::SystematicResolution {
                        variable: format!("{}/{}", output.region, output.writer_name),
                        systematic: output.systematic.to_string(),
                        missing: column.clone(),
                        path: scope.path(output.target).to_string(),
                    });
                }
            }
        }

        let mut requirements = Requirements::new(&scope);
        for region in &accepted {
            for systematic in region.systematics() {
                requirements.filter(region.target(), systematic)?;
            }
        }
        debug!("requirements: {} filters", requirements.filters.len());

        let mut creator = Creator {
            scope: &scope,
            namer: self.namer,
            options: &self.options,
            actions: Vec::new(),
            frames: HashMap::new(),
            filters: HashMap::new(),
            defines: HashMap::new(),
            statistics: HashMap::new(),
            registry: NameRegistry::new(),
        };
        creator.register_dataset();
        creator.create_nodes(&requirements)?;

        let mut plans: BTreeMap<String, RegionPlan> = BTreeMap::new();
        for region in &accepted {
            let mut plan = RegionPlan {
                name: region.name().to_string(),
                target: region.target(),
                systematics: BTreeMap::new(),
            };
            for systematic in region.systematics() {
                plan.systematics
                    .insert(systematic.clone(), creator.filter_path(region.target(), systematic)?);
            }
            plans.insert(region.name().to_string(), plan);
        }
        for output in &outputs {
            let id = creator.create_output(output)?;
            if let Some(plan) = plans
                .get_mut(output.region)
                .and_then(|p| p.systematics.get_mut(&output.systematic))
            {
                plan.outputs.push((output.writer, id));
            }
        }

        let mut graph = ActionGraph {
            actions: creator.actions,
            regions: plans,
            skipped,
        };
        graph.assign_consumers();
        debug!(
            "graph: {} actions ({} filters, {} defines, {} outputs), {} skipped regions",
            graph.len(),
            graph.count(ActionKind::FilterApply),
            graph.count(ActionKind::VariableDefine),
            graph.count(ActionKind::OutputWrite),
            graph.skipped.len()
        );
        Ok(graph)
    }

    fn validate_regions(&self, regions: &[&Region<D>]) -> BuildResult<()> {
        let mut seen = BTreeSet::new();
        for region in regions {
            let name = region.name();
            if name.is_empty() || name.contains('/') || name == crate::domain::ROOT_NAME {
                return Err(BuildError::InvalidRegion {
                    name: name.to_string(),
                    reason: "name must be non-empty, must not contain '/' and must not be ROOT"
                        .to_string(),
                });
            }
            if !seen.insert(name) {
                return Err(BuildError::DuplicateRegion(name.to_string()));
            }
            if !self.tree.contains(region.target()) {
                return Err(BuildError::ForeignNode {
                    context: format!("target of region '{name}'"),
                });
            }
        }
        Ok(())
    }

    /// Naming policy, checked once per build.
    fn validate_names(&self, scope: &ScopeIndex<'_, D>) -> BuildResult<()> {
        for systematic in scope.all_systematics() {
            self.namer.validate_systematic(systematic)?;
        }
        for (_, node) in self.tree.iter() {
            for variable in node.variables() {
                self.namer.validate_logical(variable.name())?;
            }
        }
        Ok(())
    }

    fn check_systematics(&self, scope: &ScopeIndex<'_, D>, region: &Region<D>) -> BuildResult<()> {
        let known = scope.known_systematics(region.target());
        for systematic in region.systematics() {
            if let Systematic::Variation(name) = systematic {
                if !known.contains(name.as_str()) {
                    return Err(BuildError::UnknownSystematic {
                        region: region.name().to_string(),
                        systematic: name.clone(),
                        path: scope.path(region.target()).to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl ActionGraph {
    fn assign_consumers(&mut self) {
        let mut consumers: BTreeMap<ActionId, BTreeSet<String>> = BTreeMap::new();
        for plan in self.regions.values() {
            for systematic in plan.systematics.values() {
                let roots = systematic
                    .outputs
                    .iter()
                    .map(|(_, id)| *id)
                    .chain(systematic.filters.iter().map(|(_, id)| *id))
                    .chain(systematic.statistics.iter().map(|(_, id)| *id));
                for root in roots {
                    for id in self.closure(root) {
                        consumers.entry(id).or_default().insert(plan.name.clone());
                    }
                }
            }
        }
        for (id, names) in consumers {
            if let Some(action) = self.actions.get_mut(id.0) {
                action.consumers = names;
            }
        }
    }
}

/// Phase one: which filters are needed, under which chain systematic.
struct Requirements<'s, 't, D> {
    scope: &'s ScopeIndex<'t, D>,
    /// `(position, chain systematic)` of every filter to apply
    filters: BTreeSet<(usize, Systematic)>,
}

impl<'s, 't, D> Requirements<'s, 't, D> {
    fn new(scope: &'s ScopeIndex<'t, D>) -> Self {
        Self {
            scope,
            filters: BTreeSet::new(),
        }
    }

    /// Require the filter chain from the root down to `node` under `systematic`.
    fn filter(&mut self, node: NodeId, systematic: &Systematic) -> BuildResult<()> {
        let tree = self.scope.tree();
        let current = tree.node(node)?;
        let (Some(parent), Some(_)) = (current.parent(), current.filter()) else {
            return Ok(());
        };
        let chain = self.scope.chain(node, systematic);
        let position = self
            .scope
            .position(node)
            .ok_or_else(|| BuildError::ForeignNode {
                context: format!("{node:?}"),
            })?;
        if !self.filters.insert((position, chain.clone())) {
            return Ok(());
        }
        self.filter(parent, &chain)
    }
}

/// Phase two: action creation.
///
/// Every consumer (filter, output, statistics) starts from the frame of the
/// filter it sits below and extends it with exactly the defines it reads,
/// transitively. A define is shared by all consumers that extend the same
/// frame with it, so a failing define only reaches actions that read it.
struct Creator<'s, 't, D> {
    scope: &'s ScopeIndex<'t, D>,
    namer: &'s dyn BranchNamer,
    options: &'s BuildOptions,
    actions: Vec<Action>,
    /// Lineage ending at each filter (and at the source)
    frames: HashMap<ActionId, Frame>,
    /// `(position, chain systematic)` → filter action
    filters: HashMap<(usize, Systematic), ActionId>,
    /// `(input frame tip, column, effective systematic)` → define action
    defines: HashMap<(ActionId, ColumnRef, Systematic), ActionId>,
    /// `(filter, weight column, effective systematic)` → statistics action
    statistics: HashMap<(ActionId, ColumnRef, Systematic), ActionId>,
    registry: NameRegistry,
}

impl<'s, 't, D> Creator<'s, 't, D> {
    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        kind: ActionKind,
        node: NodeId,
        systematic: Systematic,
        input: Option<ActionId>,
        mut dependencies: BTreeSet<ActionId>,
        cost: f64,
        operation: Operation,
    ) -> ActionId {
        let id = ActionId(self.actions.len());
        dependencies.extend(input);
        self.actions.push(Action {
            id,
            kind,
            node,
            path: self.scope.path(node).to_string(),
            systematic,
            input,
            dependencies,
            cost,
            operation,
            consumers: BTreeSet::new(),
        });
        id
    }

    fn register_dataset(&mut self) {
        let tree = self.scope.tree();
        for (_, node) in tree.iter() {
            for variable in node.variables() {
                let mut register = |spec: &DefinitionSpec| {
                    if let DefinitionSpec::Branch(physical) = spec {
                        self.registry.register_dataset(physical, variable.name());
                    }
                };
                register(variable.nominal());
                for systematic in variable.override_systematics() {
                    register(variable.spec_for(&Systematic::variation(systematic)));
                }
            }
        }
    }

    fn position(&self, node: NodeId) -> BuildResult<usize> {
        self.scope
            .position(node)
            .ok_or_else(|| BuildError::ForeignNode {
                context: format!("{node:?}"),
            })
    }

    fn create_nodes(&mut self, requirements: &Requirements<'_, '_, D>) -> BuildResult<()> {
        let scope = self.scope;
        let tree = scope.tree();
        for (position, &node_id) in scope.preorder().iter().enumerate() {
            let node = tree.node(node_id)?;
            let Some(parent) = node.parent() else {
                let source = self.push(
                    ActionKind::FilterApply,
                    node_id,
                    Systematic::Nominal,
                    None,
                    BTreeSet::new(),
                    0.0,
                    Operation::Source,
                );
                self.filters.insert((position, Systematic::Nominal), source);
                self.frames.insert(
                    source,
                    Frame {
                        tip: Some(source),
                        produced: HashMap::new(),
                    },
                );
                continue;
            };
            let parent_position = self.position(parent)?;
            let chains: Vec<Systematic> = requirements
                .filters
                .range((position, Systematic::Nominal)..)
                .take_while(|(p, _)| *p == position)
                .map(|(_, chain)| chain.clone())
                .collect();
            for chain in chains {
                let upstream = scope.chain(parent, &chain);
                let parent_filter = self
                    .filters
                    .get(&(parent_position, upstream.clone()))
                    .copied()
                    .ok_or_else(|| self.missing_frame(node_id, &upstream))?;
                let filter_id = self.create_filter(node_id, &chain, parent_filter)?;
                self.filters.insert((position, chain), filter_id);
            }
        }
        Ok(())
    }

    fn missing_frame(&self, node: NodeId, systematic: &Systematic) -> BuildError {
        BuildError::CyclicDependency {
            column: "<filter chain>".to_string(),
            consumer: self.scope.path(node).to_string(),
            systematic: systematic.to_string(),
            path: self.scope.path(node).to_string(),
        }
    }

    /// Computed columns `inputs` read from `site` depend on, transitively,
    /// under `systematic`. Ordered by `(node position, slot)`, which puts
    /// every column after the columns it reads.
    fn needs(
        &self,
        site: Site,
        inputs: &[&str],
        systematic: &Systematic,
        consumer: &str,
    ) -> BuildResult<Vec<(ColumnRef, Systematic)>> {
        let mut found: BTreeMap<(usize, usize, Systematic), ColumnRef> = BTreeMap::new();
        let mut stack: Vec<(Site, String, String)> = inputs
            .iter()
            .map(|input| (site, input.to_string(), consumer.to_string()))
            .collect();
        while let Some((site, input, consumer)) = stack.pop() {
            let column = self.scope.require(site, &input, &consumer)?;
            let effective = self.scope.effective(column, systematic);
            let variable = self
                .scope
                .variable(column)
                .ok_or_else(|| BuildError::ForeignNode {
                    context: format!("{column:?}"),
                })?;
            if variable.is_source(&effective) {
                continue;
            }
            let key = (self.position(column.node)?, column.slot, effective.clone());
            if found.insert(key, column).is_some() {
                continue;
            }
            for next in variable.spec_for(&effective).inputs() {
                stack.push((
                    Site::Variable(column),
                    next.to_string(),
                    variable.name().to_string(),
                ));
            }
        }
        Ok(found
            .into_iter()
            .map(|((_, _, effective), column)| (column, effective))
            .collect())
    }

    /// The lineage of filter `base`, extended with the defines `inputs`
    /// need.
    fn extend(
        &mut self,
        base: ActionId,
        site: Site,
        inputs: &[&str],
        systematic: &Systematic,
        consumer: &str,
    ) -> BuildResult<Frame> {
        let needs = self.needs(site, inputs, systematic, consumer)?;
        let mut frame = self.frames.get(&base).cloned().unwrap_or(Frame {
            tip: Some(base),
            produced: HashMap::new(),
        });
        for (column, effective) in needs {
            if frame.produced.contains_key(&(column, effective.clone())) {
                continue;
            }
            let key = (frame.tip.unwrap_or(base), column, effective.clone());
            let id = match self.defines.get(&key) {
                Some(id) => *id,
                None => {
                    let id = self.create_define(column, &effective, &frame)?;
                    self.defines.insert(key, id);
                    id
                }
            };
            frame.tip = Some(id);
            frame.produced.insert((column, effective), id);
        }
        Ok(frame)
    }

    /// Physical names and producers for `inputs`, read from `site` under
    /// `effective`.
    fn bind_inputs(
        &self,
        site: Site,
        inputs: &[&str],
        effective: &Systematic,
        frame: &Frame,
        consumer: &str,
    ) -> BuildResult<(HashMap<String, String>, BTreeSet<ActionId>)> {
        let mut physical = HashMap::new();
        let mut producers = BTreeSet::new();
        for input in inputs {
            let source = self.scope.require(site, input, consumer)?;
            let input_effective = self.scope.effective(source, effective);
            let name = self
                .scope
                .physical(source, &input_effective, self.namer)
                .ok_or_else(|| BuildError::ForeignNode {
                    context: format!("{source:?}"),
                })?;
            let is_source = self
                .scope
                .variable(source)
                .is_some_and(|v| v.is_source(&input_effective));
            if !is_source {
                let producer = frame
                    .produced
                    .get(&(source, input_effective.clone()))
                    .ok_or_else(|| BuildError::CyclicDependency {
                        column: input.to_string(),
                        consumer: consumer.to_string(),
                        systematic: input_effective.to_string(),
                        path: self.scope.path(source.node).to_string(),
                    })?;
                producers.insert(*producer);
            }
            physical.insert(input.to_string(), name);
        }
        Ok((physical, producers))
    }

    fn create_define(
        &mut self,
        column: ColumnRef,
        effective: &Systematic,
        frame: &Frame,
    ) -> BuildResult<ActionId> {
        let variable = self
            .scope
            .variable(column)
            .ok_or_else(|| BuildError::ForeignNode {
                context: format!("{column:?}"),
            })?;
        let inputs = variable.spec_for(effective).inputs();
        let (physical, producers) = self.bind_inputs(
            Site::Variable(column),
            &inputs,
            effective,
            frame,
            variable.name(),
        )?;
        let definition = variable.resolve(
            effective,
            |logical| physical.get(logical).cloned(),
            self.scope.path(column.node),
        )?;
        let name = self.namer.physical_name(variable.name(), effective);
        self.registry.register(&name, variable.name(), effective)?;
        Ok(self.push(
            ActionKind::VariableDefine,
            column.node,
            effective.clone(),
            frame.tip,
            producers,
            variable.cost().unwrap_or(self.options.default_cost),
            Operation::Define {
                column: name,
                variable: variable.name().to_string(),
                definition,
            },
        ))
    }

    fn create_filter(
        &mut self,
        node_id: NodeId,
        chain: &Systematic,
        parent_filter: ActionId,
    ) -> BuildResult<ActionId> {
        let tree = self.scope.tree();
        let node = tree.node(node_id)?;
        let filter = node.filter().ok_or_else(|| BuildError::InvalidNode {
            name: node.name().to_string(),
            reason: "non-root node without filter".to_string(),
        })?;
        let inputs = filter.spec_for(chain).inputs();
        let frame = self.extend(parent_filter, Site::Node(node_id), &inputs, chain, node.name())?;
        let (physical, producers) =
            self.bind_inputs(Site::Node(node_id), &inputs, chain, &frame, node.name())?;
        let predicate = filter.resolve(
            chain,
            |logical| physical.get(logical).cloned(),
            self.scope.path(node_id),
        )?;
        let id = self.push(
            ActionKind::FilterApply,
            node_id,
            chain.clone(),
            frame.tip,
            producers,
            filter.cost().unwrap_or(self.options.default_cost),
            Operation::Filter { predicate },
        );
        self.frames.insert(
            id,
            Frame {
                tip: Some(id),
                produced: frame.produced,
            },
        );
        Ok(id)
    }

    /// Filter and statistics actions from the root to `target` under
    /// `systematic`.
    fn filter_path(&mut self, target: NodeId, systematic: &Systematic) -> BuildResult<SystematicPlan> {
        let mut plan = SystematicPlan::default();
        for node in self.scope.tree().path(target)? {
            let position = self.position(node)?;
            let chain = self.scope.chain(node, systematic);
            let id = self
                .filters
                .get(&(position, chain.clone()))
                .copied()
                .ok_or_else(|| self.missing_frame(node, &chain))?;
            plan.filters.push((node, id));
            if let Some(statistics) = self.create_statistics(node, id, systematic)? {
                plan.statistics.push((node, statistics));
            }
        }
        Ok(plan)
    }

    /// Sum of weights passing `filter`, for weighted nodes.
    fn create_statistics(
        &mut self,
        node: NodeId,
        filter: ActionId,
        systematic: &Systematic,
    ) -> BuildResult<Option<ActionId>> {
        let Some(weight) = self.scope.tree().weight(node)? else {
            return Ok(None);
        };
        let consumer = format!("weight of {}", self.scope.path(node));
        let column = self.scope.require(Site::Node(node), weight, &consumer)?;
        let key = (filter, column, self.scope.effective(column, systematic));
        if let Some(id) = self.statistics.get(&key) {
            return Ok(Some(*id));
        }
        let frame = self.extend(filter, Site::Node(node), &[weight], systematic, &consumer)?;
        let (physical, mut producers) =
            self.bind_inputs(Site::Node(node), &[weight], systematic, &frame, &consumer)?;
        producers.insert(filter);
        let request = MaterializeRequest {
            columns: Vec::new(),
            weight: physical.get(weight).cloned(),
        };
        let chain = self.scope.chain(node, systematic);
        let id = self.push(
            ActionKind::OutputWrite,
            node,
            chain,
            frame.tip,
            producers,
            0.0,
            Operation::Statistics { request },
        );
        self.statistics.insert(key, id);
        Ok(Some(id))
    }

    fn create_output(&mut self, output: &Output<'_>) -> BuildResult<ActionId> {
        let position = self.position(output.target)?;
        let chain = self.scope.chain(output.target, &output.systematic);
        let target_filter = self
            .filters
            .get(&(position, chain.clone()))
            .copied()
            .ok_or_else(|| self.missing_frame(output.target, &chain))?;

        let consumer = format!("{}/{}", output.region, output.writer_name);
        let requested: Vec<&str> = output
            .columns
            .iter()
            .chain(output.weight.iter())
            .map(String::as_str)
            .collect();
        let frame = self.extend(
            target_filter,
            Site::Node(output.target),
            &requested,
            &output.systematic,
            &consumer,
        )?;
        let (physical, mut producers) = self.bind_inputs(
            Site::Node(output.target),
            &requested,
            &output.systematic,
            &frame,
            &consumer,
        )?;
        producers.insert(target_filter);
        let request = MaterializeRequest {
            columns: output
                .columns
                .iter()
                .filter_map(|c| physical.get(c).map(|p| (c.clone(), p.clone())))
                .collect(),
            weight: output.weight.as_ref().and_then(|w| physical.get(w).cloned()),
        };
        Ok(self.push(
            ActionKind::OutputWrite,
            output.target,
            output.systematic.clone(),
            frame.tip,
            producers,
            0.0,
            Operation::Output {
                region: output.region.to_string(),
                writer: output.writer,
                writer_name: output.writer_name.to_string(),
                request,
            },
        ))
    }
}
