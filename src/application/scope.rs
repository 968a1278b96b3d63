//! Column visibility and systematic reach over a node tree
//!
//! Built once per schedule build. Answers three questions:
//! - which definition a logical name refers to at a given point of the tree
//! - which systematics can change a column (`affects`)
//! - which systematics fork the filter chain at a node (`chain`)

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, instrument};

use crate::domain::{
    BranchNamer, BuildError, BuildResult, DefinitionSpec, NamingError, NodeId, NodeTree,
    Systematic, SystematicVariable,
};

/// A variable definition: slot `slot` of node `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnRef {
    pub node: NodeId,
    pub slot: usize,
}

/// Point in the tree a name is resolved from.
#[derive(Debug, Clone, Copy)]
pub enum Site {
    /// Inside a variable: sees ancestors and earlier variables of its node
    Variable(ColumnRef),
    /// A node's filter or anything reading after it: sees all its variables
    Node(NodeId),
}

pub struct ScopeIndex<'t, D> {
    tree: &'t NodeTree<D>,
    /// Preorder position of every node
    order: HashMap<NodeId, usize>,
    preorder: Vec<NodeId>,
    /// Names visible after all variables of a node
    visible: HashMap<NodeId, HashMap<String, ColumnRef>>,
    affects: HashMap<ColumnRef, BTreeSet<String>>,
    chain: HashMap<NodeId, BTreeSet<String>>,
    paths: HashMap<NodeId, String>,
}

impl<'t, D> ScopeIndex<'t, D> {
    #[instrument(level = "debug", skip_all)]
    pub fn build(tree: &'t NodeTree<D>) -> BuildResult<Self> {
        let mut index = Self {
            tree,
            order: HashMap::new(),
            preorder: Vec::new(),
            visible: HashMap::new(),
            affects: HashMap::new(),
            chain: HashMap::new(),
            paths: HashMap::new(),
        };
        for (id, node) in tree.iter() {
            index.order.insert(id, index.preorder.len());
            index.preorder.push(id);
            index.paths.insert(id, tree.path_string(id));

            let mut visible = match node.parent() {
                Some(parent) => index.visible.get(&parent).cloned().unwrap_or_default(),
                None => HashMap::new(),
            };
            for (slot, variable) in node.variables().iter().enumerate() {
                let here = ColumnRef { node: id, slot };
                let mut reach: BTreeSet<String> =
                    variable.override_systematics().map(str::to_string).collect();
                for input in variable.all_inputs() {
                    let source = index.require(Site::Variable(here), input, variable.name())?;
                    reach.extend(index.affects(source).iter().cloned());
                }
                index.affects.insert(here, reach);
                if visible.insert(variable.name().to_string(), here).is_some() {
                    return Err(NamingError::DuplicateDefinition {
                        name: variable.name().to_string(),
                        path: index.paths[&id].clone(),
                    }
                    .into());
                }
            }
            index.visible.insert(id, visible);

            let mut chain = match node.parent() {
                Some(parent) => index.chain.get(&parent).cloned().unwrap_or_default(),
                None => BTreeSet::new(),
            };
            if let Some(filter) = node.filter() {
                chain.extend(filter.override_systematics().map(str::to_string));
                for input in filter.all_inputs() {
                    let source = index.require(Site::Node(id), input, node.name())?;
                    chain.extend(index.affects(source).iter().cloned());
                }
            }
            index.chain.insert(id, chain);
        }
        debug!(
            "scope: {} nodes, {} variables",
            index.preorder.len(),
            index.affects.len()
        );
        Ok(index)
    }

    pub fn tree(&self) -> &'t NodeTree<D> {
        self.tree
    }

    pub fn preorder(&self) -> &[NodeId] {
        &self.preorder
    }

    pub fn position(&self, node: NodeId) -> Option<usize> {
        self.order.get(&node).copied()
    }

    pub fn path(&self, node: NodeId) -> &str {
        self.paths.get(&node).map(String::as_str).unwrap_or("<unknown>")
    }

    pub fn variable(&self, column: ColumnRef) -> Option<&'t SystematicVariable> {
        self.tree
            .node(column.node)
            .ok()
            .and_then(|n| n.variables().get(column.slot))
    }

    /// Definition `name` refers to when read from `site`.
    pub fn lookup(&self, site: Site, name: &str) -> Option<ColumnRef> {
        match site {
            Site::Node(node) => self.visible.get(&node)?.get(name).copied(),
            Site::Variable(column) => {
                let node = self.tree.node(column.node).ok()?;
                let local = node.variables()[..column.slot.min(node.variables().len())]
                    .iter()
                    .rposition(|v| v.name() == name)
                    .map(|slot| ColumnRef {
                        node: column.node,
                        slot,
                    });
                local.or_else(|| {
                    node.parent()
                        .and_then(|p| self.visible.get(&p))
                        .and_then(|visible| visible.get(name).copied())
                })
            }
        }
    }

    /// Like [`lookup`](Self::lookup) but a missing name is a resolution error.
    pub fn require(&self, site: Site, name: &str, consumer: &str) -> BuildResult<ColumnRef> {
        self.lookup(site, name)
            .ok_or_else(|| BuildError::SystematicResolution {
                variable: consumer.to_string(),
                systematic: Systematic::Nominal.to_string(),
                missing: name.to_string(),
                path: match site {
                    Site::Variable(c) => self.path(c.node).to_string(),
                    Site::Node(n) => self.path(n).to_string(),
                },
            })
    }

    /// Systematics that change `column`, directly or through its inputs.
    pub fn affects(&self, column: ColumnRef) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        self.affects.get(&column).unwrap_or(&EMPTY)
    }

    /// `systematic` if it changes `column`, nominal otherwise.
    pub fn effective(&self, column: ColumnRef, systematic: &Systematic) -> Systematic {
        match systematic {
            Systematic::Variation(name) if self.affects(column).contains(name) => {
                systematic.clone()
            }
            _ => Systematic::Nominal,
        }
    }

    /// The filter chain `systematic` runs on at `node`: its own chain if any
    /// filter from the root down to `node` depends on it, nominal otherwise.
    pub fn chain(&self, node: NodeId, systematic: &Systematic) -> Systematic {
        match systematic {
            Systematic::Variation(name)
                if self.chain.get(&node).is_some_and(|c| c.contains(name)) =>
            {
                systematic.clone()
            }
            _ => Systematic::Nominal,
        }
    }

    /// Systematics that mean something at `node`: anything changing a
    /// visible column or a filter on the path, plus declared ones.
    pub fn known_systematics(&self, node: NodeId) -> BTreeSet<&str> {
        let mut known: BTreeSet<&str> = self
            .tree
            .declared_systematics()
            .iter()
            .map(String::as_str)
            .collect();
        if let Some(chain) = self.chain.get(&node) {
            known.extend(chain.iter().map(String::as_str));
        }
        if let Some(visible) = self.visible.get(&node) {
            for column in visible.values() {
                known.extend(self.affects(*column).iter().map(String::as_str));
            }
        }
        known
    }

    /// Physical name of `column` under an already effective systematic.
    pub fn physical(
        &self,
        column: ColumnRef,
        effective: &Systematic,
        namer: &dyn BranchNamer,
    ) -> Option<String> {
        let variable = self.variable(column)?;
        Some(match variable.spec_for(effective) {
            DefinitionSpec::Branch(physical) => physical.clone(),
            _ => namer.physical_name(variable.name(), effective),
        })
    }

    /// Every systematic name mentioned by an override anywhere in the tree.
    pub fn all_systematics(&self) -> BTreeSet<&'t str> {
        let tree: &'t NodeTree<D> = self.tree;
        let mut all: BTreeSet<&'t str> = tree
            .declared_systematics()
            .iter()
            .map(String::as_str)
            .collect();
        for (_, node) in tree.iter() {
            if let Some(filter) = node.filter() {
                all.extend(filter.override_systematics());
            }
            for variable in node.variables() {
                all.extend(variable.override_systematics());
            }
        }
        all
    }
}
