//! Analysis node tree
//!
//! Nodes live in a generational arena owned by [`NodeTree`]. Each node holds
//! a filter (the selection it adds on top of its parent), the variables it
//! defines and an opaque detail payload. Identity is tree position: two
//! nodes with identical filters on different branches stay distinct.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use generational_arena::{Arena, Index};
use termtree::Tree;
use tracing::{debug, instrument};

use crate::domain::error::{BuildError, BuildResult, NamingError};
use crate::domain::namer::{BranchNamer, Systematic};
use crate::domain::sysvar::SystematicVariable;

pub const ROOT_NAME: &str = "ROOT";

/// How a node's weight combines with the one it inherits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightStrategy {
    /// Multiply by the inherited weight, if there is one
    #[default]
    Multiplicative,
    /// Ignore the inherited weight
    Replace,
}

impl FromStr for WeightStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multiplicative" => Ok(WeightStrategy::Multiplicative),
            "replace" => Ok(WeightStrategy::Replace),
            other => Err(format!(
                "unknown weight strategy '{other}' (multiplicative|replace)"
            )),
        }
    }
}

static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreeId(u64);

/// Handle to a node; only valid for the tree that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    tree: TreeId,
    index: Index,
}

impl NodeId {
    pub fn tree(&self) -> TreeId {
        self.tree
    }
}

#[derive(Debug)]
pub struct Node<D> {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    filter: Option<SystematicVariable>,
    variables: Vec<SystematicVariable>,
    weight: Option<String>,
    detail: D,
    depth: usize,
}

impl<D> Node<D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Selection applied by this node; `None` only for the root.
    pub fn filter(&self) -> Option<&SystematicVariable> {
        self.filter.as_ref()
    }

    /// Variables in declaration order.
    pub fn variables(&self) -> &[SystematicVariable] {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<(usize, &SystematicVariable)> {
        self.variables
            .iter()
            .enumerate()
            .find(|(_, v)| v.name() == name)
    }

    /// Column holding the event weight set on this node, if any. Children
    /// inherit it unless they set their own.
    pub fn own_weight(&self) -> Option<&str> {
        self.weight.as_deref()
    }

    pub fn detail(&self) -> &D {
        &self.detail
    }

    pub fn detail_mut(&mut self) -> &mut D {
        &mut self.detail
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Distance from the root (root is 0).
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Arena-backed analysis tree.
///
/// The tree is borrowed immutably by a schedule build, which freezes it for
/// as long as the schedule lives.
#[derive(Debug)]
pub struct NodeTree<D> {
    id: TreeId,
    arena: Arena<Node<D>>,
    root: NodeId,
    systematics: BTreeSet<String>,
}

impl<D: Default> Default for NodeTree<D> {
    fn default() -> Self {
        Self::new(D::default())
    }
}

impl<D> NodeTree<D> {
    pub fn new(root_detail: D) -> Self {
        let id = TreeId(NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed));
        let mut arena = Arena::new();
        let index = arena.insert(Node {
            name: ROOT_NAME.to_string(),
            parent: None,
            children: Vec::new(),
            filter: None,
            variables: Vec::new(),
            weight: None,
            detail: root_detail,
            depth: 0,
        });
        Self {
            id,
            arena,
            root: NodeId { tree: id, index },
            systematics: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.tree == self.id && self.arena.contains(id.index)
    }

    pub fn node(&self, id: NodeId) -> BuildResult<&Node<D>> {
        if id.tree != self.id {
            return Err(BuildError::ForeignNode {
                context: format!("{id:?}"),
            });
        }
        self.arena.get(id.index).ok_or_else(|| BuildError::ForeignNode {
            context: format!("{id:?} (removed)"),
        })
    }

    fn node_mut(&mut self, id: NodeId) -> BuildResult<&mut Node<D>> {
        if id.tree != self.id {
            return Err(BuildError::ForeignNode {
                context: format!("{id:?}"),
            });
        }
        self.arena
            .get_mut(id.index)
            .ok_or_else(|| BuildError::ForeignNode {
                context: format!("{id:?} (removed)"),
            })
    }

    /// Append a child selection below `parent`.
    #[instrument(level = "trace", skip(self, filter, detail))]
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: &str,
        filter: SystematicVariable,
        detail: D,
    ) -> BuildResult<NodeId> {
        let invalid = |reason: &str| BuildError::InvalidNode {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if name.is_empty() || name.contains('/') {
            return Err(invalid("name must be non-empty and must not contain '/'"));
        }
        if name == ROOT_NAME {
            return Err(invalid("name is reserved for the root"));
        }
        filter.validate_cost()?;
        let depth = {
            let parent_node = self.node(parent)?;
            if parent_node
                .children
                .iter()
                .filter_map(|c| self.arena.get(c.index))
                .any(|c| c.name == name)
            {
                return Err(invalid("a sibling with this name already exists"));
            }
            parent_node.depth + 1
        };
        let index = self.arena.insert(Node {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            filter: Some(filter),
            variables: Vec::new(),
            weight: None,
            detail,
            depth,
        });
        let id = NodeId {
            tree: self.id,
            index,
        };
        self.node_mut(parent)?.children.push(id);
        debug!("add_child: {} below {}", name, self.path_string(parent));
        Ok(id)
    }

    /// Define a variable at `node`, visible to the node's filter and to
    /// every descendant.
    #[instrument(level = "trace", skip(self, variable), fields(variable = variable.name()))]
    pub fn define(&mut self, node: NodeId, variable: SystematicVariable) -> BuildResult<()> {
        variable.validate_cost()?;
        if self.is_visible(node, variable.name())? {
            return Err(NamingError::DuplicateDefinition {
                name: variable.name().to_string(),
                path: self.path_string(node),
            }
            .into());
        }
        self.node_mut(node)?.variables.push(variable);
        Ok(())
    }

    /// Weight events from `node` down by `factor`.
    ///
    /// The factor is defined at `node` like any other variable, so it can
    /// carry its own systematic overrides. With
    /// [`WeightStrategy::Multiplicative`] and a weight inherited from an
    /// ancestor, the node's weight is the product of both, stored in a
    /// `weight_<node>` column.
    #[instrument(level = "trace", skip(self, factor), fields(factor = factor.name()))]
    pub fn set_weight(
        &mut self,
        node: NodeId,
        factor: SystematicVariable,
        strategy: WeightStrategy,
    ) -> BuildResult<()> {
        let current = self.node(node)?;
        if current.weight.is_some() {
            return Err(BuildError::InvalidNode {
                name: current.name.clone(),
                reason: "weight is already set".to_string(),
            });
        }
        let inherited = match current.parent {
            Some(parent) => self.weight(parent)?.map(str::to_string),
            None => None,
        };
        let node_name = current.name.clone();
        let factor_name = factor.name().to_string();
        self.define(node, factor)?;

        let weight = match (strategy, inherited) {
            (WeightStrategy::Multiplicative, Some(inherited)) => {
                let total = format!("weight_{node_name}");
                self.define(
                    node,
                    SystematicVariable::computed(&total, &[&inherited, &factor_name], |v| {
                        v[0] * v[1]
                    }),
                )?;
                total
            }
            _ => factor_name,
        };
        debug!("set_weight: {} weighted by {}", self.path_string(node), weight);
        self.node_mut(node)?.weight = Some(weight);
        Ok(())
    }

    /// Weight in effect at `node`: its own, or the nearest ancestor's.
    pub fn weight(&self, node: NodeId) -> BuildResult<Option<&str>> {
        let mut current = Some(node);
        while let Some(id) = current {
            let n = self.node(id)?;
            if let Some(weight) = n.weight.as_deref() {
                return Ok(Some(weight));
            }
            current = n.parent;
        }
        Ok(None)
    }

    fn is_visible(&self, node: NodeId, name: &str) -> BuildResult<bool> {
        Ok(self
            .path(node)?
            .into_iter()
            .filter_map(|id| self.arena.get(id.index))
            .any(|n| n.variable(name).is_some()))
    }

    /// Make `name` a known systematic without overriding any column.
    pub fn declare_systematic(&mut self, name: &str) {
        self.systematics.insert(name.to_string());
    }

    pub fn declared_systematics(&self) -> &BTreeSet<String> {
        &self.systematics
    }

    /// Ingest a dataset schema: every physical column is split by `namer`
    /// into logical name and systematic. Nominal columns become root
    /// variables, variant columns become overrides of them.
    pub fn declare_columns<'a, I>(&mut self, columns: I, namer: &dyn BranchNamer) -> BuildResult<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut parsed: Vec<(String, Systematic, &str)> = Vec::new();
        for physical in columns {
            let (logical, systematic) = namer.parse_physical(physical)?;
            parsed.push((logical, systematic, physical));
        }
        // nominal columns first so variants attach to an existing variable
        parsed.sort_by(|a, b| (&a.1, &a.0).cmp(&(&b.1, &b.0)));

        let root = self.root;
        for (logical, systematic, physical) in parsed {
            match systematic {
                Systematic::Nominal => {
                    self.define(root, SystematicVariable::alias(&logical, physical))?;
                }
                Systematic::Variation(syst) => {
                    let root_node = self.node_mut(root)?;
                    match root_node.variables.iter().position(|v| v.name() == logical) {
                        Some(i) => {
                            let var = root_node.variables.remove(i);
                            root_node
                                .variables
                                .insert(i, var.vary_branch(&syst, physical));
                        }
                        None => {
                            // variant without a nominal column: the nominal read
                            // fails at realization, not here
                            root_node.variables.push(
                                SystematicVariable::existing(&logical).vary_branch(&syst, physical),
                            );
                        }
                    }
                    self.systematics.insert(syst);
                }
            }
        }
        Ok(())
    }

    /// Nodes from the root down to `id`, inclusive.
    pub fn path(&self, id: NodeId) -> BuildResult<Vec<NodeId>> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            current = self.node(node_id)?.parent;
            path.push(node_id);
        }
        path.reverse();
        Ok(path)
    }

    /// Filters applied on the way from the root to `id`.
    pub fn path_filters(&self, id: NodeId) -> BuildResult<Vec<(NodeId, &SystematicVariable)>> {
        let mut filters = Vec::new();
        for node_id in self.path(id)? {
            if let Some(filter) = self.node(node_id)?.filter() {
                filters.push((node_id, filter));
            }
        }
        Ok(filters)
    }

    pub fn path_names(&self, id: NodeId) -> BuildResult<Vec<&str>> {
        self.path(id)?
            .into_iter()
            .map(|n| self.node(n).map(Node::name))
            .collect()
    }

    /// `ROOT/presel/signal`, used in logs and error messages.
    pub fn path_string(&self, id: NodeId) -> String {
        match self.path_names(id) {
            Ok(names) => names.join("/"),
            Err(_) => format!("<foreign {id:?}>"),
        }
    }

    /// Look a node up by its `/`-separated path below the root.
    pub fn find(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for part in path
            .split('/')
            .filter(|p| !p.is_empty())
            .skip_while(|p| *p == ROOT_NAME)
        {
            current = self
                .arena
                .get(current.index)?
                .children
                .iter()
                .copied()
                .find(|c| self.arena.get(c.index).is_some_and(|n| n.name == part))?;
        }
        Some(current)
    }

    /// First node in preorder with the given name.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.iter().find(|(_, n)| n.name == name).map(|(id, _)| id)
    }

    #[instrument(level = "trace", skip(self))]
    pub fn iter(&self) -> NodeIter<'_, D> {
        NodeIter {
            tree: self,
            stack: vec![self.root],
        }
    }

    /// Nodes without children, in preorder.
    pub fn leaf_nodes(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, n)| n.children.is_empty())
            .map(|(id, _)| id)
            .collect()
    }

    /// Number of levels, root included.
    pub fn depth(&self) -> usize {
        self.iter().map(|(_, n)| n.depth + 1).max().unwrap_or(0)
    }

    pub fn to_tree_string(&self) -> Tree<String> {
        fn label<D>(node: &Node<D>) -> String {
            let mut label = node.name.clone();
            if let Some(filter) = &node.filter {
                if let crate::domain::sysvar::DefinitionSpec::Expression(expr) = filter.nominal() {
                    label.push_str(&format!(" [{}]", expr.source()));
                }
            }
            if !node.variables.is_empty() {
                let names: Vec<_> = node.variables.iter().map(|v| v.name()).collect();
                label.push_str(&format!(" {{{}}}", names.join(", ")));
            }
            label
        }

        fn build<D>(tree: &NodeTree<D>, id: NodeId) -> Tree<String> {
            match tree.arena.get(id.index) {
                Some(node) => Tree::new(label(node))
                    .with_leaves(node.children.iter().map(|&c| build(tree, c))),
                None => Tree::new(String::from("<missing>")),
            }
        }

        build(self, self.root)
    }
}

/// Preorder traversal, children left to right.
pub struct NodeIter<'a, D> {
    tree: &'a NodeTree<D>,
    stack: Vec<NodeId>,
}

impl<'a, D> Iterator for NodeIter<'a, D> {
    type Item = (NodeId, &'a Node<D>);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            if let Some(node) = self.tree.arena.get(id.index) {
                // reverse so the first child is visited first
                self.stack.extend(node.children.iter().rev());
                return Some((id, node));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::namer::ScheduleNamer;

    fn cut(text: &str) -> SystematicVariable {
        SystematicVariable::expression("cut", text).unwrap()
    }

    #[test]
    fn given_tree_when_adding_children_then_paths_and_depth_follow() {
        let mut tree = NodeTree::new(());
        let a = tree.add_child(tree.root(), "a", cut("x > 1"), ()).unwrap();
        let b = tree.add_child(a, "b", cut("y > 1"), ()).unwrap();
        let c = tree.add_child(tree.root(), "c", cut("z > 1"), ()).unwrap();

        assert_eq!(tree.path_names(b).unwrap(), vec!["ROOT", "a", "b"]);
        assert_eq!(tree.path_filters(b).unwrap().len(), 2);
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.leaf_nodes(), vec![b, c]);
        assert_eq!(tree.find("a/b"), Some(b));
        assert_eq!(tree.find("ROOT/c"), Some(c));
        assert_eq!(tree.find("a/c"), None);
    }

    #[test]
    fn given_duplicate_sibling_when_adding_then_invalid_node() {
        let mut tree = NodeTree::new(());
        tree.add_child(tree.root(), "a", cut("x > 1"), ()).unwrap();
        let err = tree.add_child(tree.root(), "a", cut("x > 2"), ()).unwrap_err();
        assert!(matches!(err, BuildError::InvalidNode { .. }));
        assert!(tree.add_child(tree.root(), "ROOT", cut("x > 2"), ()).is_err());
    }

    #[test]
    fn given_node_of_other_tree_when_adding_then_foreign_node() {
        let other = NodeTree::new(());
        let mut tree = NodeTree::new(());
        let err = tree
            .add_child(other.root(), "a", cut("x > 1"), ())
            .unwrap_err();
        assert!(matches!(err, BuildError::ForeignNode { .. }));
    }

    #[test]
    fn given_variable_visible_on_path_when_redefining_then_duplicate_definition() {
        let mut tree = NodeTree::new(());
        tree.define(tree.root(), SystematicVariable::existing("x"))
            .unwrap();
        let a = tree.add_child(tree.root(), "a", cut("x > 1"), ()).unwrap();
        let err = tree
            .define(a, SystematicVariable::existing("x"))
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::Naming(NamingError::DuplicateDefinition { .. })
        ));
    }

    #[test]
    fn given_schema_when_declaring_columns_then_variants_become_overrides() {
        let mut tree: NodeTree<()> = NodeTree::default();
        let namer = ScheduleNamer::default();
        tree.declare_columns(["jet_pt__JES_up", "jet_pt", "njet"], &namer)
            .unwrap();

        let root = tree.node(tree.root()).unwrap();
        let (_, jet_pt) = root.variable("jet_pt").unwrap();
        assert_eq!(
            jet_pt.override_systematics().collect::<Vec<_>>(),
            vec!["JES_up"]
        );
        assert!(root.variable("njet").is_some());
        assert!(tree.declared_systematics().contains("JES_up"));
    }

    #[test]
    fn given_tree_when_rendering_then_contains_node_names() {
        let mut tree = NodeTree::new(());
        tree.add_child(tree.root(), "presel", cut("njet >= 2"), ())
            .unwrap();
        let rendered = tree.to_tree_string().to_string();
        assert!(rendered.contains("ROOT"));
        assert!(rendered.contains("presel [njet >= 2]"));
    }

    #[test]
    fn given_inherited_weight_when_setting_multiplicative_then_product_column_is_defined() {
        let mut tree = NodeTree::new(());
        let root = tree.root();
        tree.set_weight(root, SystematicVariable::existing("w_gen"), WeightStrategy::default())
            .unwrap();
        let sel = tree.add_child(root, "sel", cut("x > 1"), ()).unwrap();
        let inner = tree.add_child(sel, "inner", cut("x > 2"), ()).unwrap();

        tree.set_weight(
            sel,
            SystematicVariable::existing("sf_lep"),
            WeightStrategy::Multiplicative,
        )
        .unwrap();

        assert_eq!(tree.weight(root).unwrap(), Some("w_gen"));
        assert_eq!(tree.weight(sel).unwrap(), Some("weight_sel"));
        assert_eq!(tree.weight(inner).unwrap(), Some("weight_sel"));
        let (_, total) = tree.node(sel).unwrap().variable("weight_sel").unwrap();
        assert_eq!(total.all_inputs().into_iter().collect::<Vec<_>>(), vec!["sf_lep", "w_gen"]);
    }

    #[test]
    fn given_replace_strategy_when_setting_weight_then_factor_is_the_weight() {
        let mut tree = NodeTree::new(());
        let root = tree.root();
        tree.set_weight(root, SystematicVariable::existing("w_gen"), WeightStrategy::Replace)
            .unwrap();
        let sel = tree.add_child(root, "sel", cut("x > 1"), ()).unwrap();

        tree.set_weight(sel, SystematicVariable::existing("w_alt"), WeightStrategy::Replace)
            .unwrap();

        assert_eq!(tree.weight(sel).unwrap(), Some("w_alt"));
        assert!(tree.node(sel).unwrap().variable("weight_sel").is_none());
    }

    #[test]
    fn given_weighted_node_when_setting_again_then_invalid_node() {
        let mut tree = NodeTree::new(());
        let root = tree.root();
        tree.set_weight(root, SystematicVariable::existing("w"), WeightStrategy::Replace)
            .unwrap();

        let err = tree
            .set_weight(root, SystematicVariable::existing("w2"), WeightStrategy::Replace)
            .unwrap_err();

        assert!(matches!(err, BuildError::InvalidNode { .. }));
        assert_eq!("replace".parse::<WeightStrategy>(), Ok(WeightStrategy::Replace));
        assert!("sum".parse::<WeightStrategy>().is_err());
    }
}
