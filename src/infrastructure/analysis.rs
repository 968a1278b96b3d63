//! Analysis file loader
//!
//! An analysis file is TOML:
//!
//! ```toml
//! systematics = ["PU_up"]
//!
//! [dataset.columns]
//! jet_pt = [25.0, 40.0, 61.0]
//! jet_pt__JES_up = [27.0, 42.0, 64.0]
//! weight = [1.0, 0.5, 2.0]
//!
//! [[variable]]
//! name = "pt_gev"
//! expression = "jet_pt / 1"
//!
//! [[node]]
//! name = "presel"
//! filter = "jet_pt > 30"
//! cutflow = "Preselection"
//! weight = "weight"                # expression; multiplies inherited weights
//! weight_strategy = "multiplicative"
//!
//! [[region]]
//! name = "signal"
//! node = "presel"
//! systematics = ["JES_up"]
//! writers = ["cutflow", "object"]
//! columns = ["jet_pt"]
//! weight = "weight"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::application::Region;
use crate::config::Settings;
use crate::domain::{
    BranchNamer, CutflowDetail, NodeId, NodeTree, Systematic, SystematicVariable, WeightStrategy,
    ROOT_NAME,
};
use crate::infrastructure::memory::EventTable;
use crate::infrastructure::traits::OutputWriter;
use crate::infrastructure::writers::{CutflowWriter, ObjectWriter};
use crate::infrastructure::{InfraError, InfraResult};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AnalysisFile {
    #[serde(default)]
    systematics: Vec<String>,
    /// Event weight applied from the root down
    weight: Option<String>,
    #[serde(default)]
    dataset: DatasetSection,
    #[serde(default, rename = "variable")]
    variables: Vec<VariableEntry>,
    #[serde(default, rename = "node")]
    nodes: Vec<NodeEntry>,
    #[serde(default, rename = "region")]
    regions: Vec<RegionEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatasetSection {
    #[serde(default)]
    columns: BTreeMap<String, Vec<f64>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VariableEntry {
    name: String,
    expression: Option<String>,
    column: Option<String>,
    /// systematic -> expression (or column, for column aliases)
    #[serde(default)]
    overrides: BTreeMap<String, String>,
    cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeEntry {
    name: String,
    /// Path of the parent below the root; the root if absent
    parent: Option<String>,
    filter: String,
    #[serde(default)]
    overrides: BTreeMap<String, String>,
    cost: Option<f64>,
    cutflow: Option<String>,
    weight: Option<String>,
    weight_strategy: Option<String>,
    #[serde(default, rename = "variable")]
    variables: Vec<VariableEntry>,
}

fn default_writers() -> Vec<String> {
    vec![CutflowWriter::NAME.to_string()]
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegionEntry {
    name: String,
    node: String,
    #[serde(default)]
    systematics: Vec<String>,
    #[serde(default = "default_writers")]
    writers: Vec<String>,
    #[serde(default)]
    columns: Vec<String>,
    weight: Option<String>,
}

/// Everything needed to schedule and run one analysis file.
pub struct Analysis {
    pub tree: NodeTree<CutflowDetail>,
    pub regions: Vec<Region<CutflowDetail>>,
    pub table: EventTable,
    pub namer: Arc<dyn BranchNamer>,
}

/// Read and assemble an analysis file. Writers put their files below `output_dir`.
#[instrument(level = "debug", skip(settings))]
pub fn load_analysis(path: &Path, settings: &Settings, output_dir: &Path) -> InfraResult<Analysis> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| InfraError::io(format!("read analysis {}", path.display()), e))?;
    parse_analysis(&text, path, settings, output_dir)
}

/// Like [`load_analysis`] for text already in memory; `path` is used in errors.
pub fn parse_analysis(
    text: &str,
    path: &Path,
    settings: &Settings,
    output_dir: &Path,
) -> InfraResult<Analysis> {
    let file: AnalysisFile = toml::from_str(text).map_err(|e| InfraError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Loader {
        path,
        settings,
        output_dir,
        namer: settings.naming.namer(),
    }
    .assemble(file)
}

struct Loader<'a> {
    path: &'a Path,
    settings: &'a Settings,
    output_dir: &'a Path,
    namer: Arc<dyn BranchNamer>,
}

impl Loader<'_> {
    fn error(&self, message: impl Into<String>) -> InfraError {
        InfraError::analysis(self.path, message)
    }

    fn assemble(self, file: AnalysisFile) -> InfraResult<Analysis> {
        let mut table = EventTable::new();
        for (name, values) in file.dataset.columns {
            table
                .insert(name, values)
                .map_err(|e| self.error(format!("dataset: {e}")))?;
        }

        let mut tree = NodeTree::new(CutflowDetail::default());
        tree.declare_columns(table.names(), self.namer.as_ref())
            .map_err(|e| self.error(format!("dataset: {e}")))?;
        for systematic in &file.systematics {
            tree.declare_systematic(systematic);
        }

        let root = tree.root();
        for entry in &file.variables {
            let variable = self.variable(entry)?;
            tree.define(root, variable)
                .map_err(|e| self.error(format!("variable '{}': {e}", entry.name)))?;
        }
        if let Some(weight) = &file.weight {
            self.weight(&mut tree, root, weight, None)?;
        }

        for entry in &file.nodes {
            let parent_path = entry.parent.as_deref().unwrap_or(ROOT_NAME);
            let parent = tree.find(parent_path).ok_or_else(|| {
                self.error(format!(
                    "node '{}': unknown parent '{}' (parents must come first)",
                    entry.name, parent_path
                ))
            })?;
            let filter = self.filter(entry)?;
            let detail = CutflowDetail {
                label: entry.cutflow.clone(),
            };
            let node = tree
                .add_child(parent, &entry.name, filter, detail)
                .map_err(|e| self.error(format!("node '{}': {e}", entry.name)))?;
            for variable in &entry.variables {
                let defined = self.variable(variable)?;
                tree.define(node, defined).map_err(|e| {
                    self.error(format!("node '{}' variable '{}': {e}", entry.name, variable.name))
                })?;
            }
            if let Some(weight) = &entry.weight {
                self.weight(&mut tree, node, weight, entry.weight_strategy.as_deref())?;
            }
        }

        let regions = file
            .regions
            .iter()
            .map(|entry| self.region(&tree, entry))
            .collect::<InfraResult<Vec<_>>>()?;

        debug!(
            "analysis {}: {} nodes, {} regions, {} dataset columns x {} rows",
            self.path.display(),
            tree.len(),
            regions.len(),
            table.len(),
            table.rows()
        );
        Ok(Analysis {
            tree,
            regions,
            table,
            namer: self.namer,
        })
    }

    fn variable(&self, entry: &VariableEntry) -> InfraResult<SystematicVariable> {
        let context = |e: crate::domain::BuildError| {
            self.error(format!("variable '{}': {e}", entry.name))
        };
        let mut variable = match (&entry.expression, &entry.column) {
            (Some(expression), None) => {
                let mut variable =
                    SystematicVariable::expression(&entry.name, expression).map_err(context)?;
                for (systematic, text) in &entry.overrides {
                    variable = variable
                        .vary_expression(systematic, text)
                        .map_err(context)?;
                }
                variable
            }
            (None, Some(column)) => {
                let mut variable = SystematicVariable::alias(&entry.name, column);
                for (systematic, column) in &entry.overrides {
                    variable = variable.vary_branch(systematic, column);
                }
                variable
            }
            _ => {
                return Err(self.error(format!(
                    "variable '{}' needs exactly one of `expression` or `column`",
                    entry.name
                )))
            }
        };
        if let Some(cost) = entry.cost {
            variable = variable.with_cost(cost);
        }
        Ok(variable)
    }

    /// The factor is stored as `<node>_weight`.
    fn weight(
        &self,
        tree: &mut NodeTree<CutflowDetail>,
        node: NodeId,
        expression: &str,
        strategy: Option<&str>,
    ) -> InfraResult<()> {
        let name = tree
            .node(node)
            .map(|n| n.name().to_string())
            .map_err(|e| self.error(e.to_string()))?;
        let context = |e: crate::domain::BuildError| self.error(format!("weight of '{name}': {e}"));
        let strategy = match strategy {
            Some(text) => text
                .parse::<WeightStrategy>()
                .map_err(|e| self.error(format!("weight of '{name}': {e}")))?,
            None => WeightStrategy::default(),
        };
        let factor =
            SystematicVariable::expression(format!("{name}_weight"), expression).map_err(context)?;
        tree.set_weight(node, factor, strategy).map_err(context)
    }

    fn filter(&self, entry: &NodeEntry) -> InfraResult<SystematicVariable> {
        let context = |e: crate::domain::BuildError| self.error(format!("node '{}': {e}", entry.name));
        let mut filter = SystematicVariable::expression(&entry.name, &entry.filter).map_err(context)?;
        for (systematic, text) in &entry.overrides {
            filter = filter.vary_expression(systematic, text).map_err(context)?;
        }
        if let Some(cost) = entry.cost {
            filter = filter.with_cost(cost);
        }
        Ok(filter)
    }

    fn region(
        &self,
        tree: &NodeTree<CutflowDetail>,
        entry: &RegionEntry,
    ) -> InfraResult<Region<CutflowDetail>> {
        let target = tree.find(&entry.node).ok_or_else(|| {
            self.error(format!("region '{}': unknown node '{}'", entry.name, entry.node))
        })?;
        let nominal = &self.settings.naming.nominal_name;
        let mut region = Region::new(&entry.name, target);
        for label in &entry.systematics {
            region = region.with_systematic(Systematic::parse(label, nominal));
        }
        let directory: PathBuf = self.output_dir.to_path_buf();
        for name in &entry.writers {
            let writer: Arc<dyn OutputWriter<CutflowDetail>> = match name.as_str() {
                CutflowWriter::NAME => {
                    let mut writer =
                        CutflowWriter::new(&directory).with_nominal_label(nominal.as_str());
                    if let Some(weight) = &entry.weight {
                        writer = writer.with_weight(weight);
                    }
                    Arc::new(writer)
                }
                "object" => {
                    let mut writer = ObjectWriter::new(&directory, "object")
                        .with_columns(entry.columns.iter().cloned())
                        .with_nominal_label(nominal.as_str());
                    if let Some(weight) = &entry.weight {
                        writer = writer.with_weight(weight);
                    }
                    Arc::new(writer)
                }
                other => {
                    return Err(self.error(format!(
                        "region '{}': unknown writer '{}' (cutflow|object)",
                        entry.name, other
                    )))
                }
            };
            region = region.with_writer(writer);
        }
        Ok(region)
    }
}
