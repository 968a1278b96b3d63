//! TOML output writers
//!
//! Both writers lay files out as `<directory>/<region>/<systematic>/...`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::domain::CutflowLabel;
use crate::infrastructure::traits::{Materialized, OutputWriter, WriteContext, WriteError};

#[derive(Debug, Serialize)]
struct Yield {
    entries: u64,
    sum_weights: f64,
    sum_weights2: f64,
    error: f64,
}

impl From<&Materialized> for Yield {
    fn from(result: &Materialized) -> Self {
        Self {
            entries: result.entries,
            sum_weights: result.sum_weights,
            sum_weights2: result.sum_weights2,
            error: result.sum_weights2.sqrt(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CutflowRow<'a> {
    label: &'a str,
    events: u64,
    sum_weights: f64,
    sum_weights2: f64,
    error: f64,
}

#[derive(Debug, Serialize)]
struct CutflowFile<'a> {
    region: &'a str,
    systematic: &'a str,
    #[serde(rename = "yield")]
    total: Yield,
    rows: Vec<CutflowRow<'a>>,
}

#[derive(Debug, Serialize)]
struct ObjectFile<'a> {
    region: &'a str,
    systematic: &'a str,
    #[serde(rename = "yield")]
    total: Yield,
    columns: &'a std::collections::BTreeMap<String, Vec<f64>>,
}

fn output_dir<D>(root: &Path, context: &WriteContext<'_, D>, nominal_label: &str) -> PathBuf {
    root.join(context.region)
        .join(context.systematic.label(nominal_label))
}

fn write_toml<D, T: Serialize>(
    writer: &str,
    context: &WriteContext<'_, D>,
    path: PathBuf,
    content: &T,
) -> Result<(), WriteError> {
    let text = toml::to_string_pretty(content)
        .map_err(|e| context.error(writer, Some(path.clone()), e))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| context.error(writer, Some(path.clone()), e))?;
    }
    fs::write(&path, text).map_err(|e| context.error(writer, Some(path.clone()), e))?;
    debug!("{}: wrote {}", writer, path.display());
    Ok(())
}

/// Event counts and weighted sums along the selection path, one row per
/// filter.
#[derive(Debug, Clone)]
pub struct CutflowWriter {
    directory: PathBuf,
    nominal_label: String,
    weight: Option<String>,
}

impl CutflowWriter {
    pub const NAME: &'static str = "cutflow";

    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            nominal_label: "nominal".to_string(),
            weight: None,
        }
    }

    pub fn with_nominal_label(mut self, label: impl Into<String>) -> Self {
        self.nominal_label = label.into();
        self
    }

    pub fn with_weight(mut self, weight: impl Into<String>) -> Self {
        self.weight = Some(weight.into());
        self
    }
}

impl<D: CutflowLabel> OutputWriter<D> for CutflowWriter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn weight(&self) -> Option<&str> {
        self.weight.as_deref()
    }

    fn write(&self, context: &WriteContext<'_, D>, result: &Materialized) -> Result<(), WriteError> {
        let rows = context
            .cutflow
            .iter()
            .map(|step| CutflowRow {
                label: step.detail.cutflow_label().unwrap_or(step.node),
                events: step.events,
                sum_weights: step.sum_weights,
                sum_weights2: step.sum_weights2,
                error: step.sum_weights2.sqrt(),
            })
            .collect();
        let file = CutflowFile {
            region: context.region,
            systematic: context.systematic.label(&self.nominal_label),
            total: result.into(),
            rows,
        };
        let path = output_dir(&self.directory, context, &self.nominal_label).join("cutflow.toml");
        write_toml(Self::NAME, context, path, &file)
    }
}

/// Yields plus the selected values of a set of columns.
#[derive(Debug, Clone)]
pub struct ObjectWriter {
    directory: PathBuf,
    name: String,
    columns: Vec<String>,
    weight: Option<String>,
    nominal_label: String,
}

impl ObjectWriter {
    pub fn new(directory: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            name: name.into(),
            columns: Vec::new(),
            weight: None,
            nominal_label: "nominal".to_string(),
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn with_weight(mut self, weight: impl Into<String>) -> Self {
        self.weight = Some(weight.into());
        self
    }

    pub fn with_nominal_label(mut self, label: impl Into<String>) -> Self {
        self.nominal_label = label.into();
        self
    }
}

impl<D> OutputWriter<D> for ObjectWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn weight(&self) -> Option<&str> {
        self.weight.as_deref()
    }

    fn write(&self, context: &WriteContext<'_, D>, result: &Materialized) -> Result<(), WriteError> {
        let file = ObjectFile {
            region: context.region,
            systematic: context.systematic.label(&self.nominal_label),
            total: result.into(),
            columns: &result.columns,
        };
        let path = output_dir(&self.directory, context, &self.nominal_label)
            .join(format!("{}.toml", self.name));
        write_toml(&self.name, context, path, &file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CutflowDetail, NodeTree, Systematic};
    use crate::infrastructure::traits::CutflowStep;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn result() -> Materialized {
        Materialized {
            entries: 4,
            sum_weights: 2.0,
            sum_weights2: 1.0,
            columns: BTreeMap::from([("pt".to_string(), vec![10.0, 20.0, 30.0, 40.0])]),
        }
    }

    #[test]
    fn given_cutflow_path_when_writing_then_rows_use_labels_or_node_names() {
        let dir = TempDir::new().unwrap();
        let tree: NodeTree<CutflowDetail> = NodeTree::default();
        let root = CutflowDetail::default();
        let labelled = CutflowDetail::labelled("two jets");
        let context = WriteContext {
            region: "sr",
            systematic: &Systematic::variation("JES_up"),
            target: tree.root(),
            detail: &labelled,
            cutflow: vec![
                CutflowStep {
                    node: "ROOT",
                    detail: &root,
                    events: 100,
                    sum_weights: 100.0,
                    sum_weights2: 100.0,
                },
                CutflowStep {
                    node: "jets",
                    detail: &labelled,
                    events: 4,
                    sum_weights: 3.0,
                    sum_weights2: 2.25,
                },
            ],
        };

        CutflowWriter::new(dir.path())
            .write(&context, &result())
            .unwrap();

        let text = fs::read_to_string(dir.path().join("sr/JES_up/cutflow.toml")).unwrap();
        let value: toml::Value = toml::from_str(&text).unwrap();
        let rows = value["rows"].as_array().unwrap();
        assert_eq!(rows[0]["label"].as_str(), Some("ROOT"));
        assert_eq!(rows[1]["label"].as_str(), Some("two jets"));
        assert_eq!(rows[1]["events"].as_integer(), Some(4));
        assert_eq!(rows[1]["sum_weights"].as_float(), Some(3.0));
        assert_eq!(rows[1]["error"].as_float(), Some(1.5));
        assert_eq!(rows[0]["error"].as_float(), Some(10.0));
        assert_eq!(value["yield"]["sum_weights"].as_float(), Some(2.0));
    }

    #[test]
    fn given_object_writer_when_writing_nominal_then_uses_nominal_label_directory() {
        let dir = TempDir::new().unwrap();
        let tree: NodeTree<()> = NodeTree::default();
        let context = WriteContext {
            region: "cr",
            systematic: &Systematic::Nominal,
            target: tree.root(),
            detail: &(),
            cutflow: Vec::new(),
        };
        let writer = ObjectWriter::new(dir.path(), "jets")
            .with_columns(["pt"])
            .with_nominal_label("central");

        writer.write(&context, &result()).unwrap();

        let text = fs::read_to_string(dir.path().join("cr/central/jets.toml")).unwrap();
        let value: toml::Value = toml::from_str(&text).unwrap();
        assert_eq!(value["columns"]["pt"].as_array().unwrap().len(), 4);
        assert_eq!(value["yield"]["entries"].as_integer(), Some(4));
    }

    #[test]
    fn given_unwritable_directory_when_writing_then_write_error_names_path() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, "not a directory").unwrap();
        let tree: NodeTree<()> = NodeTree::default();
        let context = WriteContext {
            region: "sr",
            systematic: &Systematic::Nominal,
            target: tree.root(),
            detail: &(),
            cutflow: Vec::new(),
        };

        let err = ObjectWriter::new(&blocker, "obj")
            .write(&context, &result())
            .unwrap_err();

        assert_eq!(err.region, "sr");
        assert_eq!(err.systematic, "nominal");
        assert!(err.path.unwrap().starts_with(&blocker));
    }
}
