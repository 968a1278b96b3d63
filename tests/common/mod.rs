//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use cutgraph::application::Region;
use cutgraph::domain::{NodeId, NodeTree, ScheduleNamer, Systematic, SystematicVariable};
use cutgraph::infrastructure::{
    EventTable, Materialized, OutputWriter, WriteContext, WriteError,
};

/// Five events with a jet energy scale variation of `jet_pt`.
pub fn jet_table() -> EventTable {
    EventTable::new()
        .with_column("jet_pt", vec![20.0, 35.0, 50.0, 80.0, 120.0])
        .unwrap()
        .with_column("jet_pt__JES_up", vec![22.0, 38.0, 55.0, 88.0, 130.0])
        .unwrap()
        .with_column("n_jets", vec![1.0, 2.0, 3.0, 2.0, 4.0])
        .unwrap()
        .with_column("weight", vec![1.0, 0.5, 2.0, 1.0, 1.5])
        .unwrap()
}

pub fn cut(name: &str, text: &str) -> SystematicVariable {
    SystematicVariable::expression(name, text).unwrap()
}

/// ROOT
/// └ jets   [n_jets >= 2]
///   ├ hpt  [jet_pt > 36] {pt2 = jet_pt * jet_pt}
///   └ lowpt [jet_pt < 60]
pub struct JetTree {
    pub tree: NodeTree<()>,
    pub namer: ScheduleNamer,
    pub jets: NodeId,
    pub hpt: NodeId,
    pub lowpt: NodeId,
}

pub fn jet_tree(table: &EventTable) -> JetTree {
    let namer = ScheduleNamer::default();
    let mut tree = NodeTree::new(());
    tree.declare_columns(table.names(), &namer).unwrap();
    let jets = tree
        .add_child(tree.root(), "jets", cut("jets", "n_jets >= 2"), ())
        .unwrap();
    let hpt = tree
        .add_child(jets, "hpt", cut("hpt", "jet_pt > 36"), ())
        .unwrap();
    tree.define(hpt, cut("pt2", "jet_pt * jet_pt")).unwrap();
    let lowpt = tree
        .add_child(jets, "lowpt", cut("lowpt", "jet_pt < 60"), ())
        .unwrap();
    JetTree {
        tree,
        namer,
        jets,
        hpt,
        lowpt,
    }
}

/// What a [`Recorder`] saw for one output.
#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub region: String,
    pub systematic: Systematic,
    pub result: Materialized,
    pub cutflow: Vec<(String, u64)>,
    /// Weighted sum per cutflow row
    pub weights: Vec<f64>,
}

/// Writer that keeps every result in memory.
#[derive(Debug, Default)]
pub struct Recorder {
    pub columns: Vec<String>,
    pub weight: Option<String>,
    pub seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub fn new(columns: &[&str], weight: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            weight: weight.map(str::to_string),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn find(&self, region: &str, systematic: &Systematic) -> Option<Seen> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.region == region && &s.systematic == systematic)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl<D> OutputWriter<D> for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn weight(&self) -> Option<&str> {
        self.weight.as_deref()
    }

    fn write(&self, context: &WriteContext<'_, D>, result: &Materialized) -> Result<(), WriteError> {
        self.seen.lock().unwrap().push(Seen {
            region: context.region.to_string(),
            systematic: context.systematic.clone(),
            result: result.clone(),
            cutflow: context
                .cutflow
                .iter()
                .map(|s| (s.node.to_string(), s.events))
                .collect(),
            weights: context.cutflow.iter().map(|s| s.sum_weights).collect(),
        });
        Ok(())
    }
}

/// Writer that always fails.
pub struct Failing;

impl<D> OutputWriter<D> for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn write(&self, context: &WriteContext<'_, D>, _result: &Materialized) -> Result<(), WriteError> {
        Err(context.error("failing", None, "disk full"))
    }
}

pub struct JetRegions {
    pub regions: Vec<Region<()>>,
    /// Writer of `signal`, materializing `pt2`
    pub signal: Arc<Recorder>,
    /// Writer of `control` and `inclusive`, materializing `jet_pt`
    pub shared: Arc<Recorder>,
}

/// `signal` on hpt, `control` on lowpt, `inclusive` on jets; all nominal and
/// JES_up, weighted by `weight`.
pub fn jet_regions(fixture: &JetTree) -> JetRegions {
    let jes = Systematic::variation("JES_up");
    let signal = Recorder::new(&["pt2"], Some("weight"));
    let shared = Recorder::new(&["jet_pt"], Some("weight"));
    let regions = vec![
        Region::new("signal", fixture.hpt)
            .with_systematic(jes.clone())
            .with_writer(Arc::clone(&signal) as Arc<dyn OutputWriter<()>>),
        Region::new("control", fixture.lowpt)
            .with_systematic(jes.clone())
            .with_writer(Arc::clone(&shared) as Arc<dyn OutputWriter<()>>),
        Region::new("inclusive", fixture.jets)
            .with_systematic(jes)
            .with_writer(Arc::clone(&shared) as Arc<dyn OutputWriter<()>>),
    ];
    JetRegions {
        regions,
        signal,
        shared,
    }
}
