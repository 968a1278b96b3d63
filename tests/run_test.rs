//! Integration tests for executing schedules on the in-memory backend.

mod common;

use std::sync::{Arc, Mutex};

use common::{cut, jet_regions, jet_table, jet_tree, Failing, Recorder};
use cutgraph::application::{
    ActionKind, ActionState, Operation, RealizationError, Region, RunError, Scheduler,
};
use cutgraph::domain::{Systematic, SystematicVariable, WeightStrategy};
use cutgraph::infrastructure::{
    ActionEvent, MemoryBackend, OutputWriter, ProgressMonitor, RunMonitor,
};
use cutgraph::util::testing;

fn jes() -> Systematic {
    Systematic::variation("JES_up")
}

// ============================================================
// Results
// ============================================================

#[test]
fn given_jet_analysis_when_running_then_every_output_is_written() {
    testing::init_test_setup();
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = jet_regions(&fixture);
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();
    let backend = MemoryBackend::new(table.clone());

    let report = schedule.execute(&backend, &());

    assert!(report.is_success(), "{:?}", report.failures());
    assert_eq!(report.regions.len(), 3);
    assert_eq!(regions.signal.len(), 2);
    assert_eq!(regions.shared.len(), 4);
}

#[test]
fn given_variation_of_filter_input_when_running_then_selection_differs() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = jet_regions(&fixture);
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();

    schedule.execute(&MemoryBackend::new(table.clone()), &());

    let nominal = regions.signal.find("signal", &Systematic::Nominal).unwrap();
    assert_eq!(nominal.result.entries, 3);
    assert!((nominal.result.sum_weights - 4.5).abs() < 1e-12);
    assert_eq!(nominal.result.columns["pt2"], vec![2500.0, 6400.0, 14400.0]);

    let varied = regions.signal.find("signal", &jes()).unwrap();
    assert_eq!(varied.result.entries, 4);
    assert!((varied.result.sum_weights - 5.0).abs() < 1e-12);
    assert_eq!(
        varied.result.columns["pt2"],
        vec![38.0 * 38.0, 55.0 * 55.0, 88.0 * 88.0, 130.0 * 130.0]
    );
}

#[test]
fn given_region_path_when_running_then_cutflow_counts_each_filter() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = jet_regions(&fixture);
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();

    schedule.execute(&MemoryBackend::new(table.clone()), &());

    let cutflow = |systematic: &Systematic| {
        regions
            .signal
            .find("signal", systematic)
            .unwrap()
            .cutflow
            .into_iter()
            .map(|(node, events)| format!("{node}={events}"))
            .collect::<Vec<_>>()
    };
    assert_eq!(cutflow(&Systematic::Nominal), vec!["ROOT=5", "jets=4", "hpt=3"]);
    assert_eq!(cutflow(&jes()), vec!["ROOT=5", "jets=4", "hpt=4"]);
}

#[test]
fn given_unaffected_region_when_running_varied_then_reads_variant_columns_on_nominal_selection() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = jet_regions(&fixture);
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();

    schedule.execute(&MemoryBackend::new(table.clone()), &());

    let nominal = regions.shared.find("inclusive", &Systematic::Nominal).unwrap();
    let varied = regions.shared.find("inclusive", &jes()).unwrap();
    assert_eq!(nominal.result.entries, varied.result.entries);
    assert_eq!(nominal.result.columns["jet_pt"], vec![35.0, 50.0, 80.0, 120.0]);
    assert_eq!(varied.result.columns["jet_pt"], vec![38.0, 55.0, 88.0, 130.0]);
}

// ============================================================
// Laziness and sharing
// ============================================================

#[test]
fn given_constructed_schedule_when_nothing_pulled_then_nothing_is_evaluated() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = jet_regions(&fixture);
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();
    let backend = MemoryBackend::new(table.clone());

    let execution = schedule.construct(&backend, &());

    assert_eq!(backend.evaluations(), 0);
    for id in schedule.order() {
        assert_eq!(execution.state(*id), ActionState::Constructed);
    }
}

#[test]
fn given_shared_actions_when_running_twice_then_each_frame_is_evaluated_once() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = jet_regions(&fixture);
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();
    let backend = MemoryBackend::new(table.clone()).with_parallel(false);
    let execution = schedule.construct(&backend, &());

    let first = execution.run();
    let evaluated = backend.evaluations();
    let second = execution.run();

    assert!(first.is_success() && second.is_success());
    // source, jets, hpt x2, lowpt x2, pt2 x2
    assert_eq!(evaluated, 8);
    assert_eq!(backend.evaluations(), evaluated);
    for id in schedule.order() {
        assert_eq!(execution.state(*id), ActionState::Realized);
    }
}

// ============================================================
// Failure isolation
// ============================================================

/// Adds a `ghost` region whose filter reads a column the dataset lacks.
fn with_ghost_region(
    fixture: &mut common::JetTree,
    regions: &mut Vec<Region<()>>,
    writer: Arc<dyn OutputWriter<()>>,
) {
    let root = fixture.tree.root();
    fixture
        .tree
        .define(root, SystematicVariable::existing("ghost_pt"))
        .unwrap();
    let ghost = fixture
        .tree
        .add_child(root, "ghost", cut("ghost", "ghost_pt > 0"), ())
        .unwrap();
    regions.push(Region::new("broken", ghost).with_writer(writer));
}

#[test]
fn given_failing_region_when_running_then_independent_regions_still_succeed() {
    let table = jet_table();
    let mut fixture = jet_tree(&table);
    let mut regions = jet_regions(&fixture);
    let recorder = Recorder::new(&[], None);
    with_ghost_region(&mut fixture, &mut regions.regions, recorder.clone());
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();

    let report = schedule.execute(&MemoryBackend::new(table.clone()), &());

    assert!(!report.is_success());
    assert!(!report.region("broken").unwrap().is_success());
    for name in ["signal", "control", "inclusive"] {
        assert!(report.region(name).unwrap().is_success(), "{name}");
    }
    assert_eq!(recorder.len(), 0);
    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    let (region, outcome) = failures[0];
    assert_eq!(region, "broken");
    match &outcome.result {
        Err(RunError::Realization(error)) => {
            let root = error.root_cause().context();
            assert_eq!(root.path, "ROOT/ghost");
            assert_eq!(root.systematic, "nominal");
            assert!(error.to_string().contains("ghost_pt"), "{error}");
        }
        other => panic!("expected realization error, got {other:?}"),
    }
}

#[test]
fn given_failing_computed_root_variable_when_running_then_only_its_readers_fail() {
    let table = jet_table();
    let mut fixture = jet_tree(&table);
    let mut regions = jet_regions(&fixture);
    let root = fixture.tree.root();
    fixture
        .tree
        .define(root, SystematicVariable::existing("ghost_pt"))
        .unwrap();
    fixture
        .tree
        .define(root, cut("ghost2", "ghost_pt * 2"))
        .unwrap();
    let ghost = fixture
        .tree
        .add_child(root, "ghost", cut("ghost", "ghost2 > 0"), ())
        .unwrap();
    let recorder = Recorder::new(&[], None);
    regions
        .regions
        .push(Region::new("broken", ghost).with_writer(recorder.clone()));
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();
    let graph = schedule.graph();
    let ghost2 = graph
        .actions()
        .iter()
        .find(|a| matches!(a.operation(), Operation::Define { variable, .. } if variable == "ghost2"))
        .unwrap()
        .id();

    let report = schedule.execute(&MemoryBackend::new(table.clone()), &());

    for action in graph.actions() {
        if action.kind() == ActionKind::FilterApply && action.path() != "ROOT/ghost" {
            assert!(!graph.closure(action.id()).contains(&ghost2), "{}", action.label());
        }
    }
    for name in ["signal", "control", "inclusive"] {
        assert!(report.region(name).unwrap().is_success(), "{name}");
    }
    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "broken");
    match &failures[0].1.result {
        Err(RunError::Realization(error)) => {
            assert!(error.to_string().contains("ghost_pt"), "{error}");
        }
        other => panic!("expected realization error, got {other:?}"),
    }
    assert_eq!(recorder.len(), 0);
}

#[test]
fn given_failing_writer_when_running_then_other_writers_of_region_succeed() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let recorder = Recorder::new(&["jet_pt"], None);
    let regions: Vec<Region<()>> = vec![Region::new("sr", fixture.lowpt)
        .with_writer(Arc::new(Failing))
        .with_writer(Arc::clone(&recorder) as Arc<dyn OutputWriter<()>>)];
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions)
        .unwrap();

    let report = schedule.execute(&MemoryBackend::new(table.clone()), &());

    let outcomes = &report.region("sr").unwrap().outcomes;
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(outcomes[0].result, Err(RunError::Write(_))));
    assert!(outcomes[1].result.is_ok());
    assert_eq!(recorder.len(), 1);
    assert_eq!(outcomes[1].events, Some(2));
}

#[test]
fn given_progress_monitor_when_running_then_counts_realized_actions() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = jet_regions(&fixture);
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();
    let monitor = ProgressMonitor::new(100);

    schedule.execute(&MemoryBackend::new(table.clone()), &monitor);

    assert_eq!(monitor.realized(), schedule.graph().len() as u64);
}

/// Keeps `(kind, path, ok)` for every constructed action.
#[derive(Default)]
struct Constructions(Mutex<Vec<(String, String, bool)>>);

impl RunMonitor for Constructions {
    fn action_constructed(&self, event: &ActionEvent<'_>, outcome: Result<(), &RealizationError>) {
        self.0.lock().unwrap().push((
            event.kind.to_string(),
            event.path.to_string(),
            outcome.is_ok(),
        ));
    }
}

#[test]
fn given_backend_rejecting_define_when_constructing_then_monitor_sees_the_failure() {
    let fixture = jet_tree(&jet_table());
    let regions = jet_regions(&fixture);
    // a dataset column named like the define makes the backend refuse it
    let table = jet_table().with_column("pt2", vec![0.0; 5]).unwrap();
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();
    let monitor = Constructions::default();

    let report = schedule.execute(&MemoryBackend::new(table), &monitor);

    let seen = monitor.0.lock().unwrap();
    assert_eq!(seen.len(), schedule.graph().len());
    let failed: Vec<_> = seen.iter().filter(|(_, _, ok)| !ok).collect();
    assert_eq!(failed.len(), 2, "{failed:?}");
    assert!(failed
        .iter()
        .any(|(kind, path, _)| kind == "define" && path == "ROOT/jets/hpt"));
    assert!(failed
        .iter()
        .any(|(kind, path, _)| kind == "output" && path == "ROOT/jets/hpt"));
    assert!(!report.region("signal").unwrap().is_success());
    assert!(report.region("control").unwrap().is_success());
}

// ============================================================
// Weights
// ============================================================

#[test]
fn given_weighted_nodes_when_running_then_cutflow_carries_cumulative_sums() {
    let table = jet_table();
    let mut fixture = jet_tree(&table);
    let root = fixture.tree.root();
    fixture
        .tree
        .set_weight(
            root,
            SystematicVariable::alias("w_event", "weight"),
            WeightStrategy::Replace,
        )
        .unwrap();
    fixture
        .tree
        .set_weight(fixture.jets, cut("sf_jets", "2"), WeightStrategy::Multiplicative)
        .unwrap();
    let recorder = Recorder::new(&[], None);
    let regions = vec![Region::new("signal", fixture.hpt)
        .with_systematic(jes())
        .with_writer(Arc::clone(&recorder) as Arc<dyn OutputWriter<()>>)];
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions)
        .unwrap();

    let report = schedule.execute(&MemoryBackend::new(table.clone()), &());

    assert!(report.is_success(), "{:?}", report.failures());
    let nominal = recorder.find("signal", &Systematic::Nominal).unwrap();
    // weights 1, 0.5, 2, 1, 1.5; jets keeps rows 1-4, hpt rows 2-4
    assert_eq!(nominal.weights, vec![6.0, 10.0, 9.0]);
    assert_eq!(nominal.cutflow.last(), Some(&("hpt".to_string(), 3)));
    assert!((nominal.result.sum_weights - 9.0).abs() < 1e-12);
    assert!((nominal.result.sum_weights2 - 4.0 * (4.0 + 1.0 + 2.25)).abs() < 1e-12);
    let varied = recorder.find("signal", &jes()).unwrap();
    assert_eq!(varied.weights, vec![6.0, 10.0, 10.0]);
}

#[test]
fn given_unweighted_nodes_when_running_then_cutflow_sums_equal_counts() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = jet_regions(&fixture);
    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();

    schedule.execute(&MemoryBackend::new(table.clone()), &());

    let seen = regions.signal.find("signal", &Systematic::Nominal).unwrap();
    assert_eq!(seen.weights, vec![5.0, 4.0, 3.0]);
}
