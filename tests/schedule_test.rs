//! Integration tests for graph building and construction order.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use rstest::rstest;

use common::{cut, jet_regions, jet_table, jet_tree};
use cutgraph::application::{
    order, ActionKind, BuildOptions, Operation, Region, ScheduleError, Scheduler,
    UnknownSystematicPolicy,
};
use cutgraph::domain::{
    BranchNamer, BuildError, DefaultNamer, NameRegistry, NamingError, NodeTree, ScheduleNamer,
    Systematic, SystematicVariable,
};
use cutgraph::infrastructure::OutputWriter;

// ============================================================
// Structure of the jet analysis graph
// ============================================================

#[test]
fn given_jet_analysis_when_building_then_only_affected_filters_fork() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = jet_regions(&fixture);

    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();
    let graph = schedule.graph();

    // source, jets, hpt x2, lowpt x2
    assert_eq!(graph.count(ActionKind::FilterApply), 6);
    // pt2 nominal and JES_up
    assert_eq!(graph.count(ActionKind::VariableDefine), 2);
    // 3 regions x 2 systematics x 1 writer
    assert_eq!(graph.count(ActionKind::OutputWrite), 6);
    assert_eq!(graph.len(), 14);

    let jets_filters: Vec<_> = graph
        .actions()
        .iter()
        .filter(|a| a.kind() == ActionKind::FilterApply && a.node() == fixture.jets)
        .collect();
    assert_eq!(jets_filters.len(), 1);
    assert_eq!(jets_filters[0].systematic(), &Systematic::Nominal);
}

#[test]
fn given_variation_of_filter_input_when_building_then_predicate_reads_variant_column() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = jet_regions(&fixture);

    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();

    let varied: Vec<String> = schedule
        .graph()
        .actions()
        .iter()
        .filter(|a| a.node() == fixture.hpt && a.kind() == ActionKind::FilterApply)
        .filter(|a| a.systematic() == &Systematic::variation("JES_up"))
        .map(|a| a.label())
        .collect();
    assert_eq!(varied.len(), 1);
    assert!(varied[0].contains("jet_pt__JES_up"), "{}", varied[0]);

    let defines: Vec<String> = schedule
        .graph()
        .actions()
        .iter()
        .filter_map(|a| match a.operation() {
            Operation::Define { column, .. } => Some(column.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(defines, vec!["pt2".to_string(), "pt2__JES_up".to_string()]);
}

#[test]
fn given_two_regions_on_same_node_when_building_then_filters_are_shared() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = vec![
        Region::new("a", fixture.hpt),
        Region::new("b", fixture.hpt),
    ];

    let graph = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions)
        .unwrap()
        .graph()
        .clone();

    // source, jets, hpt; regions without writers add no outputs
    assert_eq!(graph.len(), 3);
    let hpt = graph
        .actions()
        .iter()
        .find(|a| a.node() == fixture.hpt)
        .unwrap();
    assert_eq!(
        hpt.consumers().iter().map(String::as_str).collect::<Vec<_>>(),
        vec!["a", "b"]
    );
}

#[test]
fn given_unaffected_systematic_when_building_then_no_extra_actions_except_outputs() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let recorder = common::Recorder::new(&[], None);
    let nominal = vec![Region::new("r", fixture.jets)
        .with_writer(Arc::clone(&recorder) as Arc<dyn OutputWriter<()>>)];
    let varied = vec![Region::new("r", fixture.jets)
        .with_systematic(Systematic::variation("JES_up"))
        .with_writer(Arc::clone(&recorder) as Arc<dyn OutputWriter<()>>)];

    let nominal = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&nominal)
        .unwrap();
    let varied = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&varied)
        .unwrap();

    assert_eq!(
        varied.graph().count(ActionKind::FilterApply),
        nominal.graph().count(ActionKind::FilterApply)
    );
    assert_eq!(varied.graph().count(ActionKind::OutputWrite), 2);
}

#[test]
fn given_nominal_and_varied_regions_sharing_node_when_building_then_nominal_filter_reads_no_variant() {
    let mut tree = NodeTree::new(());
    tree.define(
        tree.root(),
        SystematicVariable::existing("pt").vary_branch("S", "pt__S"),
    )
    .unwrap();
    let sel = tree
        .add_child(tree.root(), "sel", cut("sel", "pt2 > 100"), ())
        .unwrap();
    tree.define(sel, cut("pt2", "pt * pt")).unwrap();
    let regions = vec![
        Region::new("nom", sel),
        Region::new("var", sel).with_systematic(Systematic::variation("S")),
    ];

    let namer = ScheduleNamer::default();
    let schedule = Scheduler::new(&tree, &namer)
        .build(&regions)
        .unwrap();
    let graph = schedule.graph();

    let defines_in = |systematic: &Systematic| -> Vec<String> {
        let filter = graph
            .actions()
            .iter()
            .find(|a| {
                a.node() == sel
                    && a.kind() == ActionKind::FilterApply
                    && a.systematic() == systematic
            })
            .unwrap();
        graph
            .closure(filter.id())
            .into_iter()
            .filter_map(|id| match graph.get(id).unwrap().operation() {
                Operation::Define { column, .. } => Some(column.clone()),
                _ => None,
            })
            .collect()
    };
    let nominal = defines_in(&Systematic::Nominal);
    assert_eq!(nominal, vec!["pt2".to_string()]);
    assert!(nominal.iter().all(|c| !c.contains("__S")), "{nominal:?}");
    assert_eq!(defines_in(&Systematic::variation("S")), vec!["pt2__S".to_string()]);
    let nom_plan = &graph.region("nom").unwrap().systematics[&Systematic::Nominal];
    let var_plan = &graph.region("var").unwrap().systematics[&Systematic::variation("S")];
    assert_ne!(nom_plan.filters.last(), var_plan.filters.last());
}

// ============================================================
// Ordering
// ============================================================

#[test]
fn given_built_schedule_when_ordering_then_dependencies_come_first() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = jet_regions(&fixture);

    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();

    let position: BTreeMap<_, _> = schedule
        .order()
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();
    assert_eq!(position.len(), schedule.graph().len());
    for action in schedule.graph().actions() {
        for dependency in action.dependencies() {
            assert!(
                position[dependency] < position[&action.id()],
                "{} constructed before its dependency {}",
                action.label(),
                dependency
            );
        }
    }
}

#[test]
fn given_sibling_filters_with_cost_hints_when_ordering_then_cheaper_first() {
    let mut tree = NodeTree::new(());
    tree.define(tree.root(), SystematicVariable::existing("x"))
        .unwrap();
    let dear = tree
        .add_child(tree.root(), "dear", cut("dear", "x > 1").with_cost(10.0), ())
        .unwrap();
    let cheap = tree
        .add_child(tree.root(), "cheap", cut("cheap", "x > 2").with_cost(0.5), ())
        .unwrap();
    let namer = ScheduleNamer::default();

    let schedule = Scheduler::new(&tree, &namer)
        .build(&[Region::new("a", dear), Region::new("b", cheap)])
        .unwrap();

    let nodes: Vec<_> = schedule.ordered_actions().map(|a| a.node()).collect();
    assert_eq!(nodes, vec![tree.root(), cheap, dear]);
}

#[test]
fn given_same_inputs_when_building_twice_then_fingerprints_match() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let first = jet_regions(&fixture);
    let mut second = jet_regions(&fixture);
    second.regions.reverse();

    let a = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&first.regions)
        .unwrap();
    let b = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&second.regions)
        .unwrap();

    assert_eq!(a.order(), b.order());
    assert_eq!(a.fingerprint(), b.fingerprint());
    assert_eq!(a.fingerprint().len(), 64);
}

#[test]
fn given_graph_when_ordering_directly_then_matches_schedule_order() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = jet_regions(&fixture);

    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions.regions)
        .unwrap();

    assert_eq!(order(schedule.graph()).unwrap(), schedule.order());
}

// ============================================================
// Build errors
// ============================================================

#[test]
fn given_unknown_systematic_when_building_then_fails_by_default() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = vec![
        Region::new("sr", fixture.hpt).with_systematic(Systematic::variation("PU_up")),
    ];

    let err = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions)
        .err()
        .unwrap();

    assert!(matches!(
        err,
        ScheduleError::Build(BuildError::UnknownSystematic { ref systematic, .. }) if systematic == "PU_up"
    ));
    assert_eq!(err.kind(), "UnknownSystematicError");
}

#[test]
fn given_skip_region_policy_when_building_then_region_is_recorded_and_others_built() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let regions = vec![
        Region::new("bad", fixture.hpt).with_systematic(Systematic::variation("PU_up")),
        Region::new("good", fixture.hpt).with_systematic(Systematic::variation("JES_up")),
    ];
    let options = BuildOptions {
        on_unknown_systematic: UnknownSystematicPolicy::SkipRegion,
        ..BuildOptions::default()
    };

    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .with_options(options)
        .build(&regions)
        .unwrap();

    let graph = schedule.graph();
    assert_eq!(graph.skipped().len(), 1);
    assert_eq!(graph.skipped()[0].name, "bad");
    assert!(graph.region("good").is_some());
    assert!(graph.region("bad").is_none());
}

#[test]
fn given_declared_systematic_without_overrides_when_building_then_it_collapses_to_nominal() {
    let table = jet_table();
    let mut fixture = jet_tree(&table);
    fixture.tree.declare_systematic("PU_up");
    let regions = vec![
        Region::new("sr", fixture.hpt).with_systematic(Systematic::variation("PU_up")),
    ];

    let schedule = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&regions)
        .unwrap();

    let plan = schedule.graph().region("sr").unwrap();
    let nominal = &plan.systematics[&Systematic::Nominal];
    let varied = &plan.systematics[&Systematic::variation("PU_up")];
    assert_eq!(nominal.filters, varied.filters);
}

#[rstest]
#[case("")]
#[case("a/b")]
#[case("ROOT")]
fn given_invalid_region_name_when_building_then_region_error(#[case] name: &str) {
    let table = jet_table();
    let fixture = jet_tree(&table);

    let err = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&[Region::new(name, fixture.jets)])
        .err()
        .unwrap();

    assert_eq!(err.kind(), "RegionError");
}

#[test]
fn given_duplicate_region_names_when_building_then_region_error() {
    let table = jet_table();
    let fixture = jet_tree(&table);

    let err = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&[Region::new("sr", fixture.jets), Region::new("sr", fixture.hpt)])
        .err()
        .unwrap();

    assert_eq!(
        err,
        ScheduleError::Build(BuildError::DuplicateRegion("sr".to_string()))
    );
}

#[test]
fn given_filter_reading_undefined_column_when_building_then_resolution_error() {
    let mut tree = NodeTree::new(());
    let sel = tree
        .add_child(tree.root(), "sel", cut("sel", "missing > 0"), ())
        .unwrap();
    let namer = ScheduleNamer::default();

    let err = Scheduler::new(&tree, &namer)
        .build(&[Region::new("sr", sel)])
        .err()
        .unwrap();

    assert_eq!(err.kind(), "SystematicResolutionError");
}

#[test]
fn given_region_target_from_other_tree_when_building_then_foreign_node() {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let other = jet_tree(&table);

    let err = Scheduler::new(&fixture.tree, &fixture.namer)
        .build(&[Region::new("sr", other.hpt)])
        .err()
        .unwrap();

    assert!(matches!(err, ScheduleError::Build(BuildError::ForeignNode { .. })));
}

// ============================================================
// Naming
// ============================================================

fn varied_define_tree() -> (NodeTree<()>, Vec<Region<()>>) {
    let mut tree = NodeTree::new(());
    tree.define(
        tree.root(),
        SystematicVariable::existing("pt").vary_branch("JES_up", "pt_jes"),
    )
    .unwrap();
    let sel = tree
        .add_child(tree.root(), "sel", cut("sel", "x > 0"), ())
        .unwrap();
    tree.define(tree.root(), cut("x", "pt * 2")).unwrap();
    let regions = vec![Region::new("sr", sel).with_systematic(Systematic::variation("JES_up"))];
    (tree, regions)
}

#[test]
fn given_schedule_namer_when_defining_varied_column_then_physical_names_are_distinct() {
    let (tree, regions) = varied_define_tree();

    let namer = ScheduleNamer::default();
    let schedule = Scheduler::new(&tree, &namer)
        .build(&regions)
        .unwrap();

    let columns: Vec<String> = schedule
        .graph()
        .actions()
        .iter()
        .filter_map(|a| match a.operation() {
            Operation::Define { column, .. } => Some(column.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(columns, vec!["x".to_string(), "x__JES_up".to_string()]);
}

#[test]
fn given_default_namer_when_defining_varied_column_then_collision() {
    let (tree, regions) = varied_define_tree();

    let err = Scheduler::new(&tree, &DefaultNamer)
        .build(&regions)
        .err()
        .unwrap();

    assert!(matches!(
        err,
        ScheduleError::Build(BuildError::Naming(NamingError::Collision { .. }))
    ));
}

#[test]
fn given_systematic_containing_separator_when_building_then_naming_error() {
    let mut tree = NodeTree::new(());
    tree.define(
        tree.root(),
        SystematicVariable::existing("pt").vary_branch("JES__up", "pt_jes"),
    )
    .unwrap();
    let sel = tree
        .add_child(tree.root(), "sel", cut("sel", "pt > 0"), ())
        .unwrap();

    let err = Scheduler::new(&tree, &ScheduleNamer::default())
        .build(&[Region::new("sr", sel)])
        .err()
        .unwrap();

    assert_eq!(err.kind(), "NamingError");
}

#[rstest]
#[case("jets", "jet_pt")]
#[case("jets/hpt", "pt2")]
#[case("jets/lowpt", "jet_pt")]
fn given_nominal_only_regions_when_building_with_either_namer_then_schedules_match(
    #[case] path: &str,
    #[case] column: &str,
) {
    let table = jet_table();
    let fixture = jet_tree(&table);
    let target = fixture.tree.find(path).unwrap();
    let recorder = common::Recorder::new(&[column], Some("weight"));
    let regions = vec![Region::new("sr", target)
        .with_writer(Arc::clone(&recorder) as Arc<dyn OutputWriter<()>>)];

    let namer = ScheduleNamer::default();
    let scheduled = Scheduler::new(&fixture.tree, &namer)
        .build(&regions)
        .unwrap();
    let plain = Scheduler::new(&fixture.tree, &DefaultNamer)
        .build(&regions)
        .unwrap();

    let labels = |schedule: &cutgraph::application::Schedule<'_, ()>| {
        schedule.ordered_actions().map(|a| a.label()).collect::<Vec<_>>()
    };
    assert_eq!(labels(&scheduled), labels(&plain));
    assert_eq!(scheduled.fingerprint(), plain.fingerprint());
}

#[rstest]
#[case("__", false)]
#[case("__", true)]
#[case("_x_", false)]
#[case("_x_", true)]
fn given_many_logical_systematic_pairs_when_naming_then_physical_names_never_collide(
    #[case] separator: &str,
    #[case] systematic_first: bool,
) {
    let namer = ScheduleNamer::new(separator, systematic_first);
    let logicals = ["pt", "jet_pt", "pt_up", "up", "jet", "a1"];
    let systematics: Vec<Systematic> = std::iter::once(Systematic::Nominal)
        .chain(
            ["jes_up", "jer", "up_pt", "pt", "jet"]
                .into_iter()
                .map(Systematic::variation),
        )
        .collect();
    let mut registry = NameRegistry::new();

    for logical in logicals {
        namer.validate_logical(logical).unwrap();
        for systematic in &systematics {
            let physical = namer.physical_name(logical, systematic);
            registry
                .register(&physical, logical, systematic)
                .unwrap_or_else(|e| panic!("{logical} [{systematic}]: {e}"));
            assert_eq!(
                namer.parse_physical(&physical).unwrap(),
                (logical.to_string(), systematic.clone())
            );
        }
    }
}
