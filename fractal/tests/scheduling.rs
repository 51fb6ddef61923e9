//! Scheduling scenarios: dependency order, bounded concurrency, recursive
//! planning, and depth enforcement.
//!
//! Each test drives an [`Orchestrator`] over an in-memory store with scripted
//! planner and worker fakes, so the full state machine runs without processes.

use std::time::Duration;

use fractal::agents::{AcceptSuccess, AlwaysHuman, NeverSplit, Planner, Strategies};
use fractal::core::error::StructuralError;
use fractal::core::types::PlannedChild;
use fractal::io::store::{InMemoryStore, StateStore};
use fractal::orchestrator::{Orchestrator, RunStop, Settings};
use fractal::task::TaskStatus;
use fractal::test_support::{ScriptedAttempt, ScriptedPlanner, ScriptedWorkerBackend, child};

fn orchestrator(
    store: &InMemoryStore,
    planner: impl Planner + 'static,
    backend: &ScriptedWorkerBackend,
    settings: Settings,
) -> Orchestrator {
    Orchestrator::new(
        Box::new(store.clone()),
        Strategies {
            planner: Box::new(planner),
            validator: Box::new(AcceptSuccess),
            escalator: Box::new(AlwaysHuman),
        },
        Box::new(backend.clone()),
        settings,
    )
    .with_interrupt_check(|| false)
}

fn workers(max_workers: usize) -> Settings {
    Settings {
        max_workers,
        ..Settings::default()
    }
}

/// Verifies a chain A -> B -> C with one worker slot runs strictly in order and
/// each task only starts after its dependency completed.
#[test]
fn chain_runs_in_dependency_order_with_one_worker() {
    let store = InMemoryStore::new();
    let planner = ScriptedPlanner::new().split(
        "root",
        vec![child("A", &[]), child("B", &["A"]), child("C", &["B"])],
    );
    let backend = ScriptedWorkerBackend::new()
        .default_attempt(ScriptedAttempt::succeed("done").after_polls(1));
    let mut orch = orchestrator(&store, planner, &backend, workers(1));

    let root_id = orch.submit_root("root", "three steps").expect("submit");
    let ids: Vec<String> = ["A", "B", "C"]
        .iter()
        .map(|title| store.find(title).expect("child").id)
        .collect();

    let mut started = Vec::new();
    for _ in 0..50 {
        let tick = orch.tick().expect("tick");
        assert!(orch.running() <= 1);
        for id in backend.spawned().into_iter().skip(started.len()) {
            let task = store.get_task(&id).expect("get").expect("task");
            for dep in &task.depends_on {
                let dep = store.get_task(dep).expect("get").expect("dep");
                assert_eq!(dep.status, TaskStatus::Completed, "{} started early", task.title);
            }
            started.push(id);
        }
        if tick.idle {
            break;
        }
    }

    assert_eq!(started, ids);
    assert_eq!(backend.peak_running(), 1);
    let root = store.get_task(&root_id).expect("get").expect("root");
    assert_eq!(root.status, TaskStatus::Completed);
}

/// Verifies the pool never runs more than `max_workers` attempts at once even
/// with more ready leaves than slots.
#[test]
fn concurrency_is_bounded_by_max_workers() {
    let store = InMemoryStore::new();
    let children = (1..=6).map(|i| child(&format!("t{i}"), &[])).collect();
    let planner = ScriptedPlanner::new().split("root", children);
    let backend = ScriptedWorkerBackend::new()
        .default_attempt(ScriptedAttempt::succeed("done").after_polls(2));
    let mut orch = orchestrator(&store, planner, &backend, workers(2));
    orch.submit_root("root", "").expect("submit");

    let first = orch.tick().expect("tick");
    assert_eq!(first.dispatched, 2);
    assert_eq!(first.running, 2);

    assert_eq!(orch.run(Duration::ZERO).expect("run"), RunStop::Complete);
    assert_eq!(backend.peak_running(), 2);
    assert_eq!(backend.spawned().len(), 6);
}

/// Verifies unnamed children can be referenced by title, by 0-based index, or
/// as `subtask-<index>`, and the dependency edge lands on the right sibling.
#[test]
fn unnamed_children_resolve_by_alias() {
    for reference in ["schema", "0", "subtask-0"] {
        let store = InMemoryStore::new();
        let unnamed = |title: &str, deps: &[&str]| PlannedChild {
            id: None,
            ..child(title, deps)
        };
        let planner = ScriptedPlanner::new().split(
            "root",
            vec![
                unnamed("schema", &[]),
                unnamed("build", &[reference]),
                unnamed("docs", &[]),
            ],
        );
        let backend = ScriptedWorkerBackend::new();
        let mut orch = orchestrator(&store, planner, &backend, workers(1));

        orch.submit_root("root", "").expect("submit");
        let schema = store.find("schema").expect("schema");
        let build = store.find("build").expect("build");
        assert_eq!(build.depends_on, [schema.id.clone()], "reference {reference:?}");
        assert_eq!(orch.run(Duration::ZERO).expect("run"), RunStop::Complete);
        assert_eq!(backend.spawned().len(), 3);
    }
}

/// Verifies nested splits resolve local ids per split, children inherit the
/// parent's dependencies, and the whole tree completes bottom-up.
#[test]
fn recursive_split_completes_bottom_up() {
    let store = InMemoryStore::new();
    let planner = ScriptedPlanner::new()
        .split("root", vec![child("api", &[]), child("ui", &["api"])])
        .split("ui", vec![child("layout", &[]), child("forms", &["layout"])]);
    let backend = ScriptedWorkerBackend::new();
    let mut orch = orchestrator(&store, planner, &backend, workers(3));

    let root_id = orch.submit_root("root", "").expect("submit");
    assert_eq!(orch.run(Duration::ZERO).expect("run"), RunStop::Complete);

    let api = store.find("api").expect("api");
    let ui = store.find("ui").expect("ui");
    let layout = store.find("layout").expect("layout");
    let forms = store.find("forms").expect("forms");
    assert_eq!(layout.depends_on, [api.id.clone()]);
    assert_eq!(forms.depends_on, [api.id.clone(), layout.id.clone()]);
    assert_eq!(ui.children, [layout.id.clone(), forms.id.clone()]);

    let order = backend.spawned();
    let position = |id: &str| order.iter().position(|s| s == id).expect("spawned");
    assert!(position(&api.id) < position(&layout.id));
    assert!(position(&layout.id) < position(&forms.id));
    assert!(!order.contains(&ui.id), "grouping tasks never run");

    let root = store.get_task(&root_id).expect("get").expect("root");
    assert_eq!(root.status, TaskStatus::Completed);
    assert_eq!(
        store.status_history(&ui.id),
        [TaskStatus::Pending, TaskStatus::InProgress, TaskStatus::Completed]
    );
    assert_eq!(root.metrics.tokens.input_tokens, 3_000);
}

/// Verifies a split below `max_depth` fails the too-deep children as fatal
/// without asking the planner about them, and the defect is reported.
#[test]
fn children_beyond_max_depth_are_fatal() {
    let store = InMemoryStore::new();
    let planner = ScriptedPlanner::new()
        .split("root", vec![child("mid", &[])])
        .split("mid", vec![child("deep", &[])]);
    let backend = ScriptedWorkerBackend::new();
    let settings = Settings {
        max_depth: 1,
        ..workers(1)
    };
    let mut orch = orchestrator(&store, planner.clone(), &backend, settings);

    let root_id = orch.submit_root("root", "").expect("submit");
    let deep = store.find("deep").expect("deep");
    assert_eq!(deep.status, TaskStatus::Failed);
    assert!(deep.fatal);
    assert!(deep.last_error.contains("exceeds max depth 1"), "{}", deep.last_error);
    assert_eq!(
        planner.calls(),
        [("root".to_string(), 0), ("mid".to_string(), 1)]
    );

    assert_eq!(orch.run(Duration::ZERO).expect("run"), RunStop::Incomplete);
    assert!(backend.spawned().is_empty());
    let root = store.get_task(&root_id).expect("get").expect("root");
    assert_eq!(root.status, TaskStatus::Failed);
}

/// Verifies an entry call past `max_depth` returns a typed depth error and
/// marks only that task failed.
#[test]
fn entry_call_past_max_depth_returns_depth_error() {
    let store = InMemoryStore::new();
    let backend = ScriptedWorkerBackend::new();
    let settings = Settings {
        max_depth: 2,
        ..workers(1)
    };
    let mut orch = orchestrator(&store, NeverSplit, &backend, settings);
    let root_id = orch.submit_root("root", "").expect("submit");

    let err = orch.process(&root_id, 3).expect_err("too deep");
    assert!(matches!(
        err.downcast_ref::<StructuralError>(),
        Some(StructuralError::DepthExceeded { depth: 3, max_depth: 2, .. })
    ));
    let root = store.get_task(&root_id).expect("get").expect("root");
    assert_eq!(root.status, TaskStatus::Failed);
    assert!(root.fatal);
    assert!(!root.is_retryable());
}
