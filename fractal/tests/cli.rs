//! CLI tests: spawn the `fractal` binary and check exit codes and output.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use fractal::exit_codes;
use fractal::io::config::{FractalConfig, load_config, write_config};
use fractal::io::init::{FractalPaths, InitOptions, init_fractal};
use fractal::io::run_state::{RunState, write_run_state};
use fractal::io::store::{FileStore, StateStore};
use fractal::task::{Task, TaskStatus};
use fractal::test_support::{group, leaf};

fn fractal(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fractal"))
        .current_dir(root)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("run fractal")
}

/// Seed the file store with `tasks` and point run.json at `root_id`.
fn seed(root: &Path, root_id: &str, tasks: &[Task]) {
    let paths = init_fractal(root, &InitOptions { force: false }).expect("init");
    let config = load_config(&paths.config_path).expect("config");
    let store = FileStore::open(paths.resolve(&config.store.dir)).expect("store");
    for task in tasks {
        store.put_task(task).expect("put");
    }
    write_run_state(
        &paths.run_state_path,
        &RunState {
            root_id: root_id.to_string(),
            spec_path: None,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            completed_at: None,
        },
    )
    .expect("run state");
}

#[test]
fn init_then_reinit_requires_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    assert_eq!(fractal(temp.path(), &["init"]).status.code(), Some(exit_codes::OK));
    assert!(temp.path().join(".fractal/config.toml").is_file());

    let again = fractal(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::ERROR));
    assert!(String::from_utf8_lossy(&again.stderr).contains("--force"));
    assert_eq!(
        fractal(temp.path(), &["init", "--force"]).status.code(),
        Some(exit_codes::OK)
    );
}

#[test]
fn status_without_run_is_an_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_fractal(temp.path(), &InitOptions { force: false }).expect("init");
    let out = fractal(temp.path(), &["status"]);
    assert_eq!(out.status.code(), Some(exit_codes::ERROR));
    assert!(String::from_utf8_lossy(&out.stderr).contains("no run found"));
}

#[test]
fn status_exit_codes_follow_the_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut root = group("root", &["a", "b"]);
    root.status = TaskStatus::Completed;
    let mut a = leaf("a", TaskStatus::Completed);
    a.parent_id = Some("root".to_string());
    let mut b = leaf("b", TaskStatus::Completed);
    b.parent_id = Some("root".to_string());
    seed(temp.path(), "root", &[root.clone(), a.clone(), b.clone()]);

    let out = fractal(temp.path(), &["status"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("root root: completed"), "{stdout}");
    assert!(stdout.contains("completed: 2"), "{stdout}");

    let store = FileStore::open(temp.path().join(".fractal/state")).expect("store");
    b.status = TaskStatus::NeedsHuman;
    root.status = TaskStatus::Failed;
    store.put_task(&b).expect("put");
    store.put_task(&root).expect("put");
    let out = fractal(temp.path(), &["status"]);
    assert_eq!(out.status.code(), Some(exit_codes::NEEDS_HUMAN));
    assert!(String::from_utf8_lossy(&out.stdout).contains("needs human: b"));

    b.status = TaskStatus::Failed;
    b.fatal = true;
    store.put_task(&b).expect("put");
    let out = fractal(temp.path(), &["status"]);
    assert_eq!(out.status.code(), Some(exit_codes::INCOMPLETE));
    assert!(String::from_utf8_lossy(&out.stdout).contains("failed: b"));
}

#[test]
fn resolve_requeues_task_for_next_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed(temp.path(), "a", &[leaf("a", TaskStatus::NeedsHuman)]);

    let out = fractal(temp.path(), &["resolve", "a", "--note", "the API key is in .env"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let store = FileStore::open(temp.path().join(".fractal/state")).expect("store");
    let task = store.get_task("a").expect("get").expect("task");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.guidance.as_deref(), Some("the API key is in .env"));

    let out = fractal(temp.path(), &["resolve", "missing", "--note", "x"]);
    assert_eq!(out.status.code(), Some(exit_codes::ERROR));
}

/// Verifies `fractal run` drives a real worker process to completion and a
/// second `run` without `--spec` has nothing to resume.
#[cfg(unix)]
#[test]
fn run_with_shell_worker_completes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_fractal(temp.path(), &InitOptions { force: false }).expect("init");
    let mut config = FractalConfig::default();
    config.check_interval_ms = 10;
    config.worker.collect_git_artifacts = false;
    config.worker.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        concat!(
            "cat > /dev/null; ",
            r#"echo '{"type":"result","is_error":false,"result":"wrote hello.txt","usage":{"input_tokens":10,"output_tokens":5}}'"#
        )
        .to_string(),
    ];
    write_config(&paths.config_path, &config).expect("config");
    fs::write(temp.path().join("SPEC.md"), "# Say hello\n\nWrite hello.txt.\n").expect("spec");

    let out = fractal(temp.path(), &["run", "--spec", "SPEC.md"]);
    assert_eq!(
        out.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("completed: 1"), "{stdout}");

    let paths = FractalPaths::new(temp.path());
    let state: RunState =
        serde_json::from_str(&fs::read_to_string(&paths.run_state_path).expect("run.json"))
            .expect("parse run.json");
    assert!(state.completed_at.is_some());
    assert!(temp.path().join(".fractal/logs").is_dir());

    let status = fractal(temp.path(), &["status"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));

    let rerun = fractal(temp.path(), &["run"]);
    assert_eq!(rerun.status.code(), Some(exit_codes::ERROR));
}
