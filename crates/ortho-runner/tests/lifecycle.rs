use chrono::Utc;
use ortho_core::{load_json_file, OrthoError};
use ortho_runner::{dispatch, DispatchOutcome, Workspace};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

fn scratch(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "ortho_it_{}_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

fn run(ws: &Workspace, line: &[&str]) -> anyhow::Result<DispatchOutcome> {
    let tokens: Vec<String> = line.iter().map(|s| s.to_string()).collect();
    dispatch(ws, &tokens)
}

fn state(root: &Path, name: &str) -> Value {
    load_json_file(&root.join(name)).expect("state file")
}

#[test]
fn go_prepares_and_runs_a_single_experiment() {
    let root = scratch("go");
    fs::write(
        root.join("md_expts.yaml"),
        "equilibrate:\n  script: eq.py\n  settings:\n    temp: 300\n    nsteps: 10\n",
    )
    .expect("expts");
    fs::write(
        root.join("eq.py"),
        "make_step('eq')\nstate.total = settings.temp + settings.nsteps\n",
    )
    .expect("script");
    let ws = Workspace::new(&root);

    run(&ws, &["go"]).expect("go");
    let saved = state(&root, "state.json");
    assert_eq!(saved["status"], json!("completed"));
    assert_eq!(saved["total"], json!(310));
    assert_eq!(saved["step"], json!("s01-eq"));
    assert!(root.join("s01-eq").is_dir());
    assert_eq!(state(&root, "expt.json")["experiment"], json!("equilibrate"));
    assert!(root.join("state_1.json").is_file());
    assert!(root.join("config.json").is_file());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn failed_step_resumes_from_the_failing_line() {
    let root = scratch("resume");
    fs::write(
        root.join("md_expts.yaml"),
        "prod:\n  script: prod.py\n  settings: {}\n",
    )
    .expect("expts");
    fs::write(
        root.join("prod.py"),
        "make_step('prod')\nstate.first = True\nbash('test -f ../ready', cwd=state.here)\nstate.last = True\n",
    )
    .expect("script");
    let ws = Workspace::new(&root);

    run(&ws, &["prep", "prod"]).expect("prep");
    let err = run(&ws, &["run"]).expect_err("fails until ready");
    assert!(err.to_string().contains("step script failed"));
    let saved = state(&root, "state.json");
    assert_eq!(saved["status"], json!("error"));
    assert_eq!(saved["_error"]["last_lineno"], json!(2));

    fs::write(root.join("ready"), "").expect("ready");
    run(&ws, &["run"]).expect("resumed");
    let saved = state(&root, "state.json");
    assert_eq!(saved["status"], json!("completed"));
    assert_eq!(saved["first"], json!(true));
    assert_eq!(saved["last"], json!(true));
    assert!(saved.get("_error").is_none());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn metarun_skips_finished_steps_after_a_failure() {
    let root = scratch("metarun");
    fs::write(
        root.join("chain_expts.yaml"),
        concat!(
            "em:\n  script: em.py\n  settings:\n    steps: 10\n",
            "check:\n  script: check.py\n  settings: {}\n",
            "chain:\n  metarun: [em, check]\n",
        ),
    )
    .expect("expts");
    fs::write(root.join("em.py"), "make_step('em')\nbash('echo em >> ../em.count', cwd=state.here)\n")
        .expect("em");
    fs::write(
        root.join("check.py"),
        "make_step('check')\nbash('test -f ../ready', cwd=state.here)\n",
    )
    .expect("check");
    let ws = Workspace::new(&root);

    assert!(run(&ws, &["go", "chain"]).is_err());
    let saved = state(&root, "state.json");
    assert_eq!(saved["status"], json!("error"));
    assert_eq!(saved["metarun_position"], json!(2));
    assert_eq!(state(&root, "state_1.json")["step"], json!("s01-em"));

    fs::write(root.join("ready"), "").expect("ready");
    run(&ws, &["metarun"]).expect("finish");
    let saved = state(&root, "state.json");
    assert_eq!(saved["status"], json!("completed"));
    assert_eq!(saved["step"], json!("s02-check"));
    assert!(root.join("state_2.json").is_file());
    let count = fs::read_to_string(root.join("em.count")).expect("count");
    assert_eq!(count.lines().count(), 1);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn user_commands_are_listed_and_invoked_with_interpreted_arguments() {
    let root = scratch("commands");
    fs::write(
        root.join("tasks.py"),
        concat!(
            "def scale(factor, offset=0):\n    return {'value': factor * 10 + offset}\n\n",
            "def label(name):\n    return name + '!'\n\n",
            "def _hidden():\n    pass\n",
        ),
    )
    .expect("tasks");
    fs::write(root.join("broken.py"), "import not_a_module\n\ndef repair():\n    pass\n")
        .expect("broken");
    let ws = Workspace::new(&root);
    run(&ws, &["setlist", "commands", "tasks.py", "broken.py"]).expect("setlist");

    let DispatchOutcome::Listed(names) = run(&ws, &[]).expect("list") else {
        panic!("expected a listing");
    };
    assert_eq!(names, vec!["label", "repair", "scale"]);

    let outcome = run(&ws, &["scale", "factor=3", "offset=2"]).expect("scale");
    assert_eq!(outcome, DispatchOutcome::Completed(Some(json!({"value": 32}))));
    let outcome = run(&ws, &["label", "42"]).expect("label");
    assert_eq!(outcome, DispatchOutcome::Completed(Some(json!("42!"))));

    let err = run(&ws, &["repair"]).expect_err("gleaned");
    assert_eq!(err.downcast_ref::<OrthoError>().map(OrthoError::kind), Some("import"));
    let err = run(&ws, &["nothing_here"]).expect_err("unknown");
    assert_eq!(err.downcast_ref::<OrthoError>().map(OrthoError::kind), Some("resolution"));
    let _ = fs::remove_dir_all(root);
}
