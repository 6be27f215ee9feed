//! Runs a prepared step script under the shared namespace and records the
//! terminal state, resuming from a recorded failure when there is one.

use crate::experiments::parse_document;
use crate::handler::MANIFEST_FILE;
use crate::importer::{compose, Instructions};
use crate::reporter::{wrap, CallReporter};
use crate::shell::{self, ShellError, ShellOptions};
use crate::steps::{make_step, register_file};
use crate::Workspace;
use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use ortho_core::{atomic_write_json_pretty, console, load_json_file, OrthoError};
use ortho_script::builtins::bind;
use ortho_script::value::new_namespace;
use ortho_script::{
    compile_fresh, compile_resume, CallHook, Compiled, Function, Interpreter, LayeredMap, MapRef,
    ScriptError, Value, LAST_LINENO,
};
use serde_json::{json, Value as Json};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const INTERPRET_COMMAND: &str = "__interpret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error: Option<ScriptError>,
}

impl RunOutcome {
    fn completed() -> Self {
        Self {
            status: RunStatus::Completed,
            error: None,
        }
    }

    fn failed(error: ScriptError) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

/// The step script failed and its traceback has already been reported.
#[derive(Debug, Error)]
#[error("step script failed: {message}")]
pub struct ScriptFailed {
    pub message: String,
}

impl From<&RunOutcome> for ScriptFailed {
    fn from(outcome: &RunOutcome) -> Self {
        Self {
            message: outcome
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown failure".to_string()),
        }
    }
}

fn host_error(err: anyhow::Error) -> ScriptError {
    ScriptError::runtime(format!("{:#}", err))
}

fn contract(err: impl std::fmt::Display) -> anyhow::Error {
    OrthoError::Contract(err.to_string()).into()
}

fn opt_str(value: &Option<Value>, fname: &str, param: &str) -> Result<Option<String>, ScriptError> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ScriptError::type_error(format!(
            "{}() argument '{}' must be a string, not {}",
            fname,
            param,
            other.type_name()
        ))),
    }
}

/// `bash(command, cwd=None, log=None, scroll=None)`. The log defaults to the
/// current step log when a state is attached.
pub fn bash_native(root: &Path, state: Option<MapRef>, scroll_default: bool) -> Value {
    const PARAMS: &[&str] = &["command", "cwd", "log", "scroll"];
    let root = root.to_path_buf();
    Value::func(Function::native("bash", PARAMS, move |interp, args, kwargs| {
        let b = bind("bash", PARAMS, 1, args, kwargs)?;
        let command = opt_str(&b[0], "bash", "command")?
            .ok_or_else(|| ScriptError::type_error("bash() needs a command"))?;
        let cwd = opt_str(&b[1], "bash", "cwd")?.map(|c| root.join(c));
        let log = match opt_str(&b[2], "bash", "log")? {
            Some(log) => Some(root.join(log)),
            None => state
                .as_ref()
                .and_then(|s| s.borrow().lookup("step_log_file"))
                .and_then(|v| v.as_str().filter(|p| !p.is_empty()).map(|p| root.join(p))),
        };
        let scroll = match &b[3] {
            None | Some(Value::None) => scroll_default,
            Some(v) => v.truthy(),
        };
        let opts = ShellOptions {
            cwd: Some(cwd.unwrap_or_else(|| root.clone())),
            log,
            scroll,
            deadline: interp.deadline(),
            interrupt: Some(interp.interrupt_flag()),
        };
        match shell::bash(&command, &opts) {
            Ok(out) => Ok(Value::Str(out)),
            Err(ShellError::TimedOut { .. }) => Err(interp.timeout_error()),
            Err(ShellError::Interrupted { .. }) => Err(ScriptError::interrupted()),
            Err(err) => Err(ScriptError::runtime(err.to_string())),
        }
    }))
}

/// Shared variables handed to every composed module and to the script.
fn distribution(
    ws: &Workspace,
    config: &Json,
    state: &MapRef,
    settings: &MapRef,
    expt: &MapRef,
    hook: &Rc<dyn CallHook>,
) -> IndexMap<String, Value> {
    let scroll = config.get("scroll").and_then(Json::as_bool).unwrap_or(false);
    let mut out = IndexMap::new();
    out.insert("state".to_string(), Value::Map(state.clone()));
    out.insert("settings".to_string(), Value::Map(settings.clone()));
    out.insert("expt".to_string(), Value::Map(expt.clone()));
    out.insert(
        "bash".to_string(),
        bash_native(&ws.root, Some(state.clone()), scroll),
    );

    let (root, st) = (ws.root.clone(), state.clone());
    let step = Function::native("make_step", &["name"], move |_, args, kwargs| {
        let b = bind("make_step", &["name"], 1, args, kwargs)?;
        let name = opt_str(&b[0], "make_step", "name")?
            .ok_or_else(|| ScriptError::type_error("make_step() needs a name"))?;
        make_step(&root, &st, &name).map(Value::Str).map_err(host_error)
    });
    out.insert("make_step".to_string(), wrap(Rc::new(step), hook.clone()));

    let (root, st) = (ws.root.clone(), state.clone());
    let register = Function::native("register_file", &["name"], move |_, args, kwargs| {
        let b = bind("register_file", &["name"], 1, args, kwargs)?;
        let name = opt_str(&b[0], "register_file", "name")?
            .ok_or_else(|| ScriptError::type_error("register_file() needs a name"))?;
        register_file(&root, &st, &name)
            .map(|_| Value::None)
            .map_err(host_error)
    });
    out.insert("register_file".to_string(), wrap(Rc::new(register), hook.clone()));
    out
}

fn json_object(value: &Json, what: &str) -> Result<IndexMap<String, Value>> {
    match value {
        Json::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect()),
        Json::Null => Ok(IndexMap::new()),
        other => Err(contract(format!("{} must be a mapping, got {}", what, other))),
    }
}

fn settings_map(ws: &Workspace, expt: &Json) -> Result<MapRef> {
    let mut fallbacks = Vec::new();
    if let Some(params) = expt.get("params").and_then(Json::as_str) {
        let path = ws.path(params);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("cannot read params file {}", path.display()))?;
        let doc = parse_document(&path, &text)?.unwrap_or(Json::Null);
        let base = json_object(&doc, &format!("params file {}", params))?;
        let params = LayeredMap::new("params", base, Vec::new(), false, true).map_err(contract)?;
        fallbacks.push(params.into_ref());
    }
    let base = json_object(expt.get("settings").unwrap_or(&Json::Null), "settings")?;
    Ok(LayeredMap::new("settings", base, fallbacks, false, true)
        .map_err(contract)?
        .into_ref())
}

enum Previous {
    Fresh { before: Option<Json> },
    Resume { base: Json, error: Json },
}

fn status_of(state: &Json) -> Option<&str> {
    state.get("status").and_then(Json::as_str)
}

fn previous_state(ws: &Workspace) -> Result<Previous> {
    let path = ws.state_path();
    if !path.exists() {
        return Ok(Previous::Fresh { before: None });
    }
    let mut saved = load_json_file(&path)?;
    let object = saved
        .as_object_mut()
        .ok_or_else(|| contract(format!("{} must hold a mapping", path.display())))?;
    if object.get("status").and_then(Json::as_str) == Some("error") {
        let error = object.shift_remove("_error").unwrap_or(Json::Null);
        return Ok(Previous::Resume { base: saved, error });
    }
    object.shift_remove("before");
    let completed = status_of(&saved) == Some("completed");
    Ok(Previous::Fresh {
        before: completed.then_some(saved),
    })
}

fn relative_name(ws: &Workspace, path: &Path) -> String {
    path.strip_prefix(&ws.root)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn write_state(ws: &Workspace, state: &MapRef) -> Result<Json> {
    let dump = state.borrow().dump();
    atomic_write_json_pretty(&ws.state_path(), &dump)?;
    Ok(dump)
}

fn archive_state(ws: &Workspace, state: &MapRef, dump: &Json, position: Option<usize>) -> Result<PathBuf> {
    let number = state
        .borrow()
        .lookup("stepno")
        .and_then(|v| v.as_int())
        .or(position.map(|p| p as i64))
        .unwrap_or(1);
    let path = ws.path(format!("state_{}.json", number));
    if path.exists() {
        debug!(path = %path.display(), "state snapshot already present");
    } else {
        atomic_write_json_pretty(&path, dump)?;
    }
    Ok(path)
}

fn is_stateless(config: &Json, expt: &Json, position: Option<usize>) -> bool {
    let empty = |key: &str| {
        expt.get(key)
            .and_then(Json::as_array)
            .map(|items| items.is_empty())
            .unwrap_or(true)
    };
    position.is_none()
        && expt.get("quick").is_some()
        && empty("extensions")
        && empty("imports")
        && Instructions::from_config(config).modules.is_empty()
}

fn run_stateless(ws: &Workspace, script: &Path) -> Result<RunOutcome> {
    let exe = std::env::current_exe().context("cannot locate the running executable")?;
    info!(script = %script.display(), "running stateless script in a child process");
    let status = Command::new(exe)
        .arg(INTERPRET_COMMAND)
        .arg(script)
        .current_dir(&ws.root)
        .env(crate::CONFIG_ENV, &ws.config_path)
        .status()
        .context("cannot start the stateless interpreter")?;
    if status.success() {
        Ok(RunOutcome::completed())
    } else {
        Ok(RunOutcome::failed(ScriptError::runtime(format!(
            "stateless script {} exited with code {}",
            script.display(),
            status.code().unwrap_or(-1)
        ))))
    }
}

/// Evaluate a script with builtins and the shell wrapper only.
pub fn interpret_file(root: &Path, path: &Path) -> Result<(), ScriptError> {
    let source = fs::read_to_string(path)
        .map_err(|e| ScriptError::runtime(format!("cannot read {}: {}", path.display(), e)))?;
    let file = path.display().to_string();
    let mut interp = Interpreter::new();
    interp.add_search_path(root);
    interp.set_builtin("bash", bash_native(root, None, false));
    interp.register_source(&file, &source);
    let module = ortho_script::parse_module(&source).map_err(|e| interp.syntax_error(&file, e))?;
    let globals = new_namespace();
    globals
        .borrow_mut()
        .insert("__name__".to_string(), Value::str("__main__"));
    interp.run_body(&file, &module.body, &globals)
}

fn error_record(err: &ScriptError, source: &str, last_lineno: Option<i64>) -> Json {
    json!({
        "traceback": serde_json::to_value(&err.traceback).unwrap_or(Json::Null),
        "message": err.message,
        "kind": err.kind.to_string(),
        "script_code": source,
        "last_lineno": last_lineno,
    })
}

/// Run a prepared script. `position` is the 1-based metarun step, if any.
pub fn run_prepared(
    ws: &Workspace,
    config: &Json,
    script: &Path,
    expt_path: &Path,
    position: Option<usize>,
) -> Result<RunOutcome> {
    let expt_json = load_json_file(expt_path)?;
    if !expt_json.is_object() {
        return Err(contract(format!("{} must hold a mapping", expt_path.display())));
    }
    if is_stateless(config, &expt_json, position) {
        return run_stateless(ws, script);
    }
    let source = fs::read_to_string(script)
        .with_context(|| format!("cannot read script {}", script.display()))?;
    let file = relative_name(ws, script);

    let settings = settings_map(ws, &expt_json)?;
    let expt = LayeredMap::from_json("expt", &expt_json, true, false)
        .map_err(contract)?
        .into_ref();
    let (state, resume_from) = match previous_state(ws)? {
        Previous::Resume { base, error } => {
            let state = LayeredMap::from_json("state", &base, false, false).map_err(contract)?;
            (state, Some(error))
        }
        Previous::Fresh { before } => {
            let mut state = LayeredMap::empty("state");
            if let Some(before) = before {
                state.set("before", Value::from_json(&before)).map_err(contract)?;
            }
            (state, None)
        }
    };
    let state = state.into_ref();
    state.borrow_mut().set_fallbacks(vec![settings.clone()]);
    {
        let mut s = state.borrow_mut();
        s.set("status", Value::str("running")).map_err(contract)?;
        if let Some(position) = position {
            s.set("metarun_position", Value::Int(position as i64))
                .map_err(contract)?;
        }
    }

    let hook: Rc<dyn CallHook> = Rc::new(CallReporter::new(&ws.root, state.clone()));
    let shared = distribution(ws, config, &state, &settings, &expt, &hook);
    let mut interp = Interpreter::new();
    if let Some(dir) = script.parent() {
        interp.add_search_path(dir);
    }
    let composition = compose(
        &mut interp,
        ws,
        config,
        &expt_json,
        &Instructions::from_config(config),
        &shared,
        hook,
    )?;
    interp.register_source(&file, &source);

    let compiled: Result<Compiled, ScriptError> = match &resume_from {
        Some(error) => {
            let old = error.get("script_code").and_then(Json::as_str).unwrap_or("");
            let last = error.get("last_lineno").and_then(Json::as_i64);
            let compiled = compile_resume(old, &source, last)
                .with_context(|| format!("cannot resume {}", file))?;
            console::note(&format!(
                "resuming {} at top-level statement {}",
                file,
                compiled.resume_index + 1
            ));
            Ok(compiled)
        }
        None => compile_fresh(&source).map_err(|e| interp.syntax_error(&file, e)),
    };

    let globals = new_namespace();
    {
        let mut g = globals.borrow_mut();
        g.insert("__name__".to_string(), Value::str("__main__"));
        g.insert("__file__".to_string(), Value::str(&file));
        for (name, value) in composition.exports.iter().chain(shared.iter()) {
            g.insert(name.clone(), value.clone());
        }
    }
    info!(script = %file, ?position, resumed = resume_from.is_some(), "running step script");
    let result = compiled.and_then(|c| interp.run_body(&file, &c.body, &globals));
    let last_lineno = globals
        .borrow()
        .get(LAST_LINENO)
        .and_then(|v| v.as_int());

    match result {
        Ok(()) => {
            {
                let mut s = state.borrow_mut();
                s.set("status", Value::str("completed")).map_err(contract)?;
                s.set("script_code", Value::str(&source)).map_err(contract)?;
            }
            let dump = write_state(ws, &state)?;
            let archived = archive_state(ws, &state, &dump, position)?;
            console::status(&format!(
                "{} completed; state archived to {}",
                file,
                relative_name(ws, &archived)
            ));
            Ok(RunOutcome::completed())
        }
        Err(err) => {
            {
                let mut s = state.borrow_mut();
                s.set("status", Value::str("error")).map_err(contract)?;
                s.set(
                    "_error",
                    Value::from_json(&error_record(&err, &source, last_lineno)),
                )
                .map_err(contract)?;
            }
            write_state(ws, &state)?;
            warn!(script = %file, ?last_lineno, "step script failed");
            console::error_report(&err.traceback_lines(), &err.to_string());
            Ok(RunOutcome::failed(err))
        }
    }
}

/// Whether metarun position `index` already ran to completion according to
/// the saved state.
fn already_done(ws: &Workspace, index: usize) -> Result<bool> {
    let path = ws.state_path();
    if !path.exists() {
        return Ok(false);
    }
    let saved = load_json_file(&path)?;
    let position = saved
        .get("metarun_position")
        .and_then(Json::as_u64)
        .map(|p| p as usize);
    Ok(match (status_of(&saved), position) {
        (Some("completed"), Some(p)) => p >= index,
        (Some("error"), Some(p)) => p > index,
        _ => false,
    })
}

/// Run every step of the prepared metarun, skipping positions the saved
/// state shows as done, and stop at the first failure.
pub fn run_metarun(ws: &Workspace, config: &Json) -> Result<RunOutcome> {
    let manifest = load_json_file(&ws.path(MANIFEST_FILE))?;
    let steps = manifest
        .get("steps")
        .and_then(Json::as_array)
        .ok_or_else(|| anyhow!("{} has no steps list", MANIFEST_FILE))?;
    for step in steps {
        let index = step
            .get("index")
            .and_then(Json::as_u64)
            .ok_or_else(|| anyhow!("metarun step without an index: {}", step))? as usize;
        let label = step.get("name").and_then(Json::as_str).unwrap_or("?");
        let field = |key: &str| -> Result<PathBuf> {
            step.get(key)
                .and_then(Json::as_str)
                .map(|p| ws.path(p))
                .ok_or_else(|| anyhow!("metarun step {} has no {}", index, key))
        };
        if already_done(ws, index)? {
            console::note(&format!("step {} ({}) already completed", index, label));
            continue;
        }
        console::status(&format!("metarun step {} ({})", index, label));
        let outcome = run_prepared(ws, config, &field("script")?, &field("expt")?, Some(index))?;
        if outcome.is_failed() {
            return Ok(outcome);
        }
    }
    Ok(RunOutcome::completed())
}

/// Run whatever `prep` left behind.
pub fn run_current(ws: &Workspace, config: &Json) -> Result<RunOutcome> {
    if ws.path(MANIFEST_FILE).is_file() {
        return run_metarun(ws, config);
    }
    let (script, expt) = (ws.path("script.py"), ws.path("expt.json"));
    if !script.is_file() || !expt.is_file() {
        return Err(OrthoError::Resolution(
            "nothing is prepared; run `prep <experiment>` first".into(),
        )
        .into());
    }
    run_prepared(ws, config, &script, &expt, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch;

    fn setup(label: &str, script: &str, expt: Json) -> (PathBuf, Workspace) {
        let root = scratch(label);
        fs::write(root.join("script.py"), script).expect("script");
        atomic_write_json_pretty(&root.join("expt.json"), &expt).expect("expt");
        let ws = Workspace::new(&root);
        (root, ws)
    }

    fn run(ws: &Workspace) -> RunOutcome {
        run_prepared(
            ws,
            &json!({}),
            &ws.path("script.py"),
            &ws.path("expt.json"),
            None,
        )
        .expect("run")
    }

    fn saved(root: &Path, name: &str) -> Json {
        load_json_file(&root.join(name)).expect("state file")
    }

    #[test]
    fn settings_fall_back_to_params_and_state_falls_back_to_settings() {
        let (root, ws) = setup(
            "exec_maps",
            "make_step('check')\nstate.sum = state.temp + settings.nsteps + settings['box size']\n",
            json!({
                "script": "x.py",
                "settings": {"temp": 300, "box size": 2},
                "params": "md.yaml",
                "experiment": "maps",
            }),
        );
        fs::write(root.join("md.yaml"), "nsteps: 50\n").expect("params");
        let outcome = run(&ws);
        assert!(!outcome.is_failed(), "{:?}", outcome.error);
        let state = saved(&root, "state.json");
        assert_eq!(state["sum"], json!(352));
        assert_eq!(state["status"], json!("completed"));
        assert_eq!(state["step"], json!("s01-check"));
        assert!(state["script_code"].as_str().expect("code").contains("make_step"));
        assert_eq!(saved(&root, "state_1.json")["status"], json!("completed"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failure_records_error_and_identical_rerun_resumes_after_last_line() {
        let script = "make_step('a')\nbash('test -f ../go.flag', cwd=state.here)\nstate.done = True\n";
        let (root, ws) = setup("exec_resume_same", script, json!({"script": "x.py", "settings": {}}));
        let outcome = run(&ws);
        assert!(outcome.is_failed());
        let state = saved(&root, "state.json");
        assert_eq!(state["status"], json!("error"));
        assert_eq!(state["_error"]["last_lineno"], json!(1));
        assert_eq!(state["_error"]["script_code"], json!(script));
        assert_eq!(state["_error"]["traceback"][0]["line"], json!(2));
        assert!(!root.join("state_1.json").exists());
        let log = fs::read_to_string(root.join("s01-a/s01-a.log")).expect("log");
        assert!(log.contains("$ test -f ../go.flag"));

        fs::write(root.join("go.flag"), "").expect("flag");
        let outcome = run(&ws);
        assert!(!outcome.is_failed(), "{:?}", outcome.error);
        let state = saved(&root, "state.json");
        assert_eq!(state["done"], json!(true));
        assert!(state.get("_error").is_none());
        assert_eq!(saved(&root, "state_1.json")["step"], json!("s01-a"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn edited_script_resumes_at_first_difference() {
        let (root, ws) = setup(
            "exec_resume_edit",
            "make_step('a')\nstate.t = settings.temp\nmissing_function()\nstate.after = 1\n",
            json!({"script": "x.py", "settings": {"temp": 300}}),
        );
        assert!(run(&ws).is_failed());
        assert_eq!(saved(&root, "state.json")["_error"]["kind"], json!("NameError"));
        fs::write(
            root.join("script.py"),
            "make_step('a')\nstate.t = settings.temp\nstate.fixed = True\nstate.after = 1\n",
        )
        .expect("edit");
        let outcome = run(&ws);
        assert!(!outcome.is_failed(), "{:?}", outcome.error);
        let state = saved(&root, "state.json");
        assert_eq!(state["fixed"], json!(true));
        assert_eq!(state["t"], json!(300));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn completed_run_becomes_before_of_the_next() {
        let (root, ws) = setup(
            "exec_before",
            "make_step('a')\n",
            json!({"script": "x.py", "settings": {}}),
        );
        assert!(!run(&ws).is_failed());
        fs::write(root.join("script.py"), "make_step('b')\n").expect("second");
        assert!(!run(&ws).is_failed());
        let state = saved(&root, "state.json");
        assert_eq!(state["step"], json!("s02-b"));
        assert_eq!(state["before"]["step"], json!("s01-a"));
        assert!(state["before"].get("before").is_none());
        assert!(root.join("state_2.json").is_file());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn syntax_error_is_recorded_without_a_last_line() {
        let (root, ws) = setup(
            "exec_syntax",
            "x = (1,\n",
            json!({"script": "x.py", "settings": {}}),
        );
        let outcome = run(&ws);
        assert!(outcome.is_failed());
        let state = saved(&root, "state.json");
        assert_eq!(state["_error"]["kind"], json!("SyntaxError"));
        assert_eq!(state["_error"]["last_lineno"], Json::Null);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn resume_past_the_final_statement_is_refused() {
        let (root, ws) = setup(
            "exec_after_last",
            "x = 1\ny = 2\n",
            json!({"script": "x.py", "settings": {}}),
        );
        atomic_write_json_pretty(
            &ws.state_path(),
            &json!({"status": "error", "_error": {"script_code": "x = 1\ny = 2\n", "last_lineno": 2}}),
        )
        .expect("state");
        let err = run_prepared(&ws, &json!({}), &ws.path("script.py"), &ws.path("expt.json"), None)
            .expect_err("after last");
        assert!(format!("{:#}", err).contains("first difference is after the last line"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn interpret_file_has_no_step_natives() {
        let root = scratch("exec_interpret");
        let path = root.join("q.py");
        fs::write(&path, "total = sum([1, 2, 3])\nassert total == 6\n").expect("q");
        interpret_file(&root, &path).expect("interpret");
        fs::write(&path, "make_step('nope')\n").expect("q");
        let err = interpret_file(&root, &path).expect_err("no natives");
        assert_eq!(err.kind, ortho_script::ErrorKind::Name);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn interrupt_during_bash_raises_keyboard_interrupt() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let root = scratch("exec_interrupt");
        let mut interp = Interpreter::new();
        let flag = Arc::new(AtomicBool::new(false));
        interp.set_interrupt_flag(flag.clone());
        interp.set_builtin("bash", bash_native(&root, None, false));
        interp.set_builtin(
            "press_ctrl_c",
            Value::func(Function::native("press_ctrl_c", &[], move |_, _, _| {
                flag.store(true, Ordering::SeqCst);
                Ok(Value::None)
            })),
        );
        let started = std::time::Instant::now();
        let err = interp
            .load_source("__main__", "x.py", "x = [press_ctrl_c(), bash('sleep 5')]
")
            .expect_err("interrupted");
        assert_eq!(err.kind, ortho_script::ErrorKind::KeyboardInterrupt);
        assert!(started.elapsed() < std::time::Duration::from_secs(3));
        let _ = fs::remove_dir_all(root);
    }
}
