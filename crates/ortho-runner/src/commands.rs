//! Built-in targets of the dispatcher.

use crate::config::{self, read_config_with_hooks};
use crate::dispatch::parse_tokens;
use crate::executor::{interpret_file, run_current, run_metarun, RunOutcome, ScriptFailed};
use crate::experiments::collect_experiments;
use crate::handler::{prep, Method, Prepared};
use crate::shell::{self, ShellOptions};
use crate::Workspace;
use anyhow::{anyhow, Context, Result};
use globset::{Glob, GlobSetBuilder};
use indexmap::IndexMap;
use ortho_core::{console, load_json_file, OrthoError};
use ortho_script::{interpret_value, Kwargs, Value};
use regex::Regex;
use serde_json::{json, Value as Json};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;
use walkdir::WalkDir;

pub const BUILTINS: &[&str] = &[
    "set",
    "setlist",
    "set_dict",
    "unset",
    "prep",
    "run",
    "go",
    "metarun",
    "clean",
    "back",
    "modules",
    "check",
    "config",
    "look",
    crate::executor::INTERPRET_COMMAND,
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

fn usage(message: impl Into<String>) -> anyhow::Error {
    OrthoError::Config(message.into()).into()
}

fn positional_strings(args: &[Value]) -> Vec<String> {
    args.iter().map(Value::to_str).collect()
}

fn kwarg_str(kwargs: &Kwargs, key: &str) -> Option<String> {
    kwargs.get(key).map(Value::to_str)
}

pub fn run_builtin(ws: &Workspace, config: &Json, name: &str, tokens: &[String]) -> Result<Option<Json>> {
    info!(command = name, "running built-in");
    match name {
        "set" => {
            let (args, kwargs) = parse_tokens(tokens, &[])?;
            if !args.is_empty() || kwargs.is_empty() {
                return Err(usage("usage: set key=value [key=value ...]"));
            }
            for (key, value) in kwargs {
                config::set(ws, &key, value.to_json())?;
                console::status(&format!("config: {} = {}", key, value.repr()));
            }
            Ok(None)
        }
        "setlist" => {
            let (key, values) = tokens
                .split_first()
                .ok_or_else(|| usage("usage: setlist key value [value ...]"))?;
            let values = values.iter().map(|v| interpret_value(v).to_json()).collect();
            let written = config::setlist(ws, key, values)?;
            console::status(&format!("config: {} = {}", key, written[key.as_str()]));
            Ok(None)
        }
        "set_dict" => {
            let (_, mut kwargs) = parse_tokens(tokens, &[])?;
            if let Some(path) = kwargs.shift_remove("path") {
                let value = kwargs
                    .shift_remove("value")
                    .ok_or_else(|| usage("set_dict path=(...) needs value=..."))?;
                let path: Vec<String> = match path {
                    Value::Str(single) => vec![single],
                    other => other
                        .iterate()
                        .map_err(|_| usage("set_dict path must be a tuple of keys"))?
                        .iter()
                        .map(Value::to_str)
                        .collect(),
                };
                config::set_dict_path(ws, &path, value.to_json())?;
                console::status(&format!("config: {} updated", path.join(".")));
                return Ok(None);
            }
            let (name, rest) = tokens
                .split_first()
                .ok_or_else(|| usage("usage: set_dict name key=value [key=value ...]"))?;
            // Keys may hold path separators, so pairs are split by hand.
            let mut pairs: IndexMap<String, Json> = IndexMap::new();
            for token in rest {
                let (key, value) = token
                    .split_once('=')
                    .ok_or_else(|| usage(format!("set_dict expects key=value, got {}", token)))?;
                pairs.insert(key.to_string(), interpret_value(value).to_json());
            }
            config::set_dict(ws, name, pairs)?;
            console::status(&format!("config: {} updated", name));
            Ok(None)
        }
        "unset" => {
            if tokens.is_empty() {
                return Err(usage("usage: unset key [key ...]"));
            }
            config::unset(ws, tokens)?;
            Ok(None)
        }
        "prep" => {
            let prepared = prep_named(ws, config, tokens.first().map(String::as_str))?;
            Ok(Some(prepared_json(&prepared)))
        }
        "run" => finish(run_current(ws, config)?),
        "go" => {
            prep_named(ws, config, tokens.first().map(String::as_str))?;
            finish(run_current(ws, config)?)
        }
        "metarun" => {
            if let Some(name) = tokens.first() {
                let prepared = prep_named(ws, config, Some(name))?;
                if prepared.method != Method::Metarun {
                    return Err(OrthoError::Classification(format!(
                        "'{}' is a {} experiment, not a metarun",
                        name, prepared.method
                    ))
                    .into());
                }
            }
            finish(run_metarun(ws, config)?)
        }
        "clean" => {
            let (_, kwargs) = parse_tokens(tokens, &["sure".to_string()])?;
            let sure = kwargs.get("sure").map(Value::truthy).unwrap_or(false);
            clean(ws, config, sure)
        }
        "back" => {
            let (args, kwargs) = parse_tokens(tokens, &[])?;
            let command = kwarg_str(&kwargs, "command")
                .or_else(|| {
                    let joined = positional_strings(&args).join(" ");
                    (!joined.is_empty()).then_some(joined)
                })
                .ok_or_else(|| usage("usage: back command=\"...\" [stop=...] [log=...]"))?;
            let stop = kwarg_str(&kwargs, "stop").unwrap_or_else(|| "script-stop-job.sh".into());
            let log = kwarg_str(&kwargs, "log").unwrap_or_else(|| "log-back".into());
            let job = shell::background(&ws.root, &command, &stop, &log)?;
            Ok(Some(json!({
                "pid": job.pid,
                "kill_script": job.kill_script.display().to_string(),
                "log": job.log.display().to_string(),
            })))
        }
        "modules" => clone_modules(ws, config),
        "check" => {
            let command = config
                .get("install_check")
                .and_then(Json::as_str)
                .ok_or_else(|| usage("config has no install_check command"))?;
            let opts = ShellOptions {
                cwd: Some(ws.root.clone()),
                interrupt: Some(ortho_core::interrupt::flag()),
                ..Default::default()
            };
            shell::bash(command, &opts)?;
            console::status("install check passed");
            Ok(None)
        }
        "config" => {
            let hooks = tokens.iter().any(|t| t == "hooks");
            let shown = if hooks {
                read_config_with_hooks(ws, None)?
            } else {
                config.clone()
            };
            console::say(&serde_json::to_string_pretty(&shown)?);
            Ok(None)
        }
        "look" => look(ws),
        crate::executor::INTERPRET_COMMAND => {
            let path = tokens
                .first()
                .ok_or_else(|| usage("usage: __interpret <script>"))?;
            interpret_file(&ws.root, &ws.path(path)).map_err(|e| {
                anyhow::Error::new(e).context(format!("{} failed", path))
            })?;
            Ok(None)
        }
        other => Err(anyhow!("{} is not a built-in command", other)),
    }
}

fn prep_named(ws: &Workspace, config: &Json, name: Option<&str>) -> Result<Prepared> {
    let experiments = collect_experiments(ws, config)?;
    let prepared = prep(ws, &experiments, name)?;
    console::status(&format!(
        "prepared {} experiment '{}' ({} step{})",
        prepared.method,
        prepared.name,
        prepared.steps.len(),
        if prepared.steps.len() == 1 { "" } else { "s" }
    ));
    Ok(prepared)
}

fn prepared_json(prepared: &Prepared) -> Json {
    json!({
        "experiment": prepared.name,
        "method": prepared.method.name(),
        "steps": prepared
            .steps
            .iter()
            .map(|s| json!({
                "index": s.index,
                "name": s.name,
                "expt": s.expt_path.display().to_string(),
                "script": s.script_path.display().to_string(),
            }))
            .collect::<Vec<_>>(),
    })
}

fn finish(outcome: RunOutcome) -> Result<Option<Json>> {
    if outcome.is_failed() {
        return Err(ScriptFailed::from(&outcome).into());
    }
    Ok(None)
}

/// Paths under the root matched by the config's `cleanup` patterns: globs
/// (strings) or `{regex: ...}` objects, both matched against relative paths.
/// A matched directory is taken whole.
pub fn cleanup_targets(ws: &Workspace, config: &Json) -> Result<Vec<PathBuf>> {
    let mut globs = GlobSetBuilder::new();
    let mut regexes = Vec::new();
    let patterns = config
        .get("cleanup")
        .and_then(Json::as_array)
        .cloned()
        .unwrap_or_default();
    for pattern in &patterns {
        match pattern {
            Json::String(glob) => {
                globs.add(Glob::new(glob).with_context(|| format!("invalid cleanup glob {}", glob))?);
            }
            Json::Object(obj) => {
                let expr = obj
                    .get("regex")
                    .and_then(Json::as_str)
                    .ok_or_else(|| usage(format!("cleanup entry {} has no regex", pattern)))?;
                regexes.push(Regex::new(expr).with_context(|| format!("invalid cleanup regex {}", expr))?);
            }
            other => return Err(usage(format!("cleanup entries must be globs or {{regex}}, got {}", other))),
        }
    }
    let globs = globs.build()?;
    let protected = ws.config_path.clone();
    let mut out = Vec::new();
    let mut walker = WalkDir::new(&ws.root).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry?;
        let path = entry.path();
        if path == protected {
            continue;
        }
        let Ok(rel) = path.strip_prefix(&ws.root) else {
            continue;
        };
        let rel_text = rel.to_string_lossy();
        if globs.is_match(rel) || regexes.iter().any(|re| re.is_match(&rel_text)) {
            out.push(path.to_path_buf());
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
        }
    }
    Ok(out)
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("cannot remove {}", path.display()))
}

fn clean(ws: &Workspace, config: &Json, sure: bool) -> Result<Option<Json>> {
    let targets = cleanup_targets(ws, config)?;
    if targets.is_empty() {
        console::note("nothing to clean");
        return Ok(None);
    }
    for path in &targets {
        console::say(&format!("  {}", path.strip_prefix(&ws.root).unwrap_or(path).display()));
    }
    if !sure && !confirm(&format!("remove {} paths?", targets.len()))? {
        console::note("clean cancelled");
        return Ok(None);
    }
    for path in &targets {
        remove_path(path)?;
    }
    console::status(&format!("removed {} paths", targets.len()));
    Ok(None)
}

fn clone_modules(ws: &Workspace, config: &Json) -> Result<Option<Json>> {
    let Some(modules) = config.get("modules").and_then(Json::as_object) else {
        console::note("no modules configured");
        return Ok(None);
    };
    for (dest, spec) in modules {
        let (address, branch) = match spec {
            Json::String(address) => (address.as_str(), None),
            Json::Object(obj) => (
                obj.get("address")
                    .and_then(Json::as_str)
                    .ok_or_else(|| usage(format!("module {} has no address", dest)))?,
                obj.get("branch").and_then(Json::as_str),
            ),
            other => return Err(usage(format!("module {} must be an address or {{address, branch}}, got {}", dest, other))),
        };
        if ws.path(dest).exists() {
            console::note(&format!("{} already present", dest));
            continue;
        }
        let mut cmd = Command::new("git");
        cmd.arg("clone").current_dir(&ws.root);
        if let Some(branch) = branch {
            cmd.arg("--branch").arg(branch);
        }
        cmd.arg(address).arg(dest);
        let status = cmd
            .status()
            .with_context(|| format!("cannot run git clone for {}", dest))?;
        if !status.success() {
            return Err(anyhow!("git clone {} into {} failed with {}", address, dest, status));
        }
        console::status(&format!("cloned {} into {}", address, dest));
    }
    Ok(None)
}

fn look(ws: &Workspace) -> Result<Option<Json>> {
    let path = ws.state_path();
    if !path.exists() {
        console::note("no state.json yet");
        return Ok(None);
    }
    let state = load_json_file(&path)?;
    let field = |key: &str| state.get(key).cloned().unwrap_or(Json::Null);
    let history = state
        .get("history")
        .and_then(Json::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    let summary = json!({
        "status": field("status"),
        "step": field("step"),
        "steps": field("steps"),
        "history": history,
        "error": state.get("_error").map(|e| json!({
            "message": e.get("message").cloned().unwrap_or(Json::Null),
            "kind": e.get("kind").cloned().unwrap_or(Json::Null),
            "last_lineno": e.get("last_lineno").cloned().unwrap_or(Json::Null),
        })),
    });
    console::say(&serde_json::to_string_pretty(&summary)?);
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{read_config, write_config};
    use crate::testutil::scratch;

    fn tokens(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn config_mutations_through_builtins() {
        let root = scratch("commands_config");
        let ws = Workspace::new(&root);
        let config = read_config(&ws).expect("config");
        run_builtin(&ws, &config, "set", &tokens(&["auto_debug=True", "tee=log-tee"])).expect("set");
        run_builtin(&ws, &config, "setlist", &tokens(&["commands", "a.py", "b.py", "a.py"])).expect("setlist");
        run_builtin(&ws, &config, "set_dict", &tokens(&["modules", "deps/lib=git@host:lib.git"]))
            .expect("set_dict");
        run_builtin(
            &ws,
            &config,
            "set_dict",
            &tokens(&["path=('importer', 'modules')", "value=['base.py']"]),
        )
        .expect("set_dict path");
        run_builtin(&ws, &config, "unset", &tokens(&["cleanup"])).expect("unset");
        let after = read_config(&ws).expect("read");
        assert_eq!(after["auto_debug"], json!(true));
        assert_eq!(after["tee"], json!("log-tee"));
        assert_eq!(after["commands"], json!(["a.py", "b.py"]));
        assert_eq!(after["modules"]["deps/lib"], json!("git@host:lib.git"));
        assert_eq!(after["importer"]["modules"], json!(["base.py"]));
        assert!(after.get("cleanup").is_none());
        assert!(run_builtin(&ws, &config, "set", &tokens(&["loose"])).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn cleanup_matches_globs_and_regexes_and_spares_the_config() {
        let root = scratch("commands_clean");
        let ws = Workspace::new(&root);
        fs::create_dir_all(root.join("s01-em/sub")).expect("step");
        fs::write(root.join("s01-em/sub/x.trr"), "").expect("traj");
        fs::write(root.join("state_1.json"), "{}").expect("state");
        fs::write(root.join("keep.py"), "").expect("keep");
        fs::write(root.join("scratch.tmp"), "").expect("tmp");
        let config = json!({"cleanup": ["s[0-9][0-9]-*", "state*.json", "*.json", {"regex": "\\.tmp$"}]});
        write_config(&ws.config_path, &config).expect("config");
        let targets = cleanup_targets(&ws, &config).expect("targets");
        let rel: Vec<String> = targets
            .iter()
            .map(|p| p.strip_prefix(&root).expect("rel").display().to_string())
            .collect();
        assert_eq!(rel, vec!["s01-em", "scratch.tmp", "state_1.json"]);
        clean(&ws, &config, true).expect("clean");
        assert!(!root.join("s01-em").exists());
        assert!(root.join("keep.py").exists());
        assert!(ws.config_path.exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn look_and_config_print_without_failing() {
        let root = scratch("commands_look");
        let ws = Workspace::new(&root);
        let config = read_config(&ws).expect("config");
        assert_eq!(run_builtin(&ws, &config, "look", &[]).expect("no state"), None);
        fs::write(
            ws.state_path(),
            r#"{"status": "error", "step": "s01-a", "history": ["a()"], "_error": {"message": "boom", "kind": "RuntimeError", "last_lineno": 3}}"#,
        )
        .expect("state");
        run_builtin(&ws, &config, "look", &[]).expect("look");
        run_builtin(&ws, &config, "config", &[]).expect("config");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn check_runs_install_check_through_bash() {
        let root = scratch("commands_check");
        let ws = Workspace::new(&root);
        run_builtin(&ws, &json!({"install_check": "true"}), "check", &[]).expect("passes");
        assert!(run_builtin(&ws, &json!({"install_check": "exit 4"}), "check", &[]).is_err());
        assert!(run_builtin(&ws, &json!({}), "check", &[]).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn modules_skips_destinations_already_on_disk() {
        let root = scratch("commands_modules");
        fs::create_dir_all(root.join("deps/lib")).expect("present");
        let ws = Workspace::new(&root);
        let config = json!({"modules": {"deps/lib": {"address": "git@host:lib.git", "branch": "main"}}});
        assert_eq!(run_builtin(&ws, &config, "modules", &[]).expect("modules"), None);
        let _ = fs::remove_dir_all(root);
    }
}
