//! Makefile-facing dispatcher: `<target> <arg>* <key>=<value>*`.
//!
//! Targets are the built-in commands plus every function exposed by the
//! modules listed under the config's `commands`.

use crate::commands;
use crate::config::{read_config, string_list};
use crate::executor::bash_native;
use crate::importer::load_target;
use crate::Workspace;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use ortho_core::{console, load_json_file, OrthoError};
use ortho_script::ast::StmtKind;
use ortho_script::{interpret_value, parse_module, Function, Interpreter, Kwargs, ScriptError, Value};
use regex::Regex;
use serde_json::Value as Json;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const HISTORY_TAIL: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Listed(Vec<String>),
    Completed(Option<Json>),
}

const KWARG_PATTERN: &str = r"^([A-Za-z_]\w*)=(.+)$";

/// Split command-line tokens into positional and keyword arguments.
/// `key=value` tokens become keywords (values interpreted); a bare token
/// naming one of `params` sets that parameter to `True`; anything else is a
/// positional string.
pub fn parse_tokens(tokens: &[String], params: &[String]) -> Result<(Vec<Value>, Kwargs)> {
    let pattern = Regex::new(KWARG_PATTERN)?;
    let mut args = Vec::new();
    let mut kwargs = Kwargs::new();
    for token in tokens {
        if let Some(caps) = pattern.captures(token) {
            kwargs.insert(caps[1].to_string(), interpret_value(&caps[2]));
        } else if params.iter().any(|p| p == token) {
            kwargs.insert(token.clone(), Value::Bool(true));
        } else {
            args.push(Value::str(token.as_str()));
        }
    }
    Ok((args, kwargs))
}

struct Gleaned {
    source: String,
    cause: String,
}

/// Functions exposed by the configured command modules.
pub struct Catalog {
    interp: Interpreter,
    functions: IndexMap<String, Value>,
    gleaned: IndexMap<String, Gleaned>,
}

impl Catalog {
    pub fn load(ws: &Workspace, config: &Json) -> Result<Self> {
        let mut interp = Interpreter::new();
        interp.add_search_path(&ws.root);
        let scroll = config.get("scroll").and_then(Json::as_bool).unwrap_or(false);
        interp.set_builtin("bash", bash_native(&ws.root, None, scroll));
        let mut functions = IndexMap::new();
        let mut gleaned = IndexMap::new();
        for source in string_list(config, "commands") {
            match load_target(&mut interp, ws, &source) {
                Ok(module) => {
                    let names = match module.declared_all() {
                        Some(all) => all,
                        None => module
                            .exported_names()
                            .into_iter()
                            .filter(|n| {
                                matches!(module.get(n), Some(Value::Func(f)) if matches!(f.as_ref(), Function::Script(_)))
                            })
                            .collect(),
                    };
                    for name in names {
                        if let Some(value) = module.get(&name) {
                            functions.insert(name, value);
                        }
                    }
                }
                Err(err) => {
                    let cause = format!("{:#}", err);
                    warn!(source = %source, error = %cause, "command module failed to import");
                    for name in glean(&ws.path(&source)) {
                        gleaned.insert(
                            name,
                            Gleaned {
                                source: source.clone(),
                                cause: cause.clone(),
                            },
                        );
                    }
                }
            }
        }
        debug!(functions = functions.len(), gleaned = gleaned.len(), "loaded command catalog");
        Ok(Self {
            interp,
            functions,
            gleaned,
        })
    }

    /// Exposed names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .keys()
            .chain(self.gleaned.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn invoke(&mut self, target: &str, tokens: &[String]) -> Result<Option<Json>> {
        if let Some(func) = self.functions.get(target).cloned() {
            let params = match &func {
                Value::Func(f) => f.positional_params(),
                _ => Vec::new(),
            };
            let (args, kwargs) = parse_tokens(tokens, &params)?;
            debug!(target, args = args.len(), kwargs = kwargs.len(), "invoking command");
            let result = self
                .interp
                .call(&func, args, kwargs)
                .map_err(|e| anyhow::Error::new(e).context(format!("{} failed", target)))?;
            return Ok((!result.is_none()).then(|| result.to_json()));
        }
        if let Some(g) = self.gleaned.get(target) {
            return Err(OrthoError::Import {
                path: g.source.clone(),
                cause: g.cause.clone(),
            }
            .into());
        }
        Err(OrthoError::Resolution(format!("unknown target '{}'", target)).into())
    }
}

/// Top-level function names of a source file (or of every `.py` file in a
/// package directory), read without executing anything.
pub fn glean(path: &Path) -> Vec<String> {
    let files: Vec<_> = if path.is_dir() {
        let mut files: Vec<_> = fs::read_dir(path)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.extension().map(|e| e == "py").unwrap_or(false))
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };
    let mut names = Vec::new();
    for file in files {
        let Ok(source) = fs::read_to_string(&file) else {
            continue;
        };
        let Ok(module) = parse_module(&source) else {
            continue;
        };
        for stmt in &module.body {
            if let StmtKind::Def(def) = &stmt.kind {
                if !def.name.starts_with('_') {
                    names.push(def.name.clone());
                }
            }
        }
    }
    names
}

/// Route one command line. With no target, list the exposed functions.
pub fn dispatch(ws: &Workspace, tokens: &[String]) -> Result<DispatchOutcome> {
    let config = read_config(ws)?;
    if let Some(tee) = config.get("tee").and_then(Json::as_str) {
        console::install_tee(&ws.path(tee))
            .with_context(|| format!("cannot tee output to {}", tee))?;
    }
    let result = route(ws, &config, tokens);
    if let Err(err) = &result {
        if config.get("auto_debug").and_then(Json::as_bool).unwrap_or(false) {
            post_mortem(ws, err);
        }
    }
    result
}

fn route(ws: &Workspace, config: &Json, tokens: &[String]) -> Result<DispatchOutcome> {
    let Some((target, rest)) = tokens.split_first() else {
        return list(ws, config);
    };
    if target == "targets" {
        return list(ws, config);
    }
    if commands::is_builtin(target) {
        return commands::run_builtin(ws, config, target, rest).map(DispatchOutcome::Completed);
    }
    let mut catalog = Catalog::load(ws, config)?;
    catalog.invoke(target, rest).map(DispatchOutcome::Completed)
}

fn list(ws: &Workspace, config: &Json) -> Result<DispatchOutcome> {
    let names = Catalog::load(ws, config)?.names();
    for name in &names {
        console::say(name);
    }
    Ok(DispatchOutcome::Listed(names))
}

/// The script error carried somewhere in an error chain, if any.
pub fn script_error(err: &anyhow::Error) -> Option<&ScriptError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ScriptError>())
}

/// Error chain, traceback and the tail of the recorded history.
pub fn post_mortem(ws: &Workspace, err: &anyhow::Error) {
    console::say_err("[POST-MORTEM]");
    for (depth, cause) in err.chain().enumerate() {
        console::say_err(&format!("  {}: {}", depth, cause));
    }
    if let Some(script) = script_error(err) {
        for line in script.traceback_lines() {
            console::say_err(&line);
        }
    }
    let Ok(state) = load_json_file(&ws.state_path()) else {
        return;
    };
    if let Some(history) = state.get("history").and_then(Json::as_array) {
        let start = history.len().saturating_sub(HISTORY_TAIL);
        console::say_err(&format!("  last {} calls:", history.len() - start));
        for entry in &history[start..] {
            console::say_err(&format!("    {}", entry.as_str().unwrap_or_default()));
        }
    }
    if let Some(recorded) = state.get("_error").and_then(|e| e.get("message")) {
        console::say_err(&format!("  recorded error: {}", recorded));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::write_config;
    use crate::testutil::scratch;
    use serde_json::json;

    fn tokens(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn tokens_split_into_positionals_flags_and_keywords() {
        let (args, kwargs) = parse_tokens(
            &tokens(&["input.gro", "force", "n=4", "ratio=0.5", "tags=['a', 'b']", "x=y=z"]),
            &["path".to_string(), "force".to_string()],
        )
        .expect("parse");
        assert_eq!(args, vec![Value::str("input.gro")]);
        assert_eq!(kwargs["force"], Value::Bool(true));
        assert_eq!(kwargs["n"], Value::Int(4));
        assert_eq!(kwargs["ratio"], Value::Float(0.5));
        assert_eq!(kwargs["tags"].repr(), "['a', 'b']");
        assert_eq!(kwargs["x"], Value::str("y=z"));
    }

    #[test]
    fn exposed_functions_follow_all_and_skip_private_names() {
        let root = scratch("dispatch_expose");
        fs::write(
            root.join("cmds.py"),
            "def build(name, force=False):\n    return {'name': name, 'force': force}\ndef _hidden():\n    pass\nlimit = 3\n",
        )
        .expect("cmds");
        fs::write(
            root.join("more.py"),
            "__all__ = ['shown']\ndef shown():\n    return None\ndef not_listed():\n    pass\n",
        )
        .expect("more");
        let ws = Workspace::new(&root);
        write_config(&ws.config_path, &json!({"commands": ["cmds.py", "more.py"]})).expect("config");
        match dispatch(&ws, &[]).expect("list") {
            DispatchOutcome::Listed(names) => assert_eq!(names, vec!["build", "shown"]),
            other => panic!("unexpected {:?}", other),
        }
        let out = dispatch(&ws, &tokens(&["build", "water", "force"])).expect("call");
        assert_eq!(
            out,
            DispatchOutcome::Completed(Some(json!({"name": "water", "force": true})))
        );
        assert_eq!(
            dispatch(&ws, &tokens(&["shown"])).expect("shown"),
            DispatchOutcome::Completed(None)
        );
        let err = dispatch(&ws, &tokens(&["nope"])).expect_err("unknown");
        assert_eq!(err.downcast_ref::<OrthoError>().map(OrthoError::kind), Some("resolution"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn broken_module_is_gleaned_and_reported_as_import_error() {
        let root = scratch("dispatch_glean");
        fs::write(
            root.join("broken.py"),
            "import not_installed_anywhere\ndef analyse():\n    pass\ndef _private():\n    pass\n",
        )
        .expect("broken");
        let ws = Workspace::new(&root);
        write_config(&ws.config_path, &json!({"commands": ["broken.py"]})).expect("config");
        match dispatch(&ws, &tokens(&["targets"])).expect("targets") {
            DispatchOutcome::Listed(names) => assert_eq!(names, vec!["analyse"]),
            other => panic!("unexpected {:?}", other),
        }
        let err = dispatch(&ws, &tokens(&["analyse"])).expect_err("import");
        assert_eq!(err.downcast_ref::<OrthoError>().map(OrthoError::kind), Some("import"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn script_errors_stay_reachable_through_the_chain() {
        let root = scratch("dispatch_raise");
        fs::write(root.join("cmds.py"), "def fail():\n    raise ValueError('bad input')\n").expect("cmds");
        let ws = Workspace::new(&root);
        write_config(
            &ws.config_path,
            &json!({"commands": ["cmds.py"], "auto_debug": true}),
        )
        .expect("config");
        let err = dispatch(&ws, &tokens(&["fail"])).expect_err("raise");
        let script = script_error(&err).expect("script error");
        assert_eq!(script.message, "bad input");
        assert_eq!(script.traceback.last().map(|f| f.line), Some(2));
        let _ = fs::remove_dir_all(root);
    }
}
