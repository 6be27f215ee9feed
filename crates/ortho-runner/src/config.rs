//! The persistent config document.
//!
//! Keys starting with `@` are hooks: a literal string, or an
//! `{import_target, function}` pair resolved by calling into a script module.

use crate::importer::{load_target, script_failure};
use crate::Workspace;
use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use ortho_core::{atomic_write_json_pretty, load_json_file, OrthoError};
use ortho_script::{Interpreter, Kwargs};
use serde_json::{json, Map, Value};
use std::path::Path;
use tracing::{debug, info};

pub const BOOTSTRAP_FILE: &str = "bootstrap.py";

pub fn default_config() -> Value {
    json!({
        "commands": [],
        "inputs": "@regex^.+_expts\\.(py|ya?ml)$",
        "cleanup": ["s[0-9][0-9]-*", "state*.json", "expt*.json", "script*.py", "log-*"],
        "modules": {},
    })
}

fn bootstrap_config(ws: &Workspace) -> Result<Value> {
    let path = ws.root.join(BOOTSTRAP_FILE);
    if !path.is_file() {
        return Ok(default_config());
    }
    let mut interp = Interpreter::new();
    let module = interp
        .load_path("bootstrap", &path)
        .map_err(|e| script_failure(&path.display().to_string(), e))?;
    let Some(func) = module.get("default_config") else {
        return Ok(default_config());
    };
    let value = interp
        .call(&func, Vec::new(), Kwargs::new())
        .map_err(|e| script_failure(&path.display().to_string(), e))?
        .to_json();
    if !value.is_object() {
        return Err(OrthoError::Config(format!(
            "{}: default_config() must return a dict",
            path.display()
        ))
        .into());
    }
    Ok(value)
}

/// Read the config, creating it from the bootstrap defaults when absent.
pub fn read_config(ws: &Workspace) -> Result<Value> {
    if !ws.config_path.exists() {
        let config = bootstrap_config(ws)?;
        info!(path = %ws.config_path.display(), "creating config");
        write_config(&ws.config_path, &config)?;
        return Ok(config);
    }
    let config = load_json_file(&ws.config_path)?;
    if !config.is_object() {
        return Err(OrthoError::Config(format!(
            "{} must hold a JSON object",
            ws.config_path.display()
        ))
        .into());
    }
    Ok(config)
}

/// Read the config and resolve hooks; `only` restricts resolution to one
/// hook name (with or without its `@`).
pub fn read_config_with_hooks(ws: &Workspace, only: Option<&str>) -> Result<Value> {
    let mut config = read_config(ws)?;
    process_hooks(ws, &mut config, only)?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &Value) -> Result<()> {
    atomic_write_json_pretty(path, config)
        .with_context(|| format!("failed to write config {}", path.display()))
}

pub fn process_hooks(ws: &Workspace, config: &mut Value, only: Option<&str>) -> Result<()> {
    let only = only.map(|name| name.trim_start_matches('@'));
    let table = object_mut(config)?;
    let hooks: Vec<(String, Value)> = table
        .iter()
        .filter(|(k, _)| k.starts_with('@'))
        .filter(|(k, _)| only.map(|o| &k[1..] == o).unwrap_or(true))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, spec) in hooks {
        let result = resolve_hook(ws, &key, &spec)?;
        debug!(hook = %key, "resolved config hook");
        table.insert(key[1..].to_string(), result.clone());
        table.insert(key, result);
    }
    Ok(())
}

fn resolve_hook(ws: &Workspace, key: &str, spec: &Value) -> Result<Value> {
    match spec {
        Value::String(_) => Ok(spec.clone()),
        Value::Object(obj) => {
            let target = obj.get("import_target").and_then(Value::as_str);
            let function = obj.get("function").and_then(Value::as_str);
            let (Some(target), Some(function)) = (target, function) else {
                return Err(OrthoError::Config(format!(
                    "hook {} needs both import_target and function",
                    key
                ))
                .into());
            };
            let mut interp = Interpreter::new();
            interp.add_search_path(&ws.root);
            let module = load_target(&mut interp, ws, target)?;
            let func = module.get(function).ok_or_else(|| {
                OrthoError::Resolution(format!(
                    "hook {}: {} has no function '{}'",
                    key, target, function
                ))
            })?;
            let value = interp
                .call(&func, Vec::new(), Kwargs::new())
                .map_err(|e| script_failure(target, e))?;
            Ok(value.to_json())
        }
        _ => Err(OrthoError::Config(format!(
            "hook {} must be a string or an {{import_target, function}} mapping",
            key
        ))
        .into()),
    }
}

fn object_mut(config: &mut Value) -> Result<&mut Map<String, Value>> {
    config
        .as_object_mut()
        .ok_or_else(|| anyhow!(OrthoError::Config("config must be a JSON object".into())))
}

fn mutate(ws: &Workspace, edit: impl FnOnce(&mut Map<String, Value>) -> Result<()>) -> Result<Value> {
    let mut config = read_config(ws)?;
    edit(object_mut(&mut config)?)?;
    write_config(&ws.config_path, &config)?;
    Ok(config)
}

pub fn set(ws: &Workspace, key: &str, value: Value) -> Result<Value> {
    mutate(ws, |table| {
        table.insert(key.to_string(), value);
        Ok(())
    })
}

/// Store `values` as a list under `key`, dropping repeats.
pub fn setlist(ws: &Workspace, key: &str, values: Vec<Value>) -> Result<Value> {
    let mut unique: Vec<Value> = Vec::with_capacity(values.len());
    for v in values {
        if !unique.contains(&v) {
            unique.push(v);
        }
    }
    set(ws, key, Value::Array(unique))
}

pub fn set_dict(ws: &Workspace, name: &str, pairs: IndexMap<String, Value>) -> Result<Value> {
    mutate(ws, |table| {
        let entry = table
            .entry(name.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let inner = entry.as_object_mut().ok_or_else(|| {
            OrthoError::Config(format!("config key '{}' is not a dict", name))
        })?;
        for (k, v) in pairs {
            inner.insert(k, v);
        }
        Ok(())
    })
}

/// Assign a nested leaf, creating intermediate dicts along `path`.
pub fn set_dict_path(ws: &Workspace, path: &[String], value: Value) -> Result<Value> {
    let Some((leaf, parents)) = path.split_last() else {
        return Err(OrthoError::Config("set_dict path must not be empty".into()).into());
    };
    mutate(ws, |table| {
        let mut cursor = table;
        for (depth, key) in parents.iter().enumerate() {
            let next = cursor
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            cursor = next.as_object_mut().ok_or_else(|| {
                OrthoError::Config(format!(
                    "config path {} is not a dict",
                    path[..=depth].join(".")
                ))
            })?;
        }
        cursor.insert(leaf.clone(), value);
        Ok(())
    })
}

pub fn unset(ws: &Workspace, keys: &[String]) -> Result<Value> {
    mutate(ws, |table| {
        for key in keys {
            if table.shift_remove(key).is_none() {
                debug!(key = %key, "unset: key not present");
            }
        }
        Ok(())
    })
}

pub fn string_list(config: &Value, key: &str) -> Vec<String> {
    match config.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch;
    use std::fs;

    #[test]
    fn missing_config_is_created_from_defaults() {
        let root = scratch("config_default");
        let ws = Workspace::new(&root);
        let config = read_config(&ws).expect("read");
        assert_eq!(config, default_config());
        assert!(ws.config_path.exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn bootstrap_module_supplies_defaults() {
        let root = scratch("config_bootstrap");
        fs::write(
            root.join(BOOTSTRAP_FILE),
            "def default_config():\n    return {'commands': ['cmds.py'], 'tee': 'log-tee'}\n",
        )
        .expect("bootstrap");
        let config = read_config(&Workspace::new(&root)).expect("read");
        assert_eq!(config, json!({"commands": ["cmds.py"], "tee": "log-tee"}));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn mutations_are_visible_on_next_read() {
        let root = scratch("config_mutate");
        let ws = Workspace::new(&root);
        set(&ws, "auto_debug", json!(true)).expect("set");
        setlist(&ws, "commands", vec![json!("a.py"), json!("b.py"), json!("a.py")]).expect("setlist");
        let mut pairs = IndexMap::new();
        pairs.insert("lib".to_string(), json!("git@host:lib.git"));
        set_dict(&ws, "modules", pairs).expect("set_dict");
        set_dict_path(
            &ws,
            &["importer".to_string(), "initializers".to_string()],
            json!(["init"]),
        )
        .expect("set_dict path");
        unset(&ws, &["cleanup".to_string()]).expect("unset");

        let config = read_config(&ws).expect("read");
        assert_eq!(config["auto_debug"], json!(true));
        assert_eq!(config["commands"], json!(["a.py", "b.py"]));
        assert_eq!(config["modules"]["lib"], json!("git@host:lib.git"));
        assert_eq!(config["importer"]["initializers"], json!(["init"]));
        assert!(config.get("cleanup").is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn write_then_read_is_identity() {
        let root = scratch("config_roundtrip");
        let ws = Workspace::new(&root);
        let config = json!({"z": 1, "a": {"nested": [1, 2.5, null]}, "@h": "x"});
        write_config(&ws.config_path, &config).expect("write");
        assert_eq!(read_config(&ws).expect("read"), config);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn hooks_resolve_literals_and_function_calls() {
        let root = scratch("config_hooks");
        fs::write(
            root.join("hooks.py"),
            "def engine():\n    return 'gmx_' + 'mpi'\n",
        )
        .expect("hooks");
        let ws = Workspace::new(&root);
        write_config(
            &ws.config_path,
            &json!({
                "@engine": {"import_target": "hooks.py", "function": "engine"},
                "@host": "cluster",
            }),
        )
        .expect("write");
        let config = read_config_with_hooks(&ws, None).expect("hooks");
        assert_eq!(config["engine"], json!("gmx_mpi"));
        assert_eq!(config["@engine"], json!("gmx_mpi"));
        assert_eq!(config["host"], json!("cluster"));

        let scoped = read_config_with_hooks(&ws, Some("host")).expect("scoped");
        assert!(scoped.get("engine").is_none());
        assert_eq!(scoped["host"], json!("cluster"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn set_dict_refuses_non_dict_parent() {
        let root = scratch("config_non_dict");
        let ws = Workspace::new(&root);
        set(&ws, "modules", json!("flat")).expect("set");
        let err = set_dict(&ws, "modules", IndexMap::new()).expect_err("non dict");
        assert_eq!(
            err.downcast_ref::<OrthoError>().map(OrthoError::kind),
            Some("config")
        );
        let _ = fs::remove_dir_all(root);
    }
}
