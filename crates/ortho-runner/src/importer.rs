//! Module composition for step scripts.
//!
//! Base modules (from the importer instructions and the experiment's
//! `imports`) and extension modules (the experiment's `extensions`) are
//! loaded into one interpreter. Their exports are merged into a single
//! table, callables are wrapped by the call reporter, and the shared
//! variables are distributed into every module so that code deep inside a
//! package sees the same `state`, `settings` and `expt`.

use crate::reporter::wrap;
use crate::Workspace;
use anyhow::Result;
use indexmap::{IndexMap, IndexSet};
use ortho_core::OrthoError;
use ortho_script::{CallHook, Function, Interpreter, Kwargs, Module, ScriptError, Value};
use serde_json::Value as Json;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

pub const CORE_MODULE: &str = "ortho.core";

/// Wrap a script failure raised while importing or calling into `path`.
pub fn script_failure(path: &str, err: ScriptError) -> anyhow::Error {
    let cause = err.to_string();
    anyhow::Error::new(err).context(OrthoError::Import {
        path: path.to_string(),
        cause,
    })
}

/// Resolve a module path, expanding `@name/rest` through the config's
/// `modules` table (matched on the destination's final component).
pub fn resolve_module_path(ws: &Workspace, config: &Json, spec: &str) -> Result<PathBuf> {
    let path = match spec.strip_prefix('@') {
        Some(aliased) => {
            let (alias, rest) = aliased.split_once('/').unwrap_or((aliased, ""));
            let dest = config
                .get("modules")
                .and_then(Json::as_object)
                .and_then(|modules| {
                    modules.keys().find(|dest| {
                        Path::new(dest.as_str())
                            .file_name()
                            .map(|n| n == alias)
                            .unwrap_or(false)
                    })
                })
                .ok_or_else(|| {
                    OrthoError::Resolution(format!(
                        "no module named '{}' in the config modules table for {}",
                        alias, spec
                    ))
                })?;
            let base = ws.path(dest);
            if rest.is_empty() {
                base
            } else {
                base.join(rest)
            }
        }
        None => ws.path(spec),
    };
    if !path.exists() {
        return Err(OrthoError::Resolution(format!(
            "cannot find module path {} ({})",
            spec,
            path.display()
        ))
        .into());
    }
    Ok(path)
}

fn module_name(path: &Path) -> String {
    let stem = if path.is_dir() {
        path.file_name()
    } else {
        path.file_stem()
    };
    stem.and_then(|s| s.to_str()).unwrap_or("module").to_string()
}

/// Load a file or package path, falling back to a dotted module name on the
/// interpreter's search path.
pub fn load_target(interp: &mut Interpreter, ws: &Workspace, target: &str) -> Result<Rc<Module>> {
    let path = ws.path(target);
    let result = if path.exists() {
        interp.load_path(&module_name(&path), &path)
    } else if target.ends_with(".py") || target.contains('/') {
        return Err(OrthoError::Resolution(format!("cannot find {}", target)).into());
    } else {
        interp.import_module(target)
    };
    result.map_err(|e| script_failure(target, e))
}

/// What to load unconditionally and what to run once everything is loaded.
#[derive(Debug, Clone, Default)]
pub struct Instructions {
    pub modules: Vec<String>,
    pub initializers: Vec<String>,
    pub decorate: Vec<String>,
}

impl Instructions {
    /// From the config's `importer` block.
    pub fn from_config(config: &Json) -> Self {
        let block = config.get("importer");
        let list = |key: &str| -> Vec<String> {
            block
                .and_then(|b| b.get(key))
                .and_then(Json::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            modules: list("modules"),
            initializers: list("initializers"),
            decorate: list("decorate"),
        }
    }
}

pub struct LoadedModule {
    pub spec: String,
    pub module: Rc<Module>,
    pub extension: bool,
    pub exports: Vec<String>,
    declares_all: bool,
    not_reported: Vec<String>,
    overrides: Vec<String>,
}

pub struct Composition {
    pub exports: IndexMap<String, Value>,
    pub modules: Vec<LoadedModule>,
}

fn string_list(json: &Json, key: &str) -> Vec<String> {
    match json.get(key) {
        Some(Json::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Json::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn contract(message: String) -> anyhow::Error {
    OrthoError::Contract(message).into()
}

/// A native module exposing the distributed functions to `import` statements.
pub fn core_module(distribution: &IndexMap<String, Value>) -> Rc<Module> {
    let module = Module::new(CORE_MODULE, "<ortho>");
    for (name, value) in distribution {
        if matches!(value, Value::Func(_)) {
            module.set(name, value.clone());
        }
    }
    Rc::new(module)
}

fn load_one(
    interp: &mut Interpreter,
    ws: &Workspace,
    config: &Json,
    spec: &str,
    extension: bool,
) -> Result<LoadedModule> {
    let path = resolve_module_path(ws, config, spec)?;
    let name = module_name(&path);
    let module = interp
        .load_path(&name, &path)
        .map_err(|e| script_failure(spec, e))?;
    let declares_all = module.declared_all().is_some();
    let not_all = module.string_list("_not_all");
    let mut exports = module.exported_names();
    for hidden in &not_all {
        if !exports.contains(hidden) {
            return Err(contract(format!(
                "{}: _not_all names '{}', which the module does not export",
                spec, hidden
            )));
        }
    }
    exports.retain(|n| !not_all.contains(n));
    exports.retain(|n| !matches!(module.get(n), Some(Value::Module(_))));
    debug!(module = %spec, exports = exports.len(), extension, "loaded module");
    Ok(LoadedModule {
        spec: spec.to_string(),
        not_reported: module.string_list("_not_reported"),
        overrides: module.string_list("_extension_override"),
        module,
        extension,
        exports,
        declares_all,
    })
}

fn distribute(interp: &Interpreter, module: &Module, values: &IndexMap<String, Value>) {
    for (name, value) in values {
        module.set(name, value.clone());
    }
    let last = module.name.rsplit('.').next().unwrap_or(&module.name).to_string();
    for other in interp.modules() {
        if other.name != module.name && other.name.split('.').any(|seg| seg == last) {
            for (name, value) in values {
                other.set(name, value.clone());
            }
        }
    }
}

/// Load, filter, distribute, decorate and initialize. `expt` supplies
/// `imports` and `extensions`; `distribution` holds the shared variables.
pub fn compose(
    interp: &mut Interpreter,
    ws: &Workspace,
    config: &Json,
    expt: &Json,
    instructions: &Instructions,
    distribution: &IndexMap<String, Value>,
    hook: Rc<dyn CallHook>,
) -> Result<Composition> {
    interp.register_module(core_module(distribution));
    interp.add_search_path(&ws.root);

    let mut specs: Vec<(String, bool)> = Vec::new();
    for spec in instructions
        .modules
        .iter()
        .cloned()
        .chain(string_list(expt, "imports"))
    {
        specs.push((spec, false));
    }
    for spec in string_list(expt, "extensions") {
        specs.push((spec, true));
    }
    let mut modules = Vec::with_capacity(specs.len());
    for (spec, extension) in &specs {
        modules.push(load_one(interp, ws, config, spec, *extension)?);
    }

    for loaded in &modules {
        distribute(interp, &loaded.module, distribution);
    }

    // shared extensions: one pool, visible to every extension module
    let mut pool: IndexMap<String, (Value, String)> = IndexMap::new();
    for loaded in modules.iter().filter(|m| m.extension) {
        for name in loaded.module.string_list("_shared_extensions") {
            let value = loaded.module.get(&name).ok_or_else(|| {
                contract(format!(
                    "{} declares shared extension '{}' but does not define it",
                    loaded.spec, name
                ))
            })?;
            if let Some((_, first)) = pool.get(&name) {
                return Err(contract(format!(
                    "shared extension '{}' is declared by both {} and {}",
                    name, first, loaded.spec
                )));
            }
            pool.insert(name, (value, loaded.spec.clone()));
        }
    }
    let shared: IndexMap<String, Value> = pool.into_iter().map(|(k, (v, _))| (k, v)).collect();
    if !shared.is_empty() {
        for loaded in modules.iter().filter(|m| m.extension) {
            distribute(interp, &loaded.module, &shared);
        }
    }

    // extension overrides replace names inside the base modules
    for loaded in modules.iter().filter(|m| m.extension) {
        for name in &loaded.overrides {
            let value = loaded.module.get(name).ok_or_else(|| {
                contract(format!(
                    "{} overrides '{}' but does not define it",
                    loaded.spec, name
                ))
            })?;
            for base in modules.iter().filter(|m| !m.extension) {
                base.module.set(name, value.clone());
            }
        }
    }

    let mut exports: IndexMap<String, Value> = IndexMap::new();
    let mut owners: IndexMap<String, usize> = IndexMap::new();
    for (index, loaded) in modules.iter().enumerate() {
        for name in &loaded.exports {
            let raw = loaded.module.get(name).ok_or_else(|| {
                contract(format!("{} exports '{}' but does not define it", loaded.spec, name))
            })?;
            if let Some(&prev_index) = owners.get(name) {
                let prev = &modules[prev_index];
                let same_object = prev
                    .module
                    .get(name)
                    .map(|v| v.py_is(&raw))
                    .unwrap_or(false);
                if !same_object {
                    if loaded.extension && !prev.extension {
                        if !loaded.overrides.contains(name) {
                            warn!(
                                name = %name,
                                base = %prev.spec,
                                extension = %loaded.spec,
                                "extension silently overrides a base export"
                            );
                        }
                    } else if !loaded.declares_all && !prev.declares_all {
                        return Err(contract(format!(
                            "'{}' is exported by both {} and {}",
                            name, prev.spec, loaded.spec
                        )));
                    }
                }
            }
            let value = match &raw {
                Value::Func(f) if matches!(f.as_ref(), Function::Script(_))
                    && !loaded.not_reported.contains(name) =>
                {
                    wrap(f.clone(), hook.clone())
                }
                _ => raw,
            };
            exports.insert(name.clone(), value);
            owners.insert(name.clone(), index);
        }
    }

    let state = distribution.get("state").cloned().unwrap_or(Value::None);
    for name in &instructions.initializers {
        let init = exports.get(name).cloned().ok_or_else(|| {
            contract(format!("initializer '{}' is not exported by any module", name))
        })?;
        interp
            .call(&init, vec![state.clone()], Kwargs::new())
            .map_err(|e| script_failure(name, e))?;
    }

    let mut seen = IndexSet::new();
    for name in &instructions.decorate {
        if !seen.insert(name.clone()) {
            continue;
        }
        let current = exports.get(name).cloned().ok_or_else(|| {
            contract(format!("cannot decorate '{}': no such export", name))
        })?;
        if let Value::Func(f) = current {
            exports.insert(name.clone(), wrap(f, hook.clone()));
        }
    }

    Ok(Composition { exports, modules })
}
