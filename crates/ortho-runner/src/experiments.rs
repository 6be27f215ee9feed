//! Experiment files: locating them, parsing them, and merging them into one
//! table keyed by experiment name.

use crate::importer::{load_target, script_failure};
use crate::Workspace;
use anyhow::{Context, Result};
use globset::{Glob, GlobSetBuilder};
use indexmap::IndexMap;
use ortho_core::OrthoError;
use ortho_script::{read_literal, Interpreter, Kwargs, LiteralError, Value};
use regex::Regex;
use serde_json::{Map, Value as Json};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub const REGEX_SENTINEL: &str = "@regex";

#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub name: String,
    pub body: Map<String, Json>,
    pub source: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct Experiments {
    table: IndexMap<String, Experiment>,
}

impl Experiments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an experiment; a name already present is a contract error naming
    /// both sources.
    pub fn insert(&mut self, experiment: Experiment) -> Result<()> {
        if let Some(existing) = self.table.get(&experiment.name) {
            return Err(OrthoError::Contract(format!(
                "experiment '{}' is defined in both {} and {}",
                experiment.name,
                existing.source.display(),
                experiment.source.display()
            ))
            .into());
        }
        self.table.insert(experiment.name.clone(), experiment);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Experiment> {
        self.table.get(name).ok_or_else(|| {
            OrthoError::Resolution(format!(
                "unknown experiment '{}' (known: {})",
                name,
                self.names().join(", ")
            ))
            .into()
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.table.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The named experiment, or the sole one when no name is given.
    pub fn select(&self, name: Option<&str>) -> Result<&Experiment> {
        if self.table.is_empty() {
            return Err(OrthoError::Classification("source is empty".into()).into());
        }
        match name {
            Some(name) => self.get(name),
            None if self.table.len() == 1 => Ok(&self.table[0]),
            None => Err(OrthoError::Resolution(format!(
                "several experiments are defined; name one of: {}",
                self.names().join(", ")
            ))
            .into()),
        }
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

fn walk_files(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

fn locate_one(ws: &Workspace, pattern: &str, out: &mut Vec<PathBuf>) -> Result<()> {
    if let Some(expr) = pattern.strip_prefix(REGEX_SENTINEL) {
        let re = Regex::new(expr)
            .with_context(|| format!("invalid experiment locator regex {}", expr))?;
        for path in walk_files(&ws.root) {
            let hit = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| re.is_match(n))
                .unwrap_or(false);
            if hit {
                out.push(path);
            }
        }
    } else if is_glob(pattern) {
        let mut builder = GlobSetBuilder::new();
        builder.add(
            Glob::new(pattern).with_context(|| format!("invalid experiment glob {}", pattern))?,
        );
        let set = builder.build()?;
        for path in walk_files(&ws.root) {
            let matched = path
                .strip_prefix(&ws.root)
                .map(|rel| set.is_match(rel))
                .unwrap_or(false);
            if matched {
                out.push(path);
            }
        }
    } else {
        let path = ws.path(pattern);
        if !path.is_file() {
            return Err(OrthoError::Resolution(format!(
                "experiment file {} does not exist",
                pattern
            ))
            .into());
        }
        out.push(path);
    }
    Ok(())
}

/// Files named by the `inputs` locator: a path, a glob, `@regex<pattern>`
/// matched against basenames, or a list of any of these.
pub fn locate(ws: &Workspace, inputs: &Json) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    match inputs {
        Json::String(pattern) => locate_one(ws, pattern, &mut found)?,
        Json::Array(items) => {
            for item in items {
                let pattern = item.as_str().ok_or_else(|| {
                    OrthoError::Config(format!("inputs entries must be strings, got {}", item))
                })?;
                locate_one(ws, pattern, &mut found)?;
            }
        }
        Json::Null => {}
        other => {
            return Err(
                OrthoError::Config(format!("inputs must be a string or a list, got {}", other)).into(),
            )
        }
    }
    let mut unique = Vec::with_capacity(found.len());
    for path in found {
        if !unique.contains(&path) {
            unique.push(path);
        }
    }
    Ok(unique)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Parse the text of a data file: YAML by extension, a dictionary literal
/// otherwise. Returns `None` for an empty document.
pub fn parse_document(path: &Path, text: &str) -> Result<Option<Json>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let json = if is_yaml(path) {
        let doc: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| {
            OrthoError::Contract(format!("{}: {}", path.display(), e))
        })?;
        if doc.is_null() {
            return Ok(None);
        }
        serde_json::to_value(doc)
            .with_context(|| format!("{} holds a non-string mapping key", path.display()))?
    } else {
        match read_literal(text) {
            Ok(value) => value.to_json(),
            Err(LiteralError::DuplicateKeys(keys)) => {
                return Err(OrthoError::Contract(format!(
                    "{}: repeated keys {}",
                    path.display(),
                    keys
                ))
                .into())
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("cannot parse experiment file {}", path.display())))
            }
        }
    };
    Ok(Some(json))
}

fn apply_hooks(ws: &Workspace, config: &Json, mut text: String) -> Result<String> {
    let Some(hooks) = config.get("experiment_hooks").and_then(Json::as_array) else {
        return Ok(text);
    };
    if hooks.is_empty() {
        return Ok(text);
    }
    let mut interp = Interpreter::new();
    interp.add_search_path(&ws.root);
    for hook in hooks {
        let pair = hook.as_array().filter(|p| p.len() == 2);
        let (source, name) = match pair.map(|p| (p[0].as_str(), p[1].as_str())) {
            Some((Some(source), Some(name))) => (source, name),
            _ => {
                return Err(OrthoError::Config(format!(
                    "experiment_hooks entries must be [source, name] pairs, got {}",
                    hook
                ))
                .into())
            }
        };
        let module = load_target(&mut interp, ws, source)?;
        let func = module.get(name).ok_or_else(|| {
            OrthoError::Resolution(format!("experiment hook {} has no function '{}'", source, name))
        })?;
        let out = interp
            .call(&func, vec![Value::Str(text)], Kwargs::new())
            .map_err(|e| script_failure(source, e))?;
        text = match out {
            Value::Str(s) => s,
            other => {
                return Err(OrthoError::Contract(format!(
                    "experiment hook {}.{} must return a string, got {}",
                    source,
                    name,
                    other.type_name()
                ))
                .into())
            }
        };
        debug!(source, name, "applied experiment hook");
    }
    Ok(text)
}

/// Read one experiment file into `into`.
pub fn read_experiment_file(
    ws: &Workspace,
    config: &Json,
    path: &Path,
    into: &mut Experiments,
) -> Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read experiment file {}", path.display()))?;
    let text = apply_hooks(ws, config, text)?;
    let doc = parse_document(path, &text)?.ok_or_else(|| {
        OrthoError::Classification(format!("source is empty: {}", path.display()))
    })?;
    let Json::Object(table) = doc else {
        return Err(OrthoError::Contract(format!(
            "{} must hold a mapping from experiment names to experiments",
            path.display()
        ))
        .into());
    };
    for (name, body) in table {
        let Json::Object(body) = body else {
            return Err(OrthoError::Contract(format!(
                "experiment '{}' in {} is not a mapping",
                name,
                path.display()
            ))
            .into());
        };
        into.insert(Experiment {
            name,
            body,
            source: path.to_path_buf(),
        })?;
    }
    Ok(())
}

/// Locate and merge every experiment file named by the config's `inputs`.
pub fn collect_experiments(ws: &Workspace, config: &Json) -> Result<Experiments> {
    let inputs = config.get("inputs").cloned().unwrap_or(Json::Null);
    let files = locate(ws, &inputs)?;
    let mut experiments = Experiments::new();
    for path in &files {
        read_experiment_file(ws, config, path, &mut experiments)?;
    }
    debug!(files = files.len(), experiments = experiments.len(), "collected experiments");
    Ok(experiments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch;
    use serde_json::json;

    fn kind(err: &anyhow::Error) -> Option<&'static str> {
        err.downcast_ref::<OrthoError>().map(OrthoError::kind)
    }

    #[test]
    fn regex_locator_walks_the_tree_and_skips_hidden_dirs() {
        let root = scratch("expts_regex");
        fs::create_dir_all(root.join("sub")).expect("sub");
        fs::create_dir_all(root.join(".git")).expect("hidden");
        fs::write(root.join("a_expts.py"), "{}").expect("a");
        fs::write(root.join("sub/b_expts.yaml"), "").expect("b");
        fs::write(root.join(".git/c_expts.py"), "{}").expect("c");
        fs::write(root.join("notes.py"), "{}").expect("notes");
        let ws = Workspace::new(&root);
        let found = locate(&ws, &json!("@regex^.+_expts\\.(py|ya?ml)$")).expect("locate");
        let names: Vec<_> = found
            .iter()
            .map(|p| p.strip_prefix(&root).expect("rel").to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a_expts.py", "sub/b_expts.yaml"]);

        let globbed = locate(&ws, &json!(["*.py", "a_expts.py"])).expect("glob");
        assert_eq!(globbed.len(), 2);
        let err = locate(&ws, &json!("missing.py")).expect_err("missing");
        assert_eq!(kind(&err), Some("resolution"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn literal_and_yaml_files_merge_with_sources() {
        let root = scratch("expts_merge");
        fs::write(
            root.join("md_expts.py"),
            "{\n  'equil': {'script': 'eq.py', 'settings': {'nsteps': 100}},\n  # prod follows\n  'prod': {'quick': 'print(1)'},\n}\n",
        )
        .expect("literal");
        fs::write(
            root.join("more_expts.yaml"),
            "scan:\n  metarun: [equil, prod]\n",
        )
        .expect("yaml");
        let ws = Workspace::new(&root);
        let config = json!({"inputs": "@regex_expts\\."});
        let experiments = collect_experiments(&ws, &config).expect("collect");
        assert_eq!(experiments.names(), vec!["equil", "prod", "scan"]);
        let equil = experiments.get("equil").expect("equil");
        assert_eq!(equil.body["settings"], json!({"nsteps": 100}));
        assert!(equil.source.ends_with("md_expts.py"));
        assert_eq!(
            experiments.get("scan").expect("scan").body["metarun"],
            json!(["equil", "prod"])
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn repeated_keys_and_cross_file_collisions_are_contract_errors() {
        let root = scratch("expts_dupes");
        fs::write(
            root.join("one_expts.py"),
            "{'a': {'quick': 'x'},\n 'a': {'quick': 'y'}}\n",
        )
        .expect("dupes");
        let ws = Workspace::new(&root);
        let err = collect_experiments(&ws, &json!({"inputs": "one_expts.py"})).expect_err("dupes");
        assert_eq!(kind(&err), Some("contract"));
        assert!(err.to_string().contains("'a'"));

        fs::write(root.join("one_expts.py"), "{'a': {'quick': 'x'}}").expect("one");
        fs::write(root.join("two_expts.py"), "{'a': {'quick': 'y'}}").expect("two");
        let err = collect_experiments(&ws, &json!({"inputs": ["one_expts.py", "two_expts.py"]}))
            .expect_err("collision");
        assert_eq!(kind(&err), Some("contract"));
        assert!(err.to_string().contains("two_expts.py"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn empty_source_and_selection_rules() {
        let root = scratch("expts_empty");
        fs::write(root.join("empty_expts.py"), "\n  \n").expect("empty");
        let ws = Workspace::new(&root);
        let err = collect_experiments(&ws, &json!({"inputs": "empty_expts.py"})).expect_err("empty");
        assert_eq!(kind(&err), Some("classification"));
        assert!(err.to_string().contains("source is empty"));

        let none = Experiments::new();
        assert!(none.select(None).is_err());

        let mut one = Experiments::new();
        one.insert(Experiment {
            name: "only".into(),
            body: Map::new(),
            source: root.join("x.py"),
        })
        .expect("insert");
        assert_eq!(one.select(None).expect("sole").name, "only");
        assert_eq!(kind(&one.select(Some("other")).expect_err("unknown")), Some("resolution"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn experiment_hooks_rewrite_text_before_parsing() {
        let root = scratch("expts_hooks");
        fs::write(
            root.join("hooks.py"),
            "def expand(text):\n    return text.replace('ENGINE', 'gmx')\n",
        )
        .expect("hooks");
        fs::write(
            root.join("h_expts.py"),
            "{'run1': {'quick': 'bash(\"ENGINE mdrun\")'}}",
        )
        .expect("expts");
        let ws = Workspace::new(&root);
        let config = json!({
            "inputs": "h_expts.py",
            "experiment_hooks": [["hooks.py", "expand"]],
        });
        let experiments = collect_experiments(&ws, &config).expect("collect");
        assert_eq!(
            experiments.get("run1").expect("run1").body["quick"],
            json!("bash(\"gmx mdrun\")")
        );
        let _ = fs::remove_dir_all(root);
    }
}
