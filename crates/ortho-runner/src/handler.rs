//! Experiment handler: classification by key set, `extends`/`via`
//! resolution, and preparation of the per-step artifacts the executor reads.

use crate::experiments::Experiments;
use crate::steps::step_name;
use crate::Workspace;
use anyhow::{Context, Result};
use ortho_core::{atomic_write_bytes, atomic_write_json_pretty, OrthoError};
use regex::Regex;
use serde_json::{json, Map, Value as Json};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "metarun.json";

/// Required and permitted keys of one handler method.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub base: &'static [&'static str],
    pub opts: &'static [&'static str],
}

impl Schema {
    pub fn admits<'k>(&self, keys: impl IntoIterator<Item = &'k str> + Clone) -> bool {
        let has_base = self
            .base
            .iter()
            .all(|b| keys.clone().into_iter().any(|k| k == *b));
        has_base
            && keys
                .into_iter()
                .all(|k| self.base.iter().chain(self.opts).any(|known| *known == k))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Run,
    Metarun,
    Quick,
    Via,
}

impl Method {
    pub const ALL: [Method; 4] = [Method::Run, Method::Metarun, Method::Quick, Method::Via];

    pub fn name(self) -> &'static str {
        match self {
            Method::Run => "run",
            Method::Metarun => "metarun",
            Method::Quick => "quick",
            Method::Via => "via",
        }
    }

    pub fn schema(self) -> Schema {
        match self {
            Method::Run => Schema {
                base: &["script", "settings"],
                opts: &["extends", "tags", "params", "extensions", "imports", "notes"],
            },
            Method::Metarun => Schema {
                base: &["metarun"],
                opts: &["tags", "notes"],
            },
            Method::Quick => Schema {
                base: &["quick"],
                opts: &["params", "tags", "extensions", "imports", "settings", "notes"],
            },
            Method::Via => Schema {
                base: &["via"],
                opts: &["overrides", "mods", "notes"],
            },
        }
    }

    pub fn catalog() -> Vec<(Method, Schema)> {
        Method::ALL.iter().map(|m| (*m, m.schema())).collect()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The unique method of `catalog` whose schema admits `keys`.
pub fn classify_with(catalog: &[(Method, Schema)], name: &str, keys: &[&str]) -> Result<Method> {
    let matches: Vec<Method> = catalog
        .iter()
        .filter(|(_, schema)| schema.admits(keys.iter().copied()))
        .map(|(m, _)| *m)
        .collect();
    let sorted: BTreeSet<&str> = keys.iter().copied().collect();
    let listed = sorted.into_iter().collect::<Vec<_>>().join(", ");
    match matches.as_slice() {
        [one] => Ok(*one),
        [] => Err(OrthoError::Classification(format!(
            "cannot classify these keys for experiment '{}': {{{}}}",
            name, listed
        ))
        .into()),
        many => Err(OrthoError::Classification(format!(
            "experiment '{}' with keys {{{}}} matches several methods: {}",
            name,
            listed,
            many.iter().map(|m| m.name()).collect::<Vec<_>>().join(", ")
        ))
        .into()),
    }
}

pub fn classify(name: &str, body: &Map<String, Json>) -> Result<Method> {
    let keys: Vec<&str> = body.keys().map(String::as_str).collect();
    classify_with(&Method::catalog(), name, &keys)
}

fn settings_of(body: &Map<String, Json>) -> Map<String, Json> {
    body.get("settings")
        .and_then(Json::as_object)
        .cloned()
        .unwrap_or_default()
}

fn parent_name<'b>(body: &'b Map<String, Json>, key: &str, child: &str) -> Result<&'b str> {
    body.get(key).and_then(Json::as_str).ok_or_else(|| {
        OrthoError::Resolution(format!("'{}' of experiment '{}' must name an experiment", key, child))
            .into()
    })
}

/// Overlay `child` on a resolved parent: `settings` merge shallowly, every
/// other key of the child replaces the parent's.
fn overlay(mut parent: Map<String, Json>, child: &Map<String, Json>, skip: &[&str]) -> Map<String, Json> {
    let mut settings = settings_of(&parent);
    let child_settings = settings_of(child);
    let had_settings = parent.contains_key("settings") || child.contains_key("settings");
    for (k, v) in child_settings {
        settings.insert(k, v);
    }
    for (k, v) in child {
        if k == "settings" || skip.contains(&k.as_str()) {
            continue;
        }
        parent.insert(k.clone(), v.clone());
    }
    if had_settings {
        parent.insert("settings".to_string(), Json::Object(settings));
    }
    parent
}

fn deep_assign(settings: &mut Map<String, Json>, path: &mut Vec<String>, mods: &Map<String, Json>) -> Result<()> {
    for (key, value) in mods {
        path.push(key.clone());
        match value {
            Json::Object(inner) if !inner.is_empty() => deep_assign(settings, path, inner)?,
            leaf => {
                let (last, parents) = path.split_last().map(|(l, p)| (l.clone(), p.to_vec())).unwrap_or_default();
                let mut cursor = &mut *settings;
                for (depth, segment) in parents.iter().enumerate() {
                    let next = cursor
                        .entry(segment.clone())
                        .or_insert_with(|| Json::Object(Map::new()));
                    cursor = next.as_object_mut().ok_or_else(|| {
                        OrthoError::Contract(format!(
                            "mods path {} runs through a non-mapping setting",
                            parents[..=depth].join(".")
                        ))
                    })?;
                }
                cursor.insert(last, leaf.clone());
            }
        }
        path.pop();
    }
    Ok(())
}

fn resolve_chain(experiments: &Experiments, name: &str, chain: &mut Vec<String>) -> Result<Map<String, Json>> {
    if chain.iter().any(|seen| seen == name) {
        chain.push(name.to_string());
        return Err(OrthoError::Resolution(format!(
            "inheritance cycle: {}",
            chain.join(" -> ")
        ))
        .into());
    }
    chain.push(name.to_string());
    let body = &experiments.get(name)?.body;
    let resolved = if body.contains_key("via") {
        let parent = parent_name(body, "via", name)?;
        let mut base = resolve_chain(experiments, parent, chain)?;
        let mut settings = settings_of(&base);
        if let Some(overrides) = body.get("overrides") {
            let overrides = overrides.as_object().ok_or_else(|| {
                OrthoError::Contract(format!("overrides of '{}' must be a mapping", name))
            })?;
            for (k, v) in overrides {
                settings.insert(k.clone(), v.clone());
            }
        }
        if let Some(mods) = body.get("mods") {
            let mods = mods.as_object().ok_or_else(|| {
                OrthoError::Contract(format!("mods of '{}' must be a mapping", name))
            })?;
            deep_assign(&mut settings, &mut Vec::new(), mods)?;
        }
        base.insert("settings".to_string(), Json::Object(settings));
        if let Some(notes) = body.get("notes") {
            base.insert("notes".to_string(), notes.clone());
        }
        base
    } else if body.contains_key("extends") {
        let parent = parent_name(body, "extends", name)?;
        let base = resolve_chain(experiments, parent, chain)?;
        overlay(base, body, &["extends"])
    } else {
        body.clone()
    };
    chain.pop();
    Ok(resolved)
}

/// Follow `extends` and `via` to a self-contained description.
pub fn resolve(experiments: &Experiments, name: &str) -> Result<Map<String, Json>> {
    resolve_chain(experiments, name, &mut Vec::new())
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStep {
    /// Metarun position, 1-based; `None` for a single run.
    pub index: Option<usize>,
    pub name: String,
    pub expt_path: PathBuf,
    pub script_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub method: Method,
    pub name: String,
    pub steps: Vec<PreparedStep>,
}

fn artifact_names(index: Option<usize>) -> (String, String) {
    match index {
        Some(n) => (format!("expt_{}.json", n), format!("script_{}.py", n)),
        None => ("expt.json".to_string(), "script.py".to_string()),
    }
}

fn clear_artifacts(ws: &Workspace) -> Result<()> {
    let re = Regex::new(r"^(expt(_\d+)?\.json|script(_\d+)?\.py|metarun\.json)$")?;
    for entry in fs::read_dir(&ws.root)
        .with_context(|| format!("cannot list {}", ws.root.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let hit = name.to_str().map(|n| re.is_match(n)).unwrap_or(false);
        if hit && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn script_text(
    ws: &Workspace,
    experiments: &Experiments,
    name: &str,
    method: Method,
    body: &Map<String, Json>,
) -> Result<String> {
    match method {
        Method::Quick => body
            .get("quick")
            .and_then(Json::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                OrthoError::Contract(format!("quick of '{}' must be script text", name)).into()
            }),
        Method::Run => {
            let script = body.get("script").and_then(Json::as_str).ok_or_else(|| {
                OrthoError::Contract(format!("script of '{}' must be a path", name))
            })?;
            let mut candidates = vec![ws.path(script)];
            if let Some(dir) = experiments.get(name).ok().and_then(|e| e.source.parent()) {
                candidates.push(dir.join(script));
            }
            let path = candidates.into_iter().find(|p| p.is_file()).ok_or_else(|| {
                OrthoError::Resolution(format!(
                    "script {} of experiment '{}' does not exist",
                    script, name
                ))
            })?;
            fs::read_to_string(&path).with_context(|| format!("cannot read {}", path.display()))
        }
        other => Err(OrthoError::Classification(format!(
            "experiment '{}' is a {} experiment and has no script of its own",
            name, other
        ))
        .into()),
    }
}

fn write_step(
    ws: &Workspace,
    experiments: &Experiments,
    name: &str,
    method: Method,
    body: &Map<String, Json>,
    index: Option<usize>,
    label: &str,
) -> Result<PreparedStep> {
    let (expt_file, script_file) = artifact_names(index);
    let script = script_text(ws, experiments, name, method, body)?;
    let mut record = body.clone();
    record.insert("experiment".to_string(), json!(name));
    let expt_path = ws.path(&expt_file);
    let script_path = ws.path(&script_file);
    atomic_write_json_pretty(&expt_path, &Json::Object(record))?;
    atomic_write_bytes(&script_path, script.as_bytes())?;
    debug!(expt = %expt_file, script = %script_file, "wrote step artifacts");
    Ok(PreparedStep {
        index,
        name: label.to_string(),
        expt_path,
        script_path,
    })
}

fn metarun_entries(name: &str, body: &Map<String, Json>) -> Result<Vec<Json>> {
    match body.get("metarun") {
        Some(Json::Array(items)) => Ok(items.clone()),
        Some(Json::Object(table)) => {
            let mut keys: Vec<&String> = table.keys().collect();
            keys.sort();
            Ok(keys.into_iter().map(|k| table[k].clone()).collect())
        }
        _ => Err(OrthoError::Contract(format!(
            "metarun of '{}' must be a list or a mapping of step descriptions",
            name
        ))
        .into()),
    }
}

/// Resolve one metarun entry into (experiment name for errors, label, body).
fn metarun_step(
    experiments: &Experiments,
    metarun: &str,
    position: usize,
    entry: &Json,
) -> Result<(String, String, Map<String, Json>)> {
    match entry {
        Json::String(target) => Ok((target.clone(), target.clone(), resolve(experiments, target)?)),
        Json::Object(desc) if desc.contains_key("extends") => {
            let target = parent_name(desc, "extends", metarun)?;
            let base = resolve(experiments, target)?;
            let label = desc
                .get("name")
                .and_then(Json::as_str)
                .unwrap_or(target)
                .to_string();
            Ok((target.to_string(), label, overlay(base, desc, &["extends", "name"])))
        }
        Json::Object(desc) if desc.contains_key("quick") => {
            let label = desc
                .get("name")
                .and_then(Json::as_str)
                .unwrap_or("quick")
                .to_string();
            let mut body = desc.clone();
            body.remove("name");
            Ok((format!("{}[{}]", metarun, position), label, body))
        }
        other => Err(OrthoError::Classification(format!(
            "step {} of metarun '{}' must name an experiment, extend one, or be a quick step; got {}",
            position, metarun, other
        ))
        .into()),
    }
}

fn prep_metarun(
    ws: &Workspace,
    experiments: &Experiments,
    name: &str,
    body: &Map<String, Json>,
) -> Result<Vec<PreparedStep>> {
    let entries = metarun_entries(name, body)?;
    let mut steps = Vec::with_capacity(entries.len());
    let mut manifest = Vec::with_capacity(entries.len());
    for (offset, entry) in entries.iter().enumerate() {
        let position = offset + 1;
        let (target, label, step_body) = metarun_step(experiments, name, position, entry)?;
        let method = classify(&target, &step_body)?;
        if !matches!(method, Method::Run | Method::Quick) {
            return Err(OrthoError::Classification(format!(
                "step {} of metarun '{}' classifies as {}; only run and quick steps can be sequenced",
                position, name, method
            ))
            .into());
        }
        let step = write_step(ws, experiments, &target, method, &step_body, Some(position), &label)?;
        manifest.push(json!({
            "index": position,
            "name": step_name(position as i64, &label),
            "expt": format!("expt_{}.json", position),
            "script": format!("script_{}.py", position),
        }));
        steps.push(step);
    }
    atomic_write_json_pretty(
        &ws.path(MANIFEST_FILE),
        &json!({"name": name, "steps": manifest}),
    )?;
    Ok(steps)
}

/// Classify the selected experiment and write what the executor reads:
/// `expt.json` and `script.py`, or numbered copies plus `metarun.json`.
pub fn prep(ws: &Workspace, experiments: &Experiments, name: Option<&str>) -> Result<Prepared> {
    let selected = experiments.select(name)?;
    let name = selected.name.clone();
    if selected.body.contains_key("via") {
        classify(&name, &selected.body)?;
    }
    let body = resolve(experiments, &name)?;
    let method = classify(&name, &body)?;
    clear_artifacts(ws)?;
    if ws.state_path().exists() {
        warn!(
            state = %ws.state_path().display(),
            "state from a previous run is present; the next run continues from it"
        );
    }
    let steps = match method {
        Method::Run | Method::Quick => {
            vec![write_step(ws, experiments, &name, method, &body, None, &name)?]
        }
        Method::Metarun => prep_metarun(ws, experiments, &name, &body)?,
        Method::Via => {
            return Err(OrthoError::Resolution(format!(
                "via chain of '{}' does not resolve to a runnable experiment",
                name
            ))
            .into())
        }
    };
    info!(experiment = %name, method = %method, steps = steps.len(), "prepared");
    Ok(Prepared {
        method,
        name,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiments::Experiment;
    use crate::testutil::scratch;
    use std::path::Path;

    fn table(root: &Path, value: Json) -> Experiments {
        let mut out = Experiments::new();
        if let Json::Object(items) = value {
            for (name, body) in items {
                let Json::Object(body) = body else { panic!("body") };
                out.insert(Experiment {
                    name,
                    body,
                    source: root.join("test_expts.py"),
                })
                .expect("insert");
            }
        }
        out
    }

    fn kind(err: &anyhow::Error) -> Option<&'static str> {
        err.downcast_ref::<OrthoError>().map(OrthoError::kind)
    }

    #[test]
    fn classification_against_a_small_catalog() {
        let catalog = [
            (
                Method::Run,
                Schema {
                    base: &["script", "settings"],
                    opts: &["tags", "extensions"],
                },
            ),
            (
                Method::Metarun,
                Schema {
                    base: &["metarun"],
                    opts: &[],
                },
            ),
        ];
        assert_eq!(
            classify_with(&catalog, "a", &["script", "settings", "tags"]).expect("run"),
            Method::Run
        );
        assert_eq!(classify_with(&catalog, "b", &["metarun"]).expect("metarun"), Method::Metarun);
        let err = classify_with(&catalog, "c", &["script"]).expect_err("unclassifiable");
        assert_eq!(kind(&err), Some("classification"));
        assert!(err.to_string().contains("cannot classify"));
        assert_eq!(
            classify_with(&catalog, "a", &["settings", "script"]).expect("again"),
            Method::Run
        );
    }

    #[test]
    fn ambiguous_catalog_is_an_error() {
        let catalog = [
            (Method::Run, Schema { base: &["x"], opts: &[] }),
            (Method::Quick, Schema { base: &[], opts: &["x"] }),
        ];
        let err = classify_with(&catalog, "e", &["x"]).expect_err("ambiguous");
        assert!(err.to_string().contains("several methods"));
    }

    #[test]
    fn extends_merges_settings_and_inherits_missing_keys() {
        let root = scratch("handler_extends");
        let experiments = table(
            &root,
            json!({
                "parent": {"script": "p.py", "settings": {"a": 1, "b": 1}, "tags": ["t1"]},
                "child": {"extends": "parent", "settings": {"b": 2}},
            }),
        );
        let child = resolve(&experiments, "child").expect("resolve");
        assert_eq!(child["script"], json!("p.py"));
        assert_eq!(child["settings"], json!({"a": 1, "b": 2}));
        assert_eq!(child["tags"], json!(["t1"]));
        assert!(!child.contains_key("extends"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn via_chains_apply_overrides_eldest_first_and_detect_cycles() {
        let root = scratch("handler_via");
        let experiments = table(
            &root,
            json!({
                "base": {"quick": "pass", "settings": {"temp": 300, "box": {"x": 1, "y": 1}}},
                "warm": {"via": "base", "overrides": {"temp": 310}},
                "hot": {"via": "warm", "overrides": {"temp": 350}, "mods": {"box": {"y": 2}}},
                "loop_a": {"via": "loop_b"},
                "loop_b": {"via": "loop_a"},
            }),
        );
        let hot = resolve(&experiments, "hot").expect("hot");
        assert_eq!(hot["settings"], json!({"temp": 350, "box": {"x": 1, "y": 2}}));
        assert_eq!(classify("hot", &hot).expect("method"), Method::Quick);
        let err = resolve(&experiments, "loop_a").expect_err("cycle");
        assert_eq!(kind(&err), Some("resolution"));
        assert!(err.to_string().contains("loop_a -> loop_b -> loop_a"));
        let err = resolve(&experiments, "nowhere").expect_err("unknown");
        assert_eq!(kind(&err), Some("resolution"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn prep_run_is_idempotent_and_copies_the_script() {
        let root = scratch("handler_prep_run");
        fs::write(root.join("eq.py"), "make_step('eq')\n").expect("script");
        let experiments = table(
            &root,
            json!({"eq": {"script": "eq.py", "settings": {"n": 1}}}),
        );
        let ws = Workspace::new(&root);
        let prepared = prep(&ws, &experiments, None).expect("prep");
        assert_eq!(prepared.method, Method::Run);
        let first_expt = fs::read_to_string(root.join("expt.json")).expect("expt");
        let first_script = fs::read_to_string(root.join("script.py")).expect("script");
        assert_eq!(first_script, "make_step('eq')\n");
        prep(&ws, &experiments, Some("eq")).expect("again");
        assert_eq!(fs::read_to_string(root.join("expt.json")).expect("expt"), first_expt);
        assert_eq!(fs::read_to_string(root.join("script.py")).expect("script"), first_script);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn prep_metarun_numbers_steps_and_writes_a_manifest() {
        let root = scratch("handler_prep_metarun");
        fs::write(root.join("em.py"), "make_step('em')\n").expect("script");
        fs::write(root.join("expt_9.json"), "{}").expect("stale");
        let experiments = table(
            &root,
            json!({
                "em": {"script": "em.py", "settings": {"steps": 10}},
                "chain": {"metarun": [
                    "em",
                    {"extends": "em", "settings": {"steps": 20}},
                    {"quick": "make_step('check')", "name": "check"},
                ]},
            }),
        );
        let ws = Workspace::new(&root);
        let prepared = prep(&ws, &experiments, Some("chain")).expect("prep");
        assert_eq!(prepared.method, Method::Metarun);
        assert_eq!(prepared.steps.len(), 3);
        assert!(!root.join("expt_9.json").exists());
        let second: Json = serde_json::from_str(
            &fs::read_to_string(root.join("expt_2.json")).expect("expt_2"),
        )
        .expect("json");
        assert_eq!(second["settings"], json!({"steps": 20}));
        assert_eq!(
            fs::read_to_string(root.join("script_3.py")).expect("script_3"),
            "make_step('check')"
        );
        let manifest: Json = serde_json::from_str(
            &fs::read_to_string(root.join(MANIFEST_FILE)).expect("manifest"),
        )
        .expect("json");
        let names: Vec<&str> = manifest["steps"]
            .as_array()
            .expect("steps")
            .iter()
            .filter_map(|s| s["name"].as_str())
            .collect();
        assert_eq!(names, vec!["s01-em", "s02-em", "s03-check"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn metarun_mapping_is_ordered_by_key_and_rejects_nested_metaruns() {
        let root = scratch("handler_metarun_map");
        let experiments = table(
            &root,
            json!({
                "q": {"quick": "pass"},
                "inner": {"metarun": ["q"]},
                "outer": {"metarun": {"b": "q", "a": {"quick": "x = 1"}}},
                "bad": {"metarun": ["inner"]},
            }),
        );
        let ws = Workspace::new(&root);
        let prepared = prep(&ws, &experiments, Some("outer")).expect("outer");
        assert_eq!(prepared.steps[0].name, "quick");
        assert_eq!(prepared.steps[1].name, "q");
        let err = prep(&ws, &experiments, Some("bad")).expect_err("nested");
        assert_eq!(kind(&err), Some("classification"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_script_is_a_resolution_error() {
        let root = scratch("handler_missing_script");
        let experiments = table(&root, json!({"r": {"script": "gone.py", "settings": {}}}));
        let err = prep(&Workspace::new(&root), &experiments, None).expect_err("missing");
        assert_eq!(kind(&err), Some("resolution"));
        let _ = fs::remove_dir_all(root);
    }
}
