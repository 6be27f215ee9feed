//! Step directories and the file registry carried between them.

use anyhow::{Context, Result};
use ortho_core::{copy_dir, ensure_dir, OrthoError};
use ortho_script::{MapRef, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub fn step_name(stepno: i64, name: &str) -> String {
    format!("s{:02}-{}", stepno, name)
}

fn state_value(state: &MapRef, key: &str) -> Option<Value> {
    state.borrow().lookup(key).filter(|v| !v.is_none())
}

/// A key of `state.before`, which may be a plain dict or a mapping.
fn before_value(state: &MapRef, key: &str) -> Option<Value> {
    let value = match state.borrow().base().get("before")? {
        Value::Dict(d) => d.borrow().get(key).cloned(),
        Value::Map(m) => m.borrow().lookup(key),
        _ => None,
    };
    value.filter(|v| !v.is_none())
}

fn string_items(value: Option<Value>, what: &str) -> Result<Vec<String>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let items = value
        .iterate()
        .map_err(|_| OrthoError::Step(format!("state.{} must be a list", what)))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| OrthoError::Step(format!("state.{} holds a non-string entry", what)).into())
        })
        .collect()
}

fn basename(path: &str) -> Result<String> {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| OrthoError::Step(format!("'{}' has no file name", path)).into())
}

/// Create the next numbered step directory and point `state` at it.
pub fn make_step(root: &Path, state: &MapRef, name: &str) -> Result<String> {
    if name.is_empty() || name.contains('/') {
        return Err(OrthoError::Step(format!("invalid step name '{}'", name)).into());
    }
    let (stepno, mut steps, previous_here) = match state_value(state, "stepno") {
        Some(current) => (
            current.as_int().unwrap_or(0) + 1,
            string_items(state_value(state, "steps"), "steps")?,
            state_value(state, "here"),
        ),
        None => match before_value(state, "stepno") {
            Some(before) => (
                before.as_int().unwrap_or(0) + 1,
                string_items(before_value(state, "steps"), "before.steps")?,
                before_value(state, "here"),
            ),
            None => (1, Vec::new(), None),
        },
    };
    let step = step_name(stepno, name);
    let dir = root.join(&step);

    let files = string_items(state_value(state, "files"), "files")?;
    let sources = string_items(state_value(state, "sources"), "sources")?;
    let mut registry = string_items(state_value(state, "file_registry"), "file_registry")?;
    if registry.is_empty() {
        registry = string_items(before_value(state, "file_registry"), "before.file_registry")?;
    }
    for file in &files {
        if !root.join(file).is_file() {
            return Err(OrthoError::Step(format!("cannot find file '{}' for {}", file, step)).into());
        }
    }
    for source in &sources {
        if source == "." || source == "./" {
            return Err(OrthoError::Step("'.' cannot be a step source".into()).into());
        }
        if !root.join(source).is_dir() {
            return Err(
                OrthoError::Step(format!("cannot find source directory '{}' for {}", source, step)).into(),
            );
        }
    }
    let previous_dir: Option<PathBuf> = previous_here
        .and_then(|v| v.as_str().map(|s| root.join(s)))
        .filter(|_| !registry.is_empty());
    if let Some(prev) = &previous_dir {
        for registered in &registry {
            if !prev.join(registered).is_file() {
                return Err(OrthoError::Step(format!(
                    "registered file '{}' is missing from {}",
                    registered,
                    prev.display()
                ))
                .into());
            }
        }
    }
    if dir.exists() {
        return Err(OrthoError::Step(format!("step directory {} already exists", step)).into());
    }

    ensure_dir(&dir)?;
    let log_rel = format!("{}/{}.log", step, step);
    fs::File::create(root.join(&log_rel))
        .with_context(|| format!("cannot create step log {}", log_rel))?;
    for file in &files {
        let target = dir.join(basename(file)?);
        fs::copy(root.join(file), &target)
            .with_context(|| format!("cannot copy {} into {}", file, step))?;
    }
    for source in &sources {
        let target = dir.join(basename(source.trim_end_matches('/'))?);
        copy_dir(&root.join(source), &target)?;
    }
    if let Some(prev) = &previous_dir {
        for registered in &registry {
            fs::copy(prev.join(registered), dir.join(registered))
                .with_context(|| format!("cannot carry {} forward into {}", registered, step))?;
            debug!(file = %registered, step = %step, "carried registered file forward");
        }
    }

    steps.push(step.clone());
    let mut s = state.borrow_mut();
    s.set("stepno", Value::Int(stepno))?;
    s.set("step", Value::str(&step))?;
    s.set("steps", Value::list(steps.into_iter().map(Value::Str).collect()))?;
    s.set("here", Value::str(format!("{}/", step)))?;
    s.set("step_log_file", Value::str(log_rel))?;
    s.set(
        "file_registry",
        Value::list(registry.into_iter().map(Value::Str).collect()),
    )?;
    info!(step = %step, "created step");
    Ok(step)
}

/// Add a file of the current step to the registry carried into later steps.
pub fn register_file(root: &Path, state: &MapRef, name: &str) -> Result<()> {
    let here = state_value(state, "here")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| OrthoError::Step("register_file needs a step; call make_step first".into()))?;
    let name = basename(name)?;
    if !root.join(&here).join(&name).is_file() {
        return Err(OrthoError::Step(format!("cannot register '{}': not found in {}", name, here)).into());
    }
    let mut registry = string_items(state.borrow().base().get("file_registry").cloned(), "file_registry")?;
    if registry.contains(&name) {
        return Err(OrthoError::Step(format!("'{}' is already registered", name)).into());
    }
    registry.push(name);
    state.borrow_mut().set(
        "file_registry",
        Value::list(registry.into_iter().map(Value::Str).collect()),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch;
    use ortho_script::LayeredMap;

    fn list(items: &[&str]) -> Value {
        Value::list(items.iter().map(|s| Value::str(*s)).collect())
    }

    #[test]
    fn make_step_copies_files_and_points_state_at_the_step() {
        let root = scratch("steps_make");
        fs::write(root.join("in.gro"), "atoms").expect("input");
        let state = LayeredMap::empty("state").into_ref();
        {
            let mut s = state.borrow_mut();
            s.set("stepno", Value::Int(1)).expect("stepno");
            s.set("steps", list(&["s01-prep"])).expect("steps");
            s.set("files", list(&["in.gro"])).expect("files");
        }
        let step = make_step(&root, &state, "equil").expect("make_step");
        assert_eq!(step, "s02-equil");
        assert!(root.join("s02-equil/in.gro").is_file());
        let s = state.borrow();
        assert_eq!(s.get("step").expect("step"), Value::str("s02-equil"));
        assert_eq!(
            s.get("step_log_file").expect("log"),
            Value::str("s02-equil/s02-equil.log")
        );
        assert_eq!(s.get("here").expect("here"), Value::str("s02-equil/"));
        assert_eq!(s.get("steps").expect("steps").repr(), "['s01-prep', 's02-equil']");
        assert!(root.join("s02-equil/s02-equil.log").is_file());
        drop(s);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn first_step_is_numbered_one_and_continues_from_before() {
        let root = scratch("steps_before");
        let state = LayeredMap::empty("state").into_ref();
        assert_eq!(make_step(&root, &state, "a").expect("first"), "s01-a");
        assert_eq!(make_step(&root, &state, "b").expect("second"), "s02-b");

        let next = LayeredMap::empty("state").into_ref();
        let before = state.borrow().base().clone();
        next.borrow_mut()
            .set("before", Value::dict(before))
            .expect("before");
        assert_eq!(make_step(&root, &next, "c").expect("third"), "s03-c");
        assert_eq!(
            next.borrow().get("steps").expect("steps").repr(),
            "['s01-a', 's02-b', 's03-c']"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn existing_directory_and_missing_inputs_are_step_errors() {
        let root = scratch("steps_errors");
        fs::create_dir_all(root.join("s01-a")).expect("existing");
        let state = LayeredMap::empty("state").into_ref();
        let err = make_step(&root, &state, "a").expect_err("exists");
        assert_eq!(err.downcast_ref::<OrthoError>().map(OrthoError::kind), Some("step"));

        state.borrow_mut().set("files", list(&["nope.gro"])).expect("files");
        let err = make_step(&root, &state, "b").expect_err("missing file");
        assert!(err.to_string().contains("nope.gro"));
        assert!(!root.join("s01-b").exists());

        state.borrow_mut().set("files", list(&[])).expect("files");
        state.borrow_mut().set("sources", list(&["."])).expect("sources");
        assert!(make_step(&root, &state, "c").is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn registered_files_travel_to_the_next_step() {
        let root = scratch("steps_registry");
        let state = LayeredMap::empty("state").into_ref();
        make_step(&root, &state, "em").expect("em");
        fs::write(root.join("s01-em/em.gro"), "minimized").expect("output");
        register_file(&root, &state, "em.gro").expect("register");
        let err = register_file(&root, &state, "em.gro").expect_err("duplicate");
        assert!(err.to_string().contains("already registered"));
        assert!(register_file(&root, &state, "absent.gro").is_err());

        make_step(&root, &state, "md").expect("md");
        assert_eq!(
            fs::read_to_string(root.join("s02-md/em.gro")).expect("carried"),
            "minimized"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn source_directories_are_copied_whole() {
        let root = scratch("steps_sources");
        fs::create_dir_all(root.join("ff/amber")).expect("src");
        fs::write(root.join("ff/amber/ff.itp"), "params").expect("itp");
        let state = LayeredMap::empty("state").into_ref();
        state.borrow_mut().set("sources", list(&["ff"])).expect("sources");
        make_step(&root, &state, "build").expect("build");
        assert!(root.join("s01-build/ff/amber/ff.itp").is_file());
        let _ = fs::remove_dir_all(root);
    }
}
