//! Call reporter: every call through a wrapped function is echoed as a
//! `[RUN]` line, appended to the current step log and to `state.history`.

use ortho_core::console;
use ortho_script::value::ReportedFunction;
use ortho_script::{CallHook, Function, Kwargs, MapRef, ScriptError, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

/// Functions that may run before any step log exists.
pub const PRE_STEP_FUNCTIONS: &[&str] = &["make_step", "time_limit", "init"];

pub struct CallReporter {
    root: PathBuf,
    state: MapRef,
}

impl CallReporter {
    pub fn new(root: impl Into<PathBuf>, state: MapRef) -> Self {
        Self {
            root: root.into(),
            state,
        }
    }

    fn append_log(&self, name: &str, line: &str) -> Result<(), ScriptError> {
        let log = self.state.borrow().lookup("step_log_file");
        let log = match log {
            Some(Value::Str(path)) if !path.is_empty() => path,
            _ if PRE_STEP_FUNCTIONS.contains(&name) => return Ok(()),
            _ => {
                return Err(ScriptError::runtime(format!(
                    "{}() was called before a step log file was registered; call make_step first",
                    name
                )))
            }
        };
        let path = self.root.join(&log);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ScriptError::runtime(format!("cannot open {}: {}", path.display(), e)))?;
        writeln!(file, "{}", line)
            .map_err(|e| ScriptError::runtime(format!("cannot write {}: {}", path.display(), e)))
    }

    fn append_history(&self, line: &str) -> Result<(), ScriptError> {
        let existing = self.state.borrow().base().get("history").cloned();
        match existing {
            Some(Value::List(items)) => {
                items.borrow_mut().push(Value::str(line));
                Ok(())
            }
            _ => {
                self.state
                    .borrow_mut()
                    .set("history", Value::list(vec![Value::str(line)]))?;
                Ok(())
            }
        }
    }
}

impl CallHook for CallReporter {
    fn on_call(&self, func: &Function, args: &[Value], kwargs: &Kwargs) -> Result<(), ScriptError> {
        let line = format_call(func, args, kwargs);
        console::say(&format!("[RUN] {}", line));
        self.append_log(func.name(), &line)?;
        self.append_history(&line)
    }
}

/// `name(p0=<repr>,...,args=[...],kwargs={...})`; positional arguments beyond
/// the declared parameters collapse into `args`.
pub fn format_call(func: &Function, args: &[Value], kwargs: &Kwargs) -> String {
    let params = func.positional_params();
    let mut parts: Vec<String> = params
        .iter()
        .zip(args)
        .map(|(p, a)| format!("{}={}", p, a.repr()))
        .collect();
    let extra: Vec<Value> = args.iter().skip(params.len()).cloned().collect();
    parts.push(format!("args={}", Value::list(extra).repr()));
    parts.push(format!("kwargs={}", Value::dict(kwargs.clone()).repr()));
    format!("{}({})", func.name(), parts.join(","))
}

pub fn wrap(func: Rc<Function>, hook: Rc<dyn CallHook>) -> Value {
    if func.is_reported() {
        return Value::Func(func);
    }
    Value::func(Function::Reported(ReportedFunction { inner: func, hook }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch;
    use ortho_script::{Interpreter, LayeredMap};
    use std::fs;

    fn define(interp: &mut Interpreter, source: &str, name: &str) -> Rc<Function> {
        let module = interp.load_source("defs", "defs.py", source).expect("load");
        match module.get(name) {
            Some(Value::Func(f)) => f,
            _ => panic!("{} not defined", name),
        }
    }

    #[test]
    fn reported_call_lands_in_history_and_log() {
        let root = scratch("reporter_log");
        fs::create_dir_all(root.join("s01-a")).expect("step dir");
        let state = LayeredMap::empty("state").into_ref();
        state
            .borrow_mut()
            .set("step_log_file", Value::str("s01-a/s01-a.log"))
            .expect("log");
        let mut interp = Interpreter::new();
        let f = define(&mut interp, "def f(a, b=2):\n    return a + b\n", "f");
        let hook: Rc<dyn CallHook> = Rc::new(CallReporter::new(&root, state.clone()));
        let wrapped = wrap(f, hook);
        let mut kwargs = Kwargs::new();
        kwargs.insert("b".into(), Value::Int(3));
        let out = interp.call(&wrapped, vec![Value::Int(10)], kwargs).expect("call");
        assert_eq!(out, Value::Int(13));

        let expected = "f(a=10,args=[],kwargs={'b': 3})";
        let history = state.borrow().get("history").expect("history");
        assert_eq!(history, Value::list(vec![Value::str(expected)]));
        let log = fs::read_to_string(root.join("s01-a/s01-a.log")).expect("log");
        assert_eq!(log, format!("{}\n", expected));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unregistered_log_is_refused_outside_whitelist() {
        let root = scratch("reporter_refuse");
        let state = LayeredMap::empty("state").into_ref();
        let mut interp = Interpreter::new();
        let hook: Rc<dyn CallHook> = Rc::new(CallReporter::new(&root, state.clone()));
        let g = wrap(define(&mut interp, "def g():\n    pass\n", "g"), hook.clone());
        let err = interp.call(&g, vec![], Kwargs::new()).expect_err("no log");
        assert!(err.message.contains("make_step"));

        let init = wrap(define(&mut interp, "def init(state):\n    pass\n", "init"), hook);
        interp
            .call(&init, vec![Value::None], Kwargs::new())
            .expect("whitelisted");
        assert_eq!(
            state.borrow().get("history").expect("history").repr(),
            "['init(state=None,args=[],kwargs={})']"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn extra_positionals_collapse_into_args() {
        let f = Function::native("mix", &["x"], |_, _, _| Ok(Value::None));
        let line = format_call(&f, &[Value::Int(1), Value::str("y"), Value::None], &Kwargs::new());
        assert_eq!(line, "mix(x=1,args=['y', None],kwargs={})");
    }
}
