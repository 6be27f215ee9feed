//! Tree-walking evaluator.
//!
//! One [`Interpreter`] owns the module registry, the builtins table and the
//! call stack used for tracebacks. Every module and script body runs against a
//! shared [`Namespace`], so values injected from outside (state, settings,
//! imported callables) are seen immediately by the running code.

use crate::ast::*;
use crate::builtins;
use crate::error::{ErrorKind, ParseError, ScriptError, TraceFrame};
use crate::parser::parse_module;
use crate::value::*;
use crate::value::Module;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_DEPTH: usize = 200;
/// Upper bound on the length of a sequence built by repetition.
const MAX_REPEAT_LEN: usize = 1 << 28;

struct Frame {
    file: String,
    function: String,
    line: usize,
}

pub struct Scope {
    globals: Namespace,
    locals: Option<IndexMap<String, Value>>,
    global_names: HashSet<String>,
}

impl Scope {
    pub fn module(globals: Namespace) -> Self {
        Self {
            globals,
            locals: None,
            global_names: HashSet::new(),
        }
    }

    fn set(&mut self, name: &str, value: Value) {
        match &mut self.locals {
            Some(locals) if !self.global_names.contains(name) => {
                locals.insert(name.to_string(), value);
            }
            _ => {
                self.globals.borrow_mut().insert(name.to_string(), value);
            }
        }
    }
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

pub struct Interpreter {
    builtins: IndexMap<String, Value>,
    modules: IndexMap<String, Rc<Module>>,
    search_paths: Vec<PathBuf>,
    sources: HashMap<String, Rc<Vec<String>>>,
    frames: Vec<Frame>,
    deadline: Option<(Instant, Duration)>,
    interrupt: Arc<AtomicBool>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        let mut table = IndexMap::new();
        builtins::install(&mut table);
        Self {
            builtins: table,
            modules: IndexMap::new(),
            search_paths: Vec::new(),
            sources: HashMap::new(),
            frames: Vec::new(),
            deadline: None,
            interrupt: ortho_core::interrupt::flag(),
        }
    }

    pub fn set_builtin(&mut self, name: &str, value: Value) {
        self.builtins.insert(name.to_string(), value);
    }

    pub fn builtin(&self, name: &str) -> Option<Value> {
        self.builtins.get(name).cloned()
    }

    pub fn register_module(&mut self, module: Rc<Module>) {
        self.modules.insert(module.name.clone(), module);
    }

    pub fn module(&self, name: &str) -> Option<Rc<Module>> {
        self.modules.get(name).cloned()
    }

    pub fn modules(&self) -> Vec<Rc<Module>> {
        self.modules.values().cloned().collect()
    }

    /// Later additions are searched first.
    pub fn add_search_path(&mut self, dir: &Path) {
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir.to_path_buf()
        };
        if !self.search_paths.contains(&dir) {
            self.search_paths.insert(0, dir);
        }
    }

    pub fn register_source(&mut self, file: &str, source: &str) {
        let lines = source.lines().map(str::to_string).collect();
        self.sources.insert(file.to_string(), Rc::new(lines));
    }

    /// Remaining time budget of the innermost `time_limit` block.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    /// Replace the process-wide interrupt flag this interpreter polls.
    pub fn set_interrupt_flag(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = flag;
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Raised at statement boundaries: a pending interrupt first, then an
    /// expired time limit.
    pub fn check_deadline(&self) -> Result<(), ScriptError> {
        if self.interrupt.load(AtomicOrdering::SeqCst) {
            return Err(ScriptError::interrupted());
        }
        match self.deadline {
            Some((at, limit)) if Instant::now() >= at => Err(timeout_error(limit)),
            _ => Ok(()),
        }
    }

    pub fn timeout_error(&self) -> ScriptError {
        timeout_error(self.deadline.map(|(_, l)| l).unwrap_or_default())
    }

    pub fn syntax_error(&self, file: &str, err: ParseError) -> ScriptError {
        let mut out = ScriptError::new(ErrorKind::Syntax, err.message.clone());
        out.traceback.push(TraceFrame {
            file: file.to_string(),
            line: err.line,
            function: "<module>".to_string(),
            source: self.source_line(file, err.line),
        });
        out
    }

    /// Parse and execute `source` as module `name`. The module is registered
    /// before its body runs so circular imports see the partial namespace.
    pub fn load_source(
        &mut self,
        name: &str,
        file: &str,
        source: &str,
    ) -> Result<Rc<Module>, ScriptError> {
        self.register_source(file, source);
        let parsed = parse_module(source).map_err(|e| self.syntax_error(file, e))?;
        let module = Rc::new(Module::new(name, file));
        self.register_module(module.clone());
        let mut scope = Scope::module(module.globals.clone());
        if let Err(err) = self.run_frame(file, "<module>", &parsed.body, &mut scope) {
            self.modules.shift_remove(name);
            return Err(err);
        }
        Ok(module)
    }

    /// Load a file, or a directory as a package. A package without
    /// `__init__.py` exports the public names of every `.py` file inside it.
    pub fn load_path(&mut self, name: &str, path: &Path) -> Result<Rc<Module>, ScriptError> {
        if let Some(parent) = path.parent() {
            self.add_search_path(parent);
        }
        if !path.is_dir() {
            let source = std::fs::read_to_string(path).map_err(|e| {
                ScriptError::new(
                    ErrorKind::Import,
                    format!("cannot read {}: {}", path.display(), e),
                )
            })?;
            return self.load_source(name, &path.display().to_string(), &source);
        }
        self.add_search_path(path);
        let init = path.join("__init__.py");
        if init.is_file() {
            return self.load_path(name, &init);
        }
        let package = Rc::new(Module::new(name, path.display().to_string()));
        self.register_module(package.clone());
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(|e| {
                ScriptError::new(
                    ErrorKind::Import,
                    format!("cannot list {}: {}", path.display(), e),
                )
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().map(|e| e == "py").unwrap_or(false))
            .collect();
        files.sort();
        let mut all = Vec::new();
        for file in files {
            let stem = match file.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let sub = self.load_path(&format!("{}.{}", name, stem), &file)?;
            for export in sub.exported_names() {
                if let Some(value) = sub.get(&export) {
                    package.set(&export, value);
                    all.push(Value::Str(export));
                }
            }
            package.set(&stem, Value::Module(sub));
        }
        package.set("__all__", Value::list(all));
        Ok(package)
    }

    pub fn import_module(&mut self, dotted: &str) -> Result<Rc<Module>, ScriptError> {
        if let Some(m) = self.modules.get(dotted) {
            return Ok(m.clone());
        }
        let suffix = format!(".{}", dotted);
        if let Some(m) = self.modules.values().find(|m| m.name.ends_with(&suffix)) {
            return Ok(m.clone());
        }
        let rel: PathBuf = dotted.split('.').collect();
        for dir in self.search_paths.clone() {
            let file = dir.join(&rel).with_extension("py");
            if file.is_file() {
                return self.load_path(dotted, &file);
            }
            let package = dir.join(&rel);
            if package.join("__init__.py").is_file() {
                return self.load_path(dotted, &package);
            }
        }
        Err(ScriptError::new(
            ErrorKind::Import,
            format!("No module named '{}'", dotted),
        ))
    }

    /// Execute a top-level body against `globals` under a `<module>` frame.
    pub fn run_body(
        &mut self,
        file: &str,
        body: &[Stmt],
        globals: &Namespace,
    ) -> Result<(), ScriptError> {
        let mut scope = Scope::module(globals.clone());
        self.run_frame(file, "<module>", body, &mut scope)
    }

    fn run_frame(
        &mut self,
        file: &str,
        function: &str,
        body: &[Stmt],
        scope: &mut Scope,
    ) -> Result<(), ScriptError> {
        self.frames.push(Frame {
            file: file.to_string(),
            function: function.to_string(),
            line: 0,
        });
        let result = self.exec_block(body, scope);
        self.frames.pop();
        result.map(|_| ())
    }

    pub fn call(
        &mut self,
        func: &Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, ScriptError> {
        match func {
            Value::Func(f) => self.call_function(f, args, kwargs),
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    pub fn call_function(
        &mut self,
        func: &Rc<Function>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, ScriptError> {
        match func.as_ref() {
            Function::Native(native) => {
                let f = native.func.clone();
                f(self, args, kwargs)
            }
            Function::Script(script) => self.call_script(script, args, kwargs),
            Function::Reported(reported) => {
                reported.hook.on_call(&reported.inner, &args, &kwargs)?;
                self.call_function(&reported.inner, args, kwargs)
            }
            Function::Bound(bound) => {
                builtins::call_method(self, &bound.receiver, &bound.method, args, kwargs)
            }
        }
    }

    fn call_script(
        &mut self,
        func: &ScriptFunction,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, ScriptError> {
        if self.frames.len() >= MAX_DEPTH {
            return Err(ScriptError::runtime("maximum recursion depth exceeded"));
        }
        let locals = bind_arguments(func, args, kwargs)?;
        let mut scope = Scope {
            globals: func.globals.clone(),
            locals: Some(locals),
            global_names: HashSet::new(),
        };
        self.frames.push(Frame {
            file: func.file.clone(),
            function: func.name.clone(),
            line: 0,
        });
        let body = func.body.clone();
        let result = self.exec_block(&body, &mut scope);
        self.frames.pop();
        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::None),
        }
    }

    fn set_line(&mut self, line: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.line = line;
        }
    }

    fn current_file(&self) -> String {
        self.frames
            .last()
            .map(|f| f.file.clone())
            .unwrap_or_else(|| "<script>".to_string())
    }

    fn source_line(&self, file: &str, line: usize) -> String {
        self.sources
            .get(file)
            .and_then(|lines| lines.get(line.wrapping_sub(1)).cloned())
            .unwrap_or_default()
    }

    fn with_traceback(&self, mut err: ScriptError) -> ScriptError {
        if err.traceback.is_empty() {
            err.traceback = self
                .frames
                .iter()
                .map(|f| TraceFrame {
                    file: f.file.clone(),
                    line: f.line,
                    function: f.function.clone(),
                    source: self.source_line(&f.file, f.line),
                })
                .collect();
        }
        err
    }

    fn exec_block(&mut self, body: &[Stmt], scope: &mut Scope) -> Result<Flow, ScriptError> {
        for stmt in body {
            match self.exec_stmt(stmt, scope)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &mut Scope) -> Result<Flow, ScriptError> {
        self.set_line(stmt.line);
        let result = match self.check_deadline() {
            Ok(()) => self.exec_kind(stmt, scope),
            Err(err) => Err(err),
        };
        result.map_err(|err| self.with_traceback(err))
    }

    fn exec_kind(&mut self, stmt: &Stmt, scope: &mut Scope) -> Result<Flow, ScriptError> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, scope)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, scope)?;
                for target in targets {
                    self.assign(target, value.clone(), scope)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                self.aug_assign(target, *op, value, scope)?;
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test, scope)?.truthy() {
                        return self.exec_block(body, scope);
                    }
                }
                return self.exec_block(orelse, scope);
            }
            StmtKind::For { target, iter, body } => {
                let items = self.eval(iter, scope)?.iterate()?;
                for item in items {
                    self.assign(target, item, scope)?;
                    match self.exec_block(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::While { test, body } => loop {
                self.set_line(stmt.line);
                self.check_deadline()?;
                if !self.eval(test, scope)?.truthy() {
                    break;
                }
                match self.exec_block(body, scope)? {
                    Flow::Break => break,
                    Flow::Return(v) => return Ok(Flow::Return(v)),
                    Flow::Normal | Flow::Continue => {}
                }
            },
            StmtKind::Def(def) => {
                let mut params = Vec::with_capacity(def.params.len());
                for p in &def.params {
                    let default = match &p.default {
                        Some(expr) => Some(self.eval(expr, scope)?),
                        None => None,
                    };
                    params.push(ParamSpec {
                        name: p.name.clone(),
                        default,
                        kind: p.kind,
                    });
                }
                let func = Function::Script(ScriptFunction {
                    name: def.name.clone(),
                    params,
                    body: Rc::new(def.body.clone()),
                    globals: scope.globals.clone(),
                    file: self.current_file(),
                });
                scope.set(&def.name, Value::func(func));
            }
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(e) => self.eval(e, scope)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Import { module, alias } => {
                let m = self.import_module(module)?;
                let bind = match alias {
                    Some(a) => a.clone(),
                    None => module.rsplit('.').next().unwrap_or(module).to_string(),
                };
                scope.set(&bind, Value::Module(m));
            }
            StmtKind::FromImport {
                module,
                names,
                star,
            } => {
                let m = self.import_module(module)?;
                if *star {
                    for name in m.exported_names() {
                        let value = m.get(&name).ok_or_else(|| {
                            ScriptError::new(
                                ErrorKind::Import,
                                format!("'{}' lists '{}' in __all__ but does not define it", module, name),
                            )
                        })?;
                        scope.set(&name, value);
                    }
                } else {
                    for (name, alias) in names {
                        let value = match m.get(name) {
                            Some(v) => v,
                            None => match self.import_module(&format!("{}.{}", module, name)) {
                                Ok(sub) => Value::Module(sub),
                                Err(_) => {
                                    return Err(ScriptError::new(
                                        ErrorKind::Import,
                                        format!("cannot import name '{}' from '{}'", name, module),
                                    ))
                                }
                            },
                        };
                        scope.set(alias.as_deref().unwrap_or(name), value);
                    }
                }
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Raise(expr) => {
                let err = match expr {
                    None => ScriptError::runtime("No active exception to reraise"),
                    Some(e) => raised(self.eval(e, scope)?),
                };
                return Err(err);
            }
            StmtKind::Assert { test, msg } => {
                if !self.eval(test, scope)?.truthy() {
                    let message = match msg {
                        Some(m) => self.eval(m, scope)?.to_str(),
                        None => String::new(),
                    };
                    return Err(ScriptError::new(ErrorKind::Assertion, message));
                }
            }
            StmtKind::With {
                context,
                alias,
                body,
            } => {
                let ctx = self.eval(context, scope)?;
                let manager = match &ctx {
                    Value::Context(m) => m.clone(),
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "'{}' object does not support the context manager protocol",
                            other.type_name()
                        )))
                    }
                };
                if let Some(name) = alias {
                    scope.set(name, ctx.clone());
                }
                match manager.as_ref() {
                    ContextManager::TimeLimit(limit) => {
                        let saved = self.deadline;
                        let candidate = Instant::now() + *limit;
                        self.deadline = Some(match saved {
                            Some((at, outer)) if at < candidate => (at, outer),
                            _ => (candidate, *limit),
                        });
                        let result = self.exec_block(body, scope);
                        self.deadline = saved;
                        return result;
                    }
                }
            }
            StmtKind::Global(names) => {
                scope.global_names.extend(names.iter().cloned());
            }
        }
        Ok(Flow::Normal)
    }

    fn assign(&mut self, target: &Expr, value: Value, scope: &mut Scope) -> Result<(), ScriptError> {
        match target {
            Expr::Name(name) => {
                scope.set(name, value);
                Ok(())
            }
            Expr::Attribute { value: obj, attr } => {
                let obj = self.eval(obj, scope)?;
                set_attr(&obj, attr, value)
            }
            Expr::Subscript { value: obj, index } => {
                let obj = self.eval(obj, scope)?;
                let index = self.eval(index, scope)?;
                set_item(&obj, &index, value)
            }
            Expr::Tuple(targets) | Expr::List(targets) => {
                let values = value.iterate()?;
                if values.len() != targets.len() {
                    return Err(ScriptError::value_error(if values.len() > targets.len() {
                        format!("too many values to unpack (expected {})", targets.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            values.len()
                        )
                    }));
                }
                for (t, v) in targets.iter().zip(values) {
                    self.assign(t, v, scope)?;
                }
                Ok(())
            }
            _ => Err(ScriptError::new(
                ErrorKind::Syntax,
                "cannot assign to expression",
            )),
        }
    }

    fn aug_assign(
        &mut self,
        target: &Expr,
        op: BinOp,
        value: &Expr,
        scope: &mut Scope,
    ) -> Result<(), ScriptError> {
        match target {
            Expr::Name(name) => {
                let current = self.lookup(name, scope)?;
                let rhs = self.eval(value, scope)?;
                let updated = in_place(op, current, &rhs)?;
                scope.set(name, updated);
                Ok(())
            }
            Expr::Attribute { value: obj, attr } => {
                let obj = self.eval(obj, scope)?;
                let current = get_attr(&obj, attr)?;
                let rhs = self.eval(value, scope)?;
                set_attr(&obj, attr, in_place(op, current, &rhs)?)
            }
            Expr::Subscript { value: obj, index } => {
                let obj = self.eval(obj, scope)?;
                let index = self.eval(index, scope)?;
                let current = get_item(&obj, &index)?;
                let rhs = self.eval(value, scope)?;
                set_item(&obj, &index, in_place(op, current, &rhs)?)
            }
            _ => Err(ScriptError::new(
                ErrorKind::Syntax,
                "illegal target for augmented assignment",
            )),
        }
    }

    fn lookup(&self, name: &str, scope: &Scope) -> Result<Value, ScriptError> {
        if let Some(locals) = &scope.locals {
            if !scope.global_names.contains(name) {
                if let Some(v) = locals.get(name) {
                    return Ok(v.clone());
                }
            }
        }
        if let Some(v) = scope.globals.borrow().get(name) {
            return Ok(v.clone());
        }
        if let Some(v) = self.builtins.get(name) {
            return Ok(v.clone());
        }
        Err(ScriptError::new(
            ErrorKind::Name,
            format!("name '{}' is not defined", name),
        ))
    }

    fn eval(&mut self, expr: &Expr, scope: &mut Scope) -> Result<Value, ScriptError> {
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Name(name) => self.lookup(name, scope),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, scope)?);
                }
                Ok(Value::list(out))
            }
            Expr::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, scope)?);
                }
                Ok(Value::tuple(out))
            }
            Expr::Dict(items) => {
                let mut out = IndexMap::with_capacity(items.len());
                for item in items {
                    let key = self.eval(&item.key, scope)?.as_key()?;
                    let value = self.eval(&item.value, scope)?;
                    out.insert(key, value);
                }
                Ok(Value::dict(out))
            }
            Expr::ListComp {
                elt,
                target,
                iter,
                cond,
            } => {
                let items = self.eval(iter, scope)?.iterate()?;
                let mut out = Vec::new();
                for item in items {
                    self.assign(target, item, scope)?;
                    if let Some(cond) = cond {
                        if !self.eval(cond, scope)?.truthy() {
                            continue;
                        }
                    }
                    out.push(self.eval(elt, scope)?);
                }
                Ok(Value::list(out))
            }
            Expr::Attribute { value, attr } => {
                let obj = self.eval(value, scope)?;
                get_attr(&obj, attr)
            }
            Expr::Subscript { value, index } => {
                let obj = self.eval(value, scope)?;
                if let Expr::Slice { lower, upper } = index.as_ref() {
                    let lower = match lower {
                        Some(e) => self.eval(e, scope)?,
                        None => Value::None,
                    };
                    let upper = match upper {
                        Some(e) => self.eval(e, scope)?,
                        None => Value::None,
                    };
                    return slice(&obj, &lower, &upper);
                }
                let index = self.eval(index, scope)?;
                get_item(&obj, &index)
            }
            Expr::Slice { .. } => Err(ScriptError::new(
                ErrorKind::Syntax,
                "slice outside of subscript",
            )),
            Expr::Call { func, args } => {
                let callee = self.eval(func, scope)?;
                let (positional, keywords) = self.eval_args(args, scope)?;
                self.call(&callee, positional, keywords)
            }
            Expr::Unary { op, operand } => {
                let v = self.eval(operand, scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
                    UnaryOp::Pos => match v.as_number() {
                        Some(_) => Ok(v),
                        None => Err(bad_operand("unary +", &v)),
                    },
                    UnaryOp::Neg => match v {
                        Value::Int(i) => i
                            .checked_neg()
                            .map(Value::Int)
                            .ok_or_else(|| ScriptError::runtime("integer overflow")),
                        Value::Bool(b) => Ok(Value::Int(-(b as i64))),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(bad_operand("unary -", &other)),
                    },
                }
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left, scope)?;
                let r = self.eval(right, scope)?;
                binary_op(*op, &l, &r)
            }
            Expr::Compare { left, ops } => {
                let mut lhs = self.eval(left, scope)?;
                for (op, right) in ops {
                    let rhs = self.eval(right, scope)?;
                    if !compare(*op, &lhs, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    lhs = rhs;
                }
                Ok(Value::Bool(true))
            }
            Expr::BoolOp { op, values } => {
                let mut last = Value::None;
                for value in values {
                    last = self.eval(value, scope)?;
                    let stop = match op {
                        BoolOp::And => !last.truthy(),
                        BoolOp::Or => last.truthy(),
                    };
                    if stop {
                        break;
                    }
                }
                Ok(last)
            }
            Expr::IfExp { test, body, orelse } => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(body, scope)
                } else {
                    self.eval(orelse, scope)
                }
            }
        }
    }

    fn eval_args(
        &mut self,
        args: &[Arg],
        scope: &mut Scope,
    ) -> Result<(Vec<Value>, Kwargs), ScriptError> {
        let mut positional = Vec::new();
        let mut keywords = Kwargs::new();
        for arg in args {
            match arg {
                Arg::Positional(e) => positional.push(self.eval(e, scope)?),
                Arg::Star(e) => positional.extend(self.eval(e, scope)?.iterate()?),
                Arg::Keyword(name, e) => {
                    let v = self.eval(e, scope)?;
                    insert_keyword(&mut keywords, name.clone(), v)?;
                }
                Arg::DoubleStar(e) => {
                    let items = match self.eval(e, scope)? {
                        Value::Dict(d) => d.borrow().clone(),
                        Value::Map(m) => m.borrow().base().clone(),
                        other => {
                            return Err(ScriptError::type_error(format!(
                                "argument after ** must be a mapping, not {}",
                                other.type_name()
                            )))
                        }
                    };
                    for (k, v) in items {
                        insert_keyword(&mut keywords, k, v)?;
                    }
                }
            }
        }
        Ok((positional, keywords))
    }
}

fn insert_keyword(keywords: &mut Kwargs, name: String, value: Value) -> Result<(), ScriptError> {
    if keywords.contains_key(&name) {
        return Err(ScriptError::type_error(format!(
            "got multiple values for keyword argument '{}'",
            name
        )));
    }
    keywords.insert(name, value);
    Ok(())
}

fn timeout_error(limit: Duration) -> ScriptError {
    ScriptError::new(
        ErrorKind::Timeout,
        format!("time limit of {}s exceeded", limit.as_secs_f64()),
    )
}

fn raised(value: Value) -> ScriptError {
    match &value {
        Value::Str(s) => ScriptError::runtime(s.clone()),
        Value::Func(f) => match builtins::exception_kind(f.name()) {
            Some(kind) => ScriptError::new(kind, ""),
            None => ScriptError::type_error("exceptions must be exception types or strings"),
        },
        _ => ScriptError::type_error("exceptions must be exception types or strings"),
    }
}

fn bind_arguments(
    func: &ScriptFunction,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<IndexMap<String, Value>, ScriptError> {
    let normals: Vec<&ParamSpec> = func
        .params
        .iter()
        .filter(|p| p.kind == ParamKind::Normal)
        .collect();
    let varargs = func.params.iter().find(|p| p.kind == ParamKind::VarArgs);
    let kwparam = func.params.iter().find(|p| p.kind == ParamKind::KwArgs);

    let mut locals = IndexMap::new();
    let given = args.len();
    let mut extra = Vec::new();
    for (i, arg) in args.into_iter().enumerate() {
        match normals.get(i) {
            Some(p) => {
                locals.insert(p.name.clone(), arg);
            }
            None => extra.push(arg),
        }
    }
    match varargs {
        Some(p) => {
            locals.insert(p.name.clone(), Value::tuple(extra));
        }
        None if !extra.is_empty() => {
            return Err(ScriptError::type_error(format!(
                "{}() takes {} positional arguments but {} were given",
                func.name,
                normals.len(),
                given
            )))
        }
        None => {}
    }

    let mut extra_kw = IndexMap::new();
    for (name, value) in kwargs {
        if normals.iter().any(|p| p.name == name) {
            if locals.contains_key(&name) {
                return Err(ScriptError::type_error(format!(
                    "{}() got multiple values for argument '{}'",
                    func.name, name
                )));
            }
            locals.insert(name, value);
        } else if kwparam.is_some() {
            extra_kw.insert(name, value);
        } else {
            return Err(ScriptError::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                func.name, name
            )));
        }
    }
    if let Some(p) = kwparam {
        locals.insert(p.name.clone(), Value::dict(extra_kw));
    }
    for p in normals {
        if !locals.contains_key(&p.name) {
            match &p.default {
                Some(d) => {
                    locals.insert(p.name.clone(), d.clone());
                }
                None => {
                    return Err(ScriptError::type_error(format!(
                        "{}() missing required argument: '{}'",
                        func.name, p.name
                    )))
                }
            }
        }
    }
    Ok(locals)
}

fn bad_operand(op: &str, v: &Value) -> ScriptError {
    ScriptError::type_error(format!("bad operand type for {}: '{}'", op, v.type_name()))
}

fn attr_error(message: String) -> ScriptError {
    ScriptError::new(ErrorKind::Attribute, message)
}

pub(crate) fn get_attr(obj: &Value, attr: &str) -> Result<Value, ScriptError> {
    match obj {
        Value::Module(m) => m.get(attr).ok_or_else(|| {
            attr_error(format!("module '{}' has no attribute '{}'", m.name, attr))
        }),
        Value::Map(map) => {
            if builtins::has_method(obj, attr) {
                return Ok(bound(obj, attr));
            }
            let m = map.borrow();
            match attr {
                "_name" => Ok(Value::str(m.name())),
                "_strict" => Ok(Value::Bool(m.is_strict())),
                "_underscores" => Ok(Value::Bool(m.underscores())),
                "_fallbacks" => Ok(Value::list(
                    m.fallbacks().iter().map(|f| Value::Map(f.clone())).collect(),
                )),
                _ => Ok(m.get(attr)?),
            }
        }
        Value::Func(f) if attr == "__name__" => Ok(Value::str(f.name())),
        other if builtins::has_method(other, attr) => Ok(bound(other, attr)),
        other => Err(attr_error(format!(
            "'{}' object has no attribute '{}'",
            other.type_name(),
            attr
        ))),
    }
}

fn bound(receiver: &Value, method: &str) -> Value {
    Value::func(Function::Bound(BoundMethod {
        receiver: receiver.clone(),
        method: method.to_string(),
    }))
}

pub(crate) fn set_attr(obj: &Value, attr: &str, value: Value) -> Result<(), ScriptError> {
    match obj {
        Value::Module(m) => {
            m.set(attr, value);
            Ok(())
        }
        Value::Map(map) => Ok(map.borrow_mut().set(attr, value)?),
        other => Err(attr_error(format!(
            "'{}' object attribute '{}' is read-only",
            other.type_name(),
            attr
        ))),
    }
}

fn normalize_index(len: usize, index: &Value, what: &str) -> Result<usize, ScriptError> {
    let i = index.as_int().ok_or_else(|| {
        ScriptError::type_error(format!(
            "{} indices must be integers, not {}",
            what,
            index.type_name()
        ))
    })?;
    let len = len as i64;
    let resolved = if i < 0 { i + len } else { i };
    if resolved < 0 || resolved >= len {
        return Err(ScriptError::new(
            ErrorKind::Index,
            format!("{} index out of range", what),
        ));
    }
    Ok(resolved as usize)
}

pub(crate) fn get_item(obj: &Value, index: &Value) -> Result<Value, ScriptError> {
    match obj {
        Value::List(items) => {
            let items = items.borrow();
            let i = normalize_index(items.len(), index, "list")?;
            Ok(items[i].clone())
        }
        Value::Tuple(items) => {
            let i = normalize_index(items.len(), index, "tuple")?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(chars.len(), index, "string")?;
            Ok(Value::Str(chars[i].to_string()))
        }
        Value::Dict(items) => {
            let key = index.as_key()?;
            items
                .borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| ScriptError::new(ErrorKind::Key, index.repr()))
        }
        Value::Map(map) => Ok(map.borrow().get(&index.as_key()?)?),
        other => Err(ScriptError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub(crate) fn set_item(obj: &Value, index: &Value, value: Value) -> Result<(), ScriptError> {
    match obj {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = normalize_index(items.len(), index, "list")?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(items) => {
            let key = index.as_key()?;
            items.borrow_mut().insert(key, value);
            Ok(())
        }
        Value::Map(map) => Ok(map.borrow_mut().set(&index.as_key()?, value)?),
        other => Err(ScriptError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn slice_bound(v: &Value) -> Result<Option<i64>, ScriptError> {
    match v {
        Value::None => Ok(None),
        other => other
            .as_int()
            .map(Some)
            .ok_or_else(|| ScriptError::type_error("slice indices must be integers or None")),
    }
}

fn slice_range(len: usize, lower: Option<i64>, upper: Option<i64>) -> (usize, usize) {
    let len_i = len as i64;
    let norm = |i: i64| -> usize {
        let i = if i < 0 { i + len_i } else { i };
        i.clamp(0, len_i) as usize
    };
    let lo = lower.map(norm).unwrap_or(0);
    let hi = upper.map(norm).unwrap_or(len);
    (lo, hi.max(lo))
}

fn slice(obj: &Value, lower: &Value, upper: &Value) -> Result<Value, ScriptError> {
    let (lower, upper) = (slice_bound(lower)?, slice_bound(upper)?);
    match obj {
        Value::List(items) => {
            let items = items.borrow();
            let (lo, hi) = slice_range(items.len(), lower, upper);
            Ok(Value::list(items[lo..hi].to_vec()))
        }
        Value::Tuple(items) => {
            let (lo, hi) = slice_range(items.len(), lower, upper);
            Ok(Value::tuple(items[lo..hi].to_vec()))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (lo, hi) = slice_range(chars.len(), lower, upper);
            Ok(Value::Str(chars[lo..hi].iter().collect()))
        }
        other => Err(ScriptError::type_error(format!(
            "'{}' object is not sliceable",
            other.type_name()
        ))),
    }
}

fn in_place(op: BinOp, current: Value, rhs: &Value) -> Result<Value, ScriptError> {
    if op == BinOp::Add {
        if let Value::List(items) = &current {
            let extra = rhs.iterate()?;
            items.borrow_mut().extend(extra);
            return Ok(current);
        }
    }
    binary_op(op, &current, rhs)
}

fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
        BinOp::Pow => "**",
    }
}

fn overflow() -> ScriptError {
    ScriptError::runtime("integer overflow")
}

fn zero_division() -> ScriptError {
    ScriptError::new(ErrorKind::ZeroDivision, "division by zero")
}

/// Validated repetition count for `seq * n`; negative counts give an empty
/// sequence.
fn repeat_count(len: usize, n: &Value) -> Result<usize, ScriptError> {
    let times = usize::try_from(n.as_int().unwrap_or(0).max(0)).unwrap_or(usize::MAX);
    match len.checked_mul(times) {
        Some(total) if total <= MAX_REPEAT_LEN => Ok(times),
        _ => Err(ScriptError::new(
            ErrorKind::Memory,
            format!("repeating a sequence of length {} by {} is too large", len, times),
        )),
    }
}

pub fn binary_op(op: BinOp, l: &Value, r: &Value) -> Result<Value, ScriptError> {
    match (op, l, r) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{}{}", a, b))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut out = a.borrow().clone();
            out.extend(b.borrow().iter().cloned());
            return Ok(Value::list(out));
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let mut out = a.as_ref().clone();
            out.extend(b.iter().cloned());
            return Ok(Value::tuple(out));
        }
        (BinOp::Mod, Value::Str(fmt), args) => {
            return builtins::percent_format(fmt, args).map(Value::Str)
        }
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if n.as_int().is_some() => {
            let times = repeat_count(s.len(), n)?;
            return Ok(Value::Str(s.repeat(times)));
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items))
            if n.as_int().is_some() =>
        {
            let items = items.borrow();
            let times = repeat_count(items.len(), n)?;
            let mut out = Vec::with_capacity(items.len() * times);
            for _ in 0..times {
                out.extend(items.iter().cloned());
            }
            return Ok(Value::list(out));
        }
        _ => {}
    }
    let (a, b) = match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(ScriptError::type_error(format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op_symbol(op),
                l.type_name(),
                r.type_name()
            )))
        }
    };
    if let (Number::Int(x), Number::Int(y)) = (a, b) {
        return int_op(op, x, y);
    }
    let (x, y) = (a.as_f64(), b.as_f64());
    let out = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(zero_division());
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(zero_division());
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(zero_division());
            }
            let m = x % y;
            if m != 0.0 && (m < 0.0) != (y < 0.0) {
                m + y
            } else {
                m
            }
        }
        BinOp::Pow => x.powf(y),
    };
    Ok(Value::Float(out))
}

fn int_op(op: BinOp, x: i64, y: i64) -> Result<Value, ScriptError> {
    let out = match op {
        BinOp::Add => x.checked_add(y).ok_or_else(overflow)?,
        BinOp::Sub => x.checked_sub(y).ok_or_else(overflow)?,
        BinOp::Mul => x.checked_mul(y).ok_or_else(overflow)?,
        BinOp::Div => {
            if y == 0 {
                return Err(zero_division());
            }
            return Ok(Value::Float(x as f64 / y as f64));
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(zero_division());
            }
            let q = x.checked_div(y).ok_or_else(overflow)?;
            if x % y != 0 && ((x < 0) != (y < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(zero_division());
            }
            let r = x.checked_rem(y).ok_or_else(overflow)?;
            if r != 0 && ((r < 0) != (y < 0)) {
                r + y
            } else {
                r
            }
        }
        BinOp::Pow => {
            if y < 0 {
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            let exp = u32::try_from(y).map_err(|_| overflow())?;
            x.checked_pow(exp).ok_or_else(overflow)?
        }
    };
    Ok(Value::Int(out))
}

pub(crate) fn contains(container: &Value, item: &Value) -> Result<bool, ScriptError> {
    match container {
        Value::List(items) => Ok(items.borrow().iter().any(|v| v.py_eq(item))),
        Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(item))),
        Value::Str(s) => match item {
            Value::Str(sub) => Ok(s.contains(sub.as_str())),
            other => Err(ScriptError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Dict(items) => Ok(items.borrow().contains_key(&item.as_key()?)),
        Value::Map(map) => Ok(map.borrow().contains(&item.as_key()?)),
        other => Err(ScriptError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, ScriptError> {
    use std::cmp::Ordering::*;
    Ok(match op {
        CmpOp::Eq => l.py_eq(r),
        CmpOp::NotEq => !l.py_eq(r),
        CmpOp::Lt => l.py_cmp(r)? == Less,
        CmpOp::LtEq => l.py_cmp(r)? != Greater,
        CmpOp::Gt => l.py_cmp(r)? == Greater,
        CmpOp::GtEq => l.py_cmp(r)? != Less,
        CmpOp::In => contains(r, l)?,
        CmpOp::NotIn => !contains(r, l)?,
        CmpOp::Is => l.py_is(r),
        CmpOp::IsNot => !l.py_is(r),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<Namespace, ScriptError> {
        let mut interp = Interpreter::new();
        let module = interp.load_source("__main__", "main.py", source)?;
        Ok(module.globals.clone())
    }

    fn global(ns: &Namespace, name: &str) -> Value {
        ns.borrow().get(name).cloned().unwrap_or(Value::None)
    }

    #[test]
    fn arithmetic_follows_python_rules() {
        let ns = run("a = 7 // -2\nb = -7 % 3\nc = 2 ** 10\nd = 1 / 4\ne = 'ab' * 2\n").expect("run");
        assert_eq!(global(&ns, "a"), Value::Int(-4));
        assert_eq!(global(&ns, "b"), Value::Int(2));
        assert_eq!(global(&ns, "c"), Value::Int(1024));
        assert_eq!(global(&ns, "d"), Value::Float(0.25));
        assert_eq!(global(&ns, "e"), Value::str("abab"));
    }

    #[test]
    fn functions_bind_defaults_varargs_and_kwargs() {
        let src = "def f(a, b=2, *rest, **opts):\n    return [a, b, list(rest), opts]\nx = f(1)\ny = f(1, 3, 4, 5, k=6)\n";
        let ns = run(src).expect("run");
        assert_eq!(global(&ns, "x").repr(), "[1, 2, [], {}]");
        assert_eq!(global(&ns, "y").repr(), "[1, 3, [4, 5], {'k': 6}]");
    }

    #[test]
    fn global_statement_routes_assignment() {
        let src = "n = 0\ndef bump():\n    global n\n    n += 1\nbump()\nbump()\n";
        let ns = run(src).expect("run");
        assert_eq!(global(&ns, "n"), Value::Int(2));
    }

    #[test]
    fn loops_and_comprehensions() {
        let src = "total = 0\nfor i in range(5):\n    if i == 3:\n        continue\n    total += i\nsq = [i * i for i in range(4) if i % 2 == 0]\nwhile total > 2:\n    total -= 2\n";
        let ns = run(src).expect("run");
        assert_eq!(global(&ns, "total"), Value::Int(1));
        assert_eq!(global(&ns, "sq").repr(), "[0, 4]");
    }

    #[test]
    fn list_aliasing_is_shared() {
        let ns = run("a = [1]\nb = a\nb.append(2)\nb += [3]\n").expect("run");
        assert_eq!(global(&ns, "a").repr(), "[1, 2, 3]");
    }

    #[test]
    fn traceback_names_each_frame() {
        let src = "def inner():\n    return 1 / 0\n\ndef outer():\n    return inner()\n\nouter()\n";
        let err = run(src).err().expect("error");
        assert_eq!(err.kind, ErrorKind::ZeroDivision);
        let frames: Vec<(String, usize)> = err
            .traceback
            .iter()
            .map(|f| (f.function.clone(), f.line))
            .collect();
        assert_eq!(
            frames,
            vec![
                ("<module>".to_string(), 7),
                ("outer".to_string(), 5),
                ("inner".to_string(), 2)
            ]
        );
        assert_eq!(err.traceback[2].source.trim(), "return 1 / 0");
    }

    #[test]
    fn unknown_name_is_a_name_error() {
        let err = run("x = y + 1\n").err().expect("error");
        assert_eq!(err.kind, ErrorKind::Name);
        assert_eq!(err.to_string(), "NameError: name 'y' is not defined");
    }

    #[test]
    fn time_limit_raises_at_statement_boundary() {
        let err = run("with time_limit(0):\n    x = 1\n").err().expect("timeout");
        assert_eq!(err.kind, ErrorKind::Timeout);
        let ns = run("with time_limit(60):\n    x = 1\ny = 2\n").expect("run");
        assert_eq!(global(&ns, "y"), Value::Int(2));
    }

    #[test]
    fn huge_repetition_is_a_memory_error() {
        let err = run("x = 'ab' * 10**18\n").err().expect("too large");
        assert_eq!(err.kind, ErrorKind::Memory);
        let err = run("x = [1, 2] * 10**18\n").err().expect("too large");
        assert_eq!(err.kind, ErrorKind::Memory);
        let ns = run("x = 'ab' * -3\ny = [0] * 3\n").expect("small");
        assert_eq!(global(&ns, "x"), Value::str(""));
        assert_eq!(global(&ns, "y").repr(), "[0, 0, 0]");
    }

    #[test]
    fn pending_interrupt_stops_at_the_next_statement() {
        let mut interp = Interpreter::new();
        let flag = Arc::new(AtomicBool::new(false));
        interp.set_interrupt_flag(flag.clone());
        let stop = flag.clone();
        interp.set_builtin(
            "press_ctrl_c",
            Value::func(Function::native("press_ctrl_c", &[], move |_, _, _| {
                stop.store(true, AtomicOrdering::SeqCst);
                Ok(Value::None)
            })),
        );
        let err = interp
            .load_source("__main__", "main.py", "a = 1\npress_ctrl_c()\nb = 2\n")
            .err()
            .expect("interrupted");
        assert_eq!(err.kind, ErrorKind::KeyboardInterrupt);
        assert_eq!(err.traceback.last().map(|f| f.line), Some(3));
    }

    #[test]
    fn imports_resolve_registered_modules() {
        let mut interp = Interpreter::new();
        interp
            .load_source("lib.tools", "tools.py", "def double(x):\n    return 2 * x\n_hidden = 1\n")
            .expect("tools");
        let main = interp
            .load_source(
                "__main__",
                "main.py",
                "import tools\nfrom lib.tools import *\na = tools.double(2)\nb = double(3)\n",
            )
            .expect("main");
        assert_eq!(main.get("a"), Some(Value::Int(4)));
        assert_eq!(main.get("b"), Some(Value::Int(6)));
        assert!(main.get("_hidden").is_none());
    }

    #[test]
    fn assert_and_raise_carry_messages() {
        let err = run("assert 1 == 2, 'mismatch'\n").err().expect("assert");
        assert_eq!(err.to_string(), "AssertionError: mismatch");
        let err = run("raise ValueError('bad value')\n").err().expect("raise");
        assert_eq!(err.kind, ErrorKind::Value);
        assert_eq!(err.message, "bad value");
    }

    #[test]
    fn syntax_errors_point_at_the_line() {
        let err = run("x = 1\ny = (\n").err().expect("syntax");
        assert_eq!(err.kind, ErrorKind::Syntax);
        assert_eq!(err.traceback[0].file, "main.py");
    }
}
