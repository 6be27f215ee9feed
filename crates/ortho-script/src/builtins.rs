//! Builtin functions, container methods and string formatting.

use crate::error::{ErrorKind, ScriptError};
use crate::interp::{get_attr, Interpreter};
use crate::value::*;
use indexmap::IndexMap;
use ortho_core::console;
use std::cmp::Ordering;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

const EXCEPTIONS: &[(&str, ErrorKind)] = &[
    ("Exception", ErrorKind::Runtime),
    ("RuntimeError", ErrorKind::Runtime),
    ("ValueError", ErrorKind::Value),
    ("TypeError", ErrorKind::Type),
    ("KeyError", ErrorKind::Key),
    ("IndexError", ErrorKind::Index),
    ("NameError", ErrorKind::Name),
    ("AttributeError", ErrorKind::Attribute),
    ("AssertionError", ErrorKind::Assertion),
    ("TimeoutError", ErrorKind::Timeout),
    ("MemoryError", ErrorKind::Memory),
    ("ImportError", ErrorKind::Import),
];

pub fn exception_kind(name: &str) -> Option<ErrorKind> {
    EXCEPTIONS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, kind)| *kind)
}

/// Match `args`/`kwargs` against `params`; the first `required` are
/// mandatory. Missing optional parameters come back as `None`.
pub fn bind(
    fname: &str,
    params: &[&str],
    required: usize,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> Result<Vec<Option<Value>>, ScriptError> {
    if args.len() > params.len() {
        return Err(ScriptError::type_error(format!(
            "{}() takes at most {} arguments ({} given)",
            fname,
            params.len(),
            args.len()
        )));
    }
    let mut out: Vec<Option<Value>> = args.into_iter().map(Some).collect();
    out.resize(params.len(), None);
    for (i, param) in params.iter().enumerate() {
        if let Some(v) = kwargs.shift_remove(*param) {
            if out[i].is_some() {
                return Err(ScriptError::type_error(format!(
                    "{}() got multiple values for argument '{}'",
                    fname, param
                )));
            }
            out[i] = Some(v);
        }
    }
    if let Some(extra) = kwargs.keys().next() {
        return Err(ScriptError::type_error(format!(
            "{}() got an unexpected keyword argument '{}'",
            fname, extra
        )));
    }
    for (i, param) in params.iter().enumerate().take(required) {
        if out[i].is_none() {
            return Err(ScriptError::type_error(format!(
                "{}() missing required argument: '{}'",
                fname, param
            )));
        }
    }
    Ok(out)
}

fn req(bound: &mut [Option<Value>], i: usize) -> Value {
    bound[i].take().unwrap_or(Value::None)
}

fn opt(bound: &mut [Option<Value>], i: usize) -> Option<Value> {
    bound[i].take().filter(|v| !v.is_none())
}

fn int_arg(v: &Value, what: &str) -> Result<i64, ScriptError> {
    v.as_int()
        .ok_or_else(|| ScriptError::type_error(format!("{} must be an integer", what)))
}

fn num_arg(v: &Value, what: &str) -> Result<f64, ScriptError> {
    v.as_float()
        .ok_or_else(|| ScriptError::type_error(format!("{} must be a number", what)))
}

fn str_arg(v: &Value, what: &str) -> Result<String, ScriptError> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| ScriptError::type_error(format!("{} must be a string", what)))
}

fn io_error(context: &str, err: impl std::fmt::Display) -> ScriptError {
    ScriptError::runtime(format!("{}: {}", context, err))
}

fn reg(
    table: &mut IndexMap<String, Value>,
    name: &str,
    params: &[&str],
    f: impl Fn(&mut Interpreter, Vec<Value>, Kwargs) -> Result<Value, ScriptError> + 'static,
) {
    table.insert(name.to_string(), Value::func(Function::native(name, params, f)));
}

pub fn install(table: &mut IndexMap<String, Value>) {
    reg(table, "print", &[], |_, args, mut kwargs| {
        let sep = kwargs
            .shift_remove("sep")
            .map(|v| v.to_str())
            .unwrap_or_else(|| " ".to_string());
        let end = kwargs
            .shift_remove("end")
            .map(|v| v.to_str())
            .unwrap_or_else(|| "\n".to_string());
        let parts: Vec<String> = args.iter().map(Value::to_str).collect();
        let text = format!("{}{}", parts.join(&sep), end);
        console::say(text.strip_suffix('\n').unwrap_or(&text));
        Ok(Value::None)
    });
    reg(table, "len", &["obj"], |_, args, kwargs| {
        let mut b = bind("len", &["obj"], 1, args, kwargs)?;
        let n = match req(&mut b, 0) {
            Value::Str(s) => s.chars().count(),
            Value::List(items) => items.borrow().len(),
            Value::Tuple(items) => items.len(),
            Value::Dict(items) => items.borrow().len(),
            Value::Map(map) => map.borrow().len(),
            other => {
                return Err(ScriptError::type_error(format!(
                    "object of type '{}' has no len()",
                    other.type_name()
                )))
            }
        };
        Ok(Value::Int(n as i64))
    });
    reg(table, "str", &["obj"], |_, args, kwargs| {
        let mut b = bind("str", &["obj"], 0, args, kwargs)?;
        Ok(Value::Str(b[0].take().map(|v| v.to_str()).unwrap_or_default()))
    });
    reg(table, "repr", &["obj"], |_, args, kwargs| {
        let mut b = bind("repr", &["obj"], 1, args, kwargs)?;
        Ok(Value::Str(req(&mut b, 0).repr()))
    });
    reg(table, "int", &["x"], |_, args, kwargs| {
        let mut b = bind("int", &["x"], 0, args, kwargs)?;
        match b[0].take().unwrap_or(Value::Int(0)) {
            Value::Int(i) => Ok(Value::Int(i)),
            Value::Bool(v) => Ok(Value::Int(v as i64)),
            Value::Float(f) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
            Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                ScriptError::value_error(format!(
                    "invalid literal for int() with base 10: {}",
                    repr_str(&s)
                ))
            }),
            other => Err(ScriptError::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))),
        }
    });
    reg(table, "float", &["x"], |_, args, kwargs| {
        let mut b = bind("float", &["x"], 0, args, kwargs)?;
        match b[0].take().unwrap_or(Value::Float(0.0)) {
            Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                ScriptError::value_error(format!(
                    "could not convert string to float: {}",
                    repr_str(&s)
                ))
            }),
            other => other.as_float().map(Value::Float).ok_or_else(|| {
                ScriptError::type_error(format!(
                    "float() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))
            }),
        }
    });
    reg(table, "bool", &["x"], |_, args, kwargs| {
        let mut b = bind("bool", &["x"], 0, args, kwargs)?;
        Ok(Value::Bool(b[0].take().map(|v| v.truthy()).unwrap_or(false)))
    });
    reg(table, "list", &["iterable"], |_, args, kwargs| {
        let mut b = bind("list", &["iterable"], 0, args, kwargs)?;
        Ok(Value::list(match b[0].take() {
            Some(v) => v.iterate()?,
            None => Vec::new(),
        }))
    });
    reg(table, "tuple", &["iterable"], |_, args, kwargs| {
        let mut b = bind("tuple", &["iterable"], 0, args, kwargs)?;
        Ok(Value::tuple(match b[0].take() {
            Some(v) => v.iterate()?,
            None => Vec::new(),
        }))
    });
    reg(table, "dict", &[], |_, args, kwargs| {
        let mut out = IndexMap::new();
        if args.len() > 1 {
            return Err(ScriptError::type_error("dict expected at most 1 argument"));
        }
        if let Some(source) = args.into_iter().next() {
            out = pairs_of(&source)?;
        }
        out.extend(kwargs);
        Ok(Value::dict(out))
    });
    reg(table, "range", &["start", "stop", "step"], |_, args, kwargs| {
        let mut b = bind("range", &["start", "stop", "step"], 1, args, kwargs)?;
        let first = int_arg(&req(&mut b, 0), "range() argument")?;
        let (start, stop) = match opt(&mut b, 1) {
            Some(stop) => (first, int_arg(&stop, "range() argument")?),
            None => (0, first),
        };
        let step = match opt(&mut b, 2) {
            Some(s) => int_arg(&s, "range() step")?,
            None => 1,
        };
        if step == 0 {
            return Err(ScriptError::value_error("range() arg 3 must not be zero"));
        }
        let mut out = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            out.push(Value::Int(i));
            i += step;
        }
        Ok(Value::list(out))
    });
    reg(table, "sorted", &["iterable", "key", "reverse"], |interp, args, kwargs| {
        let mut b = bind("sorted", &["iterable", "key", "reverse"], 1, args, kwargs)?;
        let items = req(&mut b, 0).iterate()?;
        let key = opt(&mut b, 1);
        let reverse = opt(&mut b, 2).map(|v| v.truthy()).unwrap_or(false);
        Ok(Value::list(sort_values(interp, items, key, reverse)?))
    });
    reg(table, "enumerate", &["iterable", "start"], |_, args, kwargs| {
        let mut b = bind("enumerate", &["iterable", "start"], 1, args, kwargs)?;
        let items = req(&mut b, 0).iterate()?;
        let start = match opt(&mut b, 1) {
            Some(s) => int_arg(&s, "start")?,
            None => 0,
        };
        Ok(Value::list(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| Value::tuple(vec![Value::Int(start + i as i64), v]))
                .collect(),
        ))
    });
    reg(table, "zip", &[], |_, args, _| {
        let columns = args
            .iter()
            .map(Value::iterate)
            .collect::<Result<Vec<_>, _>>()?;
        let len = columns.iter().map(Vec::len).min().unwrap_or(0);
        Ok(Value::list(
            (0..len)
                .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                .collect(),
        ))
    });
    reg(table, "min", &[], |_, args, _| extreme("min", args, Ordering::Less));
    reg(table, "max", &[], |_, args, _| extreme("max", args, Ordering::Greater));
    reg(table, "abs", &["x"], |_, args, kwargs| {
        let mut b = bind("abs", &["x"], 1, args, kwargs)?;
        match req(&mut b, 0) {
            Value::Int(i) => Ok(Value::Int(i.abs())),
            Value::Bool(v) => Ok(Value::Int(v as i64)),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            other => Err(ScriptError::type_error(format!(
                "bad operand type for abs(): '{}'",
                other.type_name()
            ))),
        }
    });
    reg(table, "sum", &["iterable", "start"], |_, args, kwargs| {
        let mut b = bind("sum", &["iterable", "start"], 1, args, kwargs)?;
        let items = req(&mut b, 0).iterate()?;
        let mut total = b[1].take().unwrap_or(Value::Int(0));
        for item in items {
            total = crate::interp::binary_op(crate::ast::BinOp::Add, &total, &item)?;
        }
        Ok(total)
    });
    reg(table, "isinstance", &["obj", "classinfo"], |_, args, kwargs| {
        let mut b = bind("isinstance", &["obj", "classinfo"], 2, args, kwargs)?;
        let obj = req(&mut b, 0);
        let classes = match req(&mut b, 1) {
            Value::Tuple(items) => items.as_ref().clone(),
            other => vec![other],
        };
        for class in classes {
            let name = match &class {
                Value::Func(f) => f.name().to_string(),
                other => {
                    return Err(ScriptError::type_error(format!(
                        "isinstance() arg 2 must be a type, not {}",
                        other.type_name()
                    )))
                }
            };
            if is_instance(&obj, &name) {
                return Ok(Value::Bool(true));
            }
        }
        Ok(Value::Bool(false))
    });
    reg(table, "round", &["number", "ndigits"], |_, args, kwargs| {
        let mut b = bind("round", &["number", "ndigits"], 1, args, kwargs)?;
        let number = req(&mut b, 0);
        match opt(&mut b, 1) {
            None => match number {
                Value::Int(i) => Ok(Value::Int(i)),
                other => Ok(Value::Int(round_half_even(num_arg(&other, "round()")?) as i64)),
            },
            Some(digits) => {
                let digits = int_arg(&digits, "ndigits")?;
                if let Value::Int(i) = number {
                    return Ok(Value::Int(i));
                }
                let scale = 10f64.powi(digits as i32);
                Ok(Value::Float(
                    round_half_even(num_arg(&number, "round()")? * scale) / scale,
                ))
            }
        }
    });
    reg(table, "any", &["iterable"], |_, args, kwargs| {
        let mut b = bind("any", &["iterable"], 1, args, kwargs)?;
        Ok(Value::Bool(req(&mut b, 0).iterate()?.iter().any(Value::truthy)))
    });
    reg(table, "all", &["iterable"], |_, args, kwargs| {
        let mut b = bind("all", &["iterable"], 1, args, kwargs)?;
        Ok(Value::Bool(req(&mut b, 0).iterate()?.iter().all(Value::truthy)))
    });
    reg(table, "getattr", &["obj", "name", "default"], |_, args, kwargs| {
        let mut b = bind("getattr", &["obj", "name", "default"], 2, args, kwargs)?;
        let obj = req(&mut b, 0);
        let name = str_arg(&req(&mut b, 1), "attribute name")?;
        match (get_attr(&obj, &name), b[2].take()) {
            (Ok(v), _) => Ok(v),
            (Err(_), Some(default)) => Ok(default),
            (Err(err), None) => Err(err),
        }
    });
    reg(table, "hasattr", &["obj", "name"], |_, args, kwargs| {
        let mut b = bind("hasattr", &["obj", "name"], 2, args, kwargs)?;
        let obj = req(&mut b, 0);
        let name = str_arg(&req(&mut b, 1), "attribute name")?;
        Ok(Value::Bool(get_attr(&obj, &name).is_ok()))
    });
    reg(table, "exists", &["path"], |_, args, kwargs| {
        let mut b = bind("exists", &["path"], 1, args, kwargs)?;
        let path = str_arg(&req(&mut b, 0), "path")?;
        Ok(Value::Bool(Path::new(&path).exists()))
    });
    reg(table, "read_json", &["path"], |_, args, kwargs| {
        let mut b = bind("read_json", &["path"], 1, args, kwargs)?;
        let path = str_arg(&req(&mut b, 0), "path")?;
        let json = ortho_core::load_json_file(Path::new(&path))
            .map_err(|e| io_error("read_json", format!("{:#}", e)))?;
        Ok(Value::from_json(&json))
    });
    reg(table, "write_json", &["path", "obj"], |_, args, kwargs| {
        let mut b = bind("write_json", &["path", "obj"], 2, args, kwargs)?;
        let path = str_arg(&req(&mut b, 0), "path")?;
        let obj = req(&mut b, 1);
        ortho_core::atomic_write_json_pretty(Path::new(&path), &obj.to_json())
            .map_err(|e| io_error("write_json", format!("{:#}", e)))?;
        Ok(Value::None)
    });
    reg(table, "time_limit", &["seconds"], |_, args, kwargs| {
        let mut b = bind("time_limit", &["seconds"], 1, args, kwargs)?;
        let seconds = num_arg(&req(&mut b, 0), "seconds")?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ScriptError::value_error(
                "time_limit() needs a non-negative number of seconds",
            ));
        }
        Ok(Value::Context(Rc::new(ContextManager::TimeLimit(
            Duration::from_secs_f64(seconds),
        ))))
    });
    for (name, kind) in EXCEPTIONS {
        let kind = *kind;
        reg(table, name, &["message"], move |_, args, _| {
            let message = args.first().map(Value::to_str).unwrap_or_default();
            Err(ScriptError::new(kind, message))
        });
    }
}

fn is_instance(obj: &Value, class: &str) -> bool {
    match class {
        "str" => matches!(obj, Value::Str(_)),
        "int" => matches!(obj, Value::Int(_) | Value::Bool(_)),
        "float" => matches!(obj, Value::Float(_)),
        "bool" => matches!(obj, Value::Bool(_)),
        "list" => matches!(obj, Value::List(_)),
        "tuple" => matches!(obj, Value::Tuple(_)),
        "dict" => matches!(obj, Value::Dict(_) | Value::Map(_)),
        _ => false,
    }
}

fn round_half_even(x: f64) -> f64 {
    let r = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        r
    }
}

fn extreme(name: &str, args: Vec<Value>, want: Ordering) -> Result<Value, ScriptError> {
    let items = if args.len() == 1 {
        args[0].iterate()?
    } else {
        args
    };
    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            None => item,
            Some(current) => {
                if item.py_cmp(&current)? == want {
                    item
                } else {
                    current
                }
            }
        });
    }
    best.ok_or_else(|| ScriptError::value_error(format!("{}() arg is an empty sequence", name)))
}

fn pairs_of(source: &Value) -> Result<IndexMap<String, Value>, ScriptError> {
    match source {
        Value::Dict(d) => Ok(d.borrow().clone()),
        Value::Map(m) => Ok(m.borrow().base().clone()),
        other => {
            let mut out = IndexMap::new();
            for pair in other.iterate()? {
                let kv = pair.iterate()?;
                if kv.len() != 2 {
                    return Err(ScriptError::value_error(
                        "dictionary update sequence element has wrong length",
                    ));
                }
                out.insert(kv[0].as_key()?, kv[1].clone());
            }
            Ok(out)
        }
    }
}

fn sort_values(
    interp: &mut Interpreter,
    items: Vec<Value>,
    key: Option<Value>,
    reverse: bool,
) -> Result<Vec<Value>, ScriptError> {
    let keys = match &key {
        Some(k) => items
            .iter()
            .map(|v| interp.call(k, vec![v.clone()], Kwargs::new()))
            .collect::<Result<Vec<_>, _>>()?,
        None => items.clone(),
    };
    let mut order: Vec<usize> = (0..items.len()).collect();
    let mut failure = None;
    order.sort_by(|&a, &b| match keys[a].py_cmp(&keys[b]) {
        Ok(o) if reverse => o.reverse(),
        Ok(o) => o,
        Err(e) => {
            failure.get_or_insert(e);
            Ordering::Equal
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }
    Ok(order.into_iter().map(|i| items[i].clone()).collect())
}

const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "index", "count", "remove", "sort", "reverse",
];
const DICT_METHODS: &[&str] = &[
    "get",
    "keys",
    "values",
    "items",
    "update",
    "setdefault",
    "pop",
    "copy",
];
const MAP_METHODS: &[&str] = &[
    "get",
    "keys",
    "values",
    "items",
    "update",
    "setdefault",
    "pop",
    "copy",
    "dump",
    "fallbacks",
];
const STR_METHODS: &[&str] = &[
    "format",
    "join",
    "split",
    "splitlines",
    "strip",
    "lstrip",
    "rstrip",
    "startswith",
    "endswith",
    "replace",
    "upper",
    "lower",
    "find",
    "count",
];

pub fn has_method(value: &Value, name: &str) -> bool {
    let table = match value {
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Map(_) => MAP_METHODS,
        Value::Str(_) => STR_METHODS,
        _ => return false,
    };
    table.contains(&name)
}

pub fn call_method(
    interp: &mut Interpreter,
    receiver: &Value,
    method: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<Value, ScriptError> {
    match receiver {
        Value::List(items) => list_method(interp, items, method, args, kwargs),
        Value::Dict(items) => dict_method(items, method, args, kwargs),
        Value::Map(map) => map_method(map, method, args, kwargs),
        Value::Str(s) => str_method(s, method, args, kwargs),
        other => Err(ScriptError::new(
            ErrorKind::Attribute,
            format!("'{}' object has no attribute '{}'", other.type_name(), method),
        )),
    }
}

fn list_method(
    interp: &mut Interpreter,
    items: &Rc<std::cell::RefCell<Vec<Value>>>,
    method: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<Value, ScriptError> {
    let name = format!("list.{}", method);
    match method {
        "append" => {
            let mut b = bind(&name, &["item"], 1, args, kwargs)?;
            let item = req(&mut b, 0);
            items.borrow_mut().push(item);
            Ok(Value::None)
        }
        "extend" => {
            let mut b = bind(&name, &["iterable"], 1, args, kwargs)?;
            let extra = req(&mut b, 0).iterate()?;
            items.borrow_mut().extend(extra);
            Ok(Value::None)
        }
        "pop" => {
            let mut b = bind(&name, &["index"], 0, args, kwargs)?;
            let mut list = items.borrow_mut();
            if list.is_empty() {
                return Err(ScriptError::new(ErrorKind::Index, "pop from empty list"));
            }
            let len = list.len() as i64;
            let i = match opt(&mut b, 0) {
                Some(v) => int_arg(&v, "index")?,
                None => -1,
            };
            let i = if i < 0 { i + len } else { i };
            if i < 0 || i >= len {
                return Err(ScriptError::new(ErrorKind::Index, "pop index out of range"));
            }
            Ok(list.remove(i as usize))
        }
        "insert" => {
            let mut b = bind(&name, &["index", "item"], 2, args, kwargs)?;
            let i = int_arg(&req(&mut b, 0), "index")?;
            let item = req(&mut b, 1);
            let mut list = items.borrow_mut();
            let len = list.len() as i64;
            let i = if i < 0 { (i + len).max(0) } else { i.min(len) };
            list.insert(i as usize, item);
            Ok(Value::None)
        }
        "index" => {
            let mut b = bind(&name, &["item"], 1, args, kwargs)?;
            let item = req(&mut b, 0);
            items
                .borrow()
                .iter()
                .position(|v| v.py_eq(&item))
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| {
                    ScriptError::value_error(format!("{} is not in list", item.repr()))
                })
        }
        "count" => {
            let mut b = bind(&name, &["item"], 1, args, kwargs)?;
            let item = req(&mut b, 0);
            let n = items.borrow().iter().filter(|v| v.py_eq(&item)).count();
            Ok(Value::Int(n as i64))
        }
        "remove" => {
            let mut b = bind(&name, &["item"], 1, args, kwargs)?;
            let item = req(&mut b, 0);
            let mut list = items.borrow_mut();
            match list.iter().position(|v| v.py_eq(&item)) {
                Some(i) => {
                    list.remove(i);
                    Ok(Value::None)
                }
                None => Err(ScriptError::value_error("list.remove(x): x not in list")),
            }
        }
        "sort" => {
            let mut b = bind(&name, &["key", "reverse"], 0, args, kwargs)?;
            let key = opt(&mut b, 0);
            let reverse = opt(&mut b, 1).map(|v| v.truthy()).unwrap_or(false);
            let current = items.borrow().clone();
            let sorted = sort_values(interp, current, key, reverse)?;
            *items.borrow_mut() = sorted;
            Ok(Value::None)
        }
        "reverse" => {
            bind(&name, &[], 0, args, kwargs)?;
            items.borrow_mut().reverse();
            Ok(Value::None)
        }
        _ => Err(no_method("list", method)),
    }
}

fn no_method(type_name: &str, method: &str) -> ScriptError {
    ScriptError::new(
        ErrorKind::Attribute,
        format!("'{}' object has no attribute '{}'", type_name, method),
    )
}

fn dict_method(
    items: &Rc<std::cell::RefCell<IndexMap<String, Value>>>,
    method: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<Value, ScriptError> {
    let name = format!("dict.{}", method);
    match method {
        "get" => {
            let mut b = bind(&name, &["key", "default"], 1, args, kwargs)?;
            let key = req(&mut b, 0).as_key()?;
            let found = items.borrow().get(&key).cloned();
            Ok(found.or_else(|| b[1].take()).unwrap_or(Value::None))
        }
        "keys" => {
            bind(&name, &[], 0, args, kwargs)?;
            Ok(Value::list(items.borrow().keys().map(Value::str).collect()))
        }
        "values" => {
            bind(&name, &[], 0, args, kwargs)?;
            Ok(Value::list(items.borrow().values().cloned().collect()))
        }
        "items" => {
            bind(&name, &[], 0, args, kwargs)?;
            Ok(Value::list(
                items
                    .borrow()
                    .iter()
                    .map(|(k, v)| Value::tuple(vec![Value::str(k), v.clone()]))
                    .collect(),
            ))
        }
        "update" => {
            let mut updates = match args.len() {
                0 => IndexMap::new(),
                1 => pairs_of(&args[0])?,
                _ => return Err(ScriptError::type_error("update expected at most 1 argument")),
            };
            updates.extend(kwargs);
            items.borrow_mut().extend(updates);
            Ok(Value::None)
        }
        "setdefault" => {
            let mut b = bind(&name, &["key", "default"], 1, args, kwargs)?;
            let key = req(&mut b, 0).as_key()?;
            let default = b[1].take().unwrap_or(Value::None);
            let mut map = items.borrow_mut();
            Ok(map.entry(key).or_insert(default).clone())
        }
        "pop" => {
            let mut b = bind(&name, &["key", "default"], 1, args, kwargs)?;
            let keyv = req(&mut b, 0);
            let key = keyv.as_key()?;
            let removed = items.borrow_mut().shift_remove(&key);
            match (removed, b[1].take()) {
                (Some(v), _) => Ok(v),
                (None, Some(default)) => Ok(default),
                (None, None) => Err(ScriptError::new(ErrorKind::Key, keyv.repr())),
            }
        }
        "copy" => {
            bind(&name, &[], 0, args, kwargs)?;
            let copy = items.borrow().clone();
            Ok(Value::dict(copy))
        }
        _ => Err(no_method("dict", method)),
    }
}

fn map_method(
    map: &crate::mapping::MapRef,
    method: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<Value, ScriptError> {
    let name = format!("{}.{}", map.borrow().name(), method);
    match method {
        "get" => {
            let mut b = bind(&name, &["key", "default"], 1, args, kwargs)?;
            let key = req(&mut b, 0).as_key()?;
            let found = map.borrow().lookup(&key);
            Ok(found.or_else(|| b[1].take()).unwrap_or(Value::None))
        }
        "keys" => {
            bind(&name, &[], 0, args, kwargs)?;
            Ok(Value::list(map.borrow().keys().into_iter().map(Value::Str).collect()))
        }
        "values" => {
            bind(&name, &[], 0, args, kwargs)?;
            Ok(Value::list(map.borrow().values()))
        }
        "items" => {
            bind(&name, &[], 0, args, kwargs)?;
            Ok(Value::list(
                map.borrow()
                    .items()
                    .into_iter()
                    .map(|(k, v)| Value::tuple(vec![Value::Str(k), v]))
                    .collect(),
            ))
        }
        "update" => {
            let mut updates = match args.len() {
                0 => IndexMap::new(),
                1 => pairs_of(&args[0])?,
                _ => return Err(ScriptError::type_error("update expected at most 1 argument")),
            };
            updates.extend(kwargs);
            map.borrow_mut().update(&updates)?;
            Ok(Value::None)
        }
        "setdefault" => {
            let mut b = bind(&name, &["key", "default"], 1, args, kwargs)?;
            let key = req(&mut b, 0).as_key()?;
            let default = b[1].take().unwrap_or(Value::None);
            let mut m = map.borrow_mut();
            if let Some(existing) = m.base().get(&key) {
                return Ok(existing.clone());
            }
            m.set(&key, default.clone())?;
            Ok(default)
        }
        "pop" => {
            let mut b = bind(&name, &["key", "default"], 1, args, kwargs)?;
            let keyv = req(&mut b, 0);
            let key = keyv.as_key()?;
            let removed = map.borrow_mut().remove(&key);
            match (removed, b[1].take()) {
                (Some(v), _) => Ok(v),
                (None, Some(default)) => Ok(default),
                (None, None) => Err(ScriptError::new(ErrorKind::Key, keyv.repr())),
            }
        }
        "copy" => {
            bind(&name, &[], 0, args, kwargs)?;
            let copy = map.borrow().base().clone();
            Ok(Value::dict(copy))
        }
        "dump" => {
            bind(&name, &[], 0, args, kwargs)?;
            Ok(Value::from_json(&map.borrow().dump()))
        }
        "fallbacks" => {
            bind(&name, &[], 0, args, kwargs)?;
            Ok(Value::list(
                map.borrow()
                    .fallbacks()
                    .iter()
                    .map(|f| Value::Map(f.clone()))
                    .collect(),
            ))
        }
        _ => Err(no_method("mapping", method)),
    }
}

fn str_method(s: &str, method: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, ScriptError> {
    let name = format!("str.{}", method);
    match method {
        "format" => str_format(s, &args, &kwargs).map(Value::Str),
        "join" => {
            let mut b = bind(&name, &["iterable"], 1, args, kwargs)?;
            let parts = req(&mut b, 0)
                .iterate()?
                .iter()
                .map(|v| match v {
                    Value::Str(s) => Ok(s.clone()),
                    other => Err(ScriptError::type_error(format!(
                        "sequence item: expected str instance, {} found",
                        other.type_name()
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Str(parts.join(s)))
        }
        "split" => {
            let mut b = bind(&name, &["sep", "maxsplit"], 0, args, kwargs)?;
            let sep = opt(&mut b, 0);
            let maxsplit = match opt(&mut b, 1) {
                Some(v) => int_arg(&v, "maxsplit")?,
                None => -1,
            };
            let parts: Vec<String> = match sep {
                None => {
                    if maxsplit < 0 {
                        s.split_whitespace().map(str::to_string).collect()
                    } else {
                        split_whitespace_n(s, maxsplit as usize)
                    }
                }
                Some(sep) => {
                    let sep = str_arg(&sep, "separator")?;
                    if sep.is_empty() {
                        return Err(ScriptError::value_error("empty separator"));
                    }
                    if maxsplit < 0 {
                        s.split(sep.as_str()).map(str::to_string).collect()
                    } else {
                        s.splitn(maxsplit as usize + 1, sep.as_str())
                            .map(str::to_string)
                            .collect()
                    }
                }
            };
            Ok(Value::list(parts.into_iter().map(Value::Str).collect()))
        }
        "splitlines" => {
            bind(&name, &[], 0, args, kwargs)?;
            Ok(Value::list(s.lines().map(Value::str).collect()))
        }
        "strip" | "lstrip" | "rstrip" => {
            let mut b = bind(&name, &["chars"], 0, args, kwargs)?;
            let chars: Option<Vec<char>> = match opt(&mut b, 0) {
                Some(v) => Some(str_arg(&v, "chars")?.chars().collect()),
                None => None,
            };
            let matcher = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            let out = match method {
                "strip" => s.trim_matches(matcher),
                "lstrip" => s.trim_start_matches(matcher),
                _ => s.trim_end_matches(matcher),
            };
            Ok(Value::str(out))
        }
        "startswith" | "endswith" => {
            let mut b = bind(&name, &["prefix"], 1, args, kwargs)?;
            let candidates = match req(&mut b, 0) {
                Value::Tuple(items) => items.as_ref().clone(),
                other => vec![other],
            };
            for c in candidates {
                let c = str_arg(&c, "prefix")?;
                let hit = if method == "startswith" {
                    s.starts_with(c.as_str())
                } else {
                    s.ends_with(c.as_str())
                };
                if hit {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "replace" => {
            let mut b = bind(&name, &["old", "new"], 2, args, kwargs)?;
            let old = str_arg(&req(&mut b, 0), "old")?;
            let new = str_arg(&req(&mut b, 1), "new")?;
            Ok(Value::Str(s.replace(old.as_str(), &new)))
        }
        "upper" => {
            bind(&name, &[], 0, args, kwargs)?;
            Ok(Value::Str(s.to_uppercase()))
        }
        "lower" => {
            bind(&name, &[], 0, args, kwargs)?;
            Ok(Value::Str(s.to_lowercase()))
        }
        "find" => {
            let mut b = bind(&name, &["sub"], 1, args, kwargs)?;
            let sub = str_arg(&req(&mut b, 0), "sub")?;
            Ok(Value::Int(match s.find(sub.as_str()) {
                Some(byte) => s[..byte].chars().count() as i64,
                None => -1,
            }))
        }
        "count" => {
            let mut b = bind(&name, &["sub"], 1, args, kwargs)?;
            let sub = str_arg(&req(&mut b, 0), "sub")?;
            Ok(Value::Int(if sub.is_empty() {
                s.chars().count() as i64 + 1
            } else {
                s.matches(sub.as_str()).count() as i64
            }))
        }
        _ => Err(no_method("str", method)),
    }
}

fn split_whitespace_n(s: &str, maxsplit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if out.len() == maxsplit {
            out.push(rest.to_string());
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                out.push(rest[..end].to_string());
                rest = rest[end..].trim_start();
            }
            None => {
                out.push(rest.to_string());
                break;
            }
        }
    }
    out
}

#[derive(Debug, Default, Clone)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    alt: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
    conv: Option<char>,
}

fn fix_exponent(text: &str) -> String {
    match text.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => text.to_string(),
    }
}

fn general(x: f64, precision: usize, alt: bool) -> String {
    let p = precision.max(1);
    let exp_form = fix_exponent(&format!("{:.*e}", p - 1, x));
    let exponent: i32 = exp_form
        .split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);
    let text = if exponent >= -4 && exponent < p as i32 {
        format!("{:.*}", (p as i32 - 1 - exponent).max(0) as usize, x)
    } else {
        exp_form
    };
    if alt {
        return text;
    }
    match text.split_once('e') {
        Some((mantissa, exp)) => format!("{}e{}", trim_zeros(mantissa), exp),
        None => trim_zeros(&text),
    }
}

fn trim_zeros(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}

/// Render one value under `spec`; `percent` selects `%`-operator defaults.
fn render(value: &Value, spec: &Spec, percent: bool) -> Result<String, ScriptError> {
    let numeric_conv = matches!(
        spec.conv,
        Some('d' | 'i' | 'u' | 'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'x' | 'X' | 'o' | 'b' | '%')
    );
    let is_number = value.as_number().is_some() && !matches!(value, Value::Bool(_));
    let (negative, body) = if numeric_conv || (is_number && spec.conv.is_none()) {
        let conv = spec.conv.unwrap_or(if matches!(value, Value::Float(_)) {
            if spec.precision.is_some() {
                'g'
            } else {
                'r'
            }
        } else {
            'd'
        });
        let f = value.as_float().ok_or_else(|| {
            ScriptError::type_error(format!(
                "%{} format: a number is required, not {}",
                conv,
                value.type_name()
            ))
        })?;
        let negative = f < 0.0 || (f == 0.0 && f.is_sign_negative() && conv != 'd');
        let abs = f.abs();
        let int_abs = || -> u64 {
            match value {
                Value::Int(i) => i.unsigned_abs(),
                _ => abs.trunc() as u64,
            }
        };
        let body = match conv {
            'd' | 'i' | 'u' => int_abs().to_string(),
            'x' => format!("{}{:x}", if spec.alt { "0x" } else { "" }, int_abs()),
            'X' => format!("{}{:X}", if spec.alt { "0X" } else { "" }, int_abs()),
            'o' => format!("{}{:o}", if spec.alt { "0o" } else { "" }, int_abs()),
            'b' => format!("{:b}", int_abs()),
            'f' | 'F' if !abs.is_finite() => non_finite(abs),
            'f' | 'F' => format!("{:.*}", spec.precision.unwrap_or(6), abs),
            'e' | 'E' if !abs.is_finite() => non_finite(abs),
            'e' | 'E' => {
                let text = fix_exponent(&format!("{:.*e}", spec.precision.unwrap_or(6), abs));
                if conv == 'E' {
                    text.to_uppercase()
                } else {
                    text
                }
            }
            'g' | 'G' if !abs.is_finite() => non_finite(abs),
            'g' | 'G' => {
                let text = general(abs, spec.precision.unwrap_or(6), spec.alt);
                if conv == 'G' {
                    text.to_uppercase()
                } else {
                    text
                }
            }
            '%' => format!("{:.*}%", spec.precision.unwrap_or(6), abs * 100.0),
            _ => format_float(abs),
        };
        (negative, body)
    } else {
        let text = match spec.conv {
            Some('r') => value.repr(),
            Some('s') | None => value.to_str(),
            Some('c') => match value {
                Value::Int(i) => u32::try_from(*i)
                    .ok()
                    .and_then(char::from_u32)
                    .map(|c| c.to_string())
                    .ok_or_else(|| ScriptError::value_error("%c arg not in range"))?,
                Value::Str(s) if s.chars().count() == 1 => s.clone(),
                _ => return Err(ScriptError::type_error("%c requires int or char")),
            },
            Some(other) => {
                return Err(ScriptError::value_error(format!(
                    "unsupported format character '{}'",
                    other
                )))
            }
        };
        let text = match spec.precision {
            Some(p) => text.chars().take(p).collect(),
            None => text,
        };
        return Ok(pad(&text, spec, if percent { '>' } else { '<' }));
    };
    let sign = if negative {
        "-"
    } else {
        match spec.sign {
            Some('+') => "+",
            Some(' ') => " ",
            _ => "",
        }
    };
    let len = sign.len() + body.chars().count();
    if spec.zero && spec.align.is_none() && spec.width > len {
        return Ok(format!("{}{}{}", sign, "0".repeat(spec.width - len), body));
    }
    if spec.align == Some('=') && spec.width > len {
        let fill = spec.fill.unwrap_or(' ');
        return Ok(format!(
            "{}{}{}",
            sign,
            fill.to_string().repeat(spec.width - len),
            body
        ));
    }
    Ok(pad(&format!("{}{}", sign, body), spec, '>'))
}

fn non_finite(abs: f64) -> String {
    if abs.is_nan() {
        "nan".to_string()
    } else {
        "inf".to_string()
    }
}

fn pad(text: &str, spec: &Spec, default_align: char) -> String {
    let len = text.chars().count();
    if spec.width <= len {
        return text.to_string();
    }
    let fill = spec.fill.unwrap_or(' ').to_string();
    let gap = spec.width - len;
    match spec.align.unwrap_or(default_align) {
        '<' => format!("{}{}", text, fill.repeat(gap)),
        '^' => format!(
            "{}{}{}",
            fill.repeat(gap / 2),
            text,
            fill.repeat(gap - gap / 2)
        ),
        _ => format!("{}{}", fill.repeat(gap), text),
    }
}

/// The string `%` operator.
pub fn percent_format(fmt: &str, args: &Value) -> Result<String, ScriptError> {
    let values: Vec<Value> = match args {
        Value::Tuple(items) => items.as_ref().clone(),
        other => vec![other.clone()],
    };
    let mapping = matches!(args, Value::Dict(_) | Value::Map(_));
    let chars: Vec<char> = fmt.chars().collect();
    let mut out = String::with_capacity(fmt.len());
    let mut next = 0;
    let mut used_keys = false;
    let mut i = 0;
    let take_number = |i: &mut usize| -> Option<usize> {
        let start = *i;
        while *i < chars.len() && chars[*i].is_ascii_digit() {
            *i += 1;
        }
        chars[start..*i].iter().collect::<String>().parse().ok()
    };
    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        let mut key = None;
        if chars.get(i) == Some(&'(') {
            let close = chars[i..]
                .iter()
                .position(|c| *c == ')')
                .ok_or_else(|| ScriptError::value_error("incomplete format key"))?;
            key = Some(chars[i + 1..i + close].iter().collect::<String>());
            i += close + 1;
        }
        let mut spec = Spec::default();
        while let Some(&flag) = chars.get(i) {
            match flag {
                '-' => spec.align = Some('<'),
                '+' => spec.sign = Some('+'),
                ' ' => {
                    if spec.sign.is_none() {
                        spec.sign = Some(' ')
                    }
                }
                '0' => spec.zero = true,
                '#' => spec.alt = true,
                _ => break,
            }
            i += 1;
        }
        if chars.get(i) == Some(&'*') {
            i += 1;
            let w = values
                .get(next)
                .and_then(Value::as_int)
                .ok_or_else(|| ScriptError::type_error("* wants int"))?;
            next += 1;
            spec.width = w.max(0) as usize;
        } else {
            spec.width = take_number(&mut i).unwrap_or(0);
        }
        if chars.get(i) == Some(&'.') {
            i += 1;
            spec.precision = Some(take_number(&mut i).unwrap_or(0));
        }
        let conv = *chars
            .get(i)
            .ok_or_else(|| ScriptError::value_error("incomplete format"))?;
        i += 1;
        if conv == '%' {
            out.push('%');
            continue;
        }
        if spec.align == Some('<') {
            spec.zero = false;
        }
        spec.conv = Some(conv);
        let value = match key {
            Some(k) => {
                used_keys = true;
                match args {
                    Value::Dict(d) => d.borrow().get(&k).cloned(),
                    Value::Map(m) => m.borrow().lookup(&k),
                    _ => return Err(ScriptError::type_error("format requires a mapping")),
                }
                .ok_or_else(|| ScriptError::new(ErrorKind::Key, repr_str(&k)))?
            }
            None => {
                let v = values.get(next).cloned().ok_or_else(|| {
                    ScriptError::type_error("not enough arguments for format string")
                })?;
                next += 1;
                v
            }
        };
        out.push_str(&render(&value, &spec, true)?);
    }
    if !mapping && !used_keys && next < values.len() {
        return Err(ScriptError::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

fn parse_format_spec(text: &str) -> Result<Spec, ScriptError> {
    let chars: Vec<char> = text.chars().collect();
    let mut spec = Spec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        spec.fill = Some(chars[0]);
        spec.align = Some(chars[1]);
        i = 2;
    } else if !chars.is_empty() && is_align(chars[0]) {
        spec.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c) = chars.get(i) {
        if matches!(c, '+' | '-' | ' ') {
            spec.sign = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'#') {
        spec.alt = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        spec.zero = true;
        i += 1;
    }
    let start = i;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    spec.width = chars[start..i].iter().collect::<String>().parse().unwrap_or(0);
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        spec.precision = chars[start..i].iter().collect::<String>().parse().ok();
    }
    if i < chars.len() {
        spec.conv = Some(chars[i]);
        i += 1;
    }
    if i != chars.len() {
        return Err(ScriptError::value_error(format!(
            "invalid format specifier '{}'",
            text
        )));
    }
    Ok(spec)
}

/// `str.format` with `{}`, `{0}`, `{name}`, `!r`/`!s` and format specs.
pub fn str_format(fmt: &str, args: &[Value], kwargs: &Kwargs) -> Result<String, ScriptError> {
    let mut out = String::with_capacity(fmt.len());
    let mut auto = 0;
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    field.push(n);
                }
                if !closed {
                    return Err(ScriptError::value_error(
                        "expected '}' before end of string",
                    ));
                }
                let (head, spec_text) = match field.split_once(':') {
                    Some((h, s)) => (h.to_string(), s.to_string()),
                    None => (field.clone(), String::new()),
                };
                let (name, conversion) = match head.split_once('!') {
                    Some((n, c)) => (n.to_string(), Some(c.to_string())),
                    None => (head, None),
                };
                let value = if name.is_empty() {
                    let v = args.get(auto).cloned().ok_or_else(|| {
                        ScriptError::new(
                            ErrorKind::Index,
                            "replacement index out of range for positional args",
                        )
                    })?;
                    auto += 1;
                    v
                } else if let Ok(index) = name.parse::<usize>() {
                    args.get(index).cloned().ok_or_else(|| {
                        ScriptError::new(
                            ErrorKind::Index,
                            format!("replacement index {} out of range", index),
                        )
                    })?
                } else {
                    kwargs
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| ScriptError::new(ErrorKind::Key, repr_str(&name)))?
                };
                let value = match conversion.as_deref() {
                    Some("r") => Value::Str(value.repr()),
                    Some("s") => Value::Str(value.to_str()),
                    Some(other) => {
                        return Err(ScriptError::value_error(format!(
                            "unknown conversion specifier {}",
                            other
                        )))
                    }
                    None => value,
                };
                let spec = parse_format_spec(&spec_text)?;
                out.push_str(&render(&value, &spec, false)?);
            }
            '}' => {
                return Err(ScriptError::value_error(
                    "single '}' encountered in format string",
                ))
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(items: Vec<Value>) -> Value {
        Value::tuple(items)
    }

    #[test]
    fn percent_format_common_conversions() {
        assert_eq!(
            percent_format("%s-%03d-%.2f", &t(vec![Value::str("run"), Value::Int(7), Value::Float(3.14159)]))
                .expect("fmt"),
            "run-007-3.14"
        );
        assert_eq!(percent_format("%r", &Value::str("a")).expect("fmt"), "'a'");
        assert_eq!(percent_format("%5s|%-5s|", &t(vec![Value::str("a"), Value::str("b")])).expect("fmt"), "    a|b    |");
        assert_eq!(percent_format("%x %g %%", &t(vec![Value::Int(255), Value::Float(0.0001)])).expect("fmt"), "ff 0.0001 %");
        assert_eq!(percent_format("%g", &Value::Float(1e-5)).expect("fmt"), "1e-05");
        assert_eq!(percent_format("%e", &Value::Float(1500.0)).expect("fmt"), "1.500000e+03");
    }

    #[test]
    fn percent_format_extreme_integers() {
        assert_eq!(percent_format("%d", &Value::Int(i64::MIN)).expect("fmt"), "-9223372036854775808");
        assert_eq!(percent_format("%x", &Value::Int(i64::MIN)).expect("fmt"), "-8000000000000000");
        assert_eq!(percent_format("%d", &Value::Int(i64::MAX)).expect("fmt"), "9223372036854775807");
    }

    #[test]
    fn percent_format_argument_count_is_checked() {
        assert!(percent_format("%s %s", &Value::str("x")).is_err());
        assert!(percent_format("%s", &t(vec![Value::Int(1), Value::Int(2)])).is_err());
    }

    #[test]
    fn percent_format_with_mapping_keys() {
        let mut d = IndexMap::new();
        d.insert("n".to_string(), Value::Int(3));
        assert_eq!(percent_format("n=%(n)d", &Value::dict(d)).expect("fmt"), "n=3");
    }

    #[test]
    fn str_format_positions_names_and_specs() {
        let mut kw = Kwargs::new();
        kw.insert("name".into(), Value::str("equil"));
        let out = str_format(
            "{} {1!r} {name:>7} {0:.3f} {{x}}",
            &[Value::Float(2.0), Value::str("b")],
            &kw,
        )
        .expect("format");
        assert_eq!(out, "2.0 'b'   equil 2.000 {x}");
    }

    #[test]
    fn bind_reports_missing_and_unexpected_arguments() {
        let err = bind("f", &["a", "b"], 2, vec![Value::Int(1)], Kwargs::new()).expect_err("missing");
        assert!(err.message.contains("'b'"));
        let mut kw = Kwargs::new();
        kw.insert("zzz".into(), Value::None);
        assert!(bind("f", &["a"], 0, vec![], kw).is_err());
    }

    #[test]
    fn builtins_behave_through_the_interpreter() {
        let mut interp = Interpreter::new();
        let m = interp
            .load_source(
                "__main__",
                "main.py",
                "a = sorted([3, 1, 2], reverse=True)\nb = ', '.join(['x', 'y'])\nc = dict(zip(['k', 'j'], [1, 2]))\nd = 'a b  c'.split()\ne = round(2.5)\nf = max([1, 5, 2])\ng = isinstance(True, int)\nh = '  pad '.strip()\n",
            )
            .expect("run");
        assert_eq!(m.get("a").expect("a").repr(), "[3, 2, 1]");
        assert_eq!(m.get("b").expect("b"), Value::str("x, y"));
        assert_eq!(m.get("c").expect("c").repr(), "{'k': 1, 'j': 2}");
        assert_eq!(m.get("d").expect("d").repr(), "['a', 'b', 'c']");
        assert_eq!(m.get("e").expect("e"), Value::Int(2));
        assert_eq!(m.get("f").expect("f"), Value::Int(5));
        assert_eq!(m.get("g").expect("g"), Value::Bool(true));
        assert_eq!(m.get("h").expect("h"), Value::str("pad"));
    }
}
