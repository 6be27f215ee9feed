//! Runtime values.
//!
//! Lists and dicts are shared by reference like their Python counterparts;
//! tuples are immutable and may share storage freely.

use crate::ast::{ParamKind, Stmt};
use crate::error::ScriptError;
use crate::interp::Interpreter;
use crate::mapping::{LayeredMap, MapRef};
use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

pub type Namespace = Rc<RefCell<IndexMap<String, Value>>>;
pub type Kwargs = IndexMap<String, Value>;
pub type NativeFn = Rc<dyn Fn(&mut Interpreter, Vec<Value>, Kwargs) -> Result<Value, ScriptError>>;

pub fn new_namespace() -> Namespace {
    Rc::new(RefCell::new(IndexMap::new()))
}

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<IndexMap<String, Value>>>),
    Map(MapRef),
    Func(Rc<Function>),
    Module(Rc<Module>),
    Context(Rc<ContextManager>),
}

#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub file: String,
    pub globals: Namespace,
}

impl Module {
    pub fn new(name: impl Into<String>, file: impl Into<String>) -> Self {
        let name = name.into();
        let file = file.into();
        let globals = new_namespace();
        {
            let mut g = globals.borrow_mut();
            g.insert("__name__".to_string(), Value::Str(name.clone()));
            g.insert("__file__".to_string(), Value::Str(file.clone()));
        }
        Self {
            name,
            file,
            globals,
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: Value) {
        self.globals.borrow_mut().insert(name.to_string(), value);
    }

    /// Names listed in `__all__` when the module declares it.
    pub fn declared_all(&self) -> Option<Vec<String>> {
        match self.get("__all__")? {
            Value::List(items) => Some(items.borrow().iter().map(|v| v.to_str()).collect()),
            Value::Tuple(items) => Some(items.iter().map(|v| v.to_str()).collect()),
            _ => None,
        }
    }

    /// Public names: `__all__` if present, otherwise every name without a
    /// leading underscore.
    pub fn exported_names(&self) -> Vec<String> {
        if let Some(all) = self.declared_all() {
            return all;
        }
        self.globals
            .borrow()
            .keys()
            .filter(|k| !k.starts_with('_'))
            .cloned()
            .collect()
    }

    /// A string list stored under `name`, empty when absent.
    pub fn string_list(&self, name: &str) -> Vec<String> {
        match self.get(name) {
            Some(Value::List(items)) => items.borrow().iter().map(|v| v.to_str()).collect(),
            Some(Value::Tuple(items)) => items.iter().map(|v| v.to_str()).collect(),
            _ => Vec::new(),
        }
    }
}

pub enum ContextManager {
    TimeLimit(Duration),
}

pub struct ParamSpec {
    pub name: String,
    pub default: Option<Value>,
    pub kind: ParamKind,
}

pub struct ScriptFunction {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub body: Rc<Vec<Stmt>>,
    pub globals: Namespace,
    pub file: String,
}

pub struct NativeFunction {
    pub name: String,
    pub params: Vec<String>,
    pub func: NativeFn,
}

/// Receives every call made through a [`Function::Reported`] wrapper before
/// the wrapped function runs.
pub trait CallHook {
    fn on_call(&self, func: &Function, args: &[Value], kwargs: &Kwargs) -> Result<(), ScriptError>;
}

pub struct ReportedFunction {
    pub inner: Rc<Function>,
    pub hook: Rc<dyn CallHook>,
}

pub struct BoundMethod {
    pub receiver: Value,
    pub method: String,
}

pub enum Function {
    Script(ScriptFunction),
    Native(NativeFunction),
    Reported(ReportedFunction),
    Bound(BoundMethod),
}

impl Function {
    pub fn native(
        name: &str,
        params: &[&str],
        func: impl Fn(&mut Interpreter, Vec<Value>, Kwargs) -> Result<Value, ScriptError> + 'static,
    ) -> Self {
        Function::Native(NativeFunction {
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            func: Rc::new(func),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Function::Script(f) => &f.name,
            Function::Native(f) => &f.name,
            Function::Reported(f) => f.inner.name(),
            Function::Bound(m) => &m.method,
        }
    }

    /// Declared positional parameter names, in order.
    pub fn positional_params(&self) -> Vec<String> {
        match self {
            Function::Script(f) => f
                .params
                .iter()
                .filter(|p| p.kind == ParamKind::Normal)
                .map(|p| p.name.clone())
                .collect(),
            Function::Native(f) => f.params.clone(),
            Function::Reported(f) => f.inner.positional_params(),
            Function::Bound(_) => Vec::new(),
        }
    }

    pub fn is_reported(&self) -> bool {
        matches!(self, Function::Reported(_))
    }
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(items: IndexMap<String, Value>) -> Self {
        Value::Dict(Rc::new(RefCell::new(items)))
    }

    pub fn map(map: LayeredMap) -> Self {
        Value::Map(Rc::new(RefCell::new(map)))
    }

    pub fn func(f: Function) -> Self {
        Value::Func(Rc::new(f))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Map(_) => "mapping",
            Value::Func(_) => "function",
            Value::Module(_) => "module",
            Value::Context(_) => "context",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(items) => !items.borrow().is_empty(),
            Value::Map(map) => !map.borrow().is_empty(),
            Value::Func(_) | Value::Module(_) | Value::Context(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Dict keys are strings; integers are accepted and stored by their text.
    pub fn as_key(&self) -> Result<String, ScriptError> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Bool(b) => Ok(if *b { "True" } else { "False" }.to_string()),
            other => Err(ScriptError::type_error(format!(
                "dict keys must be str or int, not {}",
                other.type_name()
            ))),
        }
    }

    /// Materialize an iterable into a vector of items.
    pub fn iterate(&self) -> Result<Vec<Value>, ScriptError> {
        match self {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Tuple(items) => Ok(items.as_ref().clone()),
            Value::Dict(items) => Ok(items.borrow().keys().map(|k| Value::str(k)).collect()),
            Value::Map(map) => Ok(map.borrow().keys().into_iter().map(Value::Str).collect()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    /// `str(value)`.
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => repr_str(s),
            Value::List(items) => {
                let parts: Vec<String> = items.borrow().iter().map(Value::repr).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(Value::repr).collect();
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Value::Dict(items) => repr_items(items.borrow().iter()),
            Value::Map(map) => repr_items(map.borrow().base().iter()),
            Value::Func(f) => format!("<function {}>", f.name()),
            Value::Module(m) => format!("<module '{}'>", m.name),
            Value::Context(ctx) => match ctx.as_ref() {
                ContextManager::TimeLimit(d) => format!("<time_limit {}s>", d.as_secs_f64()),
            },
        }
    }

    /// Python `==`.
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || seq_eq(&a.borrow(), &b.borrow())
            }
            (Value::Tuple(a), Value::Tuple(b)) => seq_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => {
                Rc::ptr_eq(a, b) || map_eq(&a.borrow(), &b.borrow())
            }
            (Value::Map(a), Value::Map(b)) => {
                Rc::ptr_eq(a, b) || map_eq(a.borrow().base(), b.borrow().base())
            }
            (Value::Dict(a), Value::Map(b)) | (Value::Map(b), Value::Dict(a)) => {
                map_eq(&a.borrow(), b.borrow().base())
            }
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            (Value::Context(a), Value::Context(b)) => Rc::ptr_eq(a, b),
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(Number::Int(x)), Some(Number::Int(y))) => x == y,
                (Some(x), Some(y)) => x.as_f64() == y.as_f64(),
                _ => false,
            },
        }
    }

    /// Python `is`: identity for shared containers, equality for scalars.
    pub fn py_is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn py_cmp(&self, other: &Value) -> Result<Ordering, ScriptError> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::List(a), Value::List(b)) => seq_cmp(&a.borrow(), &b.borrow()),
            (Value::Tuple(a), Value::Tuple(b)) => seq_cmp(a, b),
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(Number::Int(x)), Some(Number::Int(y))) => Ok(x.cmp(&y)),
                (Some(x), Some(y)) => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .ok_or_else(|| ScriptError::value_error("cannot order NaN")),
                _ => Err(ScriptError::type_error(format!(
                    "'<' not supported between instances of '{}' and '{}'",
                    a.type_name(),
                    b.type_name()
                ))),
            },
        }
    }

    pub(crate) fn as_number(&self) -> Option<Number> {
        match self {
            Value::Bool(b) => Some(Number::Int(*b as i64)),
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::list(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

fn seq_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
}

fn map_eq(a: &IndexMap<String, Value>, b: &IndexMap<String, Value>) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(k, v)| b.get(k).map(|w| v.py_eq(w)).unwrap_or(false))
}

fn seq_cmp(a: &[Value], b: &[Value]) -> Result<Ordering, ScriptError> {
    for (x, y) in a.iter().zip(b) {
        if x.py_eq(y) {
            continue;
        }
        return x.py_cmp(y);
    }
    Ok(a.len().cmp(&b.len()))
}

fn repr_items<'a>(items: impl Iterator<Item = (&'a String, &'a Value)>) -> String {
    let parts: Vec<String> = items
        .map(|(k, v)| format!("{}: {}", repr_str(k), v.repr()))
        .collect();
    format!("{{{}}}", parts.join(", "))
}

pub fn repr_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Float text the way Python prints it: `1.0`, `0.25`, `1e+20`.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let text = format!("{:e}", f);
        return match text.split_once('e') {
            Some((mantissa, exp)) => {
                let (sign, digits) = match exp.strip_prefix('-') {
                    Some(d) => ('-', d),
                    None => ('+', exp),
                };
                format!("{}e{}{:0>2}", mantissa, sign, digits)
            }
            None => text,
        };
    }
    if f.fract() == 0.0 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.py_eq(other)
    }
}

/// Functions, modules and context managers serialize as their repr so that a
/// state snapshot never fails on a stray callable.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::None => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => {
                if f.is_finite() {
                    serializer.serialize_f64(*f)
                } else {
                    serializer.serialize_unit()
                }
            }
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(items) => serialize_seq(serializer, &items.borrow()),
            Value::Tuple(items) => serialize_seq(serializer, items),
            Value::Dict(items) => serialize_map(serializer, &items.borrow()),
            Value::Map(map) => serialize_map(serializer, map.borrow().base()),
            other => serializer.serialize_str(&other.repr()),
        }
    }
}

fn serialize_seq<S: Serializer>(serializer: S, items: &[Value]) -> Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_seq(Some(items.len()))?;
    for item in items {
        seq.serialize_element(item)?;
    }
    seq.end()
}

fn serialize_map<S: Serializer>(
    serializer: S,
    items: &IndexMap<String, Value>,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(items.len()))?;
    for (k, v) in items {
        map.serialize_entry(k, v)?;
    }
    map.end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn repr_matches_python_conventions() {
        let mut d = IndexMap::new();
        d.insert("b".to_string(), Value::Int(3));
        assert_eq!(Value::dict(d).repr(), "{'b': 3}");
        assert_eq!(Value::str("it's").repr(), "\"it's\"");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");
        assert_eq!(Value::Float(2.0).repr(), "2.0");
        assert_eq!(Value::Float(1e20).repr(), "1e+20");
        assert_eq!(Value::Float(0.5).repr(), "0.5");
        assert_eq!(Value::list(vec![Value::None, Value::Bool(true)]).repr(), "[None, True]");
    }

    #[test]
    fn numeric_equality_crosses_int_and_float() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::str("1").py_eq(&Value::Int(1)));
    }

    #[test]
    fn ordering_rejects_mixed_types() {
        assert!(Value::Int(1).py_cmp(&Value::str("a")).is_err());
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::Int(2)])
                .py_cmp(&Value::list(vec![Value::Int(1), Value::Int(3)]))
                .expect("cmp"),
            Ordering::Less
        );
    }

    #[test]
    fn json_conversion_keeps_order_and_types() {
        let source = json!({"z": 1, "a": [1.5, "x", null], "m": {"k": true}});
        let value = Value::from_json(&source);
        assert_eq!(value.to_json(), source);
        let keys: Vec<String> = value.iterate().expect("keys").iter().map(|k| k.to_str()).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn functions_serialize_as_repr() {
        let f = Value::func(Function::native("noop", &[], |_, _, _| Ok(Value::None)));
        assert_eq!(f.to_json(), json!("<function noop>"));
    }
}
