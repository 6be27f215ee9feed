//! Layered mapping backing `state`, `settings` and `expt`.
//!
//! Reads consult the base table and then each fallback in order; writes only
//! ever touch the base. Fallbacks are shared handles, never copies.

use crate::error::{ErrorKind, ScriptError};
use crate::value::Value;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

pub type MapRef = Rc<RefCell<LayeredMap>>;

/// Method names and internals that can never be stored as keys.
pub const RESERVED_NAMES: &[&str] = &[
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
    "_name",
    "_fallbacks",
    "_strict",
    "_underscores",
];

pub fn is_reserved(key: &str) -> bool {
    RESERVED_NAMES.contains(&key)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("'{key}' is a reserved name and cannot be stored in '{name}'")]
    Reserved { name: String, key: String },
    #[error("'{name}' has no key '{key}'")]
    Missing { name: String, key: String },
    #[error("keys in '{name}' collide once spaces become underscores: {pairs}")]
    Collision { name: String, pairs: String },
}

impl From<MappingError> for ScriptError {
    fn from(err: MappingError) -> Self {
        let kind = match err {
            MappingError::Missing { .. } => ErrorKind::Attribute,
            _ => ErrorKind::Value,
        };
        ScriptError::new(kind, err.to_string())
    }
}

pub struct LayeredMap {
    name: String,
    base: IndexMap<String, Value>,
    fallbacks: Vec<MapRef>,
    strict: bool,
    underscores: bool,
}

impl LayeredMap {
    pub fn new(
        name: impl Into<String>,
        base: IndexMap<String, Value>,
        fallbacks: Vec<MapRef>,
        strict: bool,
        underscores: bool,
    ) -> Result<Self, MappingError> {
        let name = name.into();
        let mut normalized = IndexMap::with_capacity(base.len());
        if underscores {
            let mut seen: IndexMap<String, String> = IndexMap::new();
            let mut pairs = Vec::new();
            for key in base.keys() {
                let norm = key.replace(' ', "_");
                if let Some(first) = seen.get(&norm) {
                    pairs.push(format!("'{}' and '{}'", first, key));
                } else {
                    seen.insert(norm, key.clone());
                }
            }
            if !pairs.is_empty() {
                return Err(MappingError::Collision {
                    name,
                    pairs: pairs.join(", "),
                });
            }
        }
        for (key, value) in base {
            let key = if underscores {
                key.replace(' ', "_")
            } else {
                key
            };
            if is_reserved(&key) {
                return Err(MappingError::Reserved { name, key });
            }
            normalized.insert(key, value);
        }
        Ok(Self {
            name,
            base: normalized,
            fallbacks,
            strict,
            underscores,
        })
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: IndexMap::new(),
            fallbacks: Vec::new(),
            strict: false,
            underscores: false,
        }
    }

    /// Rebuild a mapping from its JSON dump; the caller re-attaches fallbacks.
    pub fn from_json(
        name: impl Into<String>,
        json: &serde_json::Value,
        strict: bool,
        underscores: bool,
    ) -> Result<Self, MappingError> {
        let base = match json {
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect(),
            _ => IndexMap::new(),
        };
        Self::new(name, base, Vec::new(), strict, underscores)
    }

    pub fn into_ref(self) -> MapRef {
        Rc::new(RefCell::new(self))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn underscores(&self) -> bool {
        self.underscores
    }

    pub fn fallbacks(&self) -> &[MapRef] {
        &self.fallbacks
    }

    pub fn set_fallbacks(&mut self, fallbacks: Vec<MapRef>) {
        self.fallbacks = fallbacks;
    }

    pub fn base(&self) -> &IndexMap<String, Value> {
        &self.base
    }

    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    fn normalize<'k>(&self, key: &'k str) -> std::borrow::Cow<'k, str> {
        if self.underscores && key.contains(' ') {
            std::borrow::Cow::Owned(key.replace(' ', "_"))
        } else {
            std::borrow::Cow::Borrowed(key)
        }
    }

    /// Base, then fallbacks in order; `None` on a miss regardless of
    /// strictness.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        let key = self.normalize(key);
        if let Some(v) = self.base.get(key.as_ref()) {
            return Some(v.clone());
        }
        self.fallbacks
            .iter()
            .find_map(|fb| fb.borrow().lookup(key.as_ref()))
    }

    pub fn get(&self, key: &str) -> Result<Value, MappingError> {
        match self.lookup(key) {
            Some(v) => Ok(v),
            None if self.strict => Err(MappingError::Missing {
                name: self.name.clone(),
                key: key.to_string(),
            }),
            None => Ok(Value::None),
        }
    }

    /// Base-only membership, matching `keys()`.
    pub fn contains(&self, key: &str) -> bool {
        self.base.contains_key(self.normalize(key).as_ref())
    }

    pub fn set(&mut self, key: &str, value: Value) -> Result<(), MappingError> {
        let key = self.normalize(key).into_owned();
        if is_reserved(&key) {
            return Err(MappingError::Reserved {
                name: self.name.clone(),
                key,
            });
        }
        self.base.insert(key, value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let key = self.normalize(key).into_owned();
        self.base.shift_remove(&key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.base.keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.base.values().cloned().collect()
    }

    pub fn items(&self) -> Vec<(String, Value)> {
        self.base
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn update(&mut self, items: &IndexMap<String, Value>) -> Result<(), MappingError> {
        for (k, v) in items {
            self.set(k, v.clone())?;
        }
        Ok(())
    }

    /// JSON of the base table only.
    pub fn dump(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.base
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(pairs: &[(&str, i64)]) -> IndexMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Int(*v)))
            .collect()
    }

    #[test]
    fn lookup_walks_base_then_fallbacks_in_order() {
        let f1 = LayeredMap::new("f1", base(&[("a", 1), ("b", 1)]), vec![], false, false)
            .expect("f1")
            .into_ref();
        let f2 = LayeredMap::new("f2", base(&[("b", 2), ("c", 2)]), vec![], false, false)
            .expect("f2")
            .into_ref();
        let m = LayeredMap::new("m", base(&[("a", 0)]), vec![f1, f2], false, false).expect("m");
        assert_eq!(m.get("a").expect("a"), Value::Int(0));
        assert_eq!(m.get("b").expect("b"), Value::Int(1));
        assert_eq!(m.get("c").expect("c"), Value::Int(2));
        assert!(m.get("zzz").expect("lenient").is_none());
    }

    #[test]
    fn strict_miss_is_an_error() {
        let m = LayeredMap::new("expt", IndexMap::new(), vec![], true, false).expect("m");
        assert!(matches!(m.get("nope"), Err(MappingError::Missing { .. })));
    }

    #[test]
    fn writes_stay_in_base_and_fallbacks_are_shared() {
        let settings = LayeredMap::new("settings", base(&[("x", 1)]), vec![], false, false)
            .expect("settings")
            .into_ref();
        let mut state =
            LayeredMap::new("state", IndexMap::new(), vec![settings.clone()], false, false)
                .expect("state");
        state.set("x", Value::Int(5)).expect("set");
        assert_eq!(settings.borrow().get("x").expect("x"), Value::Int(1));
        settings
            .borrow_mut()
            .set("y", Value::Int(9))
            .expect("set y");
        assert_eq!(state.get("y").expect("y"), Value::Int(9));
    }

    #[test]
    fn reserved_names_are_rejected() {
        let mut m = LayeredMap::empty("state");
        assert!(matches!(
            m.set("keys", Value::None),
            Err(MappingError::Reserved { .. })
        ));
        assert!(LayeredMap::new("s", base(&[("dump", 1)]), vec![], false, false).is_err());
    }

    #[test]
    fn underscore_normalization_accepts_both_spellings() {
        let m = LayeredMap::new("s", base(&[("time step", 2)]), vec![], false, true).expect("m");
        assert_eq!(m.get("time_step").expect("u"), Value::Int(2));
        assert_eq!(m.get("time step").expect("s"), Value::Int(2));
    }

    #[test]
    fn underscore_collision_names_both_keys() {
        let err = LayeredMap::new("s", base(&[("a b", 1), ("a_b", 2)]), vec![], false, true)
            .err()
            .expect("collision");
        let text = err.to_string();
        assert!(text.contains("'a b'") && text.contains("'a_b'"), "{}", text);
    }

    #[test]
    fn dump_and_reload_keep_base_only() {
        let fb = LayeredMap::new("fb", base(&[("hidden", 1)]), vec![], false, false)
            .expect("fb")
            .into_ref();
        let m = LayeredMap::new("m", base(&[("_error", 3), ("k", 4)]), vec![fb], false, false)
            .expect("m");
        let dumped = m.dump();
        assert_eq!(dumped, serde_json::json!({"_error": 3, "k": 4}));
        let back = LayeredMap::from_json("m", &dumped, false, false).expect("reload");
        assert!(back.fallbacks().is_empty());
        assert_eq!(back.get("k").expect("k"), Value::Int(4));
    }
}
