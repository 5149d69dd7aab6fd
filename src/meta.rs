//! Structured metadata attached to data, trees, tasks and targets.
//!
//! [`Meta`] is a thin wrapper over a JSON value. Object keys are addressed
//! with [`Name`] paths, so `meta.get("endpoints.square")` walks two levels of
//! nested objects, and a token index such as `samples[2]` selects an element
//! of an array.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::Hash32;
use crate::name::Name;

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meta(Value);

impl Meta {
    pub fn empty() -> Self {
        Meta(Value::Null)
    }

    pub fn new(value: impl Into<Value>) -> Self {
        Meta(value.into())
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Look up a nested value.
    pub fn get_value(&self, key: impl Into<Name>) -> Option<&Value> {
        let key = key.into();
        let mut node = &self.0;

        for token in key.tokens() {
            node = node.as_object()?.get(token.body())?;
            if let Some(index) = token.index() {
                let index: usize = index.parse().ok()?;
                node = node.as_array()?.get(index)?;
            }
        }

        Some(node)
    }

    /// Look up a nested item as a standalone [`Meta`].
    pub fn get(&self, key: impl Into<Name>) -> Option<Meta> {
        self.get_value(key).cloned().map(Meta)
    }

    pub fn get_str(&self, key: impl Into<Name>) -> Option<&str> {
        self.get_value(key)?.as_str()
    }

    pub fn get_i64(&self, key: impl Into<Name>) -> Option<i64> {
        self.get_value(key)?.as_i64()
    }

    pub fn get_bool(&self, key: impl Into<Name>) -> Option<bool> {
        self.get_value(key)?.as_bool()
    }

    /// Read a nested item into a typed value.
    pub fn get_as<T: for<'de> Deserialize<'de>>(
        &self,
        key: impl Into<Name>,
    ) -> Option<Result<T, serde_json::Error>> {
        self.get_value(key)
            .map(|value| T::deserialize(value.clone()))
    }

    /// Set a nested value, intermediate objects are created as needed and
    /// non-object values on the way are replaced.
    pub fn set(&mut self, key: impl Into<Name>, value: impl Into<Value>) {
        let key = key.into();
        let Some((last, path)) = key.tokens().split_last() else {
            self.0 = value.into();
            return;
        };

        let mut node = &mut self.0;
        for token in path {
            node = object_mut(node)
                .entry(token.body())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        object_mut(node).insert(last.body().to_owned(), value.into());
    }

    /// Builder flavour of [`Meta::set`].
    pub fn with(mut self, key: impl Into<Name>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Deep merge, values of `overlay` win over the values of `self`.
    pub fn merge(&self, overlay: &Meta) -> Meta {
        let mut value = self.0.clone();
        merge_into(&mut value, &overlay.0);
        Meta(value)
    }

    /// Top level items of an object meta.
    pub fn items(&self) -> Vec<(String, Meta)> {
        match &self.0 {
            Value::Object(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), Meta(value.clone())))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Canonical byte form, object keys are written in sorted order so that
    /// equal metas always produce equal bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        // serializing a `Value` can't fail
        serde_json::to_vec(&canonical(&self.0)).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        if bytes.is_empty() {
            return Ok(Meta::empty());
        }
        serde_json::from_slice(bytes).map(Meta)
    }

    pub fn hash(&self) -> Hash32 {
        Hash32::hash(self.to_bytes())
    }
}

fn object_mut(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn merge_into(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (base, overlay) => *base = overlay.clone(),
    }
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonical(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

impl From<Value> for Meta {
    fn from(value: Value) -> Self {
        Meta(value)
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl fmt::Debug for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Meta({self})")
    }
}
