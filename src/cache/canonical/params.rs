use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

use super::{Canonical, Canonicalizer};
use crate::cache::object::{ObjectRef, ObjectSet, OsdkObject};

/// A parameter value accepted by function and aggregation queries.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Json(Value),
    /// Reduced to `{"$apiName", "$primaryKey"}`.
    Object(ObjectRef),
    /// Reduced to its wire form.
    ObjectSet(ObjectSet),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<ObjectRef> for ParamValue {
    fn from(value: ObjectRef) -> Self {
        Self::Object(value)
    }
}

impl From<&OsdkObject> for ParamValue {
    fn from(value: &OsdkObject) -> Self {
        Self::Object(value.object_ref())
    }
}

impl From<ObjectSet> for ParamValue {
    fn from(value: ObjectSet) -> Self {
        Self::ObjectSet(value)
    }
}

impl From<Vec<ParamValue>> for ParamValue {
    fn from(value: Vec<ParamValue>) -> Self {
        Self::List(value)
    }
}

/// Canonicalizes JSON-shaped parameters, where clauses and aggregation specs.
///
/// Object keys are deep-sorted, so `{a, b}` and `{b, a}` intern to the same
/// instance. Array order is preserved.
#[derive(Debug)]
pub struct ParamsCanonicalizer {
    interned: Canonicalizer<Value>,
    depth_limit: usize,
}

impl ParamsCanonicalizer {
    pub fn new(depth_limit: usize) -> Self {
        Self {
            interned: Canonicalizer::new("params"),
            depth_limit,
        }
    }

    pub fn depth_limit(&self) -> usize {
        self.depth_limit
    }

    /// Canonicalize a named parameter map.
    pub fn canonicalize(&self, params: &BTreeMap<String, ParamValue>) -> Canonical<Value> {
        let map = params
            .iter()
            .map(|(name, value)| (name.clone(), self.normalize(value, 1)))
            .collect::<Map<_, _>>();
        self.interned.intern(Value::Object(map))
    }

    pub fn canonicalize_value(&self, value: &ParamValue) -> Canonical<Value> {
        self.interned.intern(self.normalize(value, 0))
    }

    /// Canonicalize a plain JSON value (where clause, aggregation spec).
    pub fn canonicalize_json(&self, value: &Value) -> Canonical<Value> {
        self.interned.intern(self.sort_json(value, 0))
    }

    /// Intern a JSON value without normalizing it.
    pub(crate) fn intern_raw(&self, value: Value) -> Canonical<Value> {
        self.interned.intern(value)
    }

    pub(crate) fn sort_json(&self, value: &Value, depth: usize) -> Value {
        if depth > self.depth_limit {
            debug!(depth, limit = self.depth_limit, "Canonical depth limit reached");
            return value.clone();
        }
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|(left, _), (right, _)| left.cmp(right));
                Value::Object(
                    entries
                        .into_iter()
                        .map(|(key, item)| (key.clone(), self.sort_json(item, depth + 1)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.sort_json(item, depth + 1))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn normalize(&self, value: &ParamValue, depth: usize) -> Value {
        if depth > self.depth_limit {
            debug!(depth, limit = self.depth_limit, "Canonical depth limit reached");
            return raw_json(value);
        }
        match value {
            ParamValue::Json(json) => self.sort_json(json, depth),
            ParamValue::Object(object) => object_ref_json(object),
            ParamValue::ObjectSet(set) => self.sort_json(&set.to_json(), depth),
            ParamValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.normalize(item, depth + 1))
                    .collect(),
            ),
            ParamValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, item)| (key.clone(), self.normalize(item, depth + 1)))
                    .collect(),
            ),
        }
    }
}

fn object_ref_json(object: &ObjectRef) -> Value {
    let mut map = Map::new();
    map.insert("$apiName".to_string(), Value::from(object.api_name.as_str()));
    map.insert("$primaryKey".to_string(), object.primary_key.to_value());
    Value::Object(map)
}

fn raw_json(value: &ParamValue) -> Value {
    match value {
        ParamValue::Json(json) => json.clone(),
        ParamValue::Object(object) => object_ref_json(object),
        ParamValue::ObjectSet(set) => set.to_json(),
        ParamValue::List(items) => Value::Array(items.iter().map(raw_json).collect()),
        ParamValue::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), raw_json(item)))
                .collect(),
        ),
    }
}
