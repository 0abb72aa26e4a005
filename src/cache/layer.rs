//! Layered copy-on-write entry storage.
//!
//! The bottom layer holds confirmed ("truth") entries; optimistic layers,
//! each tagged with an [`OptimisticId`], stack above it. Reads walk the stack
//! top-down and return the first entry found. Entries are immutable: a write
//! replaces the `Arc<Entry>` for its key in one layer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::CacheError;
use super::keys::CacheKey;
use super::object::OsdkObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Init,
    Loading,
    Loaded,
    Error,
}

/// Identity of an optimistic layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptimisticId(Uuid);

impl OptimisticId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OptimisticId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OptimisticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ordered member keys of a list or link result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    pub data: Vec<CacheKey>,
    pub total_count: Option<u64>,
    pub next_page_token: Option<String>,
}

/// A stored value. Equality is deep; use [`StoreValue::same_ref`] for identity.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Object(Arc<OsdkObject>),
    Collection(Arc<Collection>),
    Json(Arc<Value>),
    /// Deleted; shadows any value beneath it.
    Tombstone,
}

impl StoreValue {
    pub fn same_ref(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            (Self::Collection(a), Self::Collection(b)) => Arc::ptr_eq(a, b),
            (Self::Json(a), Self::Json(b)) => Arc::ptr_eq(a, b),
            (Self::Tombstone, Self::Tombstone) => true,
            _ => false,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<OsdkObject>> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Arc<Collection>> {
        match self {
            Self::Collection(collection) => Some(collection),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Arc<Value>> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }
}

fn same_value(a: Option<&StoreValue>, b: Option<&StoreValue>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_ref(b),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub cache_key: CacheKey,
    pub value: Option<StoreValue>,
    pub status: Status,
    /// Milliseconds since the Unix epoch.
    pub last_updated: i64,
    pub error: Option<Arc<CacheError>>,
}

impl Entry {
    /// Placeholder for a key that has never been written.
    pub fn init(cache_key: CacheKey) -> Self {
        Self {
            cache_key,
            value: None,
            status: Status::Init,
            last_updated: 0,
            error: None,
        }
    }

    /// Live object value; `None` for tombstones and non-objects.
    pub fn object(&self) -> Option<&Arc<OsdkObject>> {
        self.value.as_ref().and_then(StoreValue::as_object)
    }

    pub fn collection(&self) -> Option<&Arc<Collection>> {
        self.value.as_ref().and_then(StoreValue::as_collection)
    }

    pub fn json(&self) -> Option<&Arc<Value>> {
        self.value.as_ref().and_then(StoreValue::as_json)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.as_ref().is_some_and(StoreValue::is_tombstone)
    }
}

#[derive(Debug, Default)]
struct Layer {
    id: Option<OptimisticId>,
    entries: HashMap<CacheKey, Arc<Entry>>,
}

/// The truth layer plus an ordered stack of optimistic layers.
#[derive(Debug)]
pub struct LayerStack {
    // index 0 is the truth layer
    layers: Vec<Layer>,
}

impl Default for LayerStack {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerStack {
    pub fn new() -> Self {
        Self {
            layers: vec![Layer::default()],
        }
    }

    /// Topmost entry for `key`.
    pub fn get(&self, key: &CacheKey) -> Option<&Arc<Entry>> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.entries.get(key))
    }

    pub fn truth(&self, key: &CacheKey) -> Option<&Arc<Entry>> {
        self.layers[0].entries.get(key)
    }

    pub fn set_truth(&mut self, entry: Arc<Entry>) {
        self.layers[0].entries.insert(entry.cache_key.clone(), entry);
    }

    /// Write into the topmost layer.
    pub fn set_top(&mut self, entry: Arc<Entry>) {
        let top = self.layers.len() - 1;
        self.layers[top]
            .entries
            .insert(entry.cache_key.clone(), entry);
    }

    pub fn push_layer(&mut self, id: OptimisticId) {
        self.layers.push(Layer {
            id: Some(id),
            entries: HashMap::new(),
        });
    }

    /// Drop the topmost optimistic layer. The truth layer is never popped.
    pub fn pop_layer(&mut self) -> Option<OptimisticId> {
        if self.layers.len() > 1 {
            self.layers.pop().and_then(|layer| layer.id)
        } else {
            None
        }
    }

    /// Put back a truth entry captured earlier; `None` removes the key.
    pub fn restore_truth(&mut self, key: &CacheKey, entry: Option<Arc<Entry>>) {
        match entry {
            Some(entry) => {
                self.layers[0].entries.insert(key.clone(), entry);
            }
            None => {
                self.layers[0].entries.remove(key);
            }
        }
    }

    /// Number of optimistic layers.
    pub fn optimistic_depth(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn has_layer(&self, id: OptimisticId) -> bool {
        self.layers.iter().any(|layer| layer.id == Some(id))
    }

    /// Remove every layer tagged `id`, wherever it sits in the stack.
    ///
    /// Returns the keys those layers held.
    pub fn remove_layer(&mut self, id: OptimisticId) -> Vec<CacheKey> {
        let mut keys = Vec::new();
        self.layers.retain_mut(|layer| {
            if layer.id == Some(id) {
                keys.extend(layer.entries.drain().map(|(key, _)| key));
                false
            } else {
                true
            }
        });
        keys
    }

    /// Drop `key` from every layer, returning its truth entry.
    pub fn remove_key(&mut self, key: &CacheKey) -> Option<Arc<Entry>> {
        for layer in self.layers.iter_mut().skip(1) {
            layer.entries.remove(key);
        }
        self.layers[0].entries.remove(key)
    }

    /// The visible value differs from the truth value.
    pub fn is_optimistic(&self, key: &CacheKey) -> bool {
        match (self.get(key), self.truth(key)) {
            (Some(top), Some(truth)) => !same_value(top.value.as_ref(), truth.value.as_ref()),
            (Some(top), None) => top.value.is_some(),
            _ => false,
        }
    }

    pub fn truth_keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.layers[0].entries.keys()
    }

    /// Keys held by every layer tagged `id`.
    pub fn layer_keys(&self, id: OptimisticId) -> Vec<CacheKey> {
        self.layers
            .iter()
            .filter(|layer| layer.id == Some(id))
            .flat_map(|layer| layer.entries.keys().cloned())
            .collect()
    }
}
