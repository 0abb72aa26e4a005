//! Per-batch change tracking.
//!
//! A [`Changes`] record collects the keys added, modified and removed during
//! one batch, along with the object values written, so dependent queries can
//! react without re-reading the store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::keys::{CacheKey, KeyKind};
use super::object::OsdkObject;

#[derive(Debug, Clone, Default)]
pub struct Changes {
    pub added: HashSet<CacheKey>,
    pub modified: HashSet<CacheKey>,
    pub removed: HashSet<CacheKey>,
    objects: HashMap<CacheKey, Arc<OsdkObject>>,
}

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an object write.
    pub fn register_object(&mut self, key: &CacheKey, object: Arc<OsdkObject>, is_new: bool) {
        if is_new {
            self.added.insert(key.clone());
        } else {
            self.modified.insert(key.clone());
        }
        self.removed.remove(key);
        self.objects.insert(key.clone(), object);
    }

    /// Record that a list, link or other derived entry changed.
    pub fn register_modified(&mut self, key: &CacheKey) {
        self.modified.insert(key.clone());
    }

    pub fn register_removed(&mut self, key: &CacheKey) {
        self.added.remove(key);
        self.modified.remove(key);
        self.objects.remove(key);
        self.removed.insert(key.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn is_modified(&self, key: &CacheKey) -> bool {
        self.modified.contains(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.added.contains(key) || self.modified.contains(key) || self.removed.contains(key)
    }

    /// Value written for an added or modified object.
    pub fn object(&self, key: &CacheKey) -> Option<&Arc<OsdkObject>> {
        self.objects.get(key)
    }

    pub fn added_objects(&self) -> impl Iterator<Item = (&CacheKey, &Arc<OsdkObject>)> {
        self.added
            .iter()
            .filter_map(|key| self.objects.get(key).map(|object| (key, object)))
    }

    pub fn modified_objects(&self) -> impl Iterator<Item = (&CacheKey, &Arc<OsdkObject>)> {
        self.modified
            .iter()
            .filter_map(|key| self.objects.get(key).map(|object| (key, object)))
    }

    pub fn removed_objects(&self) -> impl Iterator<Item = &CacheKey> {
        self.removed
            .iter()
            .filter(|key| key.kind() == KeyKind::Object)
    }

    /// Object types touched by this batch.
    pub fn object_types(&self) -> BTreeSet<String> {
        let mut types: BTreeSet<String> = self
            .objects
            .values()
            .map(|object| object.api_name.clone())
            .collect();
        types.extend(
            self.removed_objects()
                .filter_map(|key| key.arg(0).as_str().map(str::to_string)),
        );
        types
    }

    pub fn touches_type(&self, api_name: &str) -> bool {
        self.objects
            .values()
            .any(|object| object.api_name == api_name)
            || self
                .removed_objects()
                .any(|key| key.arg(0).as_str() == Some(api_name))
    }

    /// Fold another record into this one.
    pub fn merge(&mut self, other: Changes) {
        for key in other.removed {
            self.register_removed(&key);
        }
        for key in other.modified {
            match other.objects.get(&key) {
                Some(object) => self.register_object(&key, Arc::clone(object), false),
                None => self.register_modified(&key),
            }
        }
        for key in other.added {
            if let Some(object) = other.objects.get(&key) {
                self.register_object(&key, Arc::clone(object), true);
            }
        }
    }
}

impl fmt::Display for Changes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn names(keys: &HashSet<CacheKey>) -> Vec<String> {
            let mut names: Vec<String> = keys.iter().map(ToString::to_string).collect();
            names.sort();
            names
        }

        write!(
            f,
            "added={:?} modified={:?} removed={:?}",
            names(&self.added),
            names(&self.modified),
            names(&self.removed)
        )
    }
}
