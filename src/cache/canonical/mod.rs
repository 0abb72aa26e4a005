//! Canonical (structurally normalized, interned) values.
//!
//! A [`Canonical<T>`] is a shared pointer that has been through a
//! [`Canonicalizer`]: any two canonical values built from structurally equal
//! inputs are the same allocation, so they compare and hash by identity. Cache
//! keys embed canonical values directly.
//!
//! Interning tables hold only [`Weak`] references; entries whose last strong
//! reference is gone are pruned the next time their hash bucket is looked up.

mod object_set;
mod order_by;
mod params;

use std::collections::HashMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

use serde::{Serialize, Serializer};
use serde_json::Value;

use super::lock::mutex_lock;

pub use object_set::{CanonicalObjectSet, ObjectSetCanonicalizer, SetType};
pub(crate) use order_by::compare_json;
pub use order_by::{OrderBy, OrderByCanonicalizer, SortDirection};
pub use params::{ParamValue, ParamsCanonicalizer};

const SOURCE: &str = "cache::canonical";

/// An interned, already-normalized value. Equality and hashing are by identity.
pub struct Canonical<T>(Arc<T>);

impl<T> Canonical<T> {
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn as_ptr(&self) -> *const T {
        Arc::as_ptr(&self.0)
    }

    pub(crate) fn address(&self) -> usize {
        self.as_ptr() as usize
    }
}

impl<T> Clone for Canonical<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Deref for Canonical<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> PartialEq for Canonical<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T> Eq for Canonical<T> {}

impl<T> Hash for Canonical<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for Canonical<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<T: Serialize> Serialize for Canonical<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Hash of a value's structure, consistent with its `PartialEq`.
pub trait StructuralHash {
    fn structural_hash<H: Hasher>(&self, state: &mut H);
}

impl StructuralHash for Value {
    fn structural_hash<H: Hasher>(&self, state: &mut H) {
        hash_json(self, state);
    }
}

fn hash_json<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0_u8.hash(state),
        Value::Bool(flag) => {
            1_u8.hash(state);
            flag.hash(state);
        }
        Value::Number(number) => {
            2_u8.hash(state);
            number.to_string().hash(state);
        }
        Value::String(text) => {
            3_u8.hash(state);
            text.hash(state);
        }
        Value::Array(items) => {
            4_u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_json(item, state);
            }
        }
        Value::Object(map) => {
            5_u8.hash(state);
            map.len().hash(state);
            for (key, item) in map {
                key.hash(state);
                hash_json(item, state);
            }
        }
    }
}

/// Weak-reference interning table for one canonical value type.
pub struct Canonicalizer<T> {
    name: &'static str,
    buckets: Mutex<HashMap<u64, Vec<Weak<T>>>>,
}

impl<T: PartialEq + StructuralHash> Canonicalizer<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Return the canonical instance structurally equal to `value`, interning
    /// `value` if none is alive.
    pub fn intern(&self, value: T) -> Canonical<T> {
        let mut hasher = DefaultHasher::new();
        value.structural_hash(&mut hasher);
        let hash = hasher.finish();

        let mut buckets = mutex_lock(&self.buckets, SOURCE, self.name);
        let bucket = buckets.entry(hash).or_default();

        let mut found = None;
        bucket.retain(|weak| match weak.upgrade() {
            Some(existing) => {
                if found.is_none() && *existing == value {
                    found = Some(existing);
                }
                true
            }
            None => false,
        });

        if let Some(existing) = found {
            return Canonical(existing);
        }

        let interned = Arc::new(value);
        bucket.push(Arc::downgrade(&interned));
        Canonical(interned)
    }

    /// Number of table slots, including dead ones not yet pruned.
    pub fn slots(&self) -> usize {
        mutex_lock(&self.buckets, SOURCE, self.name)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Number of interned values that are still alive.
    pub fn live(&self) -> usize {
        mutex_lock(&self.buckets, SOURCE, self.name)
            .values()
            .flatten()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl<T> fmt::Debug for Canonicalizer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canonicalizer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn equal_values_share_one_instance() {
        let table = Canonicalizer::<Value>::new("test");
        let a = table.intern(json!({"a": 1, "b": [1, 2]}));
        let b = table.intern(json!({"b": [1, 2], "a": 1}));
        assert!(a.ptr_eq(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn different_values_are_distinct() {
        let table = Canonicalizer::<Value>::new("test");
        let a = table.intern(json!([1, 2]));
        let b = table.intern(json!([2, 1]));
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn dead_entries_are_pruned_on_next_lookup() {
        let table = Canonicalizer::<Value>::new("test");
        drop(table.intern(json!("x")));

        assert_eq!(table.live(), 0);
        assert_eq!(table.slots(), 1);

        let again = table.intern(json!("x"));
        assert_eq!(table.slots(), 1);
        assert_eq!(table.live(), 1);
        assert_eq!(*again, json!("x"));
    }
}
