use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Canonical, Canonicalizer, StructuralHash};
use crate::cache::object::OsdkObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Ordered list of `(property, direction)` clauses. Clause order is significant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy(Vec<(String, SortDirection)>);

impl OrderBy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a clause. A property already present keeps its first direction.
    pub fn then(mut self, property: impl Into<String>, direction: SortDirection) -> Self {
        let property = property.into();
        if !self.0.iter().any(|(existing, _)| *existing == property) {
            self.0.push((property, direction));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clauses(&self) -> &[(String, SortDirection)] {
        &self.0
    }

    /// Compare two objects clause by clause; missing properties sort first.
    pub fn compare(&self, left: &OsdkObject, right: &OsdkObject) -> Ordering {
        for (property, direction) in &self.0 {
            let ordering = compare_json(
                left.property(property).as_ref(),
                right.property(property).as_ref(),
            );
            let ordering = match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

impl StructuralHash for OrderBy {
    fn structural_hash<H: Hasher>(&self, state: &mut H) {
        self.hash(state);
    }
}

/// Total order over optional JSON scalars used for sorting lists.
pub(crate) fn compare_json(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (left, right) {
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => {
                    let a = a.as_f64().unwrap_or(f64::NAN);
                    let b = b.as_f64().unwrap_or(f64::NAN);
                    a.total_cmp(&b)
                }
            }
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        _ => rank(left).cmp(&rank(right)),
    }
}

/// Interns order-by clauses as given; no reordering is applied.
#[derive(Debug)]
pub struct OrderByCanonicalizer {
    interned: Canonicalizer<OrderBy>,
}

impl OrderByCanonicalizer {
    pub fn new() -> Self {
        Self {
            interned: Canonicalizer::new("order_by"),
        }
    }

    pub fn canonicalize(&self, order_by: &OrderBy) -> Canonical<OrderBy> {
        self.interned.intern(order_by.clone())
    }
}

impl Default for OrderByCanonicalizer {
    fn default() -> Self {
        Self::new()
    }
}
