//! Cache key definitions.
//!
//! A [`CacheKey`] identifies one cached entity or query result. Keys are
//! interned by the [`CacheKeyRegistry`](super::registry::CacheKeyRegistry):
//! two lookups with the same kind and the same normalized arguments yield the
//! same allocation, so keys compare and hash by their registry id.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::Value;

use super::canonical::{Canonical, CanonicalObjectSet, OrderBy};
use super::object::{ObjectRef, PrimaryKey};

/// Entity kind a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyKind {
    Object,
    List,
    Aggregation,
    Links,
    Function,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::List => "list",
            Self::Aggregation => "aggregation",
            Self::Links => "links",
            Self::Function => "function",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One positional key argument.
///
/// Canonical arguments compare by identity, which is only meaningful because
/// they come from a canonicalizer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyArg {
    Undefined,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    Value(Canonical<Value>),
    ObjectSet(Canonical<CanonicalObjectSet>),
    OrderBy(Canonical<OrderBy>),
}

impl KeyArg {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for KeyArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value:?}"),
            Self::Value(value) => write!(f, "{}", **value),
            Self::ObjectSet(set) => write!(f, "{}", set.to_wire().to_json()),
            Self::OrderBy(order) => write!(f, "{:?}", order.clauses()),
        }
    }
}

impl From<&str> for KeyArg {
    fn from(value: &str) -> Self {
        Self::Str(Arc::from(value))
    }
}

impl From<String> for KeyArg {
    fn from(value: String) -> Self {
        Self::Str(Arc::from(value))
    }
}

impl From<i64> for KeyArg {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for KeyArg {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&PrimaryKey> for KeyArg {
    fn from(value: &PrimaryKey) -> Self {
        match value {
            PrimaryKey::Int(value) => Self::Int(*value),
            PrimaryKey::Str(value) => Self::from(value.as_str()),
        }
    }
}

impl From<Canonical<Value>> for KeyArg {
    fn from(value: Canonical<Value>) -> Self {
        Self::Value(value)
    }
}

impl From<Canonical<CanonicalObjectSet>> for KeyArg {
    fn from(value: Canonical<CanonicalObjectSet>) -> Self {
        Self::ObjectSet(value)
    }
}

impl From<Canonical<OrderBy>> for KeyArg {
    fn from(value: Canonical<OrderBy>) -> Self {
        Self::OrderBy(value)
    }
}

impl<T: Into<KeyArg>> From<Option<T>> for KeyArg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Undefined, Into::into)
    }
}

static UNDEFINED: KeyArg = KeyArg::Undefined;

/// Registry-assigned key identifier, unique for the registry's lifetime.
pub type KeyId = u64;

struct KeyData {
    id: KeyId,
    kind: KeyKind,
    args: Vec<KeyArg>,
}

/// Interned cache key. Cloning is cheap; equality is by registry id.
#[derive(Clone)]
pub struct CacheKey(Arc<KeyData>);

impl CacheKey {
    pub(crate) fn new(id: KeyId, kind: KeyKind, args: Vec<KeyArg>) -> Self {
        Self(Arc::new(KeyData { id, kind, args }))
    }

    pub fn id(&self) -> KeyId {
        self.0.id
    }

    pub fn kind(&self) -> KeyKind {
        self.0.kind
    }

    pub fn args(&self) -> &[KeyArg] {
        &self.0.args
    }

    /// Positional argument; positions past the end read as `Undefined`.
    pub fn arg(&self, index: usize) -> &KeyArg {
        self.0.args.get(index).unwrap_or(&UNDEFINED)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Object identity for `object` keys.
    pub fn object_ref(&self) -> Option<ObjectRef> {
        if self.kind() != KeyKind::Object {
            return None;
        }
        let api_name = self.arg(0).as_str()?;
        let primary_key = match self.arg(1) {
            KeyArg::Int(value) => PrimaryKey::Int(*value),
            KeyArg::Str(value) => PrimaryKey::Str(value.to_string()),
            _ => return None,
        };
        Some(ObjectRef::new(api_name, primary_key))
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey#{}({self})", self.0.id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.0.kind)?;
        for (index, arg) in self.0.args.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

/// Strip trailing `Undefined` arguments; interior ones are significant.
pub fn normalize_args(args: &[KeyArg]) -> &[KeyArg] {
    let len = args
        .iter()
        .rposition(|arg| !arg.is_undefined())
        .map_or(0, |index| index + 1);
    &args[..len]
}

/// Arguments of the `object` key for `object`.
pub fn object_key_args(object: &ObjectRef) -> [KeyArg; 2] {
    [
        KeyArg::from(object.api_name.as_str()),
        KeyArg::from(&object.primary_key),
    ]
}
