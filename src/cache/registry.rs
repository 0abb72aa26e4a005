//! Cache key registry.
//!
//! Interns `(kind, args...)` tuples into [`CacheKey`]s using a trie keyed on
//! each positional argument. Trailing `Undefined` arguments are stripped
//! before lookup, so `("list", [T, w, Undefined])` and `("list", [T, w])`
//! resolve to the same key.
//!
//! The registry knows nothing about reference counts; the store pairs every
//! newly created key with an entry in its [`RefCounts`](super::refcounts::RefCounts).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use metrics::{counter, gauge};
use tracing::debug;

use super::keys::{CacheKey, KeyArg, KeyId, KeyKind, normalize_args};
use super::metrics_names::{KEY_CREATED_TOTAL, KEYS};

/// Callback fired with a key on creation or destruction.
pub type KeyHook = Arc<dyn Fn(&CacheKey) + Send + Sync>;

#[derive(Default)]
struct TrieNode {
    key: Option<CacheKey>,
    children: HashMap<KeyArg, TrieNode>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.key.is_none() && self.children.is_empty()
    }
}

/// Result of [`CacheKeyRegistry::intern`].
#[derive(Debug, Clone)]
pub struct Interned {
    pub key: CacheKey,
    /// The key did not exist before this call.
    pub created: bool,
}

/// Trie-backed key interner.
pub struct CacheKeyRegistry {
    roots: HashMap<KeyKind, TrieNode>,
    next_id: KeyId,
    len: usize,
    on_create: Option<KeyHook>,
}

impl fmt::Debug for CacheKeyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKeyRegistry")
            .field("len", &self.len)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl Default for CacheKeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheKeyRegistry {
    pub fn new() -> Self {
        Self {
            roots: HashMap::new(),
            next_id: 1,
            len: 0,
            on_create: None,
        }
    }

    /// Install a hook fired exactly once per created key.
    ///
    /// The hook runs while the owning store is locked and must not call back
    /// into the store.
    pub fn with_on_create(mut self, hook: KeyHook) -> Self {
        self.on_create = Some(hook);
        self
    }

    /// Look up the key for `(kind, args)`, creating it on first sight.
    pub fn intern(&mut self, kind: KeyKind, args: &[KeyArg]) -> Interned {
        let args = normalize_args(args);
        let mut node = self.roots.entry(kind).or_default();
        for arg in args {
            node = node.children.entry(arg.clone()).or_default();
        }

        if let Some(key) = &node.key {
            return Interned {
                key: key.clone(),
                created: false,
            };
        }

        let key = CacheKey::new(self.next_id, kind, args.to_vec());
        node.key = Some(key.clone());
        self.next_id += 1;
        self.len += 1;

        counter!(KEY_CREATED_TOTAL, "kind" => kind.as_str()).increment(1);
        gauge!(KEYS).set(self.len as f64);
        debug!(cache_key = %key, key_id = key.id(), "Cache key created");

        if let Some(hook) = &self.on_create {
            hook(&key);
        }

        Interned { key, created: true }
    }

    /// Look up without creating.
    pub fn peek(&self, kind: KeyKind, args: &[KeyArg]) -> Option<CacheKey> {
        let mut node = self.roots.get(&kind)?;
        for arg in normalize_args(args) {
            node = node.children.get(arg)?;
        }
        node.key.clone()
    }

    /// Remove `key` from the trie, pruning emptied branches.
    ///
    /// Returns `false` if the key was not registered (or a different key with
    /// the same arguments has since replaced it).
    pub fn remove(&mut self, key: &CacheKey) -> bool {
        let Some(root) = self.roots.get_mut(&key.kind()) else {
            return false;
        };
        let removed = remove_path(root, key, key.args());
        if root.is_empty() {
            self.roots.remove(&key.kind());
        }
        if removed {
            self.len -= 1;
            gauge!(KEYS).set(self.len as f64);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn remove_path(node: &mut TrieNode, key: &CacheKey, rest: &[KeyArg]) -> bool {
    let Some((first, tail)) = rest.split_first() else {
        return match &node.key {
            Some(existing) if existing == key => {
                node.key = None;
                true
            }
            _ => false,
        };
    };

    let Some(child) = node.children.get_mut(first) else {
        return false;
    };
    let removed = remove_path(child, key, tail);
    if child.is_empty() {
        node.children.remove(first);
    }
    removed
}
