//! Reference counting with delayed deletion.
//!
//! A key whose count drops to zero is not removed immediately: it gets an
//! expiry `now + gc_delay`, and a later [`RefCounts::gc`] pass finalizes it
//! once the expiry has passed. Retaining the key again before then cancels the
//! pending deletion.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy)]
struct RefEntry {
    count: usize,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
pub struct RefCounts<K> {
    entries: HashMap<K, RefEntry>,
    gc_delay: Duration,
    trace: bool,
}

impl<K: Eq + Hash + Clone + Debug> RefCounts<K> {
    pub fn new(gc_delay: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            gc_delay,
            trace: false,
        }
    }

    /// Log every count change at debug level.
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Track `key` with count zero and a pending deletion. No-op if tracked.
    pub fn register(&mut self, key: K) {
        let expires_at = Instant::now() + self.gc_delay;
        self.entries.entry(key).or_insert(RefEntry {
            count: 0,
            expires_at: Some(expires_at),
        });
    }

    /// Increment the count, cancelling any pending deletion.
    ///
    /// Returns `false` if the key is not tracked.
    pub fn retain(&mut self, key: &K) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            warn!(key = ?key, op = "retain", "Retain of untracked key ignored");
            return false;
        };
        entry.count += 1;
        entry.expires_at = None;
        if self.trace {
            debug!(key = ?key, count = entry.count, "retain");
        }
        true
    }

    /// Decrement the count; reaching zero schedules deletion.
    pub fn release(&mut self, key: &K) {
        let Some(entry) = self.entries.get_mut(key) else {
            warn!(key = ?key, op = "release", "Release of untracked key ignored");
            return;
        };
        if entry.count == 0 {
            warn!(key = ?key, op = "release", "Release below zero ignored");
            return;
        }
        entry.count -= 1;
        if entry.count == 0 {
            entry.expires_at = Some(Instant::now() + self.gc_delay);
        }
        if self.trace {
            debug!(key = ?key, count = entry.count, "release");
        }
    }

    pub fn count(&self, key: &K) -> Option<usize> {
        self.entries.get(key).map(|entry| entry.count)
    }

    pub fn is_pending_deletion(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.expires_at.is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finalize every key whose deletion time has passed, invoking `cleanup`
    /// once per key. A panicking cleanup is logged and does not stop the pass.
    ///
    /// Returns the finalized keys.
    pub fn gc<F>(&mut self, now: Instant, mut cleanup: F) -> Vec<K>
    where
        F: FnMut(&K),
    {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.count == 0 && entry.expires_at.is_some_and(|at| at <= now)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cleanup(key))) {
                error!(
                    key = ?key,
                    panic = %panic_message(panic.as_ref()),
                    "Cache key cleanup panicked"
                );
            }
        }

        expired
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
