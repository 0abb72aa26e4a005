//! Batched, atomic writes.
//!
//! Every mutation of store state happens through a [`BatchContext`] handed to
//! the closure passed to [`Store::batch`](super::store::Store::batch). The
//! store lock is held for the whole batch, so other observers see either none
//! or all of its writes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use super::changes::Changes;
use super::error::CacheError;
use super::keys::{CacheKey, KeyArg, KeyKind, object_key_args};
use super::layer::{Collection, Entry, OptimisticId, Status, StoreValue};
use super::object::{ObjectRef, OsdkObject};
use super::store::StoreState;

/// Options for one batch.
#[derive(Debug, Default)]
pub struct BatchMeta {
    /// Route writes to the optimistic layer with this id.
    pub optimistic_id: Option<OptimisticId>,
    /// Seed the batch's change record (for flows spanning several batches).
    pub changes: Option<Changes>,
}

impl BatchMeta {
    pub fn optimistic(id: OptimisticId) -> Self {
        Self {
            optimistic_id: Some(id),
            changes: None,
        }
    }

    pub fn with_changes(mut self, changes: Changes) -> Self {
        self.changes = Some(changes);
        self
    }
}

/// Result of [`Store::batch`](super::store::Store::batch).
#[derive(Debug)]
pub struct BatchOutcome<R> {
    pub value: R,
    pub changes: Changes,
}

/// Monotonic millisecond clock. Never returns the same value twice.
#[derive(Debug, Default)]
pub(crate) struct Clock {
    last: i64,
}

impl Clock {
    pub(crate) fn tick(&mut self) -> i64 {
        let now = i64::try_from(time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000)
            .unwrap_or(i64::MAX);
        self.last = now.max(self.last + 1);
        self.last
    }
}

/// A ref-count change made by a truth collection write.
enum RefChange {
    Retained(CacheKey),
    Released(CacheKey),
}

/// Keys whose visible entry changed in a finished batch.
pub(crate) struct BatchResult {
    pub(crate) changes: Changes,
    pub(crate) touched: Vec<CacheKey>,
}

pub struct BatchContext<'a> {
    state: &'a mut StoreState,
    optimistic_id: Option<OptimisticId>,
    layer_pushed: bool,
    changes: Changes,
    /// Visible entry of each written key as of its first write in this batch.
    previous: HashMap<CacheKey, Option<Arc<Entry>>>,
    /// Truth entry of each key as of its first truth write in this batch.
    truth_before: HashMap<CacheKey, Option<Arc<Entry>>>,
    ref_changes: Vec<RefChange>,
    written: Vec<CacheKey>,
}

impl<'a> BatchContext<'a> {
    pub(crate) fn new(state: &'a mut StoreState, meta: BatchMeta) -> Self {
        Self {
            state,
            optimistic_id: meta.optimistic_id,
            layer_pushed: false,
            changes: meta.changes.unwrap_or_default(),
            previous: HashMap::new(),
            truth_before: HashMap::new(),
            ref_changes: Vec::new(),
            written: Vec::new(),
        }
    }

    pub fn optimistic_id(&self) -> Option<OptimisticId> {
        self.optimistic_id
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic_id.is_some()
    }

    pub fn changes(&self) -> &Changes {
        &self.changes
    }

    pub fn changes_mut(&mut self) -> &mut Changes {
        &mut self.changes
    }

    pub(crate) fn state(&self) -> &StoreState {
        self.state
    }

    /// Push this batch's optimistic layer now rather than on first write.
    pub(crate) fn ensure_layer(&mut self) {
        if let Some(id) = self.optimistic_id
            && !self.layer_pushed
        {
            self.state.layers.push_layer(id);
            self.layer_pushed = true;
        }
    }

    /// Entry as seen by this batch: the visible entry for optimistic batches,
    /// the truth entry otherwise.
    pub fn read(&self, key: &CacheKey) -> Option<Arc<Entry>> {
        if self.is_optimistic() {
            self.state.layers.get(key).cloned()
        } else {
            self.state.layers.truth(key).cloned()
        }
    }

    /// Topmost entry regardless of the batch mode.
    pub fn read_visible(&self, key: &CacheKey) -> Option<Arc<Entry>> {
        self.state.layers.get(key).cloned()
    }

    /// Write `value` with `status`, stamped with the current time.
    pub fn write(&mut self, key: &CacheKey, value: Option<StoreValue>, status: Status) -> Arc<Entry> {
        let now = self.now();
        self.write_at(key, value, status, now, None)
    }

    /// Mark the entry failed, keeping its previous value.
    pub fn write_error(&mut self, key: &CacheKey, error: Arc<CacheError>) -> Arc<Entry> {
        let value = self.read(key).and_then(|entry| entry.value.clone());
        let now = self.now();
        self.write_at(key, value, Status::Error, now, Some(error))
    }

    /// Write a tombstone.
    pub fn delete(&mut self, key: &CacheKey, status: Status) -> Arc<Entry> {
        self.write(key, Some(StoreValue::Tombstone), status)
    }

    /// Update only the status, keeping value and error.
    pub fn set_status(&mut self, key: &CacheKey, status: Status) -> Arc<Entry> {
        let previous = self.read(key);
        let value = previous.as_ref().and_then(|entry| entry.value.clone());
        let error = previous.and_then(|entry| entry.error.clone());
        let now = self.now();
        self.write_at(key, value, status, now, error)
    }

    pub(crate) fn write_at(
        &mut self,
        key: &CacheKey,
        value: Option<StoreValue>,
        status: Status,
        last_updated: i64,
        error: Option<Arc<CacheError>>,
    ) -> Arc<Entry> {
        if !self.previous.contains_key(key) {
            self.previous
                .insert(key.clone(), self.state.layers.get(key).cloned());
            self.written.push(key.clone());
        }

        let base = self.read(key);
        let value = match (value, base.as_ref().and_then(|entry| entry.value.as_ref())) {
            (Some(next), Some(current)) if next == *current => Some(current.clone()),
            (next, _) => next,
        };

        let entry = Arc::new(Entry {
            cache_key: key.clone(),
            value,
            status,
            last_updated,
            error,
        });

        match self.optimistic_id {
            Some(_) => {
                self.ensure_layer();
                self.state.layers.set_top(Arc::clone(&entry));
            }
            None => {
                let before = self.state.layers.truth(key).cloned();
                let old = before.as_ref().and_then(|entry| entry.collection().cloned());
                self.truth_before.entry(key.clone()).or_insert(before);
                let new = entry.collection().cloned();
                self.state.layers.set_truth(Arc::clone(&entry));
                self.transfer_members(old.as_deref(), new.as_deref());
            }
        }

        trace!(
            cache_key = %key,
            status = ?status,
            optimistic = self.is_optimistic(),
            "Entry written"
        );
        entry
    }

    /// Write an object under its `object` key and record the change.
    ///
    /// A write deep-equal to the current value records nothing.
    pub fn write_object(&mut self, object: impl Into<Arc<OsdkObject>>, status: Status) -> CacheKey {
        let now = self.now();
        self.write_object_at(object.into(), status, now)
    }

    pub(crate) fn write_object_at(
        &mut self,
        object: Arc<OsdkObject>,
        status: Status,
        last_updated: i64,
    ) -> CacheKey {
        let key = self.cache_key(KeyKind::Object, &object_key_args(&object.object_ref()));
        let previous = self
            .read(&key)
            .and_then(|entry| entry.object().cloned());
        let entry = self.write_at(
            &key,
            Some(StoreValue::Object(object)),
            status,
            last_updated,
            None,
        );

        if let Some(written) = entry.object() {
            match previous {
                None => self.changes.register_object(&key, Arc::clone(written), true),
                Some(previous) if !Arc::ptr_eq(&previous, written) => {
                    self.changes.register_object(&key, Arc::clone(written), false);
                }
                Some(_) => {}
            }
        }
        key
    }

    /// Tombstone an object and record its removal.
    pub fn delete_object(&mut self, object: &ObjectRef) -> CacheKey {
        let key = self.cache_key(KeyKind::Object, &object_key_args(object));
        self.delete(&key, Status::Loaded);
        self.changes.register_removed(&key);
        key
    }

    /// A confirmed entry newer than `requested_at` exists for `key`.
    pub(crate) fn has_newer(&self, key: &CacheKey, requested_at: i64) -> bool {
        self.state
            .layers
            .truth(key)
            .is_some_and(|entry| entry.status == Status::Loaded && entry.last_updated > requested_at)
    }

    /// Truth collections retain their member keys.
    fn transfer_members(
        &mut self,
        old: Option<&Collection>,
        new: Option<&Collection>,
    ) {
        let old: HashSet<&CacheKey> = old.map(|c| c.data.iter().collect()).unwrap_or_default();
        let new: HashSet<&CacheKey> = new.map(|c| c.data.iter().collect()).unwrap_or_default();
        for key in new.difference(&old) {
            self.state.refcounts.retain(key);
            self.ref_changes.push(RefChange::Retained((*key).clone()));
        }
        for key in old.difference(&new) {
            self.state.refcounts.release(key);
            self.ref_changes.push(RefChange::Released((*key).clone()));
        }
    }

    /// Look up or create a key without retaining it. A new key starts with a
    /// pending deletion.
    pub fn cache_key(&mut self, kind: KeyKind, args: &[KeyArg]) -> CacheKey {
        self.state.cache_key(kind, args)
    }

    pub(crate) fn now(&mut self) -> i64 {
        self.state.clock.tick()
    }

    /// Undo every write made so far, leaving the store as it was before the
    /// batch started. Keys created by the batch stay registered with a
    /// pending deletion.
    pub(crate) fn rollback(self) {
        let Self {
            state,
            layer_pushed,
            truth_before,
            ref_changes,
            ..
        } = self;

        if layer_pushed {
            state.layers.pop_layer();
        }
        for (key, entry) in truth_before {
            state.layers.restore_truth(&key, entry);
        }
        for change in ref_changes.into_iter().rev() {
            match change {
                RefChange::Retained(key) => state.refcounts.release(&key),
                RefChange::Released(key) => {
                    state.refcounts.retain(&key);
                }
            }
        }
    }

    pub(crate) fn finish(self) -> BatchResult {
        let Self {
            state,
            changes,
            previous,
            written,
            ..
        } = self;

        let touched = written
            .into_iter()
            .filter(|key| {
                let before = previous.get(key).and_then(Option::as_ref);
                let after = state.layers.get(key);
                match (before, after) {
                    (Some(before), Some(after)) => !Arc::ptr_eq(before, after),
                    (None, None) => false,
                    _ => true,
                }
            })
            .collect();

        BatchResult { changes, touched }
    }
}
