use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, instrument};

use super::{
    Freshness, ListPage, Payload, Query, QueryCore, QueryFuture, QueryNode, collection_payload,
    collection_touched, is_live, rewrite_collection, store_error, write_members,
};
use crate::cache::batch::{BatchContext, BatchMeta};
use crate::cache::canonical::{Canonical, OrderBy, SetType};
use crate::cache::error::CacheError;
use crate::cache::invalidation::{InvalidationSet, object_types_that_invalidate};
use crate::cache::keys::{CacheKey, KeyArg};
use crate::cache::layer::{Collection, Status, StoreValue};
use crate::cache::lock::mutex_lock;
use crate::cache::network::PageRequest;
use crate::cache::object::{ObjectSet, OsdkObject};
use crate::cache::store::{Store, StoreState};
use crate::cache::where_clause::{WhereMatch, evaluate};

const SOURCE: &str = "cache::query::list";

/// What a list draws its objects from.
#[derive(Debug, Clone, PartialEq)]
pub enum ListSource {
    ObjectType(String),
    Interface(String),
    ObjectSet(ObjectSet),
}

/// A list query before canonicalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ListDescriptor {
    pub source: ListSource,
    pub where_clause: Value,
    pub order_by: OrderBy,
}

impl ListDescriptor {
    pub fn object_type(api_name: impl Into<String>) -> Self {
        Self::new(ListSource::ObjectType(api_name.into()))
    }

    pub fn interface(api_name: impl Into<String>) -> Self {
        Self::new(ListSource::Interface(api_name.into()))
    }

    pub fn object_set(object_set: ObjectSet) -> Self {
        Self::new(ListSource::ObjectSet(object_set))
    }

    fn new(source: ListSource) -> Self {
        Self {
            source,
            where_clause: Value::Object(Map::new()),
            order_by: OrderBy::new(),
        }
    }

    pub fn with_where(mut self, where_clause: Value) -> Self {
        self.where_clause = where_clause;
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }
}

/// How objects written elsewhere in the store reach a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Splice {
    /// The where clause is evaluated client-side and decides membership.
    Exact,
    /// A matching write triggers a refetch.
    Revalidate,
    /// Only deletions are applied; anything else waits for a refetch.
    RemovalsOnly,
}

/// A descriptor resolved against metadata and the canonicalizers.
pub(crate) struct ResolvedList {
    pub(crate) args: Vec<KeyArg>,
    label: String,
    where_clause: Canonical<Value>,
    order_by: Canonical<OrderBy>,
    member_types: BTreeSet<String>,
    splice: Splice,
    invalidation: Option<InvalidationSet>,
}

impl ResolvedList {
    pub(crate) fn resolve(store: &Store, descriptor: &ListDescriptor) -> Result<Self, CacheError> {
        let where_clause = match &descriptor.where_clause {
            Value::Null => store.params().canonicalize_json(&Value::Object(Map::new())),
            other => store.params().canonicalize_json(other),
        };
        let order_by = store.order_by().canonicalize(&descriptor.order_by);

        let (label, source, member_types, splice, invalidation) = match &descriptor.source {
            ListSource::ObjectType(api_name) => {
                store.metadata().object_definition(api_name)?;
                (
                    api_name.clone(),
                    KeyArg::Undefined,
                    BTreeSet::from([api_name.clone()]),
                    Splice::Exact,
                    None,
                )
            }
            ListSource::Interface(api_name) => {
                let definition = store.metadata().interface_definition(api_name)?;
                let set = store
                    .object_sets()
                    .canonicalize(&ObjectSet::interface(api_name.as_str()))?;
                (
                    api_name.clone(),
                    KeyArg::ObjectSet(set),
                    definition.implemented_by.iter().cloned().collect(),
                    // where clauses name interface properties, not the
                    // implementing type's
                    Splice::RemovalsOnly,
                    None,
                )
            }
            ListSource::ObjectSet(object_set) => {
                let (set, set_type) = store.object_sets().canonicalize_typed(object_set)?;
                let member_types = match &set_type {
                    SetType::Object(name) => BTreeSet::from([name.clone()]),
                    SetType::Interface(name) => store
                        .metadata()
                        .interface_definition(name)?
                        .implemented_by
                        .iter()
                        .cloned()
                        .collect(),
                    SetType::Unknown => BTreeSet::new(),
                };
                let invalidation = match object_types_that_invalidate(store.metadata(), object_set)
                {
                    Ok(invalidation) => Some(invalidation),
                    Err(err) => {
                        debug!(error = %err, "List source has no invalidation set");
                        None
                    }
                };
                (
                    set_type.to_string(),
                    KeyArg::ObjectSet(set),
                    member_types,
                    Splice::Revalidate,
                    invalidation,
                )
            }
        };

        let args = vec![
            KeyArg::from(label.as_str()),
            KeyArg::Value(where_clause.clone()),
            KeyArg::OrderBy(order_by.clone()),
            source,
        ];
        Ok(Self {
            args,
            label,
            where_clause,
            order_by,
            member_types,
            splice,
            invalidation,
        })
    }
}

/// A paginated list, keyed `("list", [type, where, order_by, source?])`.
pub struct ListQuery {
    core: QueryCore<ListPage>,
    descriptor: ListDescriptor,
    label: String,
    where_clause: Canonical<Value>,
    order_by: Canonical<OrderBy>,
    member_types: BTreeSet<String>,
    splice: Splice,
    invalidation: Option<InvalidationSet>,
    page_size: usize,
    page_fetch: Arc<Mutex<Option<QueryFuture>>>,
}

impl ListQuery {
    pub(crate) fn new(
        store: Weak<Store>,
        cache_key: CacheKey,
        descriptor: ListDescriptor,
        resolved: ResolvedList,
        page_size: usize,
        state: &StoreState,
    ) -> Self {
        let initial = collection_payload(state, &cache_key);
        Self {
            core: QueryCore::new(store, cache_key, initial),
            descriptor,
            label: resolved.label,
            where_clause: resolved.where_clause,
            order_by: resolved.order_by,
            member_types: resolved.member_types,
            splice: resolved.splice,
            invalidation: resolved.invalidation,
            page_size,
            page_fetch: Arc::new(Mutex::new(None)),
        }
    }

    pub fn descriptor(&self) -> &ListDescriptor {
        &self.descriptor
    }

    pub fn invalidation_set(&self) -> Option<&InvalidationSet> {
        self.invalidation.as_ref()
    }

    pub fn has_more(&self) -> bool {
        self.core
            .current()
            .value
            .is_some_and(|page| page.has_more)
    }

    /// Fetch the next page and append it. Waits for a first-page fetch in
    /// flight and joins a page fetch already running.
    #[instrument(skip(self), fields(list = %self.label))]
    pub async fn fetch_more(&self) {
        if let Some(pending) = self.core.pending() {
            pending.await;
        }

        let next = {
            let mut slot = mutex_lock(&self.page_fetch, SOURCE, "fetch_more");
            match slot.as_ref() {
                Some(existing) => Some(existing.clone()),
                None => self.start_page_fetch().map(|fetch| {
                    let clear = Arc::clone(&self.page_fetch);
                    let shared = async move {
                        fetch.await;
                        mutex_lock(&clear, SOURCE, "fetch_more.complete").take();
                    }
                    .boxed()
                    .shared();
                    *slot = Some(shared.clone());
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(shared.clone());
                    }
                    shared
                }),
            }
        };

        if let Some(next) = next {
            next.await;
        }
    }

    fn start_page_fetch(&self) -> Option<BoxFuture<'static, ()>> {
        let store = self.core.store()?;
        let key = self.core.cache_key().clone();
        let token = store
            .read(&key)
            .and_then(|entry| entry.collection().and_then(|c| c.next_page_token.clone()))?;
        let request = self.page_request(Some(token.clone()));
        let disposed = self.core.disposed_flag();

        Some(
            async move {
                let requested_at = store.now();
                let result = store.client().fetch_page(request).await;
                if !is_live(&disposed) {
                    return;
                }
                store.batch(BatchMeta::default(), |ctx| match result {
                    Ok(page) => {
                        let Some(entry) = ctx.read(&key) else {
                            return;
                        };
                        let Some(current) = entry.collection().cloned() else {
                            return;
                        };
                        // refetched or already extended meanwhile
                        if current.next_page_token.as_deref() != Some(token.as_str()) {
                            return;
                        }
                        let members = write_members(ctx, page.data, requested_at);
                        let mut data = current.data.clone();
                        for member in members {
                            if !data.contains(&member) {
                                data.push(member);
                            }
                        }
                        ctx.write_at(
                            &key,
                            Some(StoreValue::Collection(Arc::new(Collection {
                                data,
                                total_count: page.total_count.or(current.total_count),
                                next_page_token: page.next_page_token,
                            }))),
                            Status::Loaded,
                            entry.last_updated,
                            None,
                        );
                        ctx.changes_mut().register_modified(&key);
                    }
                    Err(err) => store_error(ctx, &key, err.into(), requested_at),
                });
            }
            .boxed(),
        )
    }

    fn wire_set(&self) -> ObjectSet {
        let base = match &self.descriptor.source {
            ListSource::ObjectType(api_name) => ObjectSet::base(api_name.as_str()),
            ListSource::Interface(api_name) => ObjectSet::interface(api_name.as_str()),
            ListSource::ObjectSet(object_set) => object_set.clone(),
        };
        match &*self.where_clause {
            Value::Object(map) if map.is_empty() => base,
            where_clause => base.filter(where_clause.clone()),
        }
    }

    fn page_request(&self, page_token: Option<String>) -> PageRequest {
        PageRequest {
            object_set: self.wire_set(),
            page_size: Some(self.page_size),
            page_token,
            order_by: (*self.order_by).clone(),
        }
    }

    fn fetch_and_store(&self, store: Arc<Store>) -> BoxFuture<'static, ()> {
        let key = self.core.cache_key().clone();
        let request = self.page_request(None);
        let disposed = self.core.disposed_flag();

        async move {
            let requested_at = store.now();
            let result = store.client().fetch_page(request).await;
            if !is_live(&disposed) {
                return;
            }
            store.batch(BatchMeta::default(), |ctx| match result {
                Ok(page) => {
                    if ctx.has_newer(&key, requested_at) {
                        return;
                    }
                    let data = write_members(ctx, page.data, requested_at);
                    ctx.write_at(
                        &key,
                        Some(StoreValue::Collection(Arc::new(Collection {
                            data,
                            total_count: page.total_count,
                            next_page_token: page.next_page_token,
                        }))),
                        Status::Loaded,
                        requested_at,
                        None,
                    );
                    ctx.changes_mut().register_modified(&key);
                }
                Err(err) => store_error(ctx, &key, err.into(), requested_at),
            });
        }
        .boxed()
    }

    fn freshness_revalidate(&self, freshness: Freshness) -> QueryFuture {
        self.core
            .revalidate(freshness, |store| self.fetch_and_store(store))
    }

    fn matches_type(&self, api_name: &str) -> bool {
        self.member_types.contains(api_name)
    }

    fn sort(&self, ctx: &BatchContext<'_>, data: &mut [CacheKey]) {
        if self.order_by.is_empty() {
            return;
        }
        let object = |key: &CacheKey| ctx.read(key).and_then(|entry| entry.object().cloned());
        let mut keyed: Vec<(Option<Arc<OsdkObject>>, CacheKey)> =
            data.iter().map(|key| (object(key), key.clone())).collect();
        keyed.sort_by(|(left, _), (right, _)| match (left, right) {
            (Some(left), Some(right)) => self.order_by.compare(left, right),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        for (slot, (_, key)) in data.iter_mut().zip(keyed) {
            *slot = key;
        }
    }
}

impl Query for ListQuery {
    type Value = ListPage;

    fn cache_key(&self) -> &CacheKey {
        self.core.cache_key()
    }

    fn current(&self) -> Payload<ListPage> {
        self.core.current()
    }

    fn subscribe(&self) -> watch::Receiver<Payload<ListPage>> {
        self.core.subscribe()
    }

    fn revalidate(&self, force: bool) -> QueryFuture {
        let freshness = match (force, self.core.store()) {
            (false, Some(store)) => Freshness::IfOlderThan(store.config().dedupe_interval()),
            _ => Freshness::Force,
        };
        self.freshness_revalidate(freshness)
    }

    fn revalidate_if_older(&self, interval: Duration) -> QueryFuture {
        self.freshness_revalidate(Freshness::IfOlderThan(interval))
    }
}

impl QueryNode for ListQuery {
    fn key(&self) -> &CacheKey {
        self.core.cache_key()
    }

    fn on_changes(&self, ctx: &mut BatchContext<'_>) -> bool {
        let key = self.core.cache_key();
        if ctx.changes().is_modified(key) {
            return false;
        }
        let optimistic = ctx.is_optimistic();

        if let Some(invalidation) = &self.invalidation
            && !optimistic
            && ctx
                .changes()
                .object_types()
                .iter()
                .any(|api_name| invalidation.contains(api_name))
        {
            return true;
        }

        let Some(entry) = ctx.read(key) else {
            return false;
        };
        let Some(collection) = entry.collection().cloned() else {
            return false;
        };

        let changes = ctx.changes();
        let written: Vec<(CacheKey, Arc<OsdkObject>, bool)> = changes
            .added_objects()
            .filter(|_| self.splice != Splice::RemovalsOnly)
            .map(|(key, object)| (key.clone(), Arc::clone(object), true))
            .chain(
                changes
                    .modified_objects()
                    .map(|(key, object)| (key.clone(), Arc::clone(object), false))
                    .filter(|_| self.splice != Splice::RemovalsOnly),
            )
            .filter(|(_, object, _)| self.matches_type(&object.api_name))
            .collect();
        let removed: HashSet<CacheKey> = changes.removed.clone();

        let mut data: Vec<CacheKey> = collection
            .data
            .iter()
            .filter(|member| !removed.contains(*member))
            .cloned()
            .collect();
        let mut revalidate = false;
        let mut reorder = false;

        for (member, object, is_new) in written {
            let present = data.contains(&member);
            match evaluate(&object, &self.where_clause) {
                WhereMatch::Strict if present => reorder = true,
                WhereMatch::Strict if self.splice == Splice::Exact => {
                    data.push(member);
                    reorder = true;
                }
                WhereMatch::Strict | WhereMatch::Sorta => revalidate |= !optimistic,
                WhereMatch::No if present && !is_new && !optimistic => {
                    data.retain(|candidate| *candidate != member);
                }
                WhereMatch::No => {}
            }
        }

        if reorder {
            self.sort(ctx, &mut data);
        }
        if data != collection.data {
            debug!(
                cache_key = %key,
                before = collection.data.len(),
                after = data.len(),
                optimistic,
                "List updated from changes"
            );
            rewrite_collection(
                ctx,
                &entry,
                Collection {
                    data,
                    total_count: collection.total_count,
                    next_page_token: collection.next_page_token.clone(),
                },
            );
        }
        revalidate
    }

    fn refresh(&self, state: &StoreState, touched: &HashSet<CacheKey>) {
        let key = self.core.cache_key();
        if collection_touched(state, key, touched) {
            self.core.publish(collection_payload(state, key));
        }
    }

    fn depends_on_type(&self, api_name: &str) -> bool {
        self.matches_type(api_name)
            || self
                .invalidation
                .as_ref()
                .is_some_and(|invalidation| invalidation.contains(api_name))
    }

    fn revalidate_node(&self, force: bool) -> QueryFuture {
        Query::revalidate(self, force)
    }

    fn dispose(&self) {
        self.core.dispose();
    }
}
