use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;

use super::{Freshness, Payload, Query, QueryCore, QueryFuture, QueryNode, is_live, store_error};
use crate::cache::batch::{BatchContext, BatchMeta};
use crate::cache::canonical::Canonical;
use crate::cache::keys::CacheKey;
use crate::cache::layer::{Status, StoreValue};
use crate::cache::lock::mutex_lock;
use crate::cache::object::ObjectRef;
use crate::cache::store::{Store, StoreState};

const SOURCE: &str = "cache::query::function";

/// A function execution result, keyed `("function", [api_name, params, version?])`.
///
/// The server cannot say which objects a function read, so callers declare
/// dependencies with [`FunctionQuery::depends_on`] and
/// [`FunctionQuery::depends_on_objects`]. Declarations accumulate across calls.
pub struct FunctionQuery {
    core: QueryCore<Arc<Value>>,
    api_name: String,
    params: Canonical<Value>,
    version: Option<String>,
    depends_on: Mutex<BTreeSet<String>>,
    depends_on_objects: Mutex<BTreeSet<ObjectRef>>,
}

impl FunctionQuery {
    pub(crate) fn new(
        store: Weak<Store>,
        cache_key: CacheKey,
        api_name: String,
        params: Canonical<Value>,
        version: Option<String>,
        state: &StoreState,
    ) -> Self {
        let initial = build_payload(state, &cache_key);
        Self {
            core: QueryCore::new(store, cache_key, initial),
            api_name,
            params,
            version,
            depends_on: Mutex::new(BTreeSet::new()),
            depends_on_objects: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn api_name(&self) -> &str {
        &self.api_name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Revalidate whenever an object of any of these types changes.
    pub fn depends_on<I, S>(&self, object_types: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        mutex_lock(&self.depends_on, SOURCE, "depends_on")
            .extend(object_types.into_iter().map(Into::into));
        self
    }

    /// Revalidate whenever one of these objects changes.
    pub fn depends_on_objects<I>(&self, objects: I) -> &Self
    where
        I: IntoIterator<Item = ObjectRef>,
    {
        mutex_lock(&self.depends_on_objects, SOURCE, "depends_on_objects").extend(objects);
        self
    }

    fn fetch_and_store(&self, store: Arc<Store>) -> BoxFuture<'static, ()> {
        let key = self.core.cache_key().clone();
        let api_name = self.api_name.clone();
        let params = (*self.params).clone();
        let version = self.version.clone();
        let disposed = self.core.disposed_flag();

        async move {
            let requested_at = store.now();
            let result = store
                .client()
                .execute_function(&api_name, params, version.as_deref())
                .await;
            if !is_live(&disposed) {
                return;
            }
            store.batch(BatchMeta::default(), |ctx| match result {
                Ok(value) => {
                    if !ctx.has_newer(&key, requested_at) {
                        ctx.write_at(
                            &key,
                            Some(StoreValue::Json(Arc::new(value))),
                            Status::Loaded,
                            requested_at,
                            None,
                        );
                    }
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
}

fn build_payload(state: &StoreState, key: &CacheKey) -> Payload<Arc<Value>> {
    Payload::from_entry(state.layers.get(key), state.layers.is_optimistic(key), |entry| {
        entry.json().cloned()
    })
}

impl Query for FunctionQuery {
    type Value = Arc<Value>;

    fn cache_key(&self) -> &CacheKey {
        self.core.cache_key()
    }

    fn current(&self) -> Payload<Arc<Value>> {
        self.core.current()
    }

    fn subscribe(&self) -> watch::Receiver<Payload<Arc<Value>>> {
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

impl QueryNode for FunctionQuery {
    fn key(&self) -> &CacheKey {
        self.core.cache_key()
    }

    fn on_changes(&self, ctx: &mut BatchContext<'_>) -> bool {
        if ctx.is_optimistic() {
            return false;
        }
        let changes = ctx.changes();

        let types = mutex_lock(&self.depends_on, SOURCE, "on_changes.types");
        if changes
            .object_types()
            .iter()
            .any(|api_name| types.contains(api_name))
        {
            return true;
        }
        drop(types);

        let objects = mutex_lock(&self.depends_on_objects, SOURCE, "on_changes.objects");
        if objects.is_empty() {
            return false;
        }
        changes
            .added
            .iter()
            .chain(&changes.modified)
            .chain(&changes.removed)
            .filter_map(CacheKey::object_ref)
            .any(|object| objects.contains(&object))
    }

    fn refresh(&self, state: &StoreState, touched: &HashSet<CacheKey>) {
        if touched.contains(self.core.cache_key()) {
            self.core
                .publish(build_payload(state, self.core.cache_key()));
        }
    }

    fn depends_on_type(&self, api_name: &str) -> bool {
        mutex_lock(&self.depends_on, SOURCE, "depends_on_type").contains(api_name)
    }

    fn revalidate_node(&self, force: bool) -> QueryFuture {
        Query::revalidate(self, force)
    }

    fn dispose(&self) {
        self.core.dispose();
    }
}
