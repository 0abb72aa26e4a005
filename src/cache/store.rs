//! The cache store.
//!
//! [`Store`] owns every piece of cache state behind one mutex: the key
//! registry, reference counts, the layer stack, per-key subjects and the
//! query controllers. All writes go through [`Store::batch`]; the lock is
//! held for the whole batch and released before any fetch is awaited.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use metrics::{counter, gauge, histogram};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::batch::{BatchContext, BatchMeta, BatchOutcome, Clock};
use super::canonical::{
    OrderBy, OrderByCanonicalizer, ObjectSetCanonicalizer, ParamValue, ParamsCanonicalizer,
};
use super::bulk_loader::BulkObjectLoader;
use super::config::CacheConfig;
use super::error::CacheError;
use super::keys::{CacheKey, KeyArg, KeyKind, object_key_args};
use super::layer::{Entry, LayerStack, OptimisticId, Status};
use super::lock::mutex_lock;
use super::metadata::OntologyMetadata;
use super::metrics_names::{BATCH_MS, KEY_DESTROYED_TOTAL, OPTIMISTIC_LAYERS};
use super::network::OntologyClient;
use super::object::{ObjectRef, OsdkObject, PrimaryKey};
use super::query::{
    AggregationQuery, FunctionQuery, LinkQuery, LinkSpec, ListDescriptor, ListPage, ListQuery,
    ObjectQuery, ObserveMode, ObserveOptions, Query, QueryFuture, QueryHandle,
    QuerySubscription, ResolvedList,
};
use super::refcounts::{RefCounts, panic_message};
use super::registry::{CacheKeyRegistry, KeyHook};

const SOURCE: &str = "cache::store";

/// What a raw entry subscriber sees.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub entry: Option<Arc<Entry>>,
    pub is_optimistic: bool,
}

pub(crate) struct StoreState {
    pub(crate) registry: CacheKeyRegistry,
    pub(crate) refcounts: RefCounts<CacheKey>,
    pub(crate) layers: LayerStack,
    pub(crate) subjects: HashMap<CacheKey, watch::Sender<EntrySnapshot>>,
    pub(crate) queries: HashMap<CacheKey, QueryHandle>,
    pub(crate) clock: Clock,
}

impl StoreState {
    fn new(config: &CacheConfig, on_create: Option<KeyHook>) -> Self {
        let registry = match on_create {
            Some(hook) => CacheKeyRegistry::new().with_on_create(hook),
            None => CacheKeyRegistry::new(),
        };
        Self {
            registry,
            refcounts: RefCounts::new(config.gc_delay()).with_trace(config.debug_refcounts),
            layers: LayerStack::new(),
            subjects: HashMap::new(),
            queries: HashMap::new(),
            clock: Clock::default(),
        }
    }

    /// Look up or create a key; a new key starts with a pending deletion.
    pub(crate) fn cache_key(&mut self, kind: KeyKind, args: &[KeyArg]) -> CacheKey {
        let interned = self.registry.intern(kind, args);
        if interned.created {
            self.refcounts.register(interned.key.clone());
        }
        interned.key
    }

    fn snapshot(&self, key: &CacheKey) -> EntrySnapshot {
        EntrySnapshot {
            entry: self.layers.get(key).cloned(),
            is_optimistic: self.layers.is_optimistic(key),
        }
    }

    /// One notification per touched key and per affected query.
    fn notify(&self, touched: &HashSet<CacheKey>) {
        if touched.is_empty() {
            return;
        }
        for key in touched {
            if let Some(subject) = self.subjects.get(key) {
                subject.send_replace(self.snapshot(key));
            }
        }
        for query in self.queries.values() {
            query.node().refresh(self, touched);
        }
    }
}

/// Builder for [`Store`].
pub struct StoreBuilder {
    client: Arc<dyn OntologyClient>,
    metadata: Arc<dyn OntologyMetadata>,
    config: CacheConfig,
    on_key_created: Option<KeyHook>,
    on_key_destroyed: Option<KeyHook>,
    gc_task: bool,
}

impl StoreBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Fired once per created key, while the store is locked.
    pub fn on_key_created(mut self, hook: impl Fn(&CacheKey) + Send + Sync + 'static) -> Self {
        self.on_key_created = Some(Arc::new(hook));
        self
    }

    /// Fired once per finalized key, after the store lock is released.
    pub fn on_key_destroyed(mut self, hook: impl Fn(&CacheKey) + Send + Sync + 'static) -> Self {
        self.on_key_destroyed = Some(Arc::new(hook));
        self
    }

    /// Start the periodic sweep on build (default `true`). Requires a tokio
    /// runtime; without one the sweep must be driven with [`Store::run_gc`].
    pub fn gc_task(mut self, enabled: bool) -> Self {
        self.gc_task = enabled;
        self
    }

    pub fn build(self) -> Arc<Store> {
        let params = Arc::new(ParamsCanonicalizer::new(
            self.config.canonical_depth_limit_non_zero().get(),
        ));
        let object_sets = ObjectSetCanonicalizer::new(Arc::clone(&params), Arc::clone(&self.metadata));
        let state = StoreState::new(&self.config, self.on_key_created);
        let loader = BulkObjectLoader::new(
            Arc::clone(&self.client),
            Arc::clone(&self.metadata),
            self.config.bulk_window(),
            self.config.bulk_max_entries,
        );

        let store = Arc::new_cyclic(|me| Store {
            me: me.clone(),
            state: Mutex::new(state),
            config: self.config,
            client: self.client,
            metadata: self.metadata,
            loader,
            params,
            object_sets,
            order_by: OrderByCanonicalizer::new(),
            on_key_destroyed: self.on_key_destroyed,
            gc_task: Mutex::new(None),
        });

        if self.gc_task {
            store.spawn_gc();
        }
        store
    }
}

pub struct Store {
    me: Weak<Store>,
    state: Mutex<StoreState>,
    config: CacheConfig,
    client: Arc<dyn OntologyClient>,
    metadata: Arc<dyn OntologyMetadata>,
    loader: BulkObjectLoader,
    params: Arc<ParamsCanonicalizer>,
    object_sets: ObjectSetCanonicalizer,
    order_by: OrderByCanonicalizer,
    on_key_destroyed: Option<KeyHook>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub fn builder(
        client: Arc<dyn OntologyClient>,
        metadata: Arc<dyn OntologyMetadata>,
    ) -> StoreBuilder {
        StoreBuilder {
            client,
            metadata,
            config: CacheConfig::default(),
            on_key_created: None,
            on_key_destroyed: None,
            gc_task: true,
        }
    }

    pub fn new(
        client: Arc<dyn OntologyClient>,
        metadata: Arc<dyn OntologyMetadata>,
        config: CacheConfig,
    ) -> Arc<Self> {
        Self::builder(client, metadata).config(config).build()
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, StoreState> {
        mutex_lock(&self.state, SOURCE, op)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn client(&self) -> &dyn OntologyClient {
        self.client.as_ref()
    }

    pub fn metadata(&self) -> &dyn OntologyMetadata {
        self.metadata.as_ref()
    }

    pub(crate) fn loader(&self) -> &BulkObjectLoader {
        &self.loader
    }

    pub fn params(&self) -> &ParamsCanonicalizer {
        &self.params
    }

    pub fn object_sets(&self) -> &ObjectSetCanonicalizer {
        &self.object_sets
    }

    pub fn order_by(&self) -> &OrderByCanonicalizer {
        &self.order_by
    }

    /// Monotonic store time in milliseconds.
    pub(crate) fn now(&self) -> i64 {
        self.lock("now").clock.tick()
    }

    /// A confirmed entry younger than `interval` exists for `key`.
    pub(crate) fn is_fresh(&self, key: &CacheKey, interval: Duration) -> bool {
        if interval.is_zero() {
            return false;
        }
        let max_age = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
        let mut state = self.lock("is_fresh");
        let now = state.clock.tick();
        state
            .layers
            .truth(key)
            .is_some_and(|entry| entry.status == Status::Loaded && now - entry.last_updated < max_age)
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// Run `f` as one atomic batch.
    ///
    /// Dependent queries see the batch's changes before it commits, and every
    /// affected subscriber is notified once after. Queries that asked to
    /// revalidate are started after the lock is released.
    ///
    /// If `f` panics, its writes are rolled back and the panic resumes once
    /// the lock is released. Nobody is notified.
    pub fn batch<R>(
        &self,
        meta: BatchMeta,
        f: impl FnOnce(&mut BatchContext<'_>) -> R,
    ) -> BatchOutcome<R> {
        let started = std::time::Instant::now();
        let mut follow_ups = Vec::new();

        let (value, changes, depth) = {
            let mut state = self.lock("batch");
            let queries: Vec<QueryHandle> = state.queries.values().cloned().collect();

            let mut ctx = BatchContext::new(&mut state, meta);
            let run = catch_unwind(AssertUnwindSafe(|| {
                let value = f(&mut ctx);
                if !ctx.changes().is_empty() {
                    for query in queries {
                        if query.node().on_changes(&mut ctx) {
                            follow_ups.push(query);
                        }
                    }
                }
                value
            }));
            let value = match run {
                Ok(value) => value,
                Err(panic) => {
                    ctx.rollback();
                    drop(state);
                    error!(
                        panic = %panic_message(panic.as_ref()),
                        "Batch panicked; writes rolled back"
                    );
                    resume_unwind(panic);
                }
            };
            let result = ctx.finish();

            let touched: HashSet<CacheKey> = result.touched.into_iter().collect();
            state.notify(&touched);
            (value, result.changes, state.layers.optimistic_depth())
        };

        histogram!(BATCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        gauge!(OPTIMISTIC_LAYERS).set(depth as f64);

        for query in follow_ups {
            debug!(cache_key = %query.node().key(), "Revalidating after changes");
            drop(query.node().revalidate_node(true));
        }

        BatchOutcome { value, changes }
    }

    /// Push an optimistic layer and run `f` against it.
    pub fn create_optimistic_layer(&self, f: impl FnOnce(&mut BatchContext<'_>)) -> OptimisticId {
        let id = OptimisticId::new();
        self.batch(BatchMeta::optimistic(id), |ctx| {
            ctx.ensure_layer();
            f(ctx);
        });
        debug!(optimistic_id = %id, "Optimistic layer created");
        id
    }

    /// Remove every layer tagged `id`. Keys whose visible entry changes are
    /// re-emitted and dependent queries rebuild their payloads.
    pub fn remove_layer(&self, id: OptimisticId) {
        let (touched, depth) = {
            let mut state = self.lock("remove_layer");
            let before: Vec<(CacheKey, Option<Arc<Entry>>)> = state
                .layers
                .layer_keys(id)
                .into_iter()
                .map(|key| {
                    let entry = state.layers.get(&key).cloned();
                    (key, entry)
                })
                .collect();
            state.layers.remove_layer(id);

            let touched: HashSet<CacheKey> = before
                .into_iter()
                .filter(|(key, before)| match (before, state.layers.get(key)) {
                    (Some(before), Some(after)) => !Arc::ptr_eq(before, after),
                    (None, None) => false,
                    _ => true,
                })
                .map(|(key, _)| key)
                .collect();
            state.notify(&touched);
            (touched, state.layers.optimistic_depth())
        };

        gauge!(OPTIMISTIC_LAYERS).set(depth as f64);
        debug!(optimistic_id = %id, keys = touched.len(), "Optimistic layer removed");
    }

    pub fn optimistic_depth(&self) -> usize {
        self.lock("optimistic_depth").layers.optimistic_depth()
    }

    // ========================================================================
    // Keys and entries
    // ========================================================================

    /// Look up or create a key and retain it once.
    pub fn get_cache_key(&self, kind: KeyKind, args: &[KeyArg]) -> CacheKey {
        let mut state = self.lock("get_cache_key");
        let key = state.cache_key(kind, args);
        state.refcounts.retain(&key);
        key
    }

    /// Look up or create a key without retaining it.
    pub fn register_cache_key(&self, kind: KeyKind, args: &[KeyArg]) -> CacheKey {
        self.lock("register_cache_key").cache_key(kind, args)
    }

    pub fn peek_cache_key(&self, kind: KeyKind, args: &[KeyArg]) -> Option<CacheKey> {
        self.lock("peek_cache_key").registry.peek(kind, args)
    }

    pub fn retain(&self, key: &CacheKey) -> bool {
        self.lock("retain").refcounts.retain(key)
    }

    pub fn release(&self, key: &CacheKey) {
        self.lock("release").refcounts.release(key);
    }

    pub fn ref_count(&self, key: &CacheKey) -> Option<usize> {
        self.lock("ref_count").refcounts.count(key)
    }

    pub fn key_count(&self) -> usize {
        self.lock("key_count").registry.len()
    }

    /// Topmost entry for `key`.
    pub fn read(&self, key: &CacheKey) -> Option<Arc<Entry>> {
        self.lock("read").layers.get(key).cloned()
    }

    /// Confirmed entry for `key`, ignoring optimistic layers.
    pub fn read_truth(&self, key: &CacheKey) -> Option<Arc<Entry>> {
        self.lock("read_truth").layers.truth(key).cloned()
    }

    pub fn snapshot(&self, key: &CacheKey) -> EntrySnapshot {
        self.lock("snapshot").snapshot(key)
    }

    /// Watch the visible entry of `key`. The channel closes when the key is
    /// finalized.
    pub fn subscribe_entry(&self, key: &CacheKey) -> watch::Receiver<EntrySnapshot> {
        let mut state = self.lock("subscribe_entry");
        let snapshot = state.snapshot(key);
        state
            .subjects
            .entry(key.clone())
            .or_insert_with(|| watch::channel(snapshot).0)
            .subscribe()
    }

    // ========================================================================
    // Query controllers
    // ========================================================================

    fn query_or_insert<Q>(
        &self,
        op: &'static str,
        kind: KeyKind,
        args: &[KeyArg],
        retain: bool,
        existing: impl FnOnce(&QueryHandle) -> Option<Arc<Q>>,
        create: impl FnOnce(CacheKey, &StoreState) -> Arc<Q>,
        wrap: impl FnOnce(Arc<Q>) -> QueryHandle,
    ) -> Arc<Q> {
        let mut state = self.lock(op);
        let key = state.cache_key(kind, args);
        if retain {
            state.refcounts.retain(&key);
        }
        if let Some(query) = state.queries.get(&key).and_then(existing) {
            return query;
        }
        let query = create(key.clone(), &state);
        state.queries.insert(key, wrap(Arc::clone(&query)));
        query
    }

    fn object_query_inner(
        &self,
        api_name: &str,
        primary_key: PrimaryKey,
        retain: bool,
    ) -> Arc<ObjectQuery> {
        let object = ObjectRef::new(api_name, primary_key);
        let args = object_key_args(&object);
        self.query_or_insert(
            "object_query",
            KeyKind::Object,
            &args,
            retain,
            |handle| match handle {
                QueryHandle::Object(query) => Some(Arc::clone(query)),
                _ => None,
            },
            |key, state| {
                Arc::new(ObjectQuery::new(
                    self.me.clone(),
                    key,
                    object.api_name.clone(),
                    object.primary_key.clone(),
                    state,
                ))
            },
            QueryHandle::Object,
        )
    }

    pub fn object_query(
        &self,
        api_name: &str,
        primary_key: impl Into<PrimaryKey>,
    ) -> Arc<ObjectQuery> {
        self.object_query_inner(api_name, primary_key.into(), false)
    }

    fn list_query_inner(
        &self,
        descriptor: &ListDescriptor,
        retain: bool,
    ) -> Result<Arc<ListQuery>, CacheError> {
        let resolved = ResolvedList::resolve(self, descriptor)?;
        let args = resolved.args.clone();
        let page_size = self.config.page_size_non_zero().get();
        Ok(self.query_or_insert(
            "list_query",
            KeyKind::List,
            &args,
            retain,
            |handle| match handle {
                QueryHandle::List(query) => Some(Arc::clone(query)),
                _ => None,
            },
            |key, state| {
                Arc::new(ListQuery::new(
                    self.me.clone(),
                    key,
                    descriptor.clone(),
                    resolved,
                    page_size,
                    state,
                ))
            },
            QueryHandle::List,
        ))
    }

    pub fn list_query(&self, descriptor: &ListDescriptor) -> Result<Arc<ListQuery>, CacheError> {
        self.list_query_inner(descriptor, false)
    }

    fn aggregation_query_inner(
        &self,
        api_name: &str,
        where_clause: &Value,
        aggregate: &Value,
        retain: bool,
    ) -> Result<Arc<AggregationQuery>, CacheError> {
        self.metadata.object_definition(api_name)?;
        let where_clause = self.params.canonicalize_json(where_clause);
        let aggregate = self.params.canonicalize_json(aggregate);
        let args = [
            KeyArg::from(api_name),
            KeyArg::Value(where_clause.clone()),
            KeyArg::Value(aggregate.clone()),
        ];
        Ok(self.query_or_insert(
            "aggregation_query",
            KeyKind::Aggregation,
            &args,
            retain,
            |handle| match handle {
                QueryHandle::Aggregation(query) => Some(Arc::clone(query)),
                _ => None,
            },
            |key, state| {
                Arc::new(AggregationQuery::new(
                    self.me.clone(),
                    key,
                    api_name.to_string(),
                    where_clause,
                    aggregate,
                    state,
                ))
            },
            QueryHandle::Aggregation,
        ))
    }

    pub fn aggregation_query(
        &self,
        api_name: &str,
        where_clause: &Value,
        aggregate: &Value,
    ) -> Result<Arc<AggregationQuery>, CacheError> {
        self.aggregation_query_inner(api_name, where_clause, aggregate, false)
    }

    fn link_query_inner(
        &self,
        source: &ObjectRef,
        link: &str,
        where_clause: &Value,
        order_by: &OrderBy,
        retain: bool,
    ) -> Result<Arc<LinkQuery>, CacheError> {
        let definition = self.metadata.object_definition(&source.api_name)?;
        let target_type = definition.link(link)?.target_type.clone();
        let where_clause = self.params.canonicalize_json(where_clause);
        let order_by = self.order_by.canonicalize(order_by);
        let args = [
            KeyArg::from(source.api_name.as_str()),
            KeyArg::from(&source.primary_key),
            KeyArg::from(link),
            KeyArg::Value(where_clause.clone()),
            KeyArg::OrderBy(order_by.clone()),
        ];
        let spec = LinkSpec {
            source: source.clone(),
            primary_key_property: definition.primary_key_api_name.clone(),
            link: link.to_string(),
            target_type,
            where_clause,
            order_by,
        };
        let page_size = self.config.page_size_non_zero().get();
        Ok(self.query_or_insert(
            "link_query",
            KeyKind::Links,
            &args,
            retain,
            |handle| match handle {
                QueryHandle::Links(query) => Some(Arc::clone(query)),
                _ => None,
            },
            |key, state| Arc::new(LinkQuery::new(self.me.clone(), key, spec, page_size, state)),
            QueryHandle::Links,
        ))
    }

    pub fn link_query(
        &self,
        source: &ObjectRef,
        link: &str,
        where_clause: &Value,
        order_by: &OrderBy,
    ) -> Result<Arc<LinkQuery>, CacheError> {
        self.link_query_inner(source, link, where_clause, order_by, false)
    }

    fn function_query_inner(
        &self,
        api_name: &str,
        params: &BTreeMap<String, ParamValue>,
        version: Option<&str>,
        retain: bool,
    ) -> Arc<FunctionQuery> {
        let params = self.params.canonicalize(params);
        let args = [
            KeyArg::from(api_name),
            KeyArg::Value(params.clone()),
            KeyArg::from(version),
        ];
        self.query_or_insert(
            "function_query",
            KeyKind::Function,
            &args,
            retain,
            |handle| match handle {
                QueryHandle::Function(query) => Some(Arc::clone(query)),
                _ => None,
            },
            |key, state| {
                Arc::new(FunctionQuery::new(
                    self.me.clone(),
                    key,
                    api_name.to_string(),
                    params,
                    version.map(str::to_string),
                    state,
                ))
            },
            QueryHandle::Function,
        )
    }

    pub fn function_query(
        &self,
        api_name: &str,
        params: &BTreeMap<String, ParamValue>,
        version: Option<&str>,
    ) -> Arc<FunctionQuery> {
        self.function_query_inner(api_name, params, version, false)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to `query`, retaining its key until the subscription drops.
    pub fn observe<Q: Query>(
        &self,
        query: &Arc<Q>,
        options: ObserveOptions,
    ) -> QuerySubscription<Q::Value> {
        self.retain(query.cache_key());
        self.subscribe_retained(query, options)
    }

    fn subscribe_retained<Q: Query>(
        &self,
        query: &Arc<Q>,
        options: ObserveOptions,
    ) -> QuerySubscription<Q::Value> {
        let receiver = query.subscribe();
        match options.mode {
            ObserveMode::Offline => {}
            ObserveMode::Force => drop(query.revalidate(true)),
            ObserveMode::Default => {
                let interval = options
                    .dedupe_interval
                    .unwrap_or_else(|| self.config.dedupe_interval());
                drop(query.revalidate_if_older(interval));
            }
        }
        QuerySubscription::new(self.me.clone(), query.cache_key().clone(), receiver)
    }

    pub fn observe_object(
        &self,
        api_name: &str,
        primary_key: impl Into<PrimaryKey>,
        options: ObserveOptions,
    ) -> QuerySubscription<Arc<OsdkObject>> {
        let query = self.object_query_inner(api_name, primary_key.into(), true);
        self.subscribe_retained(&query, options)
    }

    pub fn observe_list(
        &self,
        descriptor: &ListDescriptor,
        options: ObserveOptions,
    ) -> Result<QuerySubscription<ListPage>, CacheError> {
        let query = self.list_query_inner(descriptor, true)?;
        Ok(self.subscribe_retained(&query, options))
    }

    pub fn observe_aggregation(
        &self,
        api_name: &str,
        where_clause: &Value,
        aggregate: &Value,
        options: ObserveOptions,
    ) -> Result<QuerySubscription<Arc<Value>>, CacheError> {
        let query = self.aggregation_query_inner(api_name, where_clause, aggregate, true)?;
        Ok(self.subscribe_retained(&query, options))
    }

    pub fn observe_links(
        &self,
        source: &ObjectRef,
        link: &str,
        where_clause: &Value,
        order_by: &OrderBy,
        options: ObserveOptions,
    ) -> Result<QuerySubscription<ListPage>, CacheError> {
        let query = self.link_query_inner(source, link, where_clause, order_by, true)?;
        Ok(self.subscribe_retained(&query, options))
    }

    pub fn observe_function(
        &self,
        api_name: &str,
        params: &BTreeMap<String, ParamValue>,
        version: Option<&str>,
        options: ObserveOptions,
    ) -> QuerySubscription<Arc<Value>> {
        let query = self.function_query_inner(api_name, params, version, true);
        self.subscribe_retained(&query, options)
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    fn revalidate_all(handles: Vec<QueryHandle>) -> BoxFuture<'static, ()> {
        let fetches: Vec<QueryFuture> = handles
            .iter()
            .map(|handle| handle.node().revalidate_node(true))
            .collect();
        join_all(fetches).map(|_| ()).boxed()
    }

    /// Refetch the object query for `object`, if one exists.
    pub fn invalidate_object(&self, object: &ObjectRef) -> BoxFuture<'static, ()> {
        let handles: Vec<QueryHandle> = {
            let state = self.lock("invalidate_object");
            state
                .registry
                .peek(KeyKind::Object, &object_key_args(object))
                .and_then(|key| state.queries.get(&key).cloned())
                .into_iter()
                .collect()
        };
        Self::revalidate_all(handles)
    }

    /// Refetch every query that depends on objects of `api_name`.
    pub fn invalidate_object_type(&self, api_name: &str) -> BoxFuture<'static, ()> {
        let handles: Vec<QueryHandle> = {
            let state = self.lock("invalidate_object_type");
            state
                .queries
                .values()
                .filter(|handle| handle.node().depends_on_type(api_name))
                .cloned()
                .collect()
        };
        debug!(api_name, queries = handles.len(), "Invalidating object type");
        Self::revalidate_all(handles)
    }

    pub fn invalidate_list(
        &self,
        descriptor: &ListDescriptor,
    ) -> Result<BoxFuture<'static, ()>, CacheError> {
        let resolved = ResolvedList::resolve(self, descriptor)?;
        let handles: Vec<QueryHandle> = {
            let state = self.lock("invalidate_list");
            state
                .registry
                .peek(KeyKind::List, &resolved.args)
                .and_then(|key| state.queries.get(&key).cloned())
                .into_iter()
                .collect()
        };
        Ok(Self::revalidate_all(handles))
    }

    /// Refetch every cached execution of function `api_name`.
    pub fn invalidate_function(&self, api_name: &str) -> BoxFuture<'static, ()> {
        let handles: Vec<QueryHandle> = {
            let state = self.lock("invalidate_function");
            state
                .queries
                .values()
                .filter(|handle| {
                    matches!(handle, QueryHandle::Function(query) if query.api_name() == api_name)
                })
                .cloned()
                .collect()
        };
        Self::revalidate_all(handles)
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    /// Finalize every key whose deletion delay has elapsed.
    ///
    /// Returns the finalized keys.
    pub fn run_gc(&self) -> Vec<CacheKey> {
        let now = Instant::now();
        let destroyed = {
            let mut guard = self.lock("run_gc");
            let StoreState {
                registry,
                refcounts,
                layers,
                subjects,
                queries,
                ..
            } = &mut *guard;

            // registry and ref counts drop a key together; everything else
            // keyed by it is cleaned up after
            let destroyed = refcounts.gc(now, |key| {
                registry.remove(key);
            });

            let mut orphaned = Vec::new();
            let mut disposed = Vec::new();
            for key in &destroyed {
                subjects.remove(key);
                if let Some(query) = queries.remove(key) {
                    disposed.push(query);
                }
                if let Some(entry) = layers.remove_key(key)
                    && let Some(collection) = entry.collection()
                {
                    orphaned.extend(collection.data.iter().cloned());
                }
            }
            for key in &orphaned {
                refcounts.release(key);
            }
            for query in &disposed {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| query.node().dispose())) {
                    error!(
                        cache_key = %query.node().key(),
                        panic = %panic_message(panic.as_ref()),
                        "Query dispose panicked"
                    );
                }
            }
            destroyed
        };

        for key in &destroyed {
            counter!(KEY_DESTROYED_TOTAL, "kind" => key.kind().as_str()).increment(1);
            debug!(cache_key = %key, key_id = key.id(), "Cache key destroyed");
            if let Some(hook) = &self.on_key_destroyed
                && let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook(key)))
            {
                error!(
                    cache_key = %key,
                    panic = %panic_message(panic.as_ref()),
                    "Key destroy hook panicked"
                );
            }
        }
        destroyed
    }

    /// Start the periodic sweep on the current tokio runtime, replacing any
    /// running sweep.
    pub fn spawn_gc(&self) {
        let Ok(handle) = Handle::try_current() else {
            warn!("No tokio runtime; cache sweep must be driven manually");
            return;
        };
        let store = self.me.clone();
        let period = self.config.sweep_interval();
        let task = handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.run_gc();
            }
        });

        if let Some(previous) = mutex_lock(&self.gc_task, SOURCE, "spawn_gc").replace(task) {
            previous.abort();
        }
    }

    /// Stop the sweep and dispose every query controller.
    pub fn shutdown(&self) {
        if let Some(task) = mutex_lock(&self.gc_task, SOURCE, "shutdown").take() {
            task.abort();
        }
        let mut state = self.lock("shutdown");
        for (_, query) in state.queries.drain() {
            query.node().dispose();
        }
        state.subjects.clear();
        info!(keys = state.registry.len(), "Cache store shut down");
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(task) = mutex_lock(&self.gc_task, SOURCE, "drop").take() {
            task.abort();
        }
    }
}
