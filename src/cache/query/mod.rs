//! Query controllers.
//!
//! One controller exists per cache key. It owns the reactive output for that
//! key, guarantees at most one fetch in flight, and reacts to the changes of
//! every batch while the batch is still open.

mod aggregation;
mod function;
mod links;
mod list;
mod object;
mod subscription;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::batch::{BatchContext, BatchMeta};
use super::error::CacheError;
use super::keys::{CacheKey, KeyKind, object_key_args};
use super::layer::{Collection, Entry, Status, StoreValue};
use super::lock::mutex_lock;
use super::metrics_names::{FETCH_ERROR_TOTAL, FETCH_JOINED_TOTAL, FETCH_TOTAL};
use super::object::OsdkObject;
use super::store::{Store, StoreState};

pub use aggregation::AggregationQuery;
pub use function::FunctionQuery;
pub use links::LinkQuery;
pub(crate) use links::LinkSpec;
pub use list::{ListDescriptor, ListQuery, ListSource};
pub(crate) use list::ResolvedList;
pub use object::ObjectQuery;
pub use subscription::QuerySubscription;

const SOURCE: &str = "cache::query";

/// Completion of one fetch, shared by every caller that joined it.
pub type QueryFuture = Shared<BoxFuture<'static, ()>>;

pub(crate) fn ready() -> QueryFuture {
    futures::future::ready(()).boxed().shared()
}

/// What a subscriber sees for one query.
#[derive(Debug, Clone)]
pub struct Payload<T> {
    pub status: Status,
    pub value: Option<T>,
    pub last_updated: i64,
    pub is_optimistic: bool,
    pub error: Option<Arc<CacheError>>,
}

impl<T> Payload<T> {
    pub fn init() -> Self {
        Self {
            status: Status::Init,
            value: None,
            last_updated: 0,
            is_optimistic: false,
            error: None,
        }
    }

    pub(crate) fn from_entry(
        entry: Option<&Arc<Entry>>,
        is_optimistic: bool,
        value: impl FnOnce(&Entry) -> Option<T>,
    ) -> Self {
        match entry {
            None => Self::init(),
            Some(entry) => Self {
                status: entry.status,
                value: value(entry),
                last_updated: entry.last_updated,
                is_optimistic,
                error: entry.error.clone(),
            },
        }
    }
}

impl<T> Default for Payload<T> {
    fn default() -> Self {
        Self::init()
    }
}

/// A page of list or link results.
#[derive(Debug, Clone, PartialEq)]
pub struct ListPage {
    pub data: Vec<Arc<OsdkObject>>,
    pub total_count: Option<u64>,
    pub has_more: bool,
}

impl ListPage {
    pub(crate) fn from_collection(state: &StoreState, collection: &Collection) -> Self {
        let data = collection
            .data
            .iter()
            .filter_map(|key| state.layers.get(key).and_then(|entry| entry.object().cloned()))
            .collect();
        Self {
            data,
            total_count: collection.total_count,
            has_more: collection.next_page_token.is_some(),
        }
    }
}

/// Build the payload of a collection-backed query.
pub(crate) fn collection_payload(state: &StoreState, key: &CacheKey) -> Payload<ListPage> {
    let entry = state.layers.get(key);
    let is_optimistic = state.layers.is_optimistic(key)
        || entry
            .and_then(|entry| entry.collection())
            .is_some_and(|collection| {
                collection
                    .data
                    .iter()
                    .any(|member| state.layers.is_optimistic(member))
            });
    Payload::from_entry(entry, is_optimistic, |entry| {
        entry
            .collection()
            .map(|collection| ListPage::from_collection(state, collection))
    })
}

/// Whether a batch touched a collection-backed query.
pub(crate) fn collection_touched(
    state: &StoreState,
    key: &CacheKey,
    touched: &HashSet<CacheKey>,
) -> bool {
    touched.contains(key)
        || state
            .layers
            .get(key)
            .and_then(|entry| entry.collection())
            .is_some_and(|collection| collection.data.iter().any(|member| touched.contains(member)))
}

/// How eagerly `observe` fetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ObserveMode {
    /// Fetch unless a loaded entry is younger than the dedupe interval.
    #[default]
    Default,
    /// Always fetch.
    Force,
    /// Never fetch; serve whatever is cached.
    Offline,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ObserveOptions {
    pub mode: ObserveMode,
    /// Overrides the store's dedupe interval.
    pub dedupe_interval: Option<Duration>,
}

impl ObserveOptions {
    pub fn force() -> Self {
        Self {
            mode: ObserveMode::Force,
            dedupe_interval: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            mode: ObserveMode::Offline,
            dedupe_interval: None,
        }
    }
}

/// When a revalidation actually fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Freshness {
    Force,
    IfOlderThan(Duration),
}

/// Public surface shared by every query kind.
pub trait Query: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;

    fn cache_key(&self) -> &CacheKey;

    /// Latest payload.
    fn current(&self) -> Payload<Self::Value>;

    fn subscribe(&self) -> watch::Receiver<Payload<Self::Value>>;

    /// Fetch again. With `force == false` a loaded entry younger than the
    /// dedupe interval is kept. Joins a fetch already in flight.
    fn revalidate(&self, force: bool) -> QueryFuture;

    /// Fetch unless a loaded entry is younger than `interval`.
    fn revalidate_if_older(&self, interval: Duration) -> QueryFuture;
}

/// Store-facing side of a query controller.
pub(crate) trait QueryNode: Send + Sync {
    fn key(&self) -> &CacheKey;

    /// React to a batch's changes before it commits. Returns `true` when the
    /// query must revalidate once the batch is done.
    fn on_changes(&self, ctx: &mut BatchContext<'_>) -> bool;

    /// Rebuild and publish the payload if `touched` affects this query.
    fn refresh(&self, state: &StoreState, touched: &HashSet<CacheKey>);

    /// Whether a change to any object of `api_name` invalidates this query.
    fn depends_on_type(&self, api_name: &str) -> bool;

    fn revalidate_node(&self, force: bool) -> QueryFuture;

    fn dispose(&self);
}

/// Every live controller, by kind.
#[derive(Clone)]
pub(crate) enum QueryHandle {
    Object(Arc<ObjectQuery>),
    List(Arc<ListQuery>),
    Aggregation(Arc<AggregationQuery>),
    Links(Arc<LinkQuery>),
    Function(Arc<FunctionQuery>),
}

impl QueryHandle {
    pub(crate) fn node(&self) -> &dyn QueryNode {
        match self {
            Self::Object(query) => query.as_ref(),
            Self::List(query) => query.as_ref(),
            Self::Aggregation(query) => query.as_ref(),
            Self::Links(query) => query.as_ref(),
            Self::Function(query) => query.as_ref(),
        }
    }
}

/// State common to all controllers.
pub(crate) struct QueryCore<T> {
    cache_key: CacheKey,
    store: Weak<Store>,
    output: watch::Sender<Payload<T>>,
    pending: Arc<Mutex<Option<QueryFuture>>>,
    disposed: Arc<AtomicBool>,
}

impl<T: Clone + Send + Sync + 'static> QueryCore<T> {
    pub(crate) fn new(store: Weak<Store>, cache_key: CacheKey, initial: Payload<T>) -> Self {
        let (output, _) = watch::channel(initial);
        Self {
            cache_key,
            store,
            output,
            pending: Arc::new(Mutex::new(None)),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    pub(crate) fn store(&self) -> Option<Arc<Store>> {
        self.store.upgrade()
    }

    pub(crate) fn current(&self) -> Payload<T> {
        self.output.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Payload<T>> {
        self.output.subscribe()
    }

    pub(crate) fn publish(&self, payload: Payload<T>) {
        self.output.send_replace(payload);
    }

    pub(crate) fn disposed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.disposed)
    }

    pub(crate) fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            debug!(cache_key = %self.cache_key, "Query disposed");
        }
    }

    /// The fetch currently in flight, if any.
    pub(crate) fn pending(&self) -> Option<QueryFuture> {
        mutex_lock(&self.pending, SOURCE, "pending").clone()
    }

    /// Start a fetch through `fetch`, or join the one in flight.
    ///
    /// The entry moves to `Loading` before this returns. The fetch runs on the
    /// current tokio runtime when there is one; otherwise it runs when the
    /// returned future is first polled.
    pub(crate) fn revalidate<F>(&self, freshness: Freshness, fetch: F) -> QueryFuture
    where
        F: FnOnce(Arc<Store>) -> BoxFuture<'static, ()>,
    {
        let kind = self.cache_key.kind().as_str();
        let mut pending = mutex_lock(&self.pending, SOURCE, "revalidate");
        if let Some(existing) = pending.as_ref() {
            counter!(FETCH_JOINED_TOTAL, "kind" => kind).increment(1);
            trace!(cache_key = %self.cache_key, "Joined fetch in flight");
            return existing.clone();
        }
        if self.disposed.load(Ordering::SeqCst) {
            return ready();
        }
        let Some(store) = self.store() else {
            return ready();
        };
        if let Freshness::IfOlderThan(interval) = freshness
            && store.is_fresh(&self.cache_key, interval)
        {
            return ready();
        }

        let key = self.cache_key.clone();
        store.batch(BatchMeta::default(), |ctx| {
            ctx.set_status(&key, Status::Loading);
        });
        counter!(FETCH_TOTAL, "kind" => kind).increment(1);

        let slot = Arc::clone(&self.pending);
        let fetch = fetch(store);
        let shared = async move {
            fetch.await;
            mutex_lock(&slot, SOURCE, "revalidate.complete").take();
        }
        .boxed()
        .shared();

        *pending = Some(shared.clone());
        drop(pending);

        if let Ok(handle) = Handle::try_current() {
            handle.spawn(shared.clone());
        }
        shared
    }
}

/// Store a failed fetch on `key`, keeping fresher confirmed data.
pub(crate) fn store_error(
    ctx: &mut BatchContext<'_>,
    key: &CacheKey,
    error: CacheError,
    requested_at: i64,
) {
    counter!(FETCH_ERROR_TOTAL, "kind" => key.kind().as_str()).increment(1);
    debug!(cache_key = %key, error = %error, "Fetch failed");
    if ctx.has_newer(key, requested_at) {
        return;
    }
    ctx.write_error(key, Arc::new(error));
}

/// Whether a finished fetch should still be written.
pub(crate) fn is_live(disposed: &AtomicBool) -> bool {
    !disposed.load(Ordering::SeqCst)
}

/// Write fetched objects and return their keys in order, without duplicates.
///
/// Objects with a confirmed entry newer than `requested_at` keep that entry.
pub(crate) fn write_members(
    ctx: &mut BatchContext<'_>,
    objects: Vec<OsdkObject>,
    requested_at: i64,
) -> Vec<CacheKey> {
    let mut seen = HashSet::new();
    let mut keys = Vec::with_capacity(objects.len());
    for object in objects {
        let key = ctx.cache_key(
            KeyKind::Object,
            &object_key_args(&object.object_ref()),
        );
        if !ctx.has_newer(&key, requested_at) {
            ctx.write_object_at(Arc::new(object), Status::Loaded, requested_at);
        }
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }
    keys
}

/// Replace the collection stored on `key`, keeping its status and timestamp.
pub(crate) fn rewrite_collection(
    ctx: &mut BatchContext<'_>,
    entry: &Entry,
    collection: Collection,
) {
    ctx.write_at(
        &entry.cache_key,
        Some(StoreValue::Collection(Arc::new(collection))),
        entry.status,
        entry.last_updated,
        entry.error.clone(),
    );
    ctx.changes_mut().register_modified(&entry.cache_key);
}
