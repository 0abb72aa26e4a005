use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;

use super::{Freshness, Payload, Query, QueryCore, QueryFuture, QueryNode, is_live, store_error};
use crate::cache::batch::{BatchContext, BatchMeta};
use crate::cache::keys::CacheKey;
use crate::cache::layer::Status;
use crate::cache::object::{OsdkObject, PrimaryKey};
use crate::cache::store::{Store, StoreState};

/// A single object, keyed `("object", [type, pk])`.
pub struct ObjectQuery {
    core: QueryCore<Arc<OsdkObject>>,
    api_name: String,
    primary_key: PrimaryKey,
}

impl ObjectQuery {
    pub(crate) fn new(
        store: Weak<Store>,
        cache_key: CacheKey,
        api_name: String,
        primary_key: PrimaryKey,
        state: &StoreState,
    ) -> Self {
        let initial = build_payload(state, &cache_key);
        Self {
            core: QueryCore::new(store, cache_key, initial),
            api_name,
            primary_key,
        }
    }

    pub fn api_name(&self) -> &str {
        &self.api_name
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    fn fetch_and_store(&self, store: Arc<Store>) -> BoxFuture<'static, ()> {
        let key = self.core.cache_key().clone();
        let api_name = self.api_name.clone();
        let primary_key = self.primary_key.clone();
        let disposed = self.core.disposed_flag();

        async move {
            let requested_at = store.now();
            let result = store.loader().fetch(&api_name, primary_key).await;
            if !is_live(&disposed) {
                return;
            }
            store.batch(BatchMeta::default(), |ctx| match result {
                Ok(object) => {
                    if !ctx.has_newer(&key, requested_at) {
                        ctx.write_object_at(Arc::new(object), Status::Loaded, requested_at);
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

fn build_payload(state: &StoreState, key: &CacheKey) -> Payload<Arc<OsdkObject>> {
    Payload::from_entry(state.layers.get(key), state.layers.is_optimistic(key), |entry| {
        entry.object().cloned()
    })
}

impl Query for ObjectQuery {
    type Value = Arc<OsdkObject>;

    fn cache_key(&self) -> &CacheKey {
        self.core.cache_key()
    }

    fn current(&self) -> Payload<Arc<OsdkObject>> {
        self.core.current()
    }

    fn subscribe(&self) -> watch::Receiver<Payload<Arc<OsdkObject>>> {
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

impl QueryNode for ObjectQuery {
    fn key(&self) -> &CacheKey {
        self.core.cache_key()
    }

    fn on_changes(&self, _ctx: &mut BatchContext<'_>) -> bool {
        false
    }

    fn refresh(&self, state: &StoreState, touched: &HashSet<CacheKey>) {
        if touched.contains(self.core.cache_key()) {
            self.core
                .publish(build_payload(state, self.core.cache_key()));
        }
    }

    fn depends_on_type(&self, api_name: &str) -> bool {
        self.api_name == api_name
    }

    fn revalidate_node(&self, force: bool) -> QueryFuture {
        Query::revalidate(self, force)
    }

    fn dispose(&self) {
        self.core.dispose();
    }
}
