use std::collections::HashSet;
use std::sync::{Arc, Weak};
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
use crate::cache::network::AggregateRequest;
use crate::cache::object::ObjectSet;
use crate::cache::store::{Store, StoreState};

/// An aggregation over one object type, keyed
/// `("aggregation", [type, where, aggregate])`.
///
/// Any confirmed modification or removal of an object of the type triggers a
/// refetch. Objects merely seen for the first time do not.
pub struct AggregationQuery {
    core: QueryCore<Arc<Value>>,
    api_name: String,
    where_clause: Canonical<Value>,
    aggregate: Canonical<Value>,
}

impl AggregationQuery {
    pub(crate) fn new(
        store: Weak<Store>,
        cache_key: CacheKey,
        api_name: String,
        where_clause: Canonical<Value>,
        aggregate: Canonical<Value>,
        state: &StoreState,
    ) -> Self {
        let initial = build_payload(state, &cache_key);
        Self {
            core: QueryCore::new(store, cache_key, initial),
            api_name,
            where_clause,
            aggregate,
        }
    }

    pub fn api_name(&self) -> &str {
        &self.api_name
    }

    fn fetch_and_store(&self, store: Arc<Store>) -> BoxFuture<'static, ()> {
        let key = self.core.cache_key().clone();
        let base = ObjectSet::base(self.api_name.as_str());
        let object_set = match &*self.where_clause {
            Value::Object(map) if map.is_empty() => base,
            where_clause => base.filter(where_clause.clone()),
        };
        let request = AggregateRequest {
            object_set,
            aggregate: (*self.aggregate).clone(),
        };
        let disposed = self.core.disposed_flag();

        async move {
            let requested_at = store.now();
            let result = store.client().aggregate(request).await;
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

impl Query for AggregationQuery {
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

impl QueryNode for AggregationQuery {
    fn key(&self) -> &CacheKey {
        self.core.cache_key()
    }

    fn on_changes(&self, ctx: &mut BatchContext<'_>) -> bool {
        if ctx.is_optimistic() {
            return false;
        }
        let changes = ctx.changes();
        changes
            .modified_objects()
            .any(|(_, object)| object.api_name == self.api_name)
            || changes
                .removed_objects()
                .any(|key| key.arg(0).as_str() == Some(self.api_name.as_str()))
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
