use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::debug;

use super::{
    Freshness, ListPage, Payload, Query, QueryCore, QueryFuture, QueryNode, collection_payload,
    collection_touched, is_live, rewrite_collection, store_error, write_members,
};
use crate::cache::batch::{BatchContext, BatchMeta};
use crate::cache::canonical::{Canonical, OrderBy};
use crate::cache::keys::CacheKey;
use crate::cache::layer::{Collection, Status, StoreValue};
use crate::cache::network::PageRequest;
use crate::cache::object::{ObjectRef, ObjectSet};
use crate::cache::store::{Store, StoreState};

/// Linked objects of one source object, keyed
/// `("links", [source type, pk, link, where, order_by])`.
pub struct LinkQuery {
    core: QueryCore<ListPage>,
    source: ObjectRef,
    primary_key_property: String,
    link: String,
    target_type: String,
    where_clause: Canonical<Value>,
    order_by: Canonical<OrderBy>,
    page_size: usize,
}

/// Link query inputs after metadata resolution.
pub(crate) struct LinkSpec {
    pub(crate) source: ObjectRef,
    pub(crate) primary_key_property: String,
    pub(crate) link: String,
    pub(crate) target_type: String,
    pub(crate) where_clause: Canonical<Value>,
    pub(crate) order_by: Canonical<OrderBy>,
}

impl LinkQuery {
    pub(crate) fn new(
        store: Weak<Store>,
        cache_key: CacheKey,
        spec: LinkSpec,
        page_size: usize,
        state: &StoreState,
    ) -> Self {
        let initial = collection_payload(state, &cache_key);
        Self {
            core: QueryCore::new(store, cache_key, initial),
            source: spec.source,
            primary_key_property: spec.primary_key_property,
            link: spec.link,
            target_type: spec.target_type,
            where_clause: spec.where_clause,
            order_by: spec.order_by,
            page_size,
        }
    }

    pub fn source(&self) -> &ObjectRef {
        &self.source
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn target_type(&self) -> &str {
        &self.target_type
    }

    fn wire_set(&self) -> ObjectSet {
        let mut pk_filter = Map::new();
        pk_filter.insert(
            self.primary_key_property.clone(),
            self.source.primary_key.to_value(),
        );
        let linked = ObjectSet::base(self.source.api_name.as_str())
            .filter(Value::Object(pk_filter))
            .search_around(self.link.as_str());
        match &*self.where_clause {
            Value::Object(map) if map.is_empty() => linked,
            where_clause => linked.filter(where_clause.clone()),
        }
    }

    fn fetch_and_store(&self, store: Arc<Store>) -> BoxFuture<'static, ()> {
        let key = self.core.cache_key().clone();
        let request = PageRequest {
            object_set: self.wire_set(),
            page_size: Some(self.page_size),
            page_token: None,
            order_by: (*self.order_by).clone(),
        };
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
}

impl Query for LinkQuery {
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

impl QueryNode for LinkQuery {
    fn key(&self) -> &CacheKey {
        self.core.cache_key()
    }

    fn on_changes(&self, ctx: &mut BatchContext<'_>) -> bool {
        let key = self.core.cache_key();
        if ctx.changes().is_modified(key) {
            return false;
        }

        let changes = ctx.changes();
        let source_removed = changes
            .removed_objects()
            .any(|removed| removed.object_ref().as_ref() == Some(&self.source));
        let source_modified = changes
            .modified_objects()
            .any(|(_, object)| object.object_ref() == self.source);
        let removed: HashSet<CacheKey> = changes.removed.clone();

        let Some(entry) = ctx.read(key) else {
            return false;
        };
        let Some(collection) = entry.collection().cloned() else {
            return false;
        };

        if source_removed {
            if !collection.data.is_empty() {
                debug!(cache_key = %key, source = %self.source, "Link source removed");
                rewrite_collection(
                    ctx,
                    &entry,
                    Collection {
                        data: Vec::new(),
                        total_count: Some(0),
                        next_page_token: None,
                    },
                );
            }
            return false;
        }

        if collection.data.iter().any(|member| removed.contains(member)) {
            let data = collection
                .data
                .iter()
                .filter(|member| !removed.contains(*member))
                .cloned()
                .collect();
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

        source_modified && !ctx.is_optimistic()
    }

    fn refresh(&self, state: &StoreState, touched: &HashSet<CacheKey>) {
        let key = self.core.cache_key();
        if collection_touched(state, key, touched) {
            self.core.publish(collection_payload(state, key));
        }
    }

    fn depends_on_type(&self, api_name: &str) -> bool {
        self.source.api_name == api_name || self.target_type == api_name
    }

    fn revalidate_node(&self, force: bool) -> QueryFuture {
        Query::revalidate(self, force)
    }

    fn dispose(&self) {
        self.core.dispose();
    }
}
