//! Coalesced single-object fetches.
//!
//! Object queries started close together load their objects through one
//! [`BulkObjectLoader`]. Requests for the same object type are held for a
//! short window, or until the batch is full, and then sent as one page fetch
//! filtered with `$in` on the primary key. A batch asking for a single
//! object uses `fetch_one` instead.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde_json::{Map, Value, json};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::canonical::OrderBy;
use super::lock::mutex_lock;
use super::metadata::OntologyMetadata;
use super::network::{NetworkError, OntologyClient, PageRequest};
use super::object::{ObjectSet, OsdkObject, PrimaryKey};

const SOURCE: &str = "cache::bulk_loader";

type Reply = oneshot::Sender<Result<OsdkObject, NetworkError>>;
type Loaded = HashMap<PrimaryKey, Result<OsdkObject, NetworkError>>;

struct PendingBatch {
    id: u64,
    waiters: Vec<(PrimaryKey, Reply)>,
}

#[derive(Default)]
struct Pending {
    next_id: u64,
    batches: HashMap<String, PendingBatch>,
}

enum Enqueued {
    /// First request of a new batch; the caller arms its timer.
    Opened(u64),
    Joined,
    /// The request filled the batch; the caller flushes it now.
    Full(Vec<(PrimaryKey, Reply)>),
}

struct LoaderInner {
    client: Arc<dyn OntologyClient>,
    metadata: Arc<dyn OntologyMetadata>,
    window: Duration,
    max_entries: usize,
    pending: Mutex<Pending>,
}

pub(crate) struct BulkObjectLoader {
    inner: Arc<LoaderInner>,
}

impl BulkObjectLoader {
    pub(crate) fn new(
        client: Arc<dyn OntologyClient>,
        metadata: Arc<dyn OntologyMetadata>,
        window: Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                client,
                metadata,
                window,
                max_entries: max_entries.max(1),
                pending: Mutex::new(Pending::default()),
            }),
        }
    }

    /// Load one object, sharing the network call with other requests for the
    /// same type made within the batching window.
    pub(crate) async fn fetch(
        &self,
        api_name: &str,
        primary_key: PrimaryKey,
    ) -> Result<OsdkObject, NetworkError> {
        let (reply, response) = oneshot::channel();
        let enqueued = self.inner.enqueue(api_name, primary_key, reply);
        let inner = Arc::clone(&self.inner);
        let api_name = api_name.to_string();

        match (enqueued, Handle::try_current().ok()) {
            (Enqueued::Joined, _) => {}
            (Enqueued::Full(waiters), Some(handle)) => {
                handle.spawn(inner.flush(api_name, waiters));
            }
            (Enqueued::Opened(id), Some(handle)) => {
                handle.spawn(async move {
                    tokio::time::sleep(inner.window).await;
                    inner.flush_batch(api_name, id).await;
                });
            }
            // without a runtime there is no timer; flush right away
            (Enqueued::Full(waiters), None) => inner.flush(api_name, waiters).await,
            (Enqueued::Opened(id), None) => inner.flush_batch(api_name, id).await,
        }

        response
            .await
            .unwrap_or_else(|_| Err(NetworkError::transport("bulk object load was dropped")))
    }
}

impl LoaderInner {
    fn enqueue(&self, api_name: &str, primary_key: PrimaryKey, reply: Reply) -> Enqueued {
        let mut pending = mutex_lock(&self.pending, SOURCE, "enqueue");
        let Pending { next_id, batches } = &mut *pending;

        let mut opened = None;
        let batch = batches.entry(api_name.to_string()).or_insert_with(|| {
            *next_id += 1;
            opened = Some(*next_id);
            PendingBatch {
                id: *next_id,
                waiters: Vec::new(),
            }
        });
        batch.waiters.push((primary_key, reply));

        if batch.waiters.len() >= self.max_entries {
            return match batches.remove(api_name) {
                Some(batch) => Enqueued::Full(batch.waiters),
                None => Enqueued::Joined,
            };
        }
        match opened {
            Some(id) => Enqueued::Opened(id),
            None => Enqueued::Joined,
        }
    }

    /// Flush batch `id` if it is still waiting; a full batch was already sent.
    async fn flush_batch(self: Arc<Self>, api_name: String, id: u64) {
        let waiters = {
            let mut pending = mutex_lock(&self.pending, SOURCE, "flush_batch");
            if !pending.batches.get(&api_name).is_some_and(|batch| batch.id == id) {
                return;
            }
            pending
                .batches
                .remove(&api_name)
                .map(|batch| batch.waiters)
                .unwrap_or_default()
        };
        self.flush(api_name, waiters).await;
    }

    async fn flush(self: Arc<Self>, api_name: String, waiters: Vec<(PrimaryKey, Reply)>) {
        let keys: BTreeSet<PrimaryKey> = waiters.iter().map(|(key, _)| key.clone()).collect();
        let loaded = self.load(&api_name, keys).await;

        for (primary_key, reply) in waiters {
            let result = match loaded.get(&primary_key) {
                Some(result) => result.clone(),
                None => Err(NetworkError::not_found(api_name.as_str(), primary_key.clone())),
            };
            // the requesting query may have been dropped
            let _ = reply.send(result);
        }
    }

    async fn load(&self, api_name: &str, keys: BTreeSet<PrimaryKey>) -> Loaded {
        if keys.len() == 1 {
            return self.load_each(api_name, keys).await;
        }
        let property = match self.metadata.object_definition(api_name) {
            Ok(definition) => definition.primary_key_api_name.clone(),
            Err(err) => {
                warn!(api_name, error = %err, "No primary key property; loading objects one by one");
                return self.load_each(api_name, keys).await;
            }
        };

        let values: Vec<Value> = keys.iter().map(PrimaryKey::to_value).collect();
        let mut clause = Map::new();
        clause.insert(property, json!({ "$in": values }));
        let request = PageRequest {
            object_set: ObjectSet::base(api_name).filter(Value::Object(clause)),
            page_size: Some(keys.len()),
            page_token: None,
            order_by: OrderBy::new(),
        };
        debug!(api_name, objects = keys.len(), "Bulk object load");

        match self.client.fetch_page(request).await {
            Ok(page) => page
                .data
                .into_iter()
                .map(|object| (object.primary_key.clone(), Ok(object)))
                .collect(),
            Err(err) => keys.into_iter().map(|key| (key, Err(err.clone()))).collect(),
        }
    }

    async fn load_each(&self, api_name: &str, keys: BTreeSet<PrimaryKey>) -> Loaded {
        let fetches = keys.into_iter().map(|key| async move {
            let result = self.client.fetch_one(api_name, &key).await;
            (key, result)
        });
        join_all(fetches).await.into_iter().collect()
    }
}
