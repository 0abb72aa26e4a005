use std::fmt;
use std::sync::Weak;

use async_stream::stream;
use futures::Stream;
use tokio::sync::watch;

use super::Payload;
use crate::cache::keys::CacheKey;
use crate::cache::store::Store;

/// A live view of one query. Holds a retain on the query's key for as long as
/// it exists.
pub struct QuerySubscription<T> {
    store: Weak<Store>,
    cache_key: CacheKey,
    receiver: watch::Receiver<Payload<T>>,
}

impl<T: Clone + Send + Sync + 'static> QuerySubscription<T> {
    /// `cache_key` must already be retained on behalf of the subscription.
    pub(crate) fn new(
        store: Weak<Store>,
        cache_key: CacheKey,
        receiver: watch::Receiver<Payload<T>>,
    ) -> Self {
        Self {
            store,
            cache_key,
            receiver,
        }
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    pub fn current(&self) -> Payload<T> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next payload. `None` once the query is gone.
    pub async fn changed(&mut self) -> Option<Payload<T>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// The current payload followed by every later one.
    pub fn into_stream(mut self) -> impl Stream<Item = Payload<T>> + Send {
        stream! {
            let first = self.receiver.borrow_and_update().clone();
            yield first;
            while let Some(payload) = self.changed().await {
                yield payload;
            }
        }
    }
}

impl<T> fmt::Debug for QuerySubscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySubscription")
            .field("cache_key", &self.cache_key)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for QuerySubscription<T> {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.release(&self.cache_key);
        }
    }
}
