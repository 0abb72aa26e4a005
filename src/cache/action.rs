//! Action application with optional optimistic updates, and validate-only
//! action calls.

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::batch::{BatchContext, BatchMeta};
use super::error::CacheError;
use super::keys::{KeyKind, object_key_args};
use super::layer::{OptimisticId, Status};
use super::network::{ActionEditResponse, ActionValidationResponse};
use super::object::{ObjectRef, OsdkObject};
use super::query::Query;
use super::store::Store;

/// Writes applied to an optimistic layer while an action is in flight.
pub struct OptimisticBuilder<'a, 'b> {
    ctx: &'a mut BatchContext<'b>,
}

impl<'a, 'b> OptimisticBuilder<'a, 'b> {
    pub(crate) fn new(ctx: &'a mut BatchContext<'b>) -> Self {
        Self { ctx }
    }

    /// Replace an object with its expected post-action state.
    pub fn update_object(&mut self, object: OsdkObject) -> &mut Self {
        self.ctx.write_object(object, Status::Loaded);
        self
    }

    /// Show an object the action is expected to create.
    pub fn create_object(&mut self, object: OsdkObject) -> &mut Self {
        self.ctx.write_object(object, Status::Loaded);
        self
    }

    pub fn delete_object(&mut self, object: &ObjectRef) -> &mut Self {
        self.ctx.delete_object(object);
        self
    }
}

impl Store {
    /// Apply `action` and reconcile the cache with its reported edits.
    pub async fn apply_action(
        &self,
        action: &str,
        params: Value,
    ) -> Result<ActionEditResponse, CacheError> {
        self.run_action(action, params, None).await
    }

    /// Apply `action`, showing `optimistic` edits until the server answers.
    ///
    /// The optimistic layer is removed once the confirmed edits are in the
    /// cache, or immediately if the action fails.
    pub async fn apply_action_optimistic(
        &self,
        action: &str,
        params: Value,
        optimistic: impl FnOnce(&mut OptimisticBuilder<'_, '_>),
    ) -> Result<ActionEditResponse, CacheError> {
        let layer = self.create_optimistic_layer(|ctx| optimistic(&mut OptimisticBuilder::new(ctx)));
        self.run_action(action, params, Some(layer)).await
    }

    /// Ask the server whether `action` would be accepted with `params`.
    ///
    /// Nothing is applied and the cache is left untouched; an `Invalid`
    /// verdict is a successful response, not an error.
    #[instrument(skip(self, params))]
    pub async fn validate_action(
        &self,
        action: &str,
        params: Value,
    ) -> Result<ActionValidationResponse, CacheError> {
        let response = self.client().validate_action(action, params).await?;
        debug!(valid = response.is_valid(), "Action validated");
        Ok(response)
    }

    #[instrument(skip(self, params), fields(optimistic = layer.is_some()))]
    async fn run_action(
        &self,
        action: &str,
        params: Value,
        layer: Option<OptimisticId>,
    ) -> Result<ActionEditResponse, CacheError> {
        let response = match self.client().apply_action(action, params).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "Action failed");
                if let Some(id) = layer {
                    self.remove_layer(id);
                }
                return Err(err.into());
            }
        };

        if !response.deleted_objects.is_empty() {
            self.batch(BatchMeta::default(), |ctx| {
                for object in &response.deleted_objects {
                    ctx.delete_object(object);
                }
            });
        }

        let mut refreshes: Vec<BoxFuture<'static, ()>> = response
            .added_objects
            .iter()
            .chain(&response.modified_objects)
            .filter_map(|object| self.refresh_object(object))
            .collect();
        refreshes.extend(
            response
                .edited_object_types
                .iter()
                .map(|api_name| self.invalidate_object_type(api_name)),
        );
        join_all(refreshes).await;

        if let Some(id) = layer {
            self.remove_layer(id);
        }
        debug!(
            added = response.added_objects.len(),
            modified = response.modified_objects.len(),
            deleted = response.deleted_objects.len(),
            "Action applied"
        );
        Ok(response)
    }

    /// Refetch a cached object, skipping objects the cache has never seen.
    fn refresh_object(&self, object: &ObjectRef) -> Option<BoxFuture<'static, ()>> {
        self.peek_cache_key(KeyKind::Object, &object_key_args(object))?;
        let query = self.object_query(&object.api_name, object.primary_key.clone());
        Some(query.revalidate(true).boxed())
    }
}
