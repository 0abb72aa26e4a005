//! Network collaborator contract.
//!
//! The cache never speaks HTTP itself; it calls an [`OntologyClient`] and
//! stores whatever comes back, including failures.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::canonical::OrderBy;
use super::object::{ObjectRef, ObjectSet, OsdkObject, PrimaryKey};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("object `{api_name}` with primary key `{primary_key}` was not found")]
    NotFound {
        api_name: String,
        primary_key: PrimaryKey,
    },
    #[error("request failed with status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("action `{action}` was rejected: {message}")]
    ActionValidation { action: String, message: String },
}

impl NetworkError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn not_found(api_name: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        Self::NotFound {
            api_name: api_name.into(),
            primary_key: primary_key.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub object_set: ObjectSet,
    pub page_size: Option<usize>,
    pub page_token: Option<String>,
    pub order_by: OrderBy,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageResult {
    pub data: Vec<OsdkObject>,
    pub next_page_token: Option<String>,
    pub total_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRequest {
    pub object_set: ObjectSet,
    pub aggregate: Value,
}

/// Edits reported by the server after an action ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionEditResponse {
    pub added_objects: Vec<ObjectRef>,
    pub modified_objects: Vec<ObjectRef>,
    pub deleted_objects: Vec<ObjectRef>,
    pub edited_object_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid,
}

/// Server verdict on an action that was validated but not applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionValidationResponse {
    pub result: ValidationResult,
    /// Submission criteria evaluated by the server, in wire form.
    pub submission_criteria: Vec<Value>,
    /// Per-parameter evaluation, in wire form.
    pub parameters: BTreeMap<String, Value>,
}

impl ActionValidationResponse {
    pub fn valid() -> Self {
        Self {
            result: ValidationResult::Valid,
            submission_criteria: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn invalid() -> Self {
        Self {
            result: ValidationResult::Invalid,
            ..Self::valid()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.result == ValidationResult::Valid
    }
}

#[async_trait]
pub trait OntologyClient: Send + Sync {
    async fn fetch_one(
        &self,
        api_name: &str,
        primary_key: &PrimaryKey,
    ) -> Result<OsdkObject, NetworkError>;

    async fn fetch_page(&self, request: PageRequest) -> Result<PageResult, NetworkError>;

    async fn aggregate(&self, request: AggregateRequest) -> Result<Value, NetworkError>;

    async fn apply_action(
        &self,
        action: &str,
        params: Value,
    ) -> Result<ActionEditResponse, NetworkError>;

    /// Run the server's validation for `action` without applying it.
    async fn validate_action(
        &self,
        action: &str,
        params: Value,
    ) -> Result<ActionValidationResponse, NetworkError>;

    async fn execute_function(
        &self,
        api_name: &str,
        params: Value,
        version: Option<&str>,
    ) -> Result<Value, NetworkError>;
}

#[async_trait]
impl<T: OntologyClient + ?Sized> OntologyClient for Arc<T> {
    async fn fetch_one(
        &self,
        api_name: &str,
        primary_key: &PrimaryKey,
    ) -> Result<OsdkObject, NetworkError> {
        (**self).fetch_one(api_name, primary_key).await
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<PageResult, NetworkError> {
        (**self).fetch_page(request).await
    }

    async fn aggregate(&self, request: AggregateRequest) -> Result<Value, NetworkError> {
        (**self).aggregate(request).await
    }

    async fn apply_action(
        &self,
        action: &str,
        params: Value,
    ) -> Result<ActionEditResponse, NetworkError> {
        (**self).apply_action(action, params).await
    }

    async fn validate_action(
        &self,
        action: &str,
        params: Value,
    ) -> Result<ActionValidationResponse, NetworkError> {
        (**self).validate_action(action, params).await
    }

    async fn execute_function(
        &self,
        api_name: &str,
        params: Value,
        version: Option<&str>,
    ) -> Result<Value, NetworkError> {
        (**self).execute_function(api_name, params, version).await
    }
}
