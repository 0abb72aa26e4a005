#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use livequery::cache::{
    ActionEditResponse, ActionValidationResponse, AggregateRequest, CacheConfig,
    InterfaceDefinition, LinkMultiplicity, NetworkError, ObjectDefinition, ObjectRef,
    ObjectSet, OntologyClient, OsdkObject, PageRequest, PageResult, Payload, PrimaryKey,
    QuerySubscription, StaticMetadata, Store,
};
use serde_json::Value;

/// Scripted ontology backend.
///
/// Objects are served from an in-memory table, also for page requests that
/// filter a base set with `$in`. Other list pages, aggregations, function
/// results and action responses are scripted per call.
#[derive(Default)]
pub struct FakeClient {
    objects: Mutex<BTreeMap<ObjectRef, OsdkObject>>,
    pages: Mutex<HashMap<Option<String>, PageResult>>,
    aggregate: Mutex<Value>,
    function: Mutex<Value>,
    action: Mutex<VecDeque<Result<ActionEditResponse, NetworkError>>>,
    validations: Mutex<VecDeque<Result<ActionValidationResponse, NetworkError>>>,
    fail_next: Mutex<Option<NetworkError>>,
    delay: Mutex<Duration>,
    pub fetch_one_calls: AtomicUsize,
    pub fetch_page_calls: AtomicUsize,
    pub aggregate_calls: AtomicUsize,
    pub function_calls: AtomicUsize,
    pub action_calls: AtomicUsize,
    pub validate_calls: AtomicUsize,
    pub page_requests: Mutex<Vec<PageRequest>>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, object: OsdkObject) {
        self.objects
            .lock()
            .unwrap()
            .insert(object.object_ref(), object);
    }

    pub fn remove(&self, object: &ObjectRef) {
        self.objects.lock().unwrap().remove(object);
    }

    /// Serve `data` for the page requested with `token`.
    pub fn set_page(&self, token: Option<&str>, data: Vec<OsdkObject>, next: Option<&str>) {
        let total = data.len() as u64;
        self.pages.lock().unwrap().insert(
            token.map(str::to_string),
            PageResult {
                data,
                next_page_token: next.map(str::to_string),
                total_count: Some(total),
            },
        );
    }

    pub fn set_aggregate(&self, value: Value) {
        *self.aggregate.lock().unwrap() = value;
    }

    pub fn set_function(&self, value: Value) {
        *self.function.lock().unwrap() = value;
    }

    pub fn push_action(&self, response: Result<ActionEditResponse, NetworkError>) {
        self.action.lock().unwrap().push_back(response);
    }

    pub fn push_validation(&self, response: Result<ActionValidationResponse, NetworkError>) {
        self.validations.lock().unwrap().push_back(response);
    }

    /// Fail the next network call of any kind.
    pub fn fail_next(&self, error: NetworkError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    /// Delay every call; combine with paused tokio time.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn before_call(&self) -> Result<(), NetworkError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.fail_next.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OntologyClient for FakeClient {
    async fn fetch_one(
        &self,
        api_name: &str,
        primary_key: &PrimaryKey,
    ) -> Result<OsdkObject, NetworkError> {
        self.fetch_one_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        self.objects
            .lock()
            .unwrap()
            .get(&ObjectRef::new(api_name, primary_key.clone()))
            .cloned()
            .ok_or_else(|| NetworkError::not_found(api_name, primary_key.clone()))
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<PageResult, NetworkError> {
        self.fetch_page_calls.fetch_add(1, Ordering::SeqCst);
        let token = request.page_token.clone();
        self.page_requests.lock().unwrap().push(request.clone());
        self.before_call().await?;
        if let Some(page) = self.objects_in(&request.object_set) {
            return Ok(page);
        }
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&token)
            .cloned()
            .unwrap_or_default())
    }

    async fn aggregate(&self, _request: AggregateRequest) -> Result<Value, NetworkError> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        Ok(self.aggregate.lock().unwrap().clone())
    }

    async fn apply_action(
        &self,
        _action: &str,
        _params: Value,
    ) -> Result<ActionEditResponse, NetworkError> {
        self.action_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        self.action
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ActionEditResponse::default()))
    }

    async fn validate_action(
        &self,
        _action: &str,
        _params: Value,
    ) -> Result<ActionValidationResponse, NetworkError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        self.validations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ActionValidationResponse::valid()))
    }

    async fn execute_function(
        &self,
        _api_name: &str,
        _params: Value,
        _version: Option<&str>,
    ) -> Result<Value, NetworkError> {
        self.function_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        Ok(self.function.lock().unwrap().clone())
    }
}

impl FakeClient {
    /// `base(type).filter({pk: {"$in": [..]}})` is answered from the table.
    fn objects_in(&self, object_set: &ObjectSet) -> Option<PageResult> {
        let ObjectSet::Filter { object_set, r#where } = object_set else {
            return None;
        };
        let ObjectSet::Base { object_type } = object_set.as_ref() else {
            return None;
        };
        let wanted = r#where
            .as_object()?
            .values()
            .find_map(|clause| clause.get("$in"))?
            .as_array()?
            .clone();

        let data: Vec<OsdkObject> = self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|object| {
                object.api_name == *object_type
                    && wanted.contains(&object.primary_key.to_value())
            })
            .cloned()
            .collect();
        let total = data.len() as u64;
        Some(PageResult {
            data,
            next_page_token: None,
            total_count: Some(total),
        })
    }
}

pub fn metadata() -> StaticMetadata {
    StaticMetadata::new()
        .with_object(
            ObjectDefinition::new("Employee", "employeeId")
                .with_link("lead", "Employee", LinkMultiplicity::One)
                .with_link("office", "Office", LinkMultiplicity::One),
        )
        .with_object(
            ObjectDefinition::new("Office", "officeId").with_link(
                "occupants",
                "Employee",
                LinkMultiplicity::Many,
            ),
        )
        .with_interface(InterfaceDefinition::new("Worker").implemented_by("Employee"))
}

pub fn store(client: &Arc<FakeClient>) -> Arc<Store> {
    store_with(client, CacheConfig::default())
}

pub fn store_with(client: &Arc<FakeClient>, config: CacheConfig) -> Arc<Store> {
    Store::builder(client.clone(), Arc::new(metadata()))
        .config(config)
        .gc_task(false)
        .build()
}

pub fn employee(id: i64, name: &str) -> OsdkObject {
    OsdkObject::new("Employee", id).with_property("name", name)
}

pub fn calls(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// Wait until the subscription publishes a payload accepted by `ready`.
pub async fn wait_for<T>(
    subscription: &mut QuerySubscription<T>,
    mut ready: impl FnMut(&Payload<T>) -> bool,
) -> Payload<T>
where
    T: Clone + Send + Sync + 'static,
{
    let wait = async {
        let mut payload = subscription.current();
        while !ready(&payload) {
            payload = subscription
                .changed()
                .await
                .expect("query should stay alive while subscribed");
        }
        payload
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .expect("payload should arrive before the timeout")
}
