mod common;

use std::time::Duration;

use livequery::cache::{
    ActionEditResponse, ActionValidationResponse, BatchMeta, CacheError, ListDescriptor, NetworkError, ObjectRef,
    ObserveOptions, OrderBy, Query, SortDirection, Status,
};
use serde_json::json;

use common::{FakeClient, calls, employee, store, wait_for};

fn name_of(payload: &livequery::cache::Payload<std::sync::Arc<livequery::cache::OsdkObject>>) -> Option<String> {
    payload
        .value
        .as_ref()
        .and_then(|object| object.property("name"))
        .and_then(|name| name.as_str().map(str::to_string))
}

#[tokio::test(start_paused = true)]
async fn failed_actions_roll_back_optimistic_updates() {
    let client = FakeClient::new();
    client.put(employee(1, "Ada"));
    let store = store(&client);
    let mut subscription = store.observe_object("Employee", 1, ObserveOptions::default());
    wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;

    client.set_delay(Duration::from_millis(100));
    client.push_action(Err(NetworkError::ActionValidation {
        action: "rename".to_string(),
        message: "name is taken".to_string(),
    }));

    let action = tokio::spawn({
        let store = store.clone();
        async move {
            store
                .apply_action_optimistic("rename", json!({"name": "Grace"}), |builder| {
                    builder.update_object(employee(1, "Grace"));
                })
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let pending = subscription.current();
    assert!(pending.is_optimistic);
    assert_eq!(name_of(&pending).as_deref(), Some("Grace"));
    assert_eq!(store.optimistic_depth(), 1);

    let result = action.await.expect("action task");
    assert!(matches!(
        result,
        Err(CacheError::Network(NetworkError::ActionValidation { .. }))
    ));

    let rolled_back = subscription.current();
    assert!(!rolled_back.is_optimistic);
    assert_eq!(name_of(&rolled_back).as_deref(), Some("Ada"));
    assert_eq!(store.optimistic_depth(), 0);
}

#[tokio::test(start_paused = true)]
async fn optimistic_creates_show_in_lists_until_confirmed() {
    let client = FakeClient::new();
    client.set_page(None, vec![employee(1, "Ada")], None);
    let store = store(&client);
    let descriptor = ListDescriptor::object_type("Employee")
        .with_order_by(OrderBy::new().then("name", SortDirection::Asc));
    let mut list = store
        .observe_list(&descriptor, ObserveOptions::default())
        .expect("list resolves");
    wait_for(&mut list, |payload| payload.status == Status::Loaded).await;

    client.set_delay(Duration::from_millis(100));
    client.put(employee(2, "Bea"));
    client.set_page(None, vec![employee(1, "Ada"), employee(2, "Bea")], None);
    client.push_action(Ok(ActionEditResponse {
        added_objects: vec![ObjectRef::new("Employee", 2)],
        edited_object_types: vec!["Employee".to_string()],
        ..ActionEditResponse::default()
    }));

    let action = tokio::spawn({
        let store = store.clone();
        async move {
            store
                .apply_action_optimistic("hire", json!({"name": "Bea"}), |builder| {
                    builder.create_object(employee(2, "Bea"));
                })
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let optimistic = list.current();
    assert!(optimistic.is_optimistic);
    let page = optimistic.value.expect("page");
    assert_eq!(page.data.len(), 2);
    assert_eq!(page.data[1].property("name"), Some(json!("Bea")));

    let response = action.await.expect("action task").expect("action succeeds");
    assert_eq!(response.added_objects, vec![ObjectRef::new("Employee", 2)]);

    let confirmed = list.current();
    assert!(!confirmed.is_optimistic);
    assert_eq!(confirmed.value.expect("page").data.len(), 2);
    assert_eq!(calls(&client.fetch_page_calls), 2);
    assert_eq!(store.optimistic_depth(), 0);
}

#[tokio::test]
async fn deleted_objects_are_tombstoned() {
    let client = FakeClient::new();
    client.put(employee(1, "Ada"));
    let store = store(&client);
    let mut subscription = store.observe_object("Employee", 1, ObserveOptions::default());
    wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;

    client.push_action(Ok(ActionEditResponse {
        deleted_objects: vec![ObjectRef::new("Employee", 1)],
        ..ActionEditResponse::default()
    }));
    store
        .apply_action("fire", json!({"employeeId": 1}))
        .await
        .expect("action succeeds");

    let payload = subscription.current();
    assert_eq!(payload.status, Status::Loaded);
    assert!(payload.value.is_none());
    assert_eq!(calls(&client.action_calls), 1);
}

#[tokio::test]
async fn removing_a_lower_layer_keeps_the_upper_one_visible() {
    let client = FakeClient::new();
    let store = store(&client);
    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(1, "Truth"), Status::Loaded);
    });
    let query = store.object_query("Employee", 1);

    let lower = store.create_optimistic_layer(|ctx| {
        ctx.write_object(employee(1, "Lower"), Status::Loaded);
    });
    let upper = store.create_optimistic_layer(|ctx| {
        ctx.write_object(employee(1, "Upper"), Status::Loaded);
    });
    assert_eq!(name_of(&query.current()).as_deref(), Some("Upper"));

    store.remove_layer(lower);
    let payload = query.current();
    assert!(payload.is_optimistic);
    assert_eq!(name_of(&payload).as_deref(), Some("Upper"));

    store.remove_layer(upper);
    let payload = query.current();
    assert!(!payload.is_optimistic);
    assert_eq!(name_of(&payload).as_deref(), Some("Truth"));
}

#[tokio::test]
async fn validating_an_action_leaves_the_cache_alone() {
    let client = FakeClient::new();
    let store = store(&client);
    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(1, "Ada"), Status::Loaded);
    });
    let subscription = store.observe_object("Employee", 1, ObserveOptions::offline());
    let before = subscription.current();

    let mut rejected = ActionValidationResponse::invalid();
    rejected
        .parameters
        .insert("name".to_string(), json!({"result": "INVALID"}));
    client.push_validation(Ok(rejected.clone()));

    let verdict = store
        .validate_action("rename", json!({"name": ""}))
        .await
        .expect("an invalid verdict is still a response");
    assert_eq!(verdict, rejected);
    assert!(!verdict.is_valid());

    let verdict = store
        .validate_action("rename", json!({"name": "Grace"}))
        .await
        .expect("valid verdict");
    assert!(verdict.is_valid());

    client.fail_next(NetworkError::Http {
        status: 500,
        message: "down".to_string(),
    });
    let failed = store.validate_action("rename", json!({"name": "Grace"})).await;
    assert!(matches!(
        failed,
        Err(CacheError::Network(NetworkError::Http { status: 500, .. }))
    ));

    assert_eq!(calls(&client.validate_calls), 3);
    assert_eq!(calls(&client.action_calls), 0);
    assert_eq!(store.optimistic_depth(), 0);
    let after = subscription.current();
    assert_eq!(after.last_updated, before.last_updated);
    assert_eq!(name_of(&after).as_deref(), Some("Ada"));
}
