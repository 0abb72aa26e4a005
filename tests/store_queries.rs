mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use livequery::cache::{
    BatchMeta, CacheConfig, CacheError, ListDescriptor, NetworkError, ObjectRef, ObjectSet,
    ObserveOptions, OrderBy, OsdkObject, Query, SortDirection, Status,
};
use serde_json::json;

use common::{FakeClient, calls, employee, store, store_with, wait_for};

fn names(page: &livequery::cache::ListPage) -> Vec<String> {
    page.data
        .iter()
        .filter_map(|object| object.property("name"))
        .filter_map(|name| name.as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn observe_object_moves_from_loading_to_loaded() {
    let client = FakeClient::new();
    client.put(employee(1, "Ada"));
    let store = store(&client);

    let mut subscription = store.observe_object("Employee", 1, ObserveOptions::default());
    assert_eq!(subscription.current().status, Status::Loading);

    let loaded = wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;
    let object = loaded.value.expect("loaded object");
    assert_eq!(object.property("name"), Some(json!("Ada")));
    assert!(loaded.error.is_none());
    assert!(!loaded.is_optimistic);
    assert_eq!(calls(&client.fetch_one_calls), 1);
}

#[tokio::test]
async fn concurrent_revalidations_share_one_fetch() {
    let client = FakeClient::new();
    client.put(employee(1, "Ada"));
    let store = store(&client);
    let query = store.object_query("Employee", 1);

    let first = query.revalidate(true);
    let second = query.revalidate(true);
    let third = store.object_query("Employee", 1).revalidate(true);
    futures::join!(first, second, third);

    assert_eq!(calls(&client.fetch_one_calls), 1);
    assert_eq!(query.current().status, Status::Loaded);
}

#[tokio::test]
async fn fetch_errors_are_cached_and_cleared_by_a_later_success() {
    let client = FakeClient::new();
    let store = store(&client);
    client.fail_next(NetworkError::Http {
        status: 503,
        message: "unavailable".to_string(),
    });

    let mut subscription = store.observe_object("Employee", 1, ObserveOptions::default());
    let failed = wait_for(&mut subscription, |payload| payload.status == Status::Error).await;
    let error = failed.error.expect("error payload");
    assert!(matches!(
        error.as_network(),
        Some(NetworkError::Http { status: 503, .. })
    ));

    client.put(employee(1, "Ada"));
    let refetch = store.object_query("Employee", 1).revalidate(true);
    assert_eq!(subscription.current().status, Status::Loading);
    refetch.await;

    let recovered = wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;
    assert_eq!(recovered.status, Status::Loaded);
    assert!(recovered.error.is_none());
    assert_eq!(
        recovered.value.and_then(|object| object.property("name")),
        Some(json!("Ada"))
    );
}

#[tokio::test]
async fn object_queries_started_together_share_one_page_fetch() {
    let client = FakeClient::new();
    client.put(employee(1, "Ada"));
    client.put(employee(2, "Grace"));
    let store = store(&client);

    let mut first = store.observe_object("Employee", 1, ObserveOptions::default());
    let mut second = store.observe_object("Employee", 2, ObserveOptions::default());
    let mut missing = store.observe_object("Employee", 3, ObserveOptions::default());

    let ada = wait_for(&mut first, |payload| payload.status == Status::Loaded).await;
    let grace = wait_for(&mut second, |payload| payload.status == Status::Loaded).await;
    let gone = wait_for(&mut missing, |payload| payload.status == Status::Error).await;

    assert_eq!(ada.value.and_then(|object| object.property("name")), Some(json!("Ada")));
    assert_eq!(
        grace.value.and_then(|object| object.property("name")),
        Some(json!("Grace"))
    );
    assert!(matches!(
        gone.error.expect("error payload").as_network(),
        Some(NetworkError::NotFound { .. })
    ));
    assert_eq!(calls(&client.fetch_page_calls), 1);
    assert_eq!(calls(&client.fetch_one_calls), 0);

    let request = client.page_requests.lock().unwrap()[0].clone();
    assert_eq!(
        request.object_set,
        ObjectSet::base("Employee").filter(json!({"employeeId": {"$in": [1, 2, 3]}}))
    );
}

#[tokio::test]
async fn observe_modes_control_fetching() {
    let client = FakeClient::new();
    client.put(employee(1, "Ada"));
    let config = CacheConfig {
        dedupe_interval_ms: 60_000,
        ..CacheConfig::default()
    };
    let store = store_with(&client, config);

    let offline = store.observe_object("Employee", 1, ObserveOptions::offline());
    assert_eq!(offline.current().status, Status::Init);
    assert_eq!(calls(&client.fetch_one_calls), 0);

    let mut first = store.observe_object("Employee", 1, ObserveOptions::default());
    wait_for(&mut first, |payload| payload.status == Status::Loaded).await;
    assert_eq!(calls(&client.fetch_one_calls), 1);

    let deduped = store.observe_object("Employee", 1, ObserveOptions::default());
    assert_eq!(deduped.current().status, Status::Loaded);
    assert_eq!(calls(&client.fetch_one_calls), 1);

    let forced = store.observe_object("Employee", 1, ObserveOptions::force());
    assert_eq!(forced.current().status, Status::Loading);
    store.object_query("Employee", 1).revalidate(false).await;
    assert_eq!(calls(&client.fetch_one_calls), 2);
}

#[tokio::test(start_paused = true)]
async fn stale_responses_do_not_overwrite_newer_writes() {
    let client = FakeClient::new();
    client.put(employee(1, "Stale"));
    client.set_delay(Duration::from_millis(100));
    let store = store(&client);
    let query = store.object_query("Employee", 1);

    let fetch = query.revalidate(true);
    tokio::time::sleep(Duration::from_millis(10)).await;

    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(1, "Fresh"), Status::Loaded);
    });
    fetch.await;

    let payload = query.current();
    assert_eq!(payload.status, Status::Loaded);
    assert_eq!(
        payload.value.and_then(|object| object.property("name")),
        Some(json!("Fresh"))
    );
}

#[tokio::test(start_paused = true)]
async fn one_batch_publishes_one_payload() {
    let client = FakeClient::new();
    let store = store(&client);
    let mut subscription = store.observe_object("Employee", 1, ObserveOptions::offline());

    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(1, "First"), Status::Loaded);
        ctx.write_object(employee(1, "Second"), Status::Loaded);
    });

    let payload = subscription.changed().await.expect("payload");
    assert_eq!(
        payload.value.and_then(|object| object.property("name")),
        Some(json!("Second"))
    );
    let again = tokio::time::timeout(Duration::from_millis(50), subscription.changed()).await;
    assert!(again.is_err(), "no second notification expected");
}

#[tokio::test]
async fn list_pages_populate_object_entries() {
    let client = FakeClient::new();
    client.set_page(None, vec![employee(1, "Ada"), employee(2, "Grace")], Some("t1"));
    client.set_page(Some("t1"), vec![employee(3, "Linus")], None);
    let store = store(&client);
    let descriptor = ListDescriptor::object_type("Employee");

    let mut subscription = store
        .observe_list(&descriptor, ObserveOptions::default())
        .expect("list resolves");
    let first = wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;
    let page = first.value.expect("page");
    assert_eq!(names(&page), ["Ada", "Grace"]);
    assert!(page.has_more);

    let query = store.list_query(&descriptor).expect("list resolves");
    query.fetch_more().await;
    let page = subscription.current().value.expect("page");
    assert_eq!(names(&page), ["Ada", "Grace", "Linus"]);
    assert!(!page.has_more);
    assert!(!query.has_more());

    let cached = store.object_query("Employee", 2).current();
    assert_eq!(cached.status, Status::Loaded);
    assert_eq!(calls(&client.fetch_one_calls), 0);
}

#[tokio::test]
async fn lists_follow_object_writes_without_refetching() {
    let client = FakeClient::new();
    client.set_page(
        None,
        vec![
            employee(1, "B").with_property("dept", "eng"),
            employee(2, "D").with_property("dept", "eng"),
        ],
        None,
    );
    let store = store(&client);
    let descriptor = ListDescriptor::object_type("Employee")
        .with_where(json!({"dept": "eng"}))
        .with_order_by(OrderBy::new().then("name", SortDirection::Asc));

    let mut subscription = store
        .observe_list(&descriptor, ObserveOptions::default())
        .expect("list resolves");
    wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;

    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(3, "C").with_property("dept", "eng"), Status::Loaded);
        ctx.write_object(employee(4, "A").with_property("dept", "ops"), Status::Loaded);
    });
    let page = subscription.current().value.expect("page");
    assert_eq!(names(&page), ["B", "C", "D"]);

    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(1, "B").with_property("dept", "ops"), Status::Loaded);
    });
    let page = subscription.current().value.expect("page");
    assert_eq!(names(&page), ["C", "D"]);

    store.batch(BatchMeta::default(), |ctx| {
        ctx.delete_object(&ObjectRef::new("Employee", 2));
    });
    let page = subscription.current().value.expect("page");
    assert_eq!(names(&page), ["C"]);
    assert_eq!(calls(&client.fetch_page_calls), 1);
}

#[tokio::test]
async fn interface_lists_do_not_splice_in_implementing_objects() {
    let client = FakeClient::new();
    client.set_page(None, vec![employee(1, "Ada")], None);
    let store = store(&client);
    let descriptor = ListDescriptor::interface("Worker").with_where(json!({"name": "Ada"}));

    let mut subscription = store
        .observe_list(&descriptor, ObserveOptions::default())
        .expect("list resolves");
    wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;
    let fetches = calls(&client.fetch_page_calls);

    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(9, "Ada"), Status::Loaded);
        ctx.write_object(employee(1, "Ada Lovelace"), Status::Loaded);
    });
    let page = subscription.current().value.expect("page");
    assert_eq!(names(&page), ["Ada Lovelace"]);
    assert_eq!(subscription.current().status, Status::Loaded);

    store.batch(BatchMeta::default(), |ctx| {
        ctx.delete_object(&ObjectRef::new("Employee", 1));
    });
    let page = subscription.current().value.expect("page");
    assert!(page.data.is_empty());
    assert_eq!(calls(&client.fetch_page_calls), fetches);
}

#[tokio::test]
async fn object_set_lists_revalidate_on_invalidating_types() {
    let client = FakeClient::new();
    client.set_page(None, vec![employee(1, "Ada")], None);
    let store = store(&client);
    let descriptor = ListDescriptor::object_set(
        ObjectSet::base("Office").search_around("occupants"),
    );

    let mut subscription = store
        .observe_list(&descriptor, ObserveOptions::default())
        .expect("list resolves");
    wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;
    let query = store.list_query(&descriptor).expect("list resolves");
    let invalidation = query.invalidation_set().expect("invalidation set");
    assert!(invalidation.contains("Office"));

    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(OsdkObject::new("Office", 7), Status::Loaded);
    });
    assert_eq!(subscription.current().status, Status::Loading);
    wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;
    assert_eq!(calls(&client.fetch_page_calls), 2);
}

#[tokio::test]
async fn aggregations_refetch_on_confirmed_modifications_only() {
    let client = FakeClient::new();
    client.set_aggregate(json!({"count": 1}));
    let store = store(&client);
    let aggregate = json!({"count": {"$count": true}});

    let mut subscription = store
        .observe_aggregation("Employee", &json!({}), &aggregate, ObserveOptions::default())
        .expect("aggregation resolves");
    let loaded = wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;
    assert_eq!(loaded.value.as_deref(), Some(&json!({"count": 1})));

    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(1, "Ada"), Status::Loaded);
        ctx.write_object(OsdkObject::new("Office", 1).with_property("floor", 2), Status::Loaded);
    });
    assert_eq!(subscription.current().status, Status::Loaded);
    assert_eq!(calls(&client.aggregate_calls), 1);

    client.set_aggregate(json!({"count": 2}));
    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(1, "Ada Lovelace"), Status::Loaded);
    });
    let refreshed = wait_for(&mut subscription, |payload| {
        payload.status == Status::Loaded && payload.value.as_deref() == Some(&json!({"count": 2}))
    })
    .await;
    assert!(refreshed.last_updated > loaded.last_updated);
    assert_eq!(calls(&client.aggregate_calls), 2);
}

#[tokio::test]
async fn links_fetch_through_the_source_and_empty_when_it_is_deleted() {
    let client = FakeClient::new();
    client.set_page(None, vec![employee(9, "Boss")], None);
    let store = store(&client);
    let source = ObjectRef::new("Employee", 1);

    let mut subscription = store
        .observe_links(&source, "lead", &json!({}), &OrderBy::new(), ObserveOptions::default())
        .expect("link resolves");
    let loaded = wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;
    assert_eq!(names(&loaded.value.expect("page")), ["Boss"]);

    let request = client.page_requests.lock().unwrap()[0].clone();
    assert_eq!(
        request.object_set,
        ObjectSet::base("Employee")
            .filter(json!({"employeeId": 1}))
            .search_around("lead")
    );

    store.batch(BatchMeta::default(), |ctx| {
        ctx.delete_object(&source);
    });
    let emptied = subscription.current().value.expect("page");
    assert!(emptied.data.is_empty());
    assert_eq!(emptied.total_count, Some(0));
}

#[tokio::test]
async fn unknown_links_and_types_are_rejected() {
    let client = FakeClient::new();
    let store = store(&client);

    let unknown_type = store.list_query(&ListDescriptor::object_type("Nope"));
    assert!(matches!(unknown_type, Err(CacheError::Metadata(_))));

    let unknown_link = store.link_query(
        &ObjectRef::new("Employee", 1),
        "friends",
        &json!({}),
        &OrderBy::new(),
    );
    assert!(matches!(unknown_link, Err(CacheError::Metadata(_))));
}

#[tokio::test]
async fn functions_revalidate_on_declared_dependencies() {
    let client = FakeClient::new();
    client.set_function(json!(42));
    let store = store(&client);
    let params = BTreeMap::new();

    let mut subscription =
        store.observe_function("headcount", &params, None, ObserveOptions::default());
    wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;
    store
        .function_query("headcount", &params, None)
        .depends_on(["Office"])
        .depends_on_objects([ObjectRef::new("Employee", 1)]);

    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(2, "Unrelated"), Status::Loaded);
    });
    assert_eq!(subscription.current().status, Status::Loaded);
    assert_eq!(calls(&client.function_calls), 1);

    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(1, "Tracked"), Status::Loaded);
    });
    wait_for(&mut subscription, |payload| payload.status == Status::Loaded).await;
    assert_eq!(calls(&client.function_calls), 2);

    store.invalidate_object_type("Office").await;
    assert_eq!(calls(&client.function_calls), 3);

    store.invalidate_function("headcount").await;
    assert_eq!(calls(&client.function_calls), 4);
}

#[tokio::test]
async fn invalidating_a_type_refetches_dependent_queries() {
    let client = FakeClient::new();
    client.put(employee(1, "Ada"));
    client.set_page(None, vec![employee(1, "Ada")], None);
    let store = store(&client);

    let mut object = store.observe_object("Employee", 1, ObserveOptions::default());
    let mut list = store
        .observe_list(&ListDescriptor::object_type("Employee"), ObserveOptions::default())
        .expect("list resolves");
    wait_for(&mut object, |payload| payload.status == Status::Loaded).await;
    wait_for(&mut list, |payload| payload.status == Status::Loaded).await;

    store.invalidate_object_type("Employee").await;
    assert_eq!(calls(&client.fetch_one_calls), 2);
    assert_eq!(calls(&client.fetch_page_calls), 2);

    store.invalidate_object(&ObjectRef::new("Employee", 1)).await;
    assert_eq!(calls(&client.fetch_one_calls), 3);
}

#[tokio::test]
async fn panicking_batches_leave_no_trace() {
    let client = FakeClient::new();
    let store = store(&client);
    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(1, "Before"), Status::Loaded);
    });
    let mut subscription = store.observe_object("Employee", 1, ObserveOptions::offline());
    let before = subscription.current();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        store.batch(BatchMeta::default(), |ctx| {
            ctx.write_object(employee(1, "Half written"), Status::Loaded);
            panic!("writer failed");
        });
    }));
    assert!(result.is_err());

    let payload = subscription.current();
    assert_eq!(payload.last_updated, before.last_updated);
    assert_eq!(
        payload.value.and_then(|object| object.property("name")),
        Some(json!("Before"))
    );
    let notified = tokio::time::timeout(Duration::from_millis(50), subscription.changed()).await;
    assert!(notified.is_err(), "a rolled-back batch must not notify");

    let optimistic = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        store.create_optimistic_layer(|ctx| {
            ctx.write_object(employee(1, "Guess"), Status::Loaded);
            panic!("optimistic writer failed");
        });
    }));
    assert!(optimistic.is_err());
    assert_eq!(store.optimistic_depth(), 0);

    store.batch(BatchMeta::default(), |ctx| {
        ctx.write_object(employee(1, "After"), Status::Loaded);
    });
    assert_eq!(
        subscription
            .current()
            .value
            .and_then(|object| object.property("name")),
        Some(json!("After"))
    );
}
