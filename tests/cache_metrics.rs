mod common;

use std::collections::HashSet;
use std::time::Duration;

use livequery::cache::metrics_names::{
    BATCH_MS, FETCH_ERROR_TOTAL, FETCH_JOINED_TOTAL, FETCH_TOTAL, KEY_CREATED_TOTAL,
    KEY_DESTROYED_TOTAL, KEYS, OPTIMISTIC_LAYERS,
};
use livequery::cache::{NetworkError, ObserveOptions, Query, Status};
use livequery::infra::telemetry;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};

use common::{FakeClient, employee, store, wait_for};

#[tokio::test(start_paused = true)]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let client = FakeClient::new();
    client.put(employee(1, "Ada"));
    let store = store(&client);

    // fetch, joined fetch
    let query = store.object_query("Employee", 1);
    futures::join!(query.revalidate(true), query.revalidate(true));

    // failed fetch
    client.fail_next(NetworkError::transport("connection reset"));
    let mut failing = store.observe_object("Employee", 2, ObserveOptions::default());
    wait_for(&mut failing, |payload| payload.status == Status::Error).await;

    // optimistic layer
    let layer = store.create_optimistic_layer(|ctx| {
        ctx.write_object(employee(1, "Grace"), Status::Loaded);
    });
    store.remove_layer(layer);

    // sweep
    drop(failing);
    drop(query);
    tokio::time::advance(store.config().gc_delay() + Duration::from_millis(1)).await;
    let destroyed = store.run_gc();
    assert!(!destroyed.is_empty());

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    for expected in [
        KEY_CREATED_TOTAL,
        KEY_DESTROYED_TOTAL,
        KEYS,
        FETCH_TOTAL,
        FETCH_ERROR_TOTAL,
        FETCH_JOINED_TOTAL,
        BATCH_MS,
        OPTIMISTIC_LAYERS,
    ] {
        assert!(names.contains(expected), "missing metric {expected}");
    }

    let object_fetches: u64 = snapshot
        .iter()
        .filter(|(composite_key, _, _, _)| {
            let key = composite_key.key();
            key.name() == FETCH_TOTAL
                && key
                    .labels()
                    .any(|label| label.key() == "kind" && label.value() == "object")
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => *count,
            _ => 0,
        })
        .sum();
    assert_eq!(object_fetches, 2);
}
