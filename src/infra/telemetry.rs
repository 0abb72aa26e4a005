use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metrics_names::{
    BATCH_MS, FETCH_ERROR_TOTAL, FETCH_JOINED_TOTAL, FETCH_TOTAL, KEY_CREATED_TOTAL,
    KEY_DESTROYED_TOTAL, KEYS, OPTIMISTIC_LAYERS,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the cache emits.
///
/// Safe to call repeatedly; descriptions are installed once per process.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            KEY_CREATED_TOTAL,
            Unit::Count,
            "Total number of cache keys interned by the registry."
        );
        describe_counter!(
            KEY_DESTROYED_TOTAL,
            Unit::Count,
            "Total number of cache keys finalized by the garbage-collection sweep."
        );
        describe_gauge!(
            KEYS,
            Unit::Count,
            "Current number of live cache keys."
        );
        describe_counter!(
            FETCH_TOTAL,
            Unit::Count,
            "Total number of network fetches started by queries."
        );
        describe_counter!(
            FETCH_ERROR_TOTAL,
            Unit::Count,
            "Total number of network fetches that ended in an error entry."
        );
        describe_counter!(
            FETCH_JOINED_TOTAL,
            Unit::Count,
            "Total number of revalidations that joined an in-flight fetch."
        );
        describe_histogram!(
            BATCH_MS,
            Unit::Milliseconds,
            "Time spent holding the store lock for one batch."
        );
        describe_gauge!(
            OPTIMISTIC_LAYERS,
            Unit::Count,
            "Current number of optimistic layers above the truth layer."
        );
    });
}
