//! Metric names emitted by the cache. Descriptions live in
//! `infra::telemetry::describe_metrics`.

pub const KEY_CREATED_TOTAL: &str = "livequery_cache_key_created_total";
pub const KEY_DESTROYED_TOTAL: &str = "livequery_cache_key_destroyed_total";
pub const KEYS: &str = "livequery_cache_keys";
pub const FETCH_TOTAL: &str = "livequery_fetch_total";
pub const FETCH_ERROR_TOTAL: &str = "livequery_fetch_error_total";
pub const FETCH_JOINED_TOTAL: &str = "livequery_fetch_joined_total";
pub const BATCH_MS: &str = "livequery_batch_ms";
pub const OPTIMISTIC_LAYERS: &str = "livequery_optimistic_layers";
