//! Configuration layer: typed settings with layered precedence (files → environment).

use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::Path,
    str::FromStr,
    time::Duration,
};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "livequery";
const ENV_PREFIX: &str = "LIVEQUERY";

pub(crate) const DEFAULT_GC_DELAY_MS: u64 = 60_000;
pub(crate) const DEFAULT_DEBUG_GC_DELAY_MS: u64 = 15_000;
pub(crate) const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;
pub(crate) const DEFAULT_DEDUPE_INTERVAL_MS: u64 = 0;
pub(crate) const DEFAULT_PAGE_SIZE: usize = 100;
pub(crate) const DEFAULT_CANONICAL_DEPTH_LIMIT: usize = 50;
pub(crate) const DEFAULT_BULK_WINDOW_MS: u64 = 25;
pub(crate) const DEFAULT_BULK_MAX_ENTRIES: usize = 100;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Validated store tuning.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub gc_delay: Duration,
    pub debug_gc_delay: Duration,
    pub debug_refcounts: bool,
    pub sweep_interval: NonZeroU64,
    pub dedupe_interval: Duration,
    pub page_size: NonZeroUsize,
    pub canonical_depth_limit: NonZeroUsize,
    pub bulk_window: Duration,
    pub bulk_max_entries: NonZeroUsize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            gc_delay: Duration::from_millis(DEFAULT_GC_DELAY_MS),
            debug_gc_delay: Duration::from_millis(DEFAULT_DEBUG_GC_DELAY_MS),
            debug_refcounts: false,
            sweep_interval: NonZeroU64::new(DEFAULT_SWEEP_INTERVAL_MS).unwrap_or(NonZeroU64::MIN),
            dedupe_interval: Duration::from_millis(DEFAULT_DEDUPE_INTERVAL_MS),
            page_size: NonZeroUsize::new(DEFAULT_PAGE_SIZE).unwrap_or(NonZeroUsize::MIN),
            canonical_depth_limit: NonZeroUsize::new(DEFAULT_CANONICAL_DEPTH_LIMIT)
                .unwrap_or(NonZeroUsize::MIN),
            bulk_window: Duration::from_millis(DEFAULT_BULK_WINDOW_MS),
            bulk_max_entries: NonZeroUsize::new(DEFAULT_BULK_MAX_ENTRIES)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (default file → local file →
/// explicit file → `LIVEQUERY__*` environment).
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    gc_delay_ms: Option<u64>,
    debug_gc_delay_ms: Option<u64>,
    debug_refcounts: Option<bool>,
    sweep_interval_ms: Option<u64>,
    dedupe_interval_ms: Option<u64>,
    page_size: Option<usize>,
    canonical_depth_limit: Option<usize>,
    bulk_window_ms: Option<u64>,
    bulk_max_entries: Option<usize>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let gc_delay_ms = cache.gc_delay_ms.unwrap_or(DEFAULT_GC_DELAY_MS);
    let debug_gc_delay_ms = cache.debug_gc_delay_ms.unwrap_or(DEFAULT_DEBUG_GC_DELAY_MS);

    let sweep_interval = NonZeroU64::new(
        cache
            .sweep_interval_ms
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_MS),
    )
    .ok_or_else(|| LoadError::invalid("cache.sweep_interval_ms", "must be greater than zero"))?;

    let page_size = non_zero_usize(
        cache.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        "cache.page_size",
    )?;

    let canonical_depth_limit = non_zero_usize(
        cache
            .canonical_depth_limit
            .unwrap_or(DEFAULT_CANONICAL_DEPTH_LIMIT),
        "cache.canonical_depth_limit",
    )?;

    let bulk_max_entries = non_zero_usize(
        cache.bulk_max_entries.unwrap_or(DEFAULT_BULK_MAX_ENTRIES),
        "cache.bulk_max_entries",
    )?;

    Ok(CacheSettings {
        gc_delay: Duration::from_millis(gc_delay_ms),
        debug_gc_delay: Duration::from_millis(debug_gc_delay_ms),
        debug_refcounts: cache.debug_refcounts.unwrap_or(false),
        sweep_interval,
        dedupe_interval: Duration::from_millis(
            cache
                .dedupe_interval_ms
                .unwrap_or(DEFAULT_DEDUPE_INTERVAL_MS),
        ),
        page_size,
        canonical_depth_limit,
        bulk_window: Duration::from_millis(
            cache.bulk_window_ms.unwrap_or(DEFAULT_BULK_WINDOW_MS),
        ),
        bulk_max_entries,
    })
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
