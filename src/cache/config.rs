//! Store configuration.
//!
//! Controls key lifetimes, sweep cadence and query defaults via `livequery.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for store configuration
const DEFAULT_GC_DELAY_MS: u64 = 60_000;
const DEFAULT_DEBUG_GC_DELAY_MS: u64 = 15_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;
const DEFAULT_DEDUPE_INTERVAL_MS: u64 = 0;
const DEFAULT_PAGE_SIZE: usize = 100;
const DEFAULT_BULK_WINDOW_MS: u64 = 25;
const DEFAULT_BULK_MAX_ENTRIES: usize = 100;
const DEFAULT_CANONICAL_DEPTH_LIMIT: usize = 50;

/// Store configuration from `livequery.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Delay (ms) between a key's count reaching zero and its finalization.
    pub gc_delay_ms: u64,
    /// Delay (ms) used instead of `gc_delay_ms` while ref-count debugging is on.
    pub debug_gc_delay_ms: u64,
    /// Log every retain/release and use the shorter debug delay.
    pub debug_refcounts: bool,
    /// Interval (ms) between garbage-collection sweeps.
    pub sweep_interval_ms: u64,
    /// Default freshness window (ms) within which a loaded entry is not refetched.
    pub dedupe_interval_ms: u64,
    /// Page size for list and link fetches.
    pub page_size: usize,
    /// Maximum recursion depth for canonicalization.
    pub canonical_depth_limit: usize,
    /// How long (ms) single-object fetches wait to be coalesced.
    pub bulk_window_ms: u64,
    /// Coalesced fetches per object type that trigger an immediate send.
    pub bulk_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gc_delay_ms: DEFAULT_GC_DELAY_MS,
            debug_gc_delay_ms: DEFAULT_DEBUG_GC_DELAY_MS,
            debug_refcounts: false,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            dedupe_interval_ms: DEFAULT_DEDUPE_INTERVAL_MS,
            page_size: DEFAULT_PAGE_SIZE,
            canonical_depth_limit: DEFAULT_CANONICAL_DEPTH_LIMIT,
            bulk_window_ms: DEFAULT_BULK_WINDOW_MS,
            bulk_max_entries: DEFAULT_BULK_MAX_ENTRIES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            gc_delay_ms: millis(settings.gc_delay),
            debug_gc_delay_ms: millis(settings.debug_gc_delay),
            debug_refcounts: settings.debug_refcounts,
            sweep_interval_ms: settings.sweep_interval.get(),
            dedupe_interval_ms: millis(settings.dedupe_interval),
            page_size: settings.page_size.get(),
            canonical_depth_limit: settings.canonical_depth_limit.get(),
            bulk_window_ms: millis(settings.bulk_window),
            bulk_max_entries: settings.bulk_max_entries.get(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl CacheConfig {
    /// Effective delay before a released key is finalized.
    pub fn gc_delay(&self) -> Duration {
        if self.debug_refcounts {
            Duration::from_millis(self.debug_gc_delay_ms)
        } else {
            Duration::from_millis(self.gc_delay_ms)
        }
    }

    /// Sweep interval, clamped to at least one millisecond.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn dedupe_interval(&self) -> Duration {
        Duration::from_millis(self.dedupe_interval_ms)
    }

    pub fn bulk_window(&self) -> Duration {
        Duration::from_millis(self.bulk_window_ms)
    }

    /// Returns the page size as NonZeroUsize, clamping to 1 if zero.
    pub fn page_size_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.page_size).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the canonical depth limit as NonZeroUsize, clamping to 1 if zero.
    pub fn canonical_depth_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.canonical_depth_limit).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.gc_delay_ms, 60_000);
        assert_eq!(config.debug_gc_delay_ms, 15_000);
        assert!(!config.debug_refcounts);
        assert_eq!(config.sweep_interval_ms, 1_000);
        assert_eq!(config.dedupe_interval_ms, 0);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.canonical_depth_limit, 50);
        assert_eq!(config.bulk_window(), Duration::from_millis(25));
        assert_eq!(config.bulk_max_entries, 100);
    }

    #[test]
    fn debug_refcounts_shortens_gc_delay() {
        let config = CacheConfig {
            debug_refcounts: true,
            ..Default::default()
        };
        assert_eq!(config.gc_delay(), Duration::from_secs(15));
        assert_eq!(CacheConfig::default().gc_delay(), Duration::from_secs(60));
    }

    #[test]
    fn from_settings_copies_every_field() {
        let settings = crate::config::CacheSettings {
            gc_delay: Duration::from_millis(500),
            debug_refcounts: true,
            bulk_window: Duration::from_millis(5),
            ..Default::default()
        };
        let config = CacheConfig::from(&settings);
        assert_eq!(config.gc_delay_ms, 500);
        assert!(config.debug_refcounts);
        assert_eq!(config.bulk_window_ms, 5);
        assert_eq!(config.bulk_max_entries, 100);
        assert_eq!(config.page_size, 100);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            page_size: 0,
            sweep_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.page_size_non_zero().get(), 1);
        assert_eq!(config.sweep_interval(), Duration::from_millis(1));
    }
}
