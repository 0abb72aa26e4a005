use std::io::Write as _;

use super::*;

#[test]
fn defaults_apply_when_nothing_is_configured() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(
        settings.cache.gc_delay,
        Duration::from_millis(DEFAULT_GC_DELAY_MS)
    );
    assert_eq!(
        settings.cache.debug_gc_delay,
        Duration::from_millis(DEFAULT_DEBUG_GC_DELAY_MS)
    );
    assert!(!settings.cache.debug_refcounts);
    assert_eq!(settings.cache.sweep_interval.get(), DEFAULT_SWEEP_INTERVAL_MS);
    assert_eq!(settings.cache.page_size.get(), DEFAULT_PAGE_SIZE);
    assert_eq!(
        settings.cache.canonical_depth_limit.get(),
        DEFAULT_CANONICAL_DEPTH_LIMIT
    );
    assert_eq!(
        settings.cache.bulk_window,
        Duration::from_millis(DEFAULT_BULK_WINDOW_MS)
    );
    assert_eq!(
        settings.cache.bulk_max_entries.get(),
        DEFAULT_BULK_MAX_ENTRIES
    );
}

#[test]
fn zero_bulk_batch_size_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.bulk_max_entries = Some(0);

    let err = Settings::from_raw(raw).expect_err("bulk batch size must be rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.bulk_max_entries",
            ..
        }
    ));
}

#[test]
fn json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    raw.logging.json = Some(true);
    raw.logging.level = Some("debug".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).expect_err("level must be rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn zero_sweep_interval_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.sweep_interval_ms = Some(0);

    let err = Settings::from_raw(raw).expect_err("sweep interval must be rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.sweep_interval_ms",
            ..
        }
    ));
}

#[test]
fn zero_page_size_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.page_size = Some(0);

    let err = Settings::from_raw(raw).expect_err("page size must be rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.page_size",
            ..
        }
    ));
}

#[test]
fn zero_gc_delay_is_allowed() {
    let mut raw = RawSettings::default();
    raw.cache.gc_delay_ms = Some(0);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.gc_delay, Duration::ZERO);
}

#[test]
fn explicit_file_values_are_loaded() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp file");
    writeln!(
        file,
        "[logging]\nlevel = \"warn\"\n\n[cache]\ngc_delay_ms = 250\ndebug_refcounts = true\npage_size = 20\n"
    )
    .expect("write config");

    let settings = load(Some(file.path())).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::WARN);
    assert_eq!(settings.cache.gc_delay, Duration::from_millis(250));
    assert!(settings.cache.debug_refcounts);
    assert_eq!(settings.cache.page_size.get(), 20);
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("absent.toml");

    let err = load(Some(missing.as_path())).expect_err("missing file must fail");
    assert!(matches!(err, LoadError::Build(_)));
}
