use super::*;
use std::io;
use tempfile::tempdir;

#[test]
fn config_defaults_are_sane() {
    let cfg = Config::default();
    assert!(!cfg.multitenancy_support);
    assert_eq!(cfg.default_profile_level, 0);
    assert_eq!(cfg.log_filter, "info");
}

#[test]
fn builder_matches_default() {
    let built = Config::builder().build();
    let default = Config::default();
    assert_eq!(built.data_dir, default.data_dir);
    assert_eq!(built.multitenancy_support, default.multitenancy_support);
    assert_eq!(built.default_profile_level, default.default_profile_level);
}

#[test]
fn config_file_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    let cfg = Config::builder()
        .data_dir(dir.path().to_path_buf())
        .multitenancy_support(true)
        .default_profile_level(2)
        .build();
    cfg.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert!(loaded.multitenancy_support);
    assert_eq!(loaded.default_profile_level, 2);
    assert_eq!(loaded.catalog_path(), dir.path().join("catalog.json"));
}

#[test]
fn missing_config_file_yields_defaults() {
    let dir = tempdir().unwrap();
    let loaded = Config::load(&dir.path().join("absent.json")).unwrap();
    assert!(!loaded.multitenancy_support);
}

#[test]
fn malformed_config_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = Config::load(&path).unwrap_err();
    assert!(matches!(err, DbError::Config(_)));
}

#[test]
fn db_error_formats_cleanly() {
    let err = DbError::NamespaceNotFound("app.users".into());
    assert!(format!("{err}").contains("namespace not found"));
}

#[test]
fn io_error_converts() {
    let e = io::Error::other("oops");
    let db_err: DbError = e.into();
    assert!(matches!(db_err, DbError::Io(_)));
}

#[test]
fn tracing_init_is_idempotent() {
    logging::init_test_tracing();
    assert!(!logging::init_tracing("info"));
}
