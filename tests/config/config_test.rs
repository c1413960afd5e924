//! Tests for `src/config.rs`.

use std::path::{Path, PathBuf};

use clinic_kernel::config::{config_path_with, Config};
use clinic_kernel::identity::Role;
use clinic_kernel::permission::{PermissionKey, PermissionPolicy};

#[test]
fn full_file_parses() {
    let config = Config::from_toml(
        r#"
[database]
path = "data/clinic.db"
max_connections = 16

[audit]
max_value_bytes = 4096
max_page_size = 100

[retry]
max_attempts = 5
backoff_ms = 10

[permissions.roles]
nurse = ["patients.read", "visits.read"]

[permissions.feature_gates]
"lab.imaging" = "imaging"

[integrity]
interval_secs = 600
sample_size = 3

[logging]
logs_dir = "/var/log/clinic"
"#,
    )
    .expect("should parse");

    assert_eq!(config.database.max_connections, 16);
    assert_eq!(config.audit.max_value_bytes, 4096);
    assert_eq!(config.audit.max_page_size, 100);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.backoff_ms, 10);
    assert_eq!(config.integrity.interval_secs, 600);
    assert_eq!(config.integrity.sample_size, 3);
    assert_eq!(config.logging.logs_dir, Some(PathBuf::from("/var/log/clinic")));
    assert_eq!(
        config.permissions.roles.get(&Role::Nurse),
        Some(&vec!["patients.read".to_owned(), "visits.read".to_owned()])
    );
}

#[test]
fn partial_file_keeps_defaults() {
    let config = Config::from_toml("[retry]\nmax_attempts = 1\n").expect("should parse");
    assert_eq!(config.retry.max_attempts, 1);
    assert_eq!(config.audit.max_value_bytes, 16 * 1024);
    assert_eq!(config.database.path, PathBuf::from("clinic.db"));
}

#[test]
fn unknown_role_is_a_parse_error() {
    let result = Config::from_toml("[permissions.roles]\nwizard = [\"patients.read\"]\n");
    assert!(result.is_err());
}

#[test]
fn configured_roles_and_gates_shape_the_policy() {
    let config = Config::from_toml(
        r#"
[permissions.roles]
nurse = ["patients.read"]

[permissions.feature_gates]
"lab.imaging" = "imaging"
"#,
    )
    .expect("should parse");
    let policy = PermissionPolicy::from_config(&config.permissions);

    assert!(policy.role_allows(Role::Nurse, &PermissionKey::new("patients.read")));
    assert!(!policy.role_allows(Role::Nurse, &PermissionKey::new("visits.read")));
    // Untouched roles keep the built-in table.
    assert!(policy.role_allows(Role::Doctor, &PermissionKey::new("visits.read")));
    // The most specific namespace wins.
    assert_eq!(policy.gating_feature(&PermissionKey::new("lab.imaging.read")), Some("imaging"));
    assert_eq!(policy.gating_feature(&PermissionKey::new("lab.results")), Some("labs"));
}

#[test]
fn missing_file_yields_defaults() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config = Config::load_from(&tmp.path().join("absent.toml")).expect("defaults");
    assert_eq!(config.retry.max_attempts, 3);
}

#[test]
fn malformed_file_is_an_error() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[database\npath = ").expect("write");
    assert!(Config::load_from(&path).is_err());
}

#[test]
fn env_overrides_apply() {
    let mut config = Config::default();
    config.apply_overrides(|key| match key {
        "CLINIC_KERNEL_AUDIT_MAX_BYTES" => Some("2048".to_owned()),
        "CLINIC_KERNEL_MAX_CONNECTIONS" => Some("2".to_owned()),
        "CLINIC_KERNEL_LOGS_DIR" => Some("/tmp/clinic-logs".to_owned()),
        _ => None,
    });
    assert_eq!(config.audit.max_value_bytes, 2048);
    assert_eq!(config.database.max_connections, 2);
    assert_eq!(config.logging.logs_dir, Some(PathBuf::from("/tmp/clinic-logs")));
}

#[test]
fn relative_database_path_resolves_against_base() {
    let config = Config::default();
    assert_eq!(
        config.database_path(Path::new("/srv/clinic")),
        PathBuf::from("/srv/clinic/clinic.db")
    );

    let mut config = Config::default();
    config.database.path = PathBuf::from("/abs/clinic.db");
    assert_eq!(
        config.database_path(Path::new("/srv/clinic")),
        PathBuf::from("/abs/clinic.db")
    );
}

#[test]
fn config_path_defaults_under_home() {
    // Only meaningful where a home directory exists.
    if let Ok(path) = config_path_with(|_| None) {
        assert!(path.ends_with(".clinic-kernel/config.toml"));
    }
}
