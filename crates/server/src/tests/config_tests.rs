use super::{apply_env, apply_file, normalize_database_url, prepare_database_url, Settings};

use std::{
    collections::HashMap,
    env, fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

fn unique_temp_root(label: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    env::temp_dir().join(format!("chat_coordinator_{label}_{suffix}"))
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn empty_database_url_falls_back_to_default() {
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
}

#[test]
fn keeps_in_memory_url_untouched() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}

#[test]
fn keeps_windows_absolute_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("sqlite:C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn normalizes_windows_plain_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn converts_sqlite_double_slash_windows_path() {
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/alice/test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn creates_parent_dir_for_sqlite_path() {
    let temp_root = unique_temp_root("config");
    let db_path = temp_root.join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.join("data").exists());

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[test]
fn app_prefixed_env_vars_override_short_names() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("SERVER_BIND", "0.0.0.0:1"),
        ("APP__BIND_ADDR", "0.0.0.0:9000"),
        ("JWT_SECRET", "short"),
        ("BLOB_DIR", "/var/uploads"),
        ("APP__GROUP_HISTORY_LIMIT", "20"),
        ("APP__PRIVATE_HISTORY_LIMIT", "not-a-number"),
        ("APP__STORE_TIMEOUT_MS", "250"),
    ]);
    let mut settings = Settings::default();
    apply_env(&mut settings, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.jwt_secret, "short");
    assert_eq!(settings.blob_dir, PathBuf::from("/var/uploads"));
    assert_eq!(settings.group_history_limit, 20);
    assert_eq!(
        settings.private_history_limit,
        Settings::default().private_history_limit
    );
    assert_eq!(settings.store_timeout().as_millis(), 250);
}

#[test]
fn server_toml_values_are_applied() {
    let raw = r#"
        bind_addr = "127.0.0.1:7000"
        database_url = "sqlite://./chat.db"
        group_history_limit = 10
        store_timeout_ms = -5
    "#;
    let file_cfg: HashMap<String, toml::Value> = toml::from_str(raw).expect("toml");
    let mut settings = Settings::default();
    apply_file(&mut settings, &file_cfg);

    assert_eq!(settings.server_bind, "127.0.0.1:7000");
    assert_eq!(settings.database_url, "sqlite://./chat.db");
    assert_eq!(settings.group_history_limit, 10);
    assert_eq!(settings.store_timeout_ms, Settings::default().store_timeout_ms);
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let temp_root = unique_temp_root("open");
    let db_path = temp_root.join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    storage.close().await;

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(temp_root).expect("cleanup");
}
