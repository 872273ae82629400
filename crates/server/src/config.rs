use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use server_api::history::{DEFAULT_GROUP_HISTORY_LIMIT, DEFAULT_PRIVATE_HISTORY_LIMIT};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub blob_dir: PathBuf,
    pub group_history_limit: u32,
    pub private_history_limit: u32,
    pub store_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/chat.db".into(),
            jwt_secret: "dev-secret".into(),
            blob_dir: PathBuf::from("./data/uploads"),
            group_history_limit: DEFAULT_GROUP_HISTORY_LIMIT,
            private_history_limit: DEFAULT_PRIVATE_HISTORY_LIMIT,
            store_timeout_ms: 5_000,
        }
    }
}

impl Settings {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.max(1))
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            apply_file(&mut settings, &file_cfg);
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, file_cfg: &HashMap<String, toml::Value>) {
    let text = |key: &str| file_cfg.get(key).and_then(toml::Value::as_str);
    let number = |key: &str| file_cfg.get(key).and_then(toml::Value::as_integer);

    if let Some(v) = text("bind_addr") {
        settings.server_bind = v.to_string();
    }
    if let Some(v) = text("database_url") {
        settings.database_url = v.to_string();
    }
    if let Some(v) = text("jwt_secret") {
        settings.jwt_secret = v.to_string();
    }
    if let Some(v) = text("blob_dir") {
        settings.blob_dir = PathBuf::from(v);
    }
    if let Some(v) = number("group_history_limit").and_then(|v| u32::try_from(v).ok()) {
        settings.group_history_limit = v;
    }
    if let Some(v) = number("private_history_limit").and_then(|v| u32::try_from(v).ok()) {
        settings.private_history_limit = v;
    }
    if let Some(v) = number("store_timeout_ms").and_then(|v| u64::try_from(v).ok()) {
        settings.store_timeout_ms = v;
    }
}

/// `APP__*` names win over the short legacy names.
fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = var("JWT_SECRET") {
        settings.jwt_secret = v;
    }
    if let Some(v) = var("APP__JWT_SECRET") {
        settings.jwt_secret = v;
    }

    if let Some(v) = var("BLOB_DIR") {
        settings.blob_dir = PathBuf::from(v);
    }
    if let Some(v) = var("APP__BLOB_DIR") {
        settings.blob_dir = PathBuf::from(v);
    }

    if let Some(parsed) = var("APP__GROUP_HISTORY_LIMIT").and_then(|v| v.parse().ok()) {
        settings.group_history_limit = parsed;
    }
    if let Some(parsed) = var("APP__PRIVATE_HISTORY_LIMIT").and_then(|v| v.parse().ok()) {
        settings.private_history_limit = parsed;
    }
    if let Some(parsed) = var("APP__STORE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.store_timeout_ms = parsed;
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        if is_windows_drive_path(path) {
            return format!("sqlite:{}", path.replace('\\', "/"));
        }
        return raw_database_url.to_string();
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        if is_windows_drive_path(&path) {
            return format!("sqlite:{path}");
        }
        return format!("sqlite://{path}");
    }

    let path = raw_database_url.replace('\\', "/");
    if is_windows_drive_path(&path) {
        return format!("sqlite:{path}");
    }
    format!("sqlite://{path}")
}

fn is_windows_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
