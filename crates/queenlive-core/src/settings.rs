//! Client settings with layered sources.
//!
//! Loading flow:
//! 1. Start with compiled [`ClientSettings::default()`]
//! 2. If `~/.queenlive/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `QUEENLIVE_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::ids::{StreamId, Uid};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_factor: 0.2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Base URL of the token/orchestration HTTP service.
    pub server_url: String,
    /// Base URL of the chat relay. Falls back to `server_url` when empty.
    pub socket_url: String,
    pub app_id: String,
    pub channel: String,
    pub host_uid: Uid,
    /// Chat/stream room. Falls back to the host uid when unset.
    pub stream_id: Option<String>,
    pub request_timeout_ms: u64,
    pub retry: RetrySettings,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000".to_string(),
            socket_url: String::new(),
            app_id: String::new(),
            channel: "queenlive".to_string(),
            host_uid: Uid(2_882_341_273),
            stream_id: None,
            request_timeout_ms: 10_000,
            retry: RetrySettings::default(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl ClientSettings {
    pub fn stream_id(&self) -> StreamId {
        match &self.stream_id {
            Some(s) if !s.is_empty() => StreamId::from_raw(s.clone()),
            _ => StreamId::from(self.host_uid),
        }
    }

    pub fn socket_url(&self) -> &str {
        if self.socket_url.is_empty() {
            &self.server_url
        } else {
            &self.socket_url
        }
    }
}

/// `~/.queenlive/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".queenlive").join("settings.json")
}

pub fn load_settings() -> Result<ClientSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Missing file → defaults. Invalid JSON → error.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings, SettingsError> {
    let defaults = serde_json::to_value(ClientSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ClientSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

/// Objects merge per key, everything else is replaced, nulls are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Invalid values are ignored, keeping the file/default value.
pub fn apply_env_overrides(settings: &mut ClientSettings, env: impl Fn(&str) -> Option<String>) {
    let string = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = string("QUEENLIVE_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = string("QUEENLIVE_SOCKET_URL") {
        settings.socket_url = v;
    }
    if let Some(v) = string("QUEENLIVE_APP_ID") {
        settings.app_id = v;
    }
    if let Some(v) = string("QUEENLIVE_CHANNEL") {
        settings.channel = v;
    }
    if let Some(v) = string("QUEENLIVE_STREAM_ID") {
        settings.stream_id = Some(v);
    }
    if let Some(v) = string("QUEENLIVE_HOST_UID").and_then(|v| v.parse::<Uid>().ok()) {
        settings.host_uid = v;
    }
    if let Some(v) = string("QUEENLIVE_REQUEST_TIMEOUT_MS").and_then(|v| parse_u64_in(&v, 100, 600_000)) {
        settings.request_timeout_ms = v;
    }
    if let Some(v) = string("QUEENLIVE_MAX_RETRIES").and_then(|v| parse_u64_in(&v, 0, 10)) {
        settings.retry.max_retries = v as u32;
    }
    if let Some(v) = string("QUEENLIVE_LOG_LEVEL") {
        settings.log_level = v;
    }
    if let Some(v) = string("QUEENLIVE_LOG_JSON").and_then(|v| parse_bool(&v)) {
        settings.log_json = v;
    }
}

pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u64_in(val: &str, min: u64, max: u64) -> Option<u64> {
    val.trim().parse::<u64>().ok().filter(|v| (min..=max).contains(v))
}
