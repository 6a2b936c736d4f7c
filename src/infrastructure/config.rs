use crate::domain::models::{DEFAULT_CATEGORIES, DEFAULT_PROJECTS};
use crate::domain::tracker::StaleSessionPolicy;
use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const SYNC_JSON: &str = "sync.json";
const LABELS_JSON: &str = "labels.json";
const SCHEMA_VERSION: u64 = 1;

pub const DEFAULT_LARGE_PAYLOAD_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;

const SYNC_ENDPOINT_KEYS: [&str; 1] = ["DAILY_LOGGER_SYNC_ENDPOINT"];
const SYNC_USER_KEYS: [&str; 1] = ["DAILY_LOGGER_USER_ID"];
const SYNC_TOKEN_KEYS: [&str; 1] = ["DAILY_LOGGER_SYNC_TOKEN"];

/// When a remote snapshot may replace local state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemoteApplyPolicy {
    #[default]
    NewerOnly,
    AlwaysOverwrite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub stale_session_policy: StaleSessionPolicy,
}

impl AppConfig {
    pub fn timezone(&self) -> Result<Tz, InfraError> {
        self.timezone.trim().parse::<Tz>().map_err(|error| {
            InfraError::InvalidConfig(format!("invalid timezone '{}': {error}", self.timezone))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_auto_sync_interval_seconds")]
    pub auto_sync_interval_seconds: u64,
    #[serde(default = "default_auto_save_debounce_ms")]
    pub auto_save_debounce_ms: u64,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_large_payload_threshold_bytes")]
    pub large_payload_threshold_bytes: u64,
    #[serde(default)]
    pub remote_apply_policy: RemoteApplyPolicy,
    /// Only ever supplied through the environment.
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            user_id: None,
            auto_sync_interval_seconds: default_auto_sync_interval_seconds(),
            auto_save_debounce_ms: default_auto_save_debounce_ms(),
            poll_interval_seconds: default_poll_interval_seconds(),
            large_payload_threshold_bytes: default_large_payload_threshold_bytes(),
            remote_apply_policy: RemoteApplyPolicy::default(),
            token: None,
        }
    }
}

impl SyncConfig {
    /// User id, once sync is enabled and the user is known.
    pub fn active_user(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn validate(&self) -> Result<(), InfraError> {
        if self.auto_sync_interval_seconds == 0 {
            return Err(InfraError::InvalidConfig(
                "autoSyncIntervalSeconds must be > 0".to_string(),
            ));
        }
        if self.poll_interval_seconds == 0 {
            return Err(InfraError::InvalidConfig(
                "pollIntervalSeconds must be > 0".to_string(),
            ));
        }
        if self.large_payload_threshold_bytes == 0 {
            return Err(InfraError::InvalidConfig(
                "largePayloadThresholdBytes must be > 0".to_string(),
            ));
        }
        if let Some(endpoint) = self.endpoint.as_deref() {
            url::Url::parse(endpoint).map_err(|error| {
                InfraError::InvalidConfig(format!("invalid sync endpoint '{endpoint}': {error}"))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelsConfig {
    #[serde(default = "default_projects")]
    pub default_projects: Vec<String>,
    #[serde(default = "default_categories")]
    pub default_categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBundle {
    pub app: AppConfig,
    pub sync: SyncConfig,
    pub labels: LabelsConfig,
}

fn default_app_name() -> String {
    "Daily Task Logger".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_auto_sync_interval_seconds() -> u64 {
    60
}

fn default_auto_save_debounce_ms() -> u64 {
    2000
}

fn default_poll_interval_seconds() -> u64 {
    30
}

fn default_large_payload_threshold_bytes() -> u64 {
    DEFAULT_LARGE_PAYLOAD_THRESHOLD_BYTES
}

fn default_projects() -> Vec<String> {
    DEFAULT_PROJECTS.iter().map(|label| label.to_string()).collect()
}

fn default_categories() -> Vec<String> {
    DEFAULT_CATEGORIES.iter().map(|label| label.to_string()).collect()
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": default_app_name(),
                "timezone": default_timezone(),
                "staleSessionPolicy": "leave_open"
            }),
        ),
        (
            SYNC_JSON,
            serde_json::json!({
                "schema": 1,
                "enabled": false,
                "endpoint": null,
                "userId": null,
                "autoSyncIntervalSeconds": default_auto_sync_interval_seconds(),
                "autoSaveDebounceMs": default_auto_save_debounce_ms(),
                "pollIntervalSeconds": default_poll_interval_seconds(),
                "largePayloadThresholdBytes": DEFAULT_LARGE_PAYLOAD_THRESHOLD_BYTES,
                "remoteApplyPolicy": "newer_only"
            }),
        ),
        (
            LABELS_JSON,
            serde_json::json!({
                "schema": 1,
                "defaultProjects": default_projects(),
                "defaultCategories": default_categories()
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            write_config(&path, &value)?;
        }
    }
    Ok(())
}

fn write_config(path: &Path, value: &serde_json::Value) -> Result<(), InfraError> {
    let formatted = serde_json::to_string_pretty(value)?;
    fs::write(path, format!("{formatted}\n"))?;
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SCHEMA_VERSION {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

fn read_typed<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, InfraError> {
    let value = read_config(path)?;
    serde_json::from_value(value).map_err(|error| {
        InfraError::InvalidConfig(format!("invalid {}: {error}", path.display()))
    })
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    let app: AppConfig = read_typed(&config_dir.join(APP_JSON))?;
    app.timezone()?;
    let sync: SyncConfig = read_typed(&config_dir.join(SYNC_JSON))?;
    sync.validate()?;
    let labels: LabelsConfig = read_typed(&config_dir.join(LABELS_JSON))?;
    Ok(ConfigBundle { app, sync, labels })
}

/// Loads the bundle with environment overrides applied to the sync section.
pub fn load_configs_with_env(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    let mut bundle = load_configs(config_dir)?;
    bundle.sync = apply_sync_overrides(bundle.sync, |key| std::env::var(key).ok());
    bundle.sync.validate()?;
    Ok(bundle)
}

pub fn apply_sync_overrides<F>(mut sync: SyncConfig, lookup: F) -> SyncConfig
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(endpoint) = optional_lookup_value(&lookup, &SYNC_ENDPOINT_KEYS) {
        sync.endpoint = Some(endpoint);
    }
    if let Some(user_id) = optional_lookup_value(&lookup, &SYNC_USER_KEYS) {
        sync.user_id = Some(user_id);
    }
    if let Some(token) = optional_lookup_value(&lookup, &SYNC_TOKEN_KEYS) {
        sync.token = Some(token);
    }
    sync
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}

/// Writes the sync section back, keeping unrelated keys in the file.
pub fn save_sync_config(config_dir: &Path, sync: &SyncConfig) -> Result<(), InfraError> {
    sync.validate()?;
    let path = config_dir.join(SYNC_JSON);
    let mut current = read_config(&path)?;
    let object = current.as_object_mut().ok_or_else(|| {
        InfraError::InvalidConfig(format!("invalid object structure in {}", path.display()))
    })?;
    let serde_json::Value::Object(updates) = serde_json::to_value(sync)? else {
        return Err(InfraError::InvalidConfig(
            "sync config must serialize to an object".to_string(),
        ));
    };
    object.extend(updates);
    write_config(&path, &current)
}
