use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

pub use iacd_runner::RunnerConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 19020,
        }
    }
}

/// Terraform state backend handed to the runner with every submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StateStoreConfig {
    pub backend: String,
    pub scheme: String,
    pub address: String,
    pub lock: bool,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            backend: "consul".to_string(),
            scheme: "http".to_string(),
            address: "127.0.0.1:8500".to_string(),
            lock: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollerConfig {
    pub max_retries: u32,
    pub retry_step_ms: u64,
    pub retry_cap_ms: u64,
    /// Used as the deadline when a task is already past its timeout.
    pub deadline_grace_ms: u64,
}

pub const DEFAULT_DEADLINE_GRACE: Duration = Duration::from_secs(10);

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_step_ms: 2_000,
            retry_cap_ms: 10_000,
            deadline_grace_ms: DEFAULT_DEADLINE_GRACE.as_millis() as u64,
        }
    }
}

impl PollerConfig {
    /// Delay before the retry that follows `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let step = self.retry_step_ms.saturating_mul(u64::from(attempt));
        Duration::from_millis(step.min(self.retry_cap_ms))
    }

    pub fn deadline_grace(&self) -> Duration {
        Duration::from_millis(self.deadline_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub queue_capacity: usize,
    pub workers: usize,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            queue_capacity: 256,
            workers: 4,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { retention_days: 7 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub runner: RunnerConfig,
    pub state_store: StateStoreConfig,
    pub poller: PollerConfig,
    pub notify: NotifyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration: defaults < JSON file < `IACD_*` environment < CLI.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: Option<PathBuf>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let file = match &path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        let layers = ConfigLayers {
            file,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    /// A store holding exactly `config`, for tests and embedded use.
    pub fn from_config(config: &AppConfig) -> Self {
        let layers = ConfigLayers {
            file: empty_object(),
            env: empty_object(),
            cli: serde_json::to_value(config).unwrap_or_else(|_| empty_object()),
        };
        Self {
            path: None,
            layers: Arc::new(RwLock::new(layers)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("invalid configuration, falling back to defaults: {err}");
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = serde_json::to_value(AppConfig::default()).unwrap_or_else(|_| empty_object());
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    /// Re-reads the config file and the environment. CLI overrides are kept.
    pub async fn reload(&self) -> anyhow::Result<AppConfig> {
        let file = match &self.path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        {
            let mut layers = self.layers.write().await;
            layers.file = file;
            layers.env = env_layer();
        }
        Ok(self.get().await)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    let value = serde_json::from_str::<Value>(&raw)
        .map_err(|err| anyhow::anyhow!("invalid config file {}: {err}", path.display()))?;
    Ok(value)
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = get("IACD_RUNNER_URL") {
        deep_merge(&mut root, &json!({ "runner": { "url": url.trim() } }));
    }
    if let Some(hostname) = get("IACD_SERVER_HOSTNAME") {
        deep_merge(&mut root, &json!({ "server": { "hostname": hostname.trim() } }));
    }
    if let Some(port) = get("IACD_SERVER_PORT").and_then(|v| v.trim().parse::<u16>().ok()) {
        deep_merge(&mut root, &json!({ "server": { "port": port } }));
    }
    if let Some(backend) = get("IACD_STATE_BACKEND") {
        deep_merge(&mut root, &json!({ "state_store": { "backend": backend.trim() } }));
    }
    if let Some(address) = get("IACD_STATE_BACKEND_ADDRESS") {
        deep_merge(&mut root, &json!({ "state_store": { "address": address.trim() } }));
    }
    if let Some(scheme) = get("IACD_STATE_BACKEND_SCHEME") {
        deep_merge(&mut root, &json!({ "state_store": { "scheme": scheme.trim() } }));
    }
    if let Some(lock) = get("IACD_STATE_LOCK").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "state_store": { "lock": lock } }));
    }
    if let Some(retries) = get("IACD_POLL_MAX_RETRIES").and_then(|v| v.trim().parse::<u32>().ok())
    {
        deep_merge(&mut root, &json!({ "poller": { "max_retries": retries } }));
    }
    if let Some(url) = get("IACD_NOTIFY_WEBHOOK_URL") {
        deep_merge(&mut root, &json!({ "notify": { "webhook_url": url.trim() } }));
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn retry_delay_grows_linearly_and_caps() {
        let config = PollerConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(2));
        assert_eq!(config.retry_delay(3), Duration::from_secs(6));
        assert_eq!(config.retry_delay(5), Duration::from_secs(10));
        assert_eq!(config.retry_delay(9), Duration::from_secs(10));
        assert_eq!(config.deadline_grace(), Duration::from_secs(10));
    }

    #[test]
    fn env_layer_maps_known_variables() {
        let vars = HashMap::from([
            ("IACD_RUNNER_URL", "http://runner:19030"),
            ("IACD_SERVER_PORT", "8080"),
            ("IACD_STATE_LOCK", "off"),
            ("IACD_POLL_MAX_RETRIES", "not-a-number"),
            ("IACD_NOTIFY_WEBHOOK_URL", " "),
        ]);
        let layer = env_layer_from(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(layer["runner"]["url"], "http://runner:19030");
        assert_eq!(layer["server"]["port"], 8080);
        assert_eq!(layer["state_store"]["lock"], false);
        assert!(layer.get("poller").is_none());
        assert!(layer.get("notify").is_none());
    }

    #[test]
    fn deep_merge_keeps_sibling_keys() {
        let mut base = json!({"runner": {"url": "a", "run_path": "/task/run"}});
        deep_merge(&mut base, &json!({"runner": {"url": "b", "status_path": null}}));
        assert_eq!(base, json!({"runner": {"url": "b", "run_path": "/task/run"}}));
    }

    #[tokio::test]
    async fn file_layer_overrides_defaults_and_cli_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"runner": {"url": "http://file-runner"}, "poller": {"max_retries": 3}}"#,
        )
        .expect("write");
        let store = ConfigStore::new(
            Some(path.clone()),
            Some(json!({"poller": {"max_retries": 5}})),
        )
        .await
        .expect("store");
        let config = store.get().await;
        assert_eq!(config.poller.max_retries, 5);
        assert_eq!(config.poller.retry_step_ms, 2_000);
        assert_eq!(config.runner.status_path, "/task/status");

        std::fs::write(&path, r#"{"state_store": {"backend": "s3"}}"#).expect("rewrite");
        let reloaded = store.reload().await.expect("reload");
        assert_eq!(reloaded.state_store.backend, "s3");
        assert_eq!(reloaded.poller.max_retries, 5);
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(Some(dir.path().join("absent.json")), None)
            .await
            .expect("store");
        let config = store.get().await;
        assert_eq!(config.notify, NotifyConfig::default());
        assert_eq!(config.server.port, 19020);
    }
}
