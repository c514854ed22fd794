use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use crate::{DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT};

/// A bearer token accepted by the server and the identity it stands for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    pub sub: String,
    pub email: String,
    pub sign_in_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub db_path: Option<String>,
    pub isolation: String,
    pub tokens: Vec<TokenGrant>,
    pub object_store_url: Option<String>,
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            isolation: "serializable".to_string(),
            tokens: Vec::new(),
            object_store_url: None,
            event_buffer: crate::event_bus::DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("http://{DEFAULT_SERVER_HOST}:{DEFAULT_SERVER_PORT}"),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global file, project file, environment and
/// command-line overrides, later layers winning.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    /// `path` is the project config file, usually `<state_dir>/config.json`.
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        let global_path = resolve_global_config_path();
        Self::with_paths(global_path, project_path, env_layer(), cli_overrides).await
    }

    pub async fn with_paths(
        global_path: PathBuf,
        project_path: PathBuf,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let global = read_json_file(&global_path).await?;
        let project = read_json_file(&project_path).await?;
        let layers = ConfigLayers {
            global,
            project,
            env,
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            project_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "invalid configuration, using defaults");
                AppConfig::default()
            }
        }
    }

    async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

/// Drops the client token from a persisted layer when the environment
/// already supplies one.
fn strip_persisted_secrets(value: &mut Value) {
    if std::env::var("TASKLANE_TOKEN").is_err() {
        return;
    }
    if let Some(client) = value.get_mut("client").and_then(Value::as_object_mut) {
        client.remove("token");
    }
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable config file");
            Ok(empty_object())
        }
    }
}

fn resolve_global_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TASKLANE_GLOBAL_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("tasklane").join("config.json");
    }
    PathBuf::from(".tasklane/global_config.json")
}

pub fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();

    if let Some(url) = lookup("TASKLANE_SERVER_URL").filter(|v| !v.trim().is_empty()) {
        deep_merge(&mut root, &json!({ "client": { "server_url": url.trim() } }));
    }
    if let Some(token) = lookup("TASKLANE_TOKEN").filter(|v| !v.trim().is_empty()) {
        deep_merge(&mut root, &json!({ "client": { "token": token.trim() } }));
    }
    if let Some(path) = lookup("TASKLANE_DB_PATH").filter(|v| !v.trim().is_empty()) {
        deep_merge(&mut root, &json!({ "server": { "db_path": path.trim() } }));
    }
    if let Some(level) = lookup("TASKLANE_ISOLATION").filter(|v| !v.trim().is_empty()) {
        deep_merge(
            &mut root,
            &json!({ "server": { "isolation": level.trim().to_ascii_lowercase() } }),
        );
    }
    if let Some(url) = lookup("TASKLANE_OBJECT_STORE_URL").filter(|v| !v.trim().is_empty()) {
        deep_merge(&mut root, &json!({ "server": { "object_store_url": url.trim() } }));
    }
    if let Some(raw) = lookup("TASKLANE_TOKENS") {
        let grants = parse_token_grants(&raw);
        if !grants.is_empty() {
            deep_merge(&mut root, &json!({ "server": { "tokens": grants } }));
        }
    }

    root
}

/// Parses `token=sub:email:name;token2=...`. Malformed entries are skipped.
pub fn parse_token_grants(raw: &str) -> Vec<TokenGrant> {
    raw.split(';')
        .filter_map(|entry| {
            let (token, identity) = entry.trim().split_once('=')?;
            let mut parts = identity.splitn(3, ':');
            let sub = parts.next()?.trim();
            let email = parts.next()?.trim();
            let sign_in_name = parts.next().unwrap_or(sub).trim();
            if token.trim().is_empty() || sub.is_empty() {
                return None;
            }
            Some(TokenGrant {
                token: token.trim().to_string(),
                sub: sub.to_string(),
                email: email.to_string(),
                sign_in_name: sign_in_name.to_string(),
            })
        })
        .collect()
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
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
