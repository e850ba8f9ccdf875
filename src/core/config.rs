use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentboxConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Kube,
    /// Process-local fake; only useful for demos where every worker shares one process.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    #[serde(default = "default_api_server")]
    pub api_server: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,

    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,

    /// Readiness poll interval.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreConfig {
    /// SQLite file holding checkpoints, status rows and inbox logs.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_routed_worker_type")]
    pub worker_type: String,

    #[serde(default = "default_routed_image")]
    pub image: String,

    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    #[serde(default = "default_model_name")]
    pub model_name: String,

    #[serde(default)]
    pub service_account: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// OpenAI-compatible chat completions endpoint. Unset means the offline echo model.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_model_name")]
    pub model: String,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_api_server() -> String {
    "https://kubernetes.default.svc".to_string()
}
fn default_namespace() -> String {
    "default".to_string()
}
fn default_token_path() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
}
fn default_ca_path() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt")
}
fn default_poll_interval_secs() -> u64 {
    2
}
fn default_routed_worker_type() -> String {
    "chatbot-agent".to_string()
}
fn default_routed_image() -> String {
    "chatbot-agent:latest".to_string()
}
fn default_name_prefix() -> String {
    "chatbot-user".to_string()
}
fn default_ttl_seconds() -> u64 {
    1800
}
fn default_ready_timeout_secs() -> u64 {
    60
}
fn default_model_name() -> String {
    "models/gemini-flash-2.0".to_string()
}
fn default_api_key_env() -> String {
    "AGENTBOX_MODEL_API_KEY".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            api_server: default_api_server(),
            namespace: default_namespace(),
            token_path: default_token_path(),
            ca_path: default_ca_path(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            worker_type: default_routed_worker_type(),
            image: default_routed_image(),
            name_prefix: default_name_prefix(),
            ttl_seconds: default_ttl_seconds(),
            ready_timeout_secs: default_ready_timeout_secs(),
            model_name: default_model_name(),
            service_account: None,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: default_model_name(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl AgentboxConfig {
    pub async fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();
        if !config_path.exists() {
            info!(
                "No config found at {}, using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(config_path).await?;
        let config: AgentboxConfig = toml::from_str(&content)?;
        info!(
            "Loaded config: backend={:?} ({}), namespace={}, routed type={}",
            config.backend.kind,
            config.backend.api_server,
            config.backend.namespace,
            config.router.worker_type
        );
        Ok(config)
    }

    /// Apply process-environment overrides. `lookup` is `std::env::var` in the binary.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ns) = lookup("NAMESPACE") {
            self.backend.namespace = ns;
        }
        if let Some(path) = lookup("AGENTBOX_DB_PATH") {
            self.store.db_path = Some(PathBuf::from(path));
        }
        if let Some(model) = lookup("MODEL_NAME") {
            self.model.model = model.clone();
            self.router.model_name = model;
        }
        if let Some(account) = lookup("SERVICE_ACCOUNT_NAME") {
            self.router.service_account = Some(account);
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.store
            .db_path
            .clone()
            .unwrap_or_else(|| data_dir().join("agentbox.db"))
    }
}

/// Identity of the worker process, injected by the orchestration backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub agent_id: String,
    pub agent_type: String,
    pub run_once: bool,
}

impl WorkerIdentity {
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let agent_type = lookup("AGENT_TYPE").unwrap_or_else(|| "hello-agent".to_string());
        let agent_id = lookup("AGENT_ID").unwrap_or_else(|| agent_type.clone());
        let run_once = lookup("RUN_ONCE")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            agent_id,
            agent_type,
            run_once,
        }
    }
}

/// Root data directory: `$AGENTBOX_DATA_DIR`, else `~/.agentbox`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AGENTBOX_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".agentbox")
}

/// Config file location: `$AGENTBOX_CONFIG`, else `<data_dir>/agentbox.toml`.
pub fn config_path() -> PathBuf {
    std::env::var("AGENTBOX_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("agentbox.toml"))
}
