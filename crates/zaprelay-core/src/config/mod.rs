mod defaults;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::RelayError;
use defaults::*;

/// Top-level zaprelay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub flows: FlowConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub crm: CrmConfig,
}

/// General process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// HTTP API server config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Bearer token for the `/api/*` routes. Empty = no auth (webhooks are never gated).
    #[serde(default)]
    pub api_key: String,
    /// Externally reachable base URL, used for media links and CRM handler URLs.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            api_key: String::new(),
            public_url: default_public_url(),
        }
    }
}

/// Datastore config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Event queue and worker config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Entries processed per worker pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempts before an entry becomes `failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// A `processing` claim older than this is considered abandoned and may be reclaimed.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
    /// Background poll interval for `serve`. 0 = only run on explicit invocation.
    #[serde(default)]
    pub poll_interval_secs: u64,
    /// Kick a worker pass for the new entry as soon as the CRM webhook is acked.
    #[serde(default = "default_true")]
    pub process_on_enqueue: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            claim_lease_secs: default_claim_lease_secs(),
            poll_interval_secs: 0,
            process_on_enqueue: true,
        }
    }
}

/// Flow engine and attendance gate config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Upper bound on nodes executed per flow run.
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    /// Cap applied to every `delay` node.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Automation is suppressed if the bot sent a message this recently.
    #[serde(default = "default_anti_loop_secs")]
    pub anti_loop_secs: i64,
    /// Sent by `transfer_to_human` nodes that carry no message of their own.
    #[serde(default = "default_handoff_message")]
    pub handoff_message: String,
    /// Labels the intent classifier may return.
    #[serde(default = "default_intents")]
    pub intents: Vec<String>,
    /// Recent messages passed to the classifier and the AI responder.
    #[serde(default = "default_history_messages")]
    pub history_messages: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_nodes: default_max_nodes(),
            max_delay_secs: default_max_delay_secs(),
            anti_loop_secs: default_anti_loop_secs(),
            handoff_message: default_handoff_message(),
            intents: default_intents(),
            history_messages: default_history_messages(),
        }
    }
}

/// OpenAI-compatible completion config, used for replies and intent classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    /// Model used by the intent classifier. Empty = same as `model`.
    #[serde(default)]
    pub classifier_model: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            model: default_openai_model(),
            classifier_model: String::new(),
            base_url: default_openai_base_url(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// Speech-to-text config (Whisper-compatible endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Empty = reuse `ai.api_key`.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_whisper_model")]
    pub model: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            model: default_whisper_model(),
            base_url: default_openai_base_url(),
        }
    }
}

/// CRM application credentials.
///
/// Client credentials belong to the shared marketplace app, so they live in
/// process configuration and never in per-tenant integration rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Tokens expiring within this window are refreshed (clamped to 300..=600).
    #[serde(default = "default_refresh_buffer_secs")]
    pub refresh_buffer_secs: i64,
    /// Connector code registered with the CRM's open-channel API.
    #[serde(default = "default_connector_id")]
    pub connector_id: String,
    #[serde(default = "default_connector_name")]
    pub connector_name: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_url: default_token_url(),
            refresh_buffer_secs: default_refresh_buffer_secs(),
            connector_id: default_connector_id(),
            connector_name: default_connector_name(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl CrmConfig {
    /// Refresh buffer in seconds, kept inside the 5–10 minute window.
    pub fn refresh_buffer(&self) -> i64 {
        self.refresh_buffer_secs.clamp(300, 600)
    }
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Overlay secrets from the environment onto a loaded config.
///
/// Environment wins over the file so deployments can keep credentials out of it.
pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let pick = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = pick("OPENAI_API_KEY") {
        config.ai.api_key = v;
    }
    if let Some(v) = pick("CRM_CLIENT_ID") {
        config.crm.client_id = v;
    }
    if let Some(v) = pick("CRM_CLIENT_SECRET") {
        config.crm.client_secret = v;
    }
    if let Some(v) = pick("RELAY_API_KEY") {
        config.api.api_key = v;
    }
    if let Some(v) = pick("RELAY_PUBLIC_URL") {
        config.api.public_url = v;
    }
    if let Some(v) = pick("RELAY_DB_PATH") {
        config.store.db_path = v;
    }
}

/// Load configuration from a TOML file, then apply environment overrides.
pub fn load(path: &str) -> Result<Config, RelayError> {
    let path = Path::new(path);
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str::<Config>(&content)
            .map_err(|e| RelayError::Config(format!("failed to parse config: {}", e)))?
    } else {
        info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        Config::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}
