//! Unified config (figment-deserialized from defaults / config.toml / env vars).
//!
//! Three equivalent ways to configure:
//!
//!   config.toml:   [lifecycle]
//!                  circuit_breaker_threshold = 3
//!
//!   env var:       COORD_LIFECYCLE__CIRCUIT_BREAKER_THRESHOLD=3   (double underscore = nesting)

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub lifecycle: LifecycleFileConfig,
    #[serde(default)]
    pub secrets: SecretsFileConfig,
    #[serde(default)]
    pub crypto: CryptoFileConfig,
    #[serde(default)]
    pub ports: PortsFileConfig,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            server: ServerFileConfig::default(),
            lifecycle: LifecycleFileConfig::default(),
            secrets: SecretsFileConfig::default(),
            crypto: CryptoFileConfig::default(),
            ports: PortsFileConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Lifecycle tunables — the literal thresholds from SPEC_FULL.md §4.4,
/// overridable but defaulting to the spec's values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleFileConfig {
    #[serde(default = "default_cb_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_cb_window_ms")]
    pub circuit_breaker_window_ms: i64,
    #[serde(default = "default_cooldown_ms")]
    pub spawn_cooldown_ms: i64,
    #[serde(default = "default_ready_wait_ms")]
    pub ready_wait_ms: i64,
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: i64,
    #[serde(default = "default_inactivity_extension_ms")]
    pub inactivity_extension_ms: i64,
    #[serde(default = "default_min_check_ms")]
    pub min_check_ms: i64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: i64,
    #[serde(default = "default_heartbeat_stale_ms")]
    pub heartbeat_stale_ms: i64,
    #[serde(default = "default_auth_deadline_ms")]
    pub client_auth_deadline_ms: i64,
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: i64,
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for LifecycleFileConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: default_cb_threshold(),
            circuit_breaker_window_ms: default_cb_window_ms(),
            spawn_cooldown_ms: default_cooldown_ms(),
            ready_wait_ms: default_ready_wait_ms(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            inactivity_extension_ms: default_inactivity_extension_ms(),
            min_check_ms: default_min_check_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_stale_ms: default_heartbeat_stale_ms(),
            client_auth_deadline_ms: default_auth_deadline_ms(),
            push_timeout_ms: default_push_timeout_ms(),
            default_model: default_model(),
        }
    }
}

fn default_cb_threshold() -> u32 {
    3
}
fn default_cb_window_ms() -> i64 {
    5 * 60 * 1000
}
fn default_cooldown_ms() -> i64 {
    30 * 1000
}
fn default_ready_wait_ms() -> i64 {
    60 * 1000
}
fn default_inactivity_timeout_ms() -> i64 {
    10 * 60 * 1000
}
fn default_inactivity_extension_ms() -> i64 {
    5 * 60 * 1000
}
fn default_min_check_ms() -> i64 {
    30 * 1000
}
fn default_heartbeat_interval_ms() -> i64 {
    30 * 1000
}
fn default_heartbeat_stale_ms() -> i64 {
    90 * 1000
}
fn default_auth_deadline_ms() -> i64 {
    30 * 1000
}
fn default_push_timeout_ms() -> i64 {
    180 * 1000
}
fn default_model() -> String {
    "claude-default".to_string()
}

/// Repository secrets store quotas — fixed by spec, not meant to be
/// loosened per deployment, but kept here so tests can shrink them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretsFileConfig {
    #[serde(default = "default_max_secrets")]
    pub max_secrets_per_repo: usize,
    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,
    #[serde(default = "default_max_aggregate_bytes")]
    pub max_aggregate_bytes: usize,
}

impl Default for SecretsFileConfig {
    fn default() -> Self {
        Self {
            max_secrets_per_repo: default_max_secrets(),
            max_value_bytes: default_max_value_bytes(),
            max_aggregate_bytes: default_max_aggregate_bytes(),
        }
    }
}

fn default_max_secrets() -> usize {
    50
}
fn default_max_value_bytes() -> usize {
    16 * 1024
}
fn default_max_aggregate_bytes() -> usize {
    64 * 1024
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CryptoFileConfig {
    /// Base64-encoded 32-byte AES-256-GCM master key.
    #[serde(default = "default_master_key")]
    pub master_key_b64: String,
    /// HMAC-SHA-256 secret for outbound completion callbacks.
    #[serde(default = "default_callback_secret")]
    pub callback_secret: String,
}

impl Default for CryptoFileConfig {
    fn default() -> Self {
        Self {
            master_key_b64: default_master_key(),
            callback_secret: default_callback_secret(),
        }
    }
}

fn default_master_key() -> String {
    // 32 zero bytes, base64-encoded — intentionally obvious so it is never
    // mistaken for a real key; every deployment must override it.
    "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string()
}
fn default_callback_secret() -> String {
    "dev-callback-secret-override-me".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortsFileConfig {
    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,
    #[serde(default = "default_codehost_base_url")]
    pub codehost_base_url: String,
    /// Base URL for installation-token minting (spec.md §6 "Identity
    /// port"). Defaults to the code-host base URL since real GitHub App
    /// installation tokens are minted against the same `api.github.com`
    /// host as the code-host API, but is independently overridable for
    /// deployments (e.g. GitHub Enterprise) where the two diverge.
    #[serde(default = "default_identity_base_url")]
    pub identity_base_url: String,
    #[serde(default)]
    pub identity_app_id: String,
    #[serde(default)]
    pub identity_private_key_pem: String,
    #[serde(default)]
    pub identity_installation_id: String,
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl Default for PortsFileConfig {
    fn default() -> Self {
        Self {
            provider_base_url: default_provider_base_url(),
            codehost_base_url: default_codehost_base_url(),
            identity_base_url: default_identity_base_url(),
            identity_app_id: String::new(),
            identity_private_key_pem: String::new(),
            identity_installation_id: String::new(),
            callback_url: None,
        }
    }
}

fn default_provider_base_url() -> String {
    "http://localhost:9001".to_string()
}
fn default_codehost_base_url() -> String {
    "https://api.github.example".to_string()
}
fn default_identity_base_url() -> String {
    default_codehost_base_url()
}

pub fn load() -> anyhow::Result<FileConfig> {
    let config: FileConfig = Figment::new()
        .merge(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file("config.toml"))
        .merge(Env::prefixed("COORD_").split("__"))
        .extract()?;
    Ok(config)
}
