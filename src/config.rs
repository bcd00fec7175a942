//! Vitalwatch configuration
//!
//! Layered: TOML file → environment variables → CLI flags (applied by the
//! binaries). Durations are written as milliseconds.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::vitals::poller::{InitialLoad, PollerConfig};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Remote vitals API
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Poll driver
    #[serde(default)]
    pub poller: PollerConfig,

    /// Where ciphertext gets opened
    #[serde(default)]
    pub decrypt: DecryptConfig,

    /// Status HTTP surface
    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `VITALWATCH_CONFIG_PATH` (or `vitalwatch.toml`), then apply
    /// environment overrides.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let path = std::env::var("VITALWATCH_CONFIG_PATH")
            .unwrap_or_else(|_| "vitalwatch.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default vitalwatch config ({}): {}", path, e);
            Self::default()
        });
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Overlay values from a key lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("VITALS_API_BASE") {
            self.remote.base_url = v;
        }
        if let Some(ms) = lookup("VITALS_HTTP_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.remote.timeout_ms = ms;
        }
        if let Some(v) = lookup("VITALS_PATIENT_ID") {
            self.poller.patient_id = v;
        }
        if let Some(size) = lookup("VITALS_WINDOW_SIZE")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
        {
            self.poller.window_size = size;
        }
        if let Some(ms) = lookup("VITALS_POLL_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
        {
            self.poller.interval = std::time::Duration::from_millis(ms);
        }
        if let Some(v) = lookup("VITALS_INITIAL_LOAD") {
            match v.to_lowercase().as_str() {
                "range" => self.poller.initial_load = InitialLoad::Range,
                "latest" | "logs" => self.poller.initial_load = InitialLoad::Latest,
                other => tracing::warn!("Ignoring unknown VITALS_INITIAL_LOAD={}", other),
            }
        }
        if let Some(v) = lookup("VITALS_DECRYPT_MODE") {
            match v.to_lowercase().as_str() {
                "remote" => self.decrypt.mode = DecryptMode::Remote,
                "local" => self.decrypt.mode = DecryptMode::Local,
                other => tracing::warn!("Ignoring unknown VITALS_DECRYPT_MODE={}", other),
            }
        }
        if let Some(port) = lookup("VITALWATCH_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
    }
}

/// Remote vitals API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_range_path")]
    pub range_path: String,
    #[serde(default = "default_latest_path")]
    pub latest_path: String,
    #[serde(default = "default_decrypt_path")]
    pub decrypt_path: String,
    /// Per-request timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_range_path() -> String {
    "/read_encrypted_range".to_string()
}

fn default_latest_path() -> String {
    "/read_encrypted".to_string()
}

fn default_decrypt_path() -> String {
    "/decrypt".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            range_path: default_range_path(),
            latest_path: default_latest_path(),
            decrypt_path: default_decrypt_path(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecryptMode {
    /// POST each blob to the API's decrypt endpoint
    Remote,
    /// Open AES-GCM envelopes locally
    Local,
}

impl Default for DecryptMode {
    fn default() -> Self {
        Self::Remote
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptConfig {
    #[serde(default)]
    pub mode: DecryptMode,
    /// Environment variable holding the AES-256 key (local mode)
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

fn default_key_env() -> String {
    "AES_KEY".to_string()
}

impl Default for DecryptConfig {
    fn default() -> Self {
        Self {
            mode: DecryptMode::default(),
            key_env: default_key_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on records returned by `/vitals`
    #[serde(default = "default_display_limit")]
    pub display_limit: usize,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_display_limit() -> usize {
    200
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            display_limit: default_display_limit(),
        }
    }
}

/// Serialize `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
