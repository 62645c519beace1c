use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::ProviderId;

/// Backend that fronts every vendor API
pub const DEFAULT_BASE_URL: &str = "https://ai-assistant-backend-164860087792.us-central1.run.app";

/// Environment variable prefix; `AMUX__GATEWAY__BASE_URL` overrides `gateway.base_url`
pub const ENV_PREFIX: &str = "AMUX";

const APP_DIR: &str = ".assistant-mux";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Optional bearer token for the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Budget for one-shot calls (summaries, speech, images)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Longest gap between streamed lines; 0 disables the check
    #[serde(default = "default_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
}

impl GatewayConfig {
    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        match self.stream_idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
            stream_idle_timeout_secs: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding chat_history.json and quota.json (defaults to ~/.assistant-mux)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(crate::message_tracing::expand_tilde(dir)),
            None => app_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_daily_messages")]
    pub daily_messages: u32,
    /// Premium users are never gated
    #[serde(default)]
    pub premium: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_messages: default_daily_messages(),
            premium: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_trace_path")]
    pub path: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_trace_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderId,
    /// Per-provider model override, keyed by provider id (`claude = "claude-3-opus-20240229"`)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub models: HashMap<String, String>,
}

impl DefaultsConfig {
    pub fn model_for(&self, provider: ProviderId) -> Option<&str> {
        self.models
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(provider.as_str()))
            .map(|(_, model)| model.as_str())
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            models: HashMap::new(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_daily_messages() -> u32 {
    10
}

fn default_trace_path() -> String {
    format!("~/{}/trace.jsonl", APP_DIR)
}

fn default_provider() -> ProviderId {
    ProviderId::ChatGpt
}

fn app_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(APP_DIR))
}

impl AppConfig {
    /// `~/.assistant-mux/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        Ok(app_dir()?.join("config.toml"))
    }

    /// Load from a TOML file layered under `AMUX__*` environment variables.
    /// A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings = builder
            .build()
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AppConfig = settings
            .try_deserialize()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Write a starter config; refuses to overwrite an existing file
    pub fn write_default(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists: {}", path.display());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(&AppConfig::default())
            .context("Failed to serialize default config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = AppConfig::from_file(&temp_dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.gateway.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.gateway.request_timeout_secs, 120);
        assert_eq!(config.quota.daily_messages, 10);
        assert_eq!(config.defaults.provider, ProviderId::ChatGpt);
        assert!(!config.tracing.enabled);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
base_url = "http://localhost:9000"
stream_idle_timeout_secs = 0

[defaults]
provider = "claude"

[defaults.models]
claude = "claude-3-opus-20240229"
"#,
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.gateway.base_url, "http://localhost:9000");
        assert_eq!(config.gateway.stream_idle_timeout(), None);
        assert_eq!(config.gateway.request_timeout_secs, 120);
        assert_eq!(config.defaults.provider, ProviderId::Claude);
        assert_eq!(
            config.defaults.model_for(ProviderId::Claude),
            Some("claude-3-opus-20240229")
        );
        assert_eq!(config.defaults.model_for(ProviderId::Grok), None);
    }

    #[test]
    fn test_write_default_round_trips_and_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        AppConfig::write_default(&path).unwrap();
        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.gateway.stream_idle_timeout(), Some(Duration::from_secs(60)));

        assert!(AppConfig::write_default(&path).is_err());
    }
}
