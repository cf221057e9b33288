//! Gateway configuration
//!
//! Configuration is loaded from layered sources in priority order:
//! 1. Environment variables (PROMPTGATE_*) (highest)
//! 2. Explicit config file path
//! 3. Local config file (./promptgate.toml)
//! 4. User config file (~/.config/promptgate/config.toml) (lowest)

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// OpenAI-compatible API
    OpenAi,
    /// Anthropic-compatible API
    Anthropic,
}

impl ProviderType {
    /// Get the default API base URL for this provider type
    pub fn default_base_url(&self) -> &str {
        match self {
            ProviderType::OpenAi => "https://api.openai.com/v1",
            ProviderType::Anthropic => "https://api.anthropic.com",
        }
    }
}

/// One candidate model with an optional output-size cap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier as sent on the wire
    pub id: String,

    /// Output token cap for this model; provider default when unset
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ModelSpec {
    /// Create a model spec without an output cap
    pub fn new(id: impl Into<String>) -> Self {
        ModelSpec {
            id: id.into(),
            max_tokens: None,
        }
    }

    /// Set the output token cap
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Configuration for one LLM provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider type (OpenAI or Anthropic dialect)
    #[serde(rename = "type")]
    pub provider_type: ProviderType,

    /// API base URL
    #[serde(default)]
    pub api_base: Option<String>,

    /// Interchangeable API keys, rotated on rate limits
    #[serde(skip_serializing)]
    pub api_keys: Vec<String>,

    /// Candidate models in priority order (first is tried first)
    pub models: Vec<ModelSpec>,

    /// Request timeout in seconds (default: 120)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

impl ProviderConfig {
    /// Create a config with defaults for the given provider type
    pub fn new(provider_type: ProviderType, api_keys: Vec<String>, models: Vec<ModelSpec>) -> Self {
        ProviderConfig {
            provider_type,
            api_base: None,
            api_keys,
            models,
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Resolved API base URL
    pub fn api_base(&self) -> &str {
        self.api_base
            .as_deref()
            .unwrap_or_else(|| self.provider_type.default_base_url())
    }

    /// Request timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry and backoff policy shared by all providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Provider-call budget per request; `None` means 2 x pool size
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Exponential backoff base in milliseconds (default: 500)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds (default: 5000)
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,

    /// Credential cooldown after a rate limit without a provider hint,
    /// in milliseconds (default: 30000)
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_ceiling_ms() -> u64 {
    5000
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: None,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl RetryConfig {
    /// Backoff base as a [`Duration`]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Backoff ceiling as a [`Duration`]
    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_ms)
    }

    /// Default credential cooldown as a [`Duration`]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Providers by name, in configured order
    pub providers: IndexMap<String, ProviderConfig>,

    /// Retry and backoff policy
    #[serde(default)]
    pub retry: RetryConfig,
}

impl GatewayConfig {
    /// Load configuration from the given path, or from the default locations
    /// (`./promptgate.toml`, then `~/.config/promptgate/config.toml`).
    ///
    /// Environment variables override file contents per provider:
    /// - `PROMPTGATE_<PROVIDER>_API_KEYS`: comma-separated key list
    /// - `PROMPTGATE_<PROVIDER>_API_BASE`: base URL
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::discover_path()
                .ok_or_else(|| anyhow::anyhow!("no promptgate.toml found"))?,
        };

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no env overrides, no validation)
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn discover_path() -> Option<PathBuf> {
        let local = PathBuf::from("promptgate.toml");
        if local.exists() {
            return Some(local);
        }
        let user = dirs::config_dir()?.join("promptgate").join("config.toml");
        user.exists().then_some(user)
    }

    fn apply_env_overrides(&mut self) {
        for (name, provider) in self.providers.iter_mut() {
            let prefix = format!("PROMPTGATE_{}", name.to_uppercase());
            if let Ok(keys) = std::env::var(format!("{}_API_KEYS", prefix)) {
                let keys: Vec<String> = keys
                    .split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect();
                if !keys.is_empty() {
                    provider.api_keys = keys;
                }
            }
            if let Ok(base) = std::env::var(format!("{}_API_BASE", prefix)) {
                provider.api_base = Some(base);
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.providers.is_empty() {
            anyhow::bail!("no providers configured");
        }
        for (name, provider) in &self.providers {
            if provider.api_keys.is_empty() {
                anyhow::bail!("provider '{}' has no API keys", name);
            }
            if provider.models.is_empty() {
                anyhow::bail!("provider '{}' has no models", name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [providers.openai]
        type = "openai"
        api_keys = ["sk-one", "sk-two"]
        models = [
            { id = "gpt-4o-mini" },
            { id = "gpt-4o", max_tokens = 8192 },
        ]

        [retry]
        backoff_base_ms = 250
    "#;

    #[test]
    fn test_parse_sample() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        let provider = &config.providers["openai"];
        assert_eq!(provider.provider_type, ProviderType::OpenAi);
        assert_eq!(provider.api_keys.len(), 2);
        assert_eq!(provider.models[1].max_tokens, Some(8192));
        assert_eq!(config.retry.backoff_base_ms, 250);
        assert_eq!(config.retry.backoff_ceiling_ms, 5000);
    }

    #[test]
    fn test_default_base_url() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            config.providers["openai"].api_base(),
            "https://api.openai.com/v1"
        );
    }

    #[test]
    fn test_provider_order_preserved() {
        let raw = r#"
            [providers.secondary]
            type = "anthropic"
            api_keys = ["k"]
            models = [{ id = "m" }]

            [providers.primary]
            type = "openai"
            api_keys = ["k"]
            models = [{ id = "m" }]
        "#;
        let config = GatewayConfig::from_toml_str(raw).unwrap();
        let names: Vec<&String> = config.providers.keys().collect();
        assert_eq!(names, ["secondary", "primary"]);
    }

    #[test]
    fn test_validate_rejects_empty_keys() {
        let raw = r#"
            [providers.openai]
            type = "openai"
            api_keys = []
            models = [{ id = "m" }]
        "#;
        let config = GatewayConfig::from_toml_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
