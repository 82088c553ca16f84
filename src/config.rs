use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::chunking::MergeStrategy;
use crate::dispatch::http::ApiFormat;
use crate::error::DispatchError;
use crate::queue::Priority;
use crate::router::policy::Policy;

pub const PRIMARY_PROVIDER: &str = "anthropic";

/// Whether a provider is assumed up (primary) or must pass a live probe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    Primary,
    #[default]
    Secondary,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub model: String,
    pub base_url: String,
    #[serde(default)]
    pub api_format: ApiFormat,
    #[serde(default)]
    pub role: ProviderRole,
    /// Environment variable holding the API key. Keys never live in the file.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub probe_url: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub default_priority: u8,
    pub processing_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_size: 100,
            default_priority: Priority::NORMAL.value(),
            processing_timeout_ms: 120_000,
        }
    }
}

impl QueueConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_max_calls: 3,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            capacity: 100,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub max_tokens: usize,
    pub overlap: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub merge_strategy: MergeStrategy,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            overlap: 200,
            max_retries: 3,
            retry_delay_ms: 1000,
            merge_strategy: MergeStrategy::Smart,
        }
    }
}

impl ChunkConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub policy: Policy,
    pub probe_window_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            policy: Policy::Balanced,
            probe_window_secs: 60,
        }
    }
}

impl RouterConfig {
    pub fn probe_window(&self) -> Duration {
        Duration::from_secs(self.probe_window_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub chunking: ChunkConfig,
    pub router: RouterConfig,
    pub providers: Vec<ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            chunking: ChunkConfig::default(),
            router: RouterConfig::default(),
            providers: default_providers(),
        }
    }
}

impl Config {
    /// Defaults, overlaid by an optional TOML file, then credentials from env.
    ///
    /// File lookup: `PLUME_CONFIG` if set, else `plume.toml` in the CWD.
    /// A malformed file is logged and ignored rather than aborting startup.
    pub fn load() -> Self {
        let path = env::var("PLUME_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("plume.toml"));

        let mut config = if path.exists() {
            match Self::from_file(&path) {
                Ok(c) => {
                    tracing::info!(path = %path.display(), "loaded config file");
                    c
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "ignoring config file: {e}");
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.apply_env();

        if let Err(e) = config.validate() {
            tracing::warn!("{e}; falling back to defaults");
            config = Self::default();
            config.apply_env();
        }

        config
    }

    pub fn from_file(path: &Path) -> Result<Self, DispatchError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, DispatchError> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| DispatchError::Config(e.to_string()))?;
        if config.providers.is_empty() {
            config.providers = default_providers();
        }
        Ok(config)
    }

    /// Resolve API keys and the local Ollama endpoint from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(base) = env::var("OLLAMA_BASE_URL") {
            let base = base.trim_end_matches('/').to_string();
            if let Some(p) = self.providers.iter_mut().find(|p| p.id == "ollama") {
                p.base_url = format!("{base}/v1/chat/completions");
                p.probe_url = Some(format!("{base}/api/tags"));
            }
        }

        for provider in &mut self.providers {
            let Some(ref var) = provider.api_key_env else {
                continue;
            };
            match env::var(var) {
                Ok(key) if !key.trim().is_empty() => provider.api_key = Some(key),
                _ => {
                    if provider.role == ProviderRole::Primary {
                        tracing::error!("{var} not set, primary provider {} will fail", provider.id);
                    } else {
                        tracing::warn!("{var} not set, {} unavailable", provider.id);
                    }
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.queue.max_concurrent == 0 {
            return Err(DispatchError::Config("queue.max_concurrent must be > 0".into()));
        }
        if self.queue.max_queue_size == 0 {
            return Err(DispatchError::Config("queue.max_queue_size must be > 0".into()));
        }
        if self.queue.default_priority > Priority::MAX {
            return Err(DispatchError::Config(format!(
                "queue.default_priority must be 0..={}, got {}",
                Priority::MAX,
                self.queue.default_priority
            )));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.half_open_max_calls == 0 {
            return Err(DispatchError::Config(
                "breaker thresholds must be > 0".into(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(DispatchError::Config("cache.capacity must be > 0".into()));
        }
        if self.chunking.max_tokens == 0 {
            return Err(DispatchError::Config("chunking.max_tokens must be > 0".into()));
        }
        let primaries = self
            .providers
            .iter()
            .filter(|p| p.role == ProviderRole::Primary)
            .count();
        if primaries != 1 {
            return Err(DispatchError::Config(format!(
                "exactly one primary provider required, found {primaries}"
            )));
        }
        Ok(())
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            id: PRIMARY_PROVIDER.to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: "https://api.anthropic.com/v1/messages".to_string(),
            api_format: ApiFormat::Anthropic,
            role: ProviderRole::Primary,
            api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
            probe_url: None,
            api_key: None,
        },
        ProviderConfig {
            id: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: "https://api.deepseek.com/chat/completions".to_string(),
            api_format: ApiFormat::OpenAi,
            role: ProviderRole::Secondary,
            api_key_env: Some("DEEPSEEK_API_KEY".to_string()),
            probe_url: None,
            api_key: None,
        },
        ProviderConfig {
            id: "ollama".to_string(),
            model: "llama3.1".to_string(),
            base_url: "http://localhost:11434/v1/chat/completions".to_string(),
            api_format: ApiFormat::OpenAi,
            role: ProviderRole::Secondary,
            api_key_env: None,
            probe_url: Some("http://localhost:11434/api/tags".to_string()),
            api_key: None,
        },
    ]
}
