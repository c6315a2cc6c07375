// 7.0 config.rs: all settings in one place. stream names, dispatcher and correlator
// timing, cache retention, risk limits.
// 7.1 loaded from margin-engine.toml or the file named by MARGIN_ENGINE_CONFIG.
// every section and field is optional and falls back to the defaults below.

use crate::broker::MemoryLogConfig;
use crate::correlator::CorrelatorConfig;
use crate::dispatcher::DispatcherConfig;
use crate::engine::EngineConfig;
use crate::risk::RiskConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_ENV: &str = "MARGIN_ENGINE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "margin-engine.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    pub request: String,
    pub response: String,
    pub group: String,
    pub consumer: String,
    /// approximate per-stream retention
    pub max_len: usize,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            request: "stream:app:request".to_string(),
            response: "stream:engine:response".to_string(),
            group: "engine_group".to_string(),
            consumer: "engine-1".to_string(),
            max_len: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub batch_size: usize,
    pub block_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_deliveries: u32,
    pub publish_retries: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block_ms: 1_000,
            retry_backoff_ms: 500,
            max_deliveries: 5,
            publish_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorSettings {
    pub timeout_ms: u64,
    pub block_ms: u64,
    pub batch_size: usize,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 3_500,
            block_ms: 1_000,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub history_cap: usize,
    pub history_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            history_cap: 100,
            history_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub streams: StreamsConfig,
    pub dispatcher: DispatcherSettings,
    pub correlator: CorrelatorSettings,
    pub cache: CacheSettings,
    pub engine: EngineConfig,
    pub risk: RiskConfig,
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `MARGIN_ENGINE_CONFIG`, then `margin-engine.toml`, else defaults.
    pub fn load_default() -> Self {
        let from_env = std::env::var(CONFIG_ENV).ok();
        let candidates = from_env.iter().map(String::as_str).chain([DEFAULT_CONFIG_PATH]);

        for path in candidates {
            match Self::load(Path::new(path)) {
                Ok(cfg) => {
                    tracing::info!(path, "loaded config");
                    return cfg;
                }
                Err(e) if Path::new(path).exists() => {
                    tracing::warn!(path, error = %e, "config file rejected");
                }
                Err(_) => {}
            }
        }

        tracing::warn!("no config file found, using defaults");
        Self::default()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.risk.validate()?;
        anyhow::ensure!(self.dispatcher.batch_size > 0, "dispatcher.batch_size must be positive");
        anyhow::ensure!(self.dispatcher.max_deliveries > 0, "dispatcher.max_deliveries must be positive");
        anyhow::ensure!(self.correlator.timeout_ms > 0, "correlator.timeout_ms must be positive");
        anyhow::ensure!(self.streams.max_len > 0, "streams.max_len must be positive");
        Ok(())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            request_stream: self.streams.request.clone(),
            response_stream: self.streams.response.clone(),
            group: self.streams.group.clone(),
            consumer: self.streams.consumer.clone(),
            batch_size: self.dispatcher.batch_size,
            block: Duration::from_millis(self.dispatcher.block_ms),
            retry_backoff: Duration::from_millis(self.dispatcher.retry_backoff_ms),
            max_deliveries: self.dispatcher.max_deliveries,
            publish_retries: self.dispatcher.publish_retries,
        }
    }

    pub fn correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            response_stream: self.streams.response.clone(),
            timeout: Duration::from_millis(self.correlator.timeout_ms),
            block: Duration::from_millis(self.correlator.block_ms),
            batch_size: self.correlator.batch_size,
            retry_backoff: Duration::from_millis(self.dispatcher.retry_backoff_ms),
        }
    }

    pub fn log_config(&self) -> MemoryLogConfig {
        MemoryLogConfig {
            max_len: self.streams.max_len,
            history_cap: self.cache.history_cap,
            history_ttl: Duration::from_secs(self.cache.history_ttl_secs),
        }
    }
}
