use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BlockflowError, Result};

/// Top-level Blockflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionConfig,
    #[serde(default)]
    pub wallet: Option<WalletConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-node timeout. 0 disables the timeout.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Upper bound on sibling nodes running at the same time.
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_timeout_secs: default_node_timeout(),
            max_concurrent_nodes: default_max_concurrent_nodes(),
        }
    }
}

impl EngineConfig {
    pub fn node_timeout(&self) -> Option<Duration> {
        (self.node_timeout_secs > 0).then(|| Duration::from_secs(self.node_timeout_secs))
    }
}

fn default_node_timeout() -> u64 { 120 }
fn default_max_concurrent_nodes() -> usize { 8 }

/// What to do with a trigger firing while a run from the same node is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Drop the firing.
    #[default]
    Skip,
    /// Buffer the firing and run it after the current one.
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default)]
    pub overlap: OverlapPolicy,
    /// Buffered firings per trigger node when `overlap = "queue"`.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            overlap: OverlapPolicy::default(),
            queue_capacity: default_queue_capacity(),
            retry: RetryConfig::default(),
        }
    }
}

impl SubscriptionConfig {
    /// Channel capacity backing one trigger node's firings.
    pub fn channel_capacity(&self) -> usize {
        match self.overlap {
            OverlapPolicy::Skip => 1,
            OverlapPolicy::Queue => self.queue_capacity.max(1),
        }
    }
}

fn default_queue_capacity() -> usize { 16 }

/// Resubscribe policy for listeners that fail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 5 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 60_000 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Address injected into every run context.
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `blockflow=debug`.
    #[serde(default)]
    pub filter: Option<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| BlockflowError::ConfigNotFound(path.display().to_string()))?;

        Self::from_toml(&content)
    }

    /// Load config, falling back to defaults when `path` does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| BlockflowError::Config(e.to_string()))
    }

    pub fn wallet_address(&self) -> Option<&str> {
        self.wallet.as_ref().and_then(|w| w.address.as_deref())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
