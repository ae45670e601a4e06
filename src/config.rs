//! Configuration management for Floodgate.
//!
//! Configuration is read once at startup. Values come from, in increasing
//! priority: built-in defaults, an optional YAML file, and `FLOODGATE__*`
//! environment variables (e.g. `FLOODGATE__STORE__URL`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{
    default_policies, PolicyConfig, PolicyRegistry, DEFAULT_KEY_PREFIX, FORWARDED_FOR_HEADER,
    REAL_IP_HEADER,
};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for Floodgate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Local fallback configuration
    #[serde(default)]
    pub local: LocalConfig,

    /// Caller identification configuration
    #[serde(default)]
    pub identifier: IdentifierConfig,

    /// Named rate limit policies
    #[serde(default = "default_policies")]
    pub policies: Vec<PolicyConfig>,
}

impl Default for FloodgateConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            local: LocalConfig::default(),
            identifier: IdentifierConfig::default(),
            policies: default_policies(),
        }
    }
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL; when absent only the local path is used
    #[serde(default)]
    pub url: Option<String>,

    /// Per-call timeout in milliseconds before falling back
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Namespace for store keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    200
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Local fallback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Seconds between sweeps of expired local counters
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            gc_interval_secs: default_gc_interval(),
        }
    }
}

impl LocalConfig {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

fn default_gc_interval() -> u64 {
    60
}

/// Which headers identify a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierConfig {
    /// Header holding the forwarded-address chain
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,

    /// Header holding a single real client address
    #[serde(default = "default_real_ip_header")]
    pub real_ip_header: String,
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        Self {
            forwarded_header: default_forwarded_header(),
            real_ip_header: default_real_ip_header(),
        }
    }
}

fn default_forwarded_header() -> String {
    FORWARDED_FOR_HEADER.to_string()
}

fn default_real_ip_header() -> String {
    REAL_IP_HEADER.to_string()
}

impl FloodgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults, then the optional file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: FloodgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a working enforcer.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(FloodgateError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.local.gc_interval_secs == 0 {
            return Err(FloodgateError::Config(
                "local.gc_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.store.url.as_deref().is_some_and(|url| url.trim().is_empty()) {
            return Err(FloodgateError::Config(
                "store.url must not be empty when set".to_string(),
            ));
        }
        PolicyRegistry::from_configs(self.policies.clone())?;
        Ok(())
    }
}
