//! Named rate limit policies.
//!
//! Policies are loaded once at startup (from YAML or the built-in defaults)
//! and are never mutated afterwards, so a [`PolicyRegistry`] can be shared
//! between any number of tasks without locking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// A named (window, ceiling) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    name: Arc<str>,
    window: Duration,
    max_requests: u64,
}

impl Policy {
    /// Create a policy. Use [`PolicyRegistry::from_configs`] for validated construction.
    pub fn new(name: &str, window: Duration, max_requests: u64) -> Self {
        Self {
            name: Arc::from(name),
            window,
            max_requests,
        }
    }

    /// The policy name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length of the counting window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Maximum requests allowed inside one window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }
}

/// A policy as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// The policy name callers refer to
    pub name: String,
    /// Window length in seconds
    pub window_secs: u64,
    /// Number of requests allowed per window
    pub max_requests: u64,
}

impl PolicyConfig {
    /// Shorthand constructor.
    pub fn new(name: &str, window_secs: u64, max_requests: u64) -> Self {
        Self {
            name: name.to_string(),
            window_secs,
            max_requests,
        }
    }
}

/// Wrapper used when a YAML document contains only a policy list.
#[derive(Debug, Deserialize)]
struct PolicyFile {
    policies: Vec<PolicyConfig>,
}

/// The built-in policy set.
pub fn default_policies() -> Vec<PolicyConfig> {
    vec![
        PolicyConfig::new("standard", 60, 100),
        PolicyConfig::new("auth", 60, 10),
        PolicyConfig::new("sensitive", 3600, 20),
        PolicyConfig::new("upload", 3600, 30),
        PolicyConfig::new("webhook", 60, 1000),
    ]
}

/// Immutable lookup table of named policies.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Policy>,
}

impl PolicyRegistry {
    /// Build a registry from configured policies, rejecting invalid entries.
    pub fn from_configs<I>(configs: I) -> Result<Self>
    where
        I: IntoIterator<Item = PolicyConfig>,
    {
        let mut policies = HashMap::new();

        for config in configs {
            let name = config.name.trim();
            if name.is_empty() {
                return Err(FloodgateError::Config(
                    "policy name must not be empty".to_string(),
                ));
            }
            if config.window_secs == 0 {
                return Err(FloodgateError::Config(format!(
                    "policy '{}' must have a window of at least one second",
                    name
                )));
            }
            if config.max_requests == 0 {
                return Err(FloodgateError::Config(format!(
                    "policy '{}' must allow at least one request",
                    name
                )));
            }
            if policies.contains_key(name) {
                return Err(FloodgateError::Config(format!(
                    "policy '{}' is defined more than once",
                    name
                )));
            }

            let policy = Policy::new(
                name,
                Duration::from_secs(config.window_secs),
                config.max_requests,
            );
            policies.insert(name.to_string(), policy);
        }

        Ok(Self { policies })
    }

    /// Registry holding the built-in policies.
    pub fn defaults() -> Self {
        Self::from_configs(default_policies()).unwrap_or_default()
    }

    /// Load policies from a YAML file containing a `policies:` list.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from YAML, either a bare list or a `policies:` mapping.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(list) = serde_yaml::from_str::<Vec<PolicyConfig>>(yaml) {
            return Self::from_configs(list);
        }

        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse policies: {}", e)))?;
        Self::from_configs(file.policies)
    }

    /// Look up a policy by name.
    pub fn resolve(&self, name: &str) -> Result<&Policy> {
        self.policies
            .get(name)
            .ok_or_else(|| FloodgateError::UnknownPolicy(name.to_string()))
    }

    /// Registered policy names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// All registered policies, sorted by name.
    pub fn policies(&self) -> Vec<&Policy> {
        let mut policies: Vec<&Policy> = self.policies.values().collect();
        policies.sort_unstable_by(|a, b| a.name().cmp(b.name()));
        policies
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
