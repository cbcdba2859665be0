//! Configuration management for the Warden engine.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::policy::PolicySet;

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Backing store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Inline policy rules for the static resolver. Hosts with their own
    /// resolver leave this empty.
    #[serde(default)]
    pub policies: PolicySet,
}

impl WardenConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(e.to_string()))?;
        for rule in &config.policies.rules {
            rule.policy.validate()?;
        }
        Ok(config)
    }
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Shared store URL. When absent the engine runs purely on the local
    /// store, which is only sensible for single-instance deployments.
    pub redis_url: Option<String>,

    /// Per-operation timeout in milliseconds. This check sits in front of
    /// every gated request, so keep it short; exceeding it triggers the
    /// fail-safety path instead of ballooning request latency.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// Consecutive shared-store failures before flipping to the local
    /// fallback.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How often the health probe checks a degraded shared store, seconds.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            op_timeout_ms: default_op_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            probe_interval_secs: default_probe_interval(),
        }
    }
}

fn default_op_timeout_ms() -> u64 {
    75
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_probe_interval() -> u64 {
    5
}
