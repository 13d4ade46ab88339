//! Host configuration, loadable from a JSON file.

use crate::domain::retry::RetryPolicy;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings of the simulated payment processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Simulated processor latency per call
    #[serde(with = "humantime_serde", default = "default_latency")]
    pub latency: Duration,

    /// Number of initial calls that fail transiently
    #[serde(default)]
    pub fail_first: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            latency: default_latency(),
            fail_first: 0,
        }
    }
}

/// Everything the execution host needs besides its stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSettings {
    /// Retry policy attached to every new run
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Upper bound on charge operations running at the same time
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,

    #[serde(default)]
    pub gateway: GatewaySettings,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            max_concurrent_operations: default_max_concurrent_operations(),
            gateway: GatewaySettings::default(),
        }
    }
}

impl HostSettings {
    /// Reads settings from a JSON file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

fn default_latency() -> Duration {
    Duration::from_secs(5)
}

fn default_max_concurrent_operations() -> usize {
    64
}
