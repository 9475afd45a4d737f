//! Configuration structures for devmux
//!
//! This module defines the configuration surface of the scheduler.
//! Configurations are loaded from YAML files or assembled programmatically.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Well-known config keys understood by the resolver and passed through to
/// backends. Keys a backend does not list in `SUPPORTED_CONFIG_KEYS` are
/// silently dropped from its device config.
pub mod keys {
    /// Device-plus-batch target for the BATCH pseudo-device, e.g. `"GPU(4)"`
    pub const AUTO_BATCH: &str = "AUTO_BATCH";

    /// Enables per-op timing collection on the backend
    pub const PERF_COUNT: &str = "PERF_COUNT";

    /// Numeric device id suffix resolved from names like `"GPU.1"`
    pub const DEVICE_ID: &str = "DEVICE_ID";

    /// Latency/throughput hint; the load-race helper is pinned to latency
    pub const PERFORMANCE_HINT: &str = "PERFORMANCE_HINT";

    /// Value for [`PERFORMANCE_HINT`] selecting low-latency single-stream use
    pub const LATENCY: &str = "LATENCY";

    /// Batch dimension the backend should compile the model for
    pub const AUTO_BATCH_SIZE: &str = "AUTO_BATCH_SIZE";

    /// Cap on compile threads while another load is racing
    pub const COMPILE_THREADS: &str = "COMPILE_THREADS";
}

/// Top-level configuration for one devmux compilation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Target string, e.g. `"AUTO:GPU,CPU"`, `"MULTI:GPU.1,CPU"` or `"BATCH:GPU(4)"`
    pub target: String,

    /// Base config map merged into every device's config (per-device keys win)
    #[serde(default)]
    pub device_config: HashMap<String, String>,

    /// Batching configuration (BATCH targets only)
    #[serde(default)]
    pub batch: BatchConfig,

    /// Request per-op timing from the backend
    #[serde(default)]
    pub perf_count: bool,
}

/// Batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// How long a partially filled batch may wait before its members are
    /// executed individually
    #[serde(default = "default_collect_timeout_ms")]
    pub collect_timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            collect_timeout_ms: default_collect_timeout_ms(),
        }
    }
}

fn default_collect_timeout_ms() -> u64 {
    100
}

impl MuxConfig {
    /// Create a configuration for a target string with everything else defaulted
    pub fn for_target(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            device_config: HashMap::new(),
            batch: BatchConfig::default(),
            perf_count: false,
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)?;
        let config: MuxConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(crate::error::DevMuxError::config(
                "Target string must not be empty",
            ));
        }
        if self.batch.collect_timeout_ms == 0 {
            return Err(crate::error::DevMuxError::config(
                "Batch collect timeout must be > 0",
            ));
        }
        Ok(())
    }

    /// Get the batch collect timeout as a Duration
    pub fn collect_timeout(&self) -> Duration {
        Duration::from_millis(self.batch.collect_timeout_ms)
    }
}
