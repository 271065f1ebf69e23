// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Layered loading with the `config` crate: built-in defaults, then an
//! optional `content-filter.{toml,yaml,json}` file, then `CFIL__*`
//! environment variables (e.g. `CFIL__GC__ACTION_TIMEOUT_SECS=30`).

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// log2 of the storage cluster size
const CLUSTER_SHIFT: u32 = 11;

/// Per-flow datagram buffer floor (2 MiB)
const DGRAM_BUFFER_FLOOR: u64 = 2 << 20;

/// Fraction of the platform cluster pool a single flow may hold (1/32)
const DGRAM_BUFFER_SHIFT: u32 = 5;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub datapath: DataPathConfig,
    pub gc: GcConfig,
    pub stats: StatsConfig,
    pub logging: LoggingConfig,
}

/// Data path and close lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPathConfig {
    /// How long a closing socket waits for agents to detach (default: 1000)
    pub close_wait_timeout_ms: u64,
}

impl Default for DataPathConfig {
    fn default() -> Self {
        Self {
            close_wait_timeout_ms: 1000,
        }
    }
}

/// Datagram flow garbage collection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Agent silence tolerated while data is held (default: 10)
    pub action_timeout_secs: u64,

    /// Teardowns per reaper run (default: 100)
    pub max_flows_per_run: usize,

    /// Size of the platform cluster pool, 0 to use the floor only
    pub platform_cluster_count: u64,

    /// Reaper cadence on the background thread (default: 1000)
    pub interval_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            action_timeout_secs: 10,
            max_flows_per_run: 100,
            platform_cluster_count: 0,
            interval_ms: 1000,
        }
    }
}

impl GcConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    /// Byte budget for data held on one datagram flow
    pub fn mbuf_cnt_max(&self) -> u64 {
        let platform = (self.platform_cluster_count << CLUSTER_SHIFT) >> DGRAM_BUFFER_SHIFT;
        platform.max(DGRAM_BUFFER_FLOOR)
    }

    /// Segment budget for data held on one datagram flow
    pub fn mbuf_num_max(&self) -> u64 {
        self.mbuf_cnt_max() >> CLUSTER_SHIFT
    }
}

/// Periodic flow statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Lower bound for an agent-requested report interval (default: 500)
    pub min_interval_ms: u32,

    /// Flows examined per batch (default: 50)
    pub max_flows_per_batch: usize,

    /// Reporter wake interval while flows are registered (default: 500)
    pub run_interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 500,
            max_flows_per_batch: 50,
            run_interval_ms: 500,
        }
    }
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load from `content-filter.*` in the working directory and the environment
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("content-filter").required(false))
            .add_source(config::Environment::with_prefix("CFIL").separator("__"))
            .build()?;

        let cfg: EngineConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit file, still honouring the environment
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("CFIL").separator("__"))
            .build()?;

        let cfg: EngineConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.datapath.close_wait_timeout_ms == 0 {
            return Err(EngineError::ConfigError(
                "datapath.close_wait_timeout_ms must be > 0".into(),
            ));
        }
        if self.gc.action_timeout_secs == 0 {
            return Err(EngineError::ConfigError(
                "gc.action_timeout_secs must be > 0".into(),
            ));
        }
        if self.stats.max_flows_per_batch == 0 {
            return Err(EngineError::ConfigError(
                "stats.max_flows_per_batch must be > 0".into(),
            ));
        }
        if self.stats.min_interval_ms == 0 {
            return Err(EngineError::ConfigError(
                "stats.min_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn close_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.datapath.close_wait_timeout_ms)
    }
}
