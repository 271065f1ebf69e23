// packages/engine/src/observability/mod.rs
//! Logging, metrics and engine counters
//!
//! - **Tracing**: `tracing-subscriber` with `EnvFilter`, text or JSON lines
//! - **Metrics**: `metrics` facade, Prometheus recorder for the binary
//! - **Counters**: [`FilterCounters`], the in-process view of the same numbers

pub mod counters;

pub use counters::{Counter, CounterSnapshot, FilterCounters};

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.level`. Call once at startup.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::ConfigError(format!("bad log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init()
    };

    result.map_err(|e| EngineError::ConfigError(format!("tracing already initialized: {}", e)))
}

/// Install the Prometheus recorder behind the `metrics` facade
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| EngineError::ConfigError(format!("metrics recorder: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level_is_valid_filter() {
        let cfg = LoggingConfig::default();
        assert!(EnvFilter::try_new(&cfg.level).is_ok());
    }
}
