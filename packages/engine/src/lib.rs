// packages/engine/src/lib.rs
//! Content Filter Data-Path Engine
//!
//! Sits between a socket layer and up to eight out-of-process inspection
//! agents. Data submitted on a filtered socket is held in per-agent
//! offset-windowed queues, shown to agents as events, and released (or
//! dropped) according to the verdicts they send back.
//!
//! # Architecture
//!
//! - **engine**: submit path, queue servicing, verdicts, lifecycle, stats
//! - **flow**: per-connection state, reference counting, the flow lock
//! - **filter**: the agent registry and its reader/writer lock
//! - **queue**: byte-range queues of owned spans
//! - **protocol**: event/action wire format and socket options
//! - **ports**: collaborator traits and in-memory implementations
//! - **observability**: tracing setup, metrics, engine counters
//! - **utils**: configuration and error types

pub mod engine;
pub mod filter;
pub mod flow;
pub mod observability;
pub mod ports;
pub mod protocol;
pub mod queue;
pub mod utils;

// Re-export commonly used types
pub use engine::{
    ContentFilterEngine, Disposition, EngineCore, FlowSnapshot, Ports, ShutdownHow,
    ShutdownOutcome,
};
pub use flow::Socket;
pub use protocol::{Action, ConnDirection, Direction, Event};
pub use queue::Span;
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

use once_cell::sync::Lazy;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Built-in configuration, before any file or environment layer
pub static DEFAULT_CONFIG: Lazy<EngineConfig> = Lazy::new(EngineConfig::default);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_config_valid() {
        assert!(DEFAULT_CONFIG.validate().is_ok());
    }
}
