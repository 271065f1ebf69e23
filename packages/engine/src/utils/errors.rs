// packages/engine/src/utils/errors.rs
//! Engine error types
//!
//! The data path speaks in a small set of outcomes. Backpressure and
//! allocation failures are recoverable and never reach the application;
//! `Dropped` is the steady-state answer for a flow an agent has killed.

use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the content-filter engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Flow is drop-latched, defunct, or its filter policy changed underneath it
    #[error("flow dropped by content filter")]
    Dropped,

    /// Transport to the agent is temporarily full
    #[error("agent transport is flow controlled")]
    FlowControlled,

    /// Could not build an event message
    #[error("allocation failure: {0}")]
    NoMemory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Verdict message rejected at the boundary
    #[error("bad message: {0}")]
    BadMessage(String),

    #[error("socket not connected")]
    NotConnected,

    /// Outgoing disconnect held back while data still waits for the agent
    #[error("busy: {0}")]
    Busy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already in use: {0}")]
    AlreadyInUse(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    /// Hard transport failure (not backpressure)
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("reinjection failed: {0}")]
    InjectFailed(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl EngineError {
    /// True for errors the data path retries later instead of surfacing
    pub fn is_backpressure(&self) -> bool {
        matches!(self, EngineError::FlowControlled | EngineError::NoMemory(_))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_classification() {
        assert!(EngineError::FlowControlled.is_backpressure());
        assert!(EngineError::NoMemory("event".into()).is_backpressure());
        assert!(!EngineError::Dropped.is_backpressure());
        assert!(!EngineError::Transport("closed".into()).is_backpressure());
    }

    #[test]
    fn test_display() {
        let err = EngineError::BadMessage("bad version 2".into());
        assert_eq!(err.to_string(), "bad message: bad version 2");
    }
}
