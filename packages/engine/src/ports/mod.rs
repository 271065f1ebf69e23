// packages/engine/src/ports/mod.rs
//! Collaborators the engine consumes
//!
//! - [`Transport`]: deliver an event to an agent, reporting backpressure
//!   separately from failure
//! - [`PolicyOracle`]: which agents should see a socket, and a policy
//!   generation counter
//! - [`SocketLayer`]: reinjection and socket state callbacks
//! - [`FlowDb`]: per-socket datagram flow table
//! - [`Signer`]: event signatures
//!
//! [`memory`] has in-process implementations of all of them.

pub mod memory;

use crate::flow::{FlowRef, Socket};
use crate::protocol::message::{Direction, CRYPTO_KEY_LEN};
use crate::queue::Span;
use crate::utils::errors::EngineError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Outcome of a failed enqueue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Receiver full; retry after a resume notification
    #[error("transport backpressure")]
    Backpressure,

    #[error("transport failure: {0}")]
    Failure(String),
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Backpressure => EngineError::FlowControlled,
            TransportError::Failure(msg) => EngineError::Transport(msg),
        }
    }
}

/// Reinjection refused by the socket layer; the span is handed back
#[derive(Debug, Error)]
#[error("reinject failed: {reason}")]
pub struct ReinjectError {
    pub reason: String,

    /// The untouched span, to be requeued by the caller
    pub span: Span,
}

impl ReinjectError {
    pub fn new(reason: impl Into<String>, span: Span) -> Self {
        Self {
            reason: reason.into(),
            span,
        }
    }
}

impl From<ReinjectError> for EngineError {
    fn from(err: ReinjectError) -> Self {
        EngineError::InjectFailed(err.reason)
    }
}

/// Message channel to agents, addressed by unit
pub trait Transport: Send + Sync {
    fn enqueue(&self, unit: u32, msg: Bytes) -> Result<(), TransportError>;
}

/// Policy lookups for a socket
pub trait PolicyOracle: Send + Sync {
    /// Filter control unit the socket's policy maps to, 0 for none
    fn control_unit(&self, sock: &Socket) -> u32;

    /// Changes whenever policy is re-evaluated
    fn policy_gencount(&self, sock: &Socket) -> u32;
}

/// Callbacks into the socket layer
pub trait SocketLayer: Send + Sync {
    /// Hand passed data back to the socket's normal path
    ///
    /// On failure the span must come back unchanged inside the error.
    fn reinject(&self, sock: &Socket, dir: Direction, span: Span) -> Result<(), ReinjectError>;

    /// Force the socket into the defunct state
    fn defunct(&self, sock: &Socket);

    /// Wake readers (`In`) or writers (`Out`)
    fn wake(&self, sock: &Socket, dir: Direction);

    /// Complete a shutdown that was waiting on held data
    fn shutdown_final(&self, sock: &Socket, dir: Direction);

    /// The socket connected while its first verdict was pending
    fn connected(&self, sock: &Socket);

    /// Find a live socket by client identity
    fn find_by_client_uuid(&self, client_id: &[u8; 16]) -> Option<Arc<Socket>>;
}

/// Event signing
pub trait Signer: Send + Sync {
    fn sign(&self, key: &[u8; CRYPTO_KEY_LEN], msg: &[u8]) -> Bytes;
}

/// One tracked datagram flow
pub struct DgramFlowEntry {
    pub flowhash: u32,

    pub local: Option<SocketAddr>,

    pub remote: SocketAddr,

    /// Engine context for the flow
    context: Mutex<Option<FlowRef>>,
}

impl DgramFlowEntry {
    pub fn new(flowhash: u32, local: Option<SocketAddr>, remote: SocketAddr) -> Self {
        Self {
            flowhash,
            local,
            remote,
            context: Mutex::new(None),
        }
    }

    /// The attached flow, retained
    pub fn context(&self) -> Option<FlowRef> {
        self.context.lock().clone()
    }

    pub fn has_context(&self) -> bool {
        self.context.lock().is_some()
    }

    /// Replace the context, returning the old one for the caller to drop
    pub fn set_context(&self, flow: Option<FlowRef>) -> Option<FlowRef> {
        std::mem::replace(&mut *self.context.lock(), flow)
    }
}

impl fmt::Debug for DgramFlowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DgramFlowEntry")
            .field("flowhash", &format_args!("{:#x}", self.flowhash))
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("attached", &self.has_context())
            .finish()
    }
}

/// Datagram flow table for one socket
pub trait FlowDb: Send + Sync {
    fn lookup(&self, local: Option<SocketAddr>, remote: SocketAddr) -> Option<Arc<DgramFlowEntry>>;

    /// Find or create the entry for a 4-tuple
    fn insert(&self, local: Option<SocketAddr>, remote: SocketAddr) -> Arc<DgramFlowEntry>;

    fn get(&self, flowhash: u32) -> Option<Arc<DgramFlowEntry>>;

    fn remove(&self, flowhash: u32) -> Option<Arc<DgramFlowEntry>>;

    /// Snapshot of every entry
    fn entries(&self) -> Vec<Arc<DgramFlowEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_mapping() {
        assert_eq!(
            EngineError::from(TransportError::Backpressure),
            EngineError::FlowControlled
        );
        assert!(EngineError::from(TransportError::Backpressure).is_backpressure());
        assert!(matches!(
            EngineError::from(TransportError::Failure("closed".into())),
            EngineError::Transport(_)
        ));
    }

    #[test]
    fn test_reinject_error_returns_span() {
        let err = ReinjectError::new("no buffer space", Span::new(&b"held"[..]));
        assert_eq!(err.to_string(), "reinject failed: no buffer space");
        assert_eq!(err.span.len(), 4);
        assert_eq!(
            EngineError::from(err),
            EngineError::InjectFailed("no buffer space".into())
        );
    }

    #[test]
    fn test_dgram_entry_context() {
        let entry = DgramFlowEntry::new(1, None, "10.0.0.1:53".parse().unwrap());
        assert!(!entry.has_context());
        assert!(entry.context().is_none());
        assert!(entry.set_context(None).is_none());
    }
}
