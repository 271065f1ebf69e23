// packages/engine/src/filter/mod.rs
//! Registered inspection agents
//!
//! One [`ContentFilter`] per connected agent, stored in a bounded
//! [`FilterRegistry`] indexed by unit number (1..=8). The registry sits
//! behind a single reader/writer lock; see [`registry::RegistryLock`] for
//! the lock-ordering rule.

pub mod registry;

pub use registry::{FilterRegistry, RegistryLock, RegistryReadGuard, RegistryWriteGuard};

use crate::protocol::message::{SockId, CRYPTO_KEY_LEN};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// Capacity of the agent registry
pub const MAX_CONTENT_FILTER: usize = 8;

/// A connected agent
#[derive(Debug)]
pub struct ContentFilter {
    /// Agent unit number, 1..=8
    pub unit: u32,

    /// Distinguishes successive agents on the same unit
    pub instance: u64,

    /// Policy control unit this agent receives (0 until set)
    pub necp_control_unit: u32,

    /// Agent asked to keep connections across filter-state changes
    pub preserve_connections: bool,

    /// Agent is disconnecting
    pub detaching: bool,

    /// Transport backpressure; set under the shared lock
    flow_controlled: AtomicBool,

    /// Flows with an entry linked to this agent, in attach order
    sock_entries: Vec<SockId>,

    /// Signing key handle
    pub crypto_key: Option<[u8; CRYPTO_KEY_LEN]>,
}

impl ContentFilter {
    pub fn new(unit: u32, instance: u64) -> Self {
        Self {
            unit,
            instance,
            necp_control_unit: 0,
            preserve_connections: false,
            detaching: false,
            flow_controlled: AtomicBool::new(false),
            sock_entries: Vec::new(),
            crypto_key: None,
        }
    }

    #[inline]
    pub fn is_flow_controlled(&self) -> bool {
        self.flow_controlled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_flow_controlled(&self) {
        self.flow_controlled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn clear_flow_controlled(&self) {
        self.flow_controlled.store(false, Ordering::Release);
    }

    pub fn sock_count(&self) -> usize {
        self.sock_entries.len()
    }

    pub fn sock_entries(&self) -> &[SockId] {
        &self.sock_entries
    }

    pub(crate) fn link(&mut self, sock_id: SockId) {
        self.sock_entries.push(sock_id);
    }

    pub(crate) fn unlink(&mut self, sock_id: SockId) -> bool {
        match self.sock_entries.iter().position(|id| *id == sock_id) {
            Some(pos) => {
                self.sock_entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn summary(&self) -> FilterSummary {
        FilterSummary {
            unit: self.unit,
            necp_control_unit: self.necp_control_unit,
            sock_count: self.sock_count(),
            flow_controlled: self.is_flow_controlled(),
            detaching: self.detaching,
            preserve_connections: self.preserve_connections,
            has_crypto_key: self.crypto_key.is_some(),
        }
    }
}

/// Point-in-time view of one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterSummary {
    pub unit: u32,
    pub necp_control_unit: u32,
    pub sock_count: usize,
    pub flow_controlled: bool,
    pub detaching: bool,
    pub preserve_connections: bool,
    pub has_crypto_key: bool,
}
