// packages/engine/src/protocol/sockopt.rs
//! Agent socket options and socket constants

use crate::protocol::message::SockId;
use crate::utils::errors::{EngineError, Result};
use serde::Serialize;
use std::net::SocketAddr;

/// Policy control unit routed to an agent
pub const CFIL_OPT_NECP_CONTROL_UNIT: u32 = 1;

/// Read-only socket information for a flow id
pub const CFIL_OPT_GET_SOCKET_INFO: u32 = 2;

/// Keep connections that predate a filter-state change
pub const CFIL_OPT_PRESERVE_CONNECTIONS: u32 = 3;

/// Policy says "never filter"
pub const NECP_FILTER_UNIT_NO_FILTER: u32 = u32::MAX;

/// Policy unit handled by a userspace proxy only
pub const NECP_MASK_USERSPACE_ONLY: u32 = 0x8000_0000;

pub const AF_INET: u32 = 2;
pub const AF_INET6: u32 = 30;

pub const SOCK_STREAM: u32 = 1;
pub const SOCK_DGRAM: u32 = 2;

pub const IPPROTO_TCP: u32 = 6;
pub const IPPROTO_UDP: u32 = 17;

/// Known agent options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    NecpControlUnit,
    SocketInfo,
    PreserveConnections,
}

impl SockOpt {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            CFIL_OPT_NECP_CONTROL_UNIT => Some(SockOpt::NecpControlUnit),
            CFIL_OPT_GET_SOCKET_INFO => Some(SockOpt::SocketInfo),
            CFIL_OPT_PRESERVE_CONNECTIONS => Some(SockOpt::PreserveConnections),
            _ => None,
        }
    }

    /// Decode an option code; unknown codes are not supported
    pub fn parse(code: u32) -> Result<Self> {
        Self::from_u32(code).ok_or_else(|| EngineError::NotSupported(format!("option {}", code)))
    }
}

/// Option payload, typed per option
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OptValue {
    ControlUnit(u32),
    Preserve(bool),
    SocketInfo(SockInfo),
}

/// Answer to `CFIL_OPT_GET_SOCKET_INFO`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SockInfo {
    pub sock_id: SockId,
    pub family: u32,
    pub sock_type: u32,
    pub protocol: u32,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_codes() {
        assert_eq!(SockOpt::from_u32(1), Some(SockOpt::NecpControlUnit));
        assert_eq!(SockOpt::from_u32(2), Some(SockOpt::SocketInfo));
        assert_eq!(SockOpt::from_u32(3), Some(SockOpt::PreserveConnections));
        assert_eq!(SockOpt::from_u32(42), None);
    }

    #[test]
    fn test_userspace_mask_excludes_no_filter() {
        // NO_FILTER has the userspace bit too; callers must test it first
        assert_ne!(NECP_FILTER_UNIT_NO_FILTER & NECP_MASK_USERSPACE_ONLY, 0);
        assert_eq!(0x10 & NECP_MASK_USERSPACE_ONLY, 0);
    }
}
