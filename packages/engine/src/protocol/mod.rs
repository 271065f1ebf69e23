// packages/engine/src/protocol/mod.rs
//! Agent wire protocol
//!
//! ```text
//!   engine ── Event (ATTACHED, DATA_*, DISCONNECT_*, CLOSED, STATS) ──► agent
//!   engine ◄── Action (DATA_UPDATE, DROP, BLESS_CLIENT, SET_CRYPTO_KEY) ── agent
//! ```

pub mod message;
pub mod sockopt;

pub use message::{
    Action, ActionOp, AttachedEvent, ClosedEvent, ConnDirection, DataEvent, DecodeError,
    Direction, Event, EventOp, FlowStatsRecord, MsgHeader, MsgType, SockId, CFM_MAX_OFFSET,
    CFM_VERSION_CURRENT, MAX_TIME_LOG_ENTRIES,
};
pub use sockopt::{OptValue, SockInfo, SockOpt};
