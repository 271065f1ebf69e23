// packages/engine/src/flow/mod.rs
//! Flow state
//!
//! ```text
//!   Socket ──► FlowRef ──► Flow ─┬─ Mutex<FlowState>   (flow lock)
//!                                │    ├─ entries[unit-1]: FilterEntry
//!                                │    ├─ ordered: chain of units
//!                                │    └─ snd / rcv: FlowBuf (window, inject_q)
//!                                ├─ Condvar            (close-wait, sockbuf)
//!                                └─ byte counters      (atomics, lock-free reads)
//! ```

pub mod entry;
pub mod handle;
pub mod socket;
pub mod state;

pub use entry::{EntryBuf, EntryFlags, FilterEntry};
pub use handle::{Flow, FlowOwner, FlowRef};
pub use socket::{is_reinjecting, SockKind, Socket};
pub use state::{FlowBuf, FlowFlags, FlowState, OpLog};
