// packages/engine/src/queue/mod.rs
//! Byte-range queues
//!
//! Filtered data sits in one of three queues per direction until every
//! agent has passed it:
//!
//! ```text
//! submit ─► entry ctl_q ─► entry pending_q ─► (next entry ctl_q ...) ─► flow inject_q ─► reinject
//!            (awaiting      (shown to agent,
//!             delivery)      awaiting verdict)
//! ```

pub mod byte_range;

pub use byte_range::{ByteRangeQueue, Span, SpanMeta, CLUSTER_SIZE};
