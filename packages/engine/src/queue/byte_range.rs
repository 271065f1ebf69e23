// packages/engine/src/queue/byte_range.rs
//! Ordered queue of byte spans with absolute stream offsets
//!
//! ```text
//!   start                                   end
//!     │◄── span 0 ──►│◄─ span 1 ─►│◄─ span 2 ─►│
//!     └───────────── len() = end - start ─────┘
//! ```
//!
//! Spans are moved in and out whole; the queue never splits or copies
//! them. Cursors only move forward.

use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

/// Accounting unit for buffered storage (one cluster)
pub const CLUSTER_SIZE: u64 = 2048;

/// Per-datagram state captured at submit time and handed back on reinjection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanMeta {
    /// Peer address of the datagram
    pub peer: Option<SocketAddr>,

    /// Socket state change counter when the datagram was captured
    pub state_change_cnt: u32,

    /// Socket options in effect when the datagram was captured
    pub options: u32,
}

/// One caller-supplied unit of data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub data: Bytes,
    pub meta: Option<Arc<SpanMeta>>,
}

impl Span {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: SpanMeta) -> Self {
        self.meta = Some(Arc::new(meta));
        self
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Storage clusters this span pins while buffered
    pub fn mbnum(&self) -> u64 {
        let len = self.len();
        ((len + CLUSTER_SIZE - 1) / CLUSTER_SIZE).max(1)
    }

    /// Storage bytes this span pins while buffered
    pub fn mbcnt(&self) -> u64 {
        self.mbnum() * CLUSTER_SIZE
    }
}

/// Byte-range queue
#[derive(Debug, Default)]
pub struct ByteRangeQueue {
    spans: VecDeque<Span>,
    start: u64,
    end: u64,
}

impl ByteRangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a span and advance `end`
    pub fn enqueue(&mut self, span: Span) {
        self.end += span.len();
        self.spans.push_back(span);
        self.verify();
    }

    /// Remove the oldest span, which must be exactly `len` bytes long
    pub fn remove(&mut self, len: u64) -> Result<Span> {
        let first_len = match self.spans.front() {
            Some(span) => span.len(),
            None => {
                return Err(EngineError::InvalidArgument(
                    "remove from empty queue".into(),
                ))
            }
        };
        if first_len != len {
            debug_assert!(false, "span length {} != {}", first_len, len);
            return Err(EngineError::InvalidArgument(format!(
                "span length {} does not match {}",
                first_len, len
            )));
        }

        let span = self.spans.pop_front();
        self.start += len;
        self.verify();

        span.ok_or_else(|| EngineError::InvalidArgument("remove from empty queue".into()))
    }

    /// Put back a span just taken by [`remove`](Self::remove), moving
    /// `start` back over it
    pub fn requeue_front(&mut self, span: Span) {
        debug_assert!(self.start >= span.len(), "requeue past offset 0");
        self.start = self.start.saturating_sub(span.len());
        self.spans.push_front(span);
        self.verify();
    }

    /// Discard everything, returning the number of bytes dropped
    pub fn drain(&mut self) -> u64 {
        let drained = self.len();
        self.spans.clear();
        self.start = self.end;
        self.verify();
        drained
    }

    /// Move both cursors past `len` bytes that never entered the queue
    pub fn advance(&mut self, len: u64) {
        self.start += len;
        self.end += len;
        self.verify();
    }

    pub fn first(&self) -> Option<&Span> {
        self.spans.front()
    }

    /// Span at position `index`, oldest first
    pub fn get(&self, index: usize) -> Option<&Span> {
        self.spans.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Span> {
        self.spans.iter()
    }

    /// Buffered bytes
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    #[inline]
    pub fn offset_first(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn offset_last(&self) -> u64 {
        self.end
    }

    /// Check cursor ordering, and in debug builds rebuild the byte total
    /// from the span list
    #[inline]
    fn verify(&self) {
        debug_assert!(self.start <= self.end, "queue start {} > end {}", self.start, self.end);

        #[cfg(debug_assertions)]
        {
            let total: u64 = self.spans.iter().map(Span::len).sum();
            debug_assert_eq!(
                total,
                self.end - self.start,
                "queue holds {} bytes but cursors span {}",
                total,
                self.end - self.start
            );
            debug_assert_eq!(self.spans.is_empty(), self.start == self.end);
        }
    }
}
