// packages/engine/src/flow/entry.rs
//! Per (flow, agent) filter entry
//!
//! ```text
//!   pending_q.start   pending_q.end == ctl_q.start        ctl_q.end
//!        │◄── delivered, awaiting verdict ──►│◄── awaiting delivery ──►│
//!                         pass_offset ≤ peek_offset,  ctl_q.start ≤ peeked
//! ```

use crate::protocol::message::Direction;
use crate::queue::ByteRangeQueue;
use std::time::Instant;

/// Per-direction offsets and staging queues
#[derive(Debug, Default)]
pub struct EntryBuf {
    /// Data below this offset may flow on
    pub pass_offset: u64,

    /// Data below this offset must be shown to the agent
    pub peek_offset: u64,

    /// High-water mark of data shown to the agent
    pub peeked: u64,

    /// Not yet delivered to the agent
    pub ctl_q: ByteRangeQueue,

    /// Delivered, waiting for a verdict
    pub pending_q: ByteRangeQueue,
}

impl EntryBuf {
    /// Bytes this entry is holding in either queue
    pub fn buffered(&self) -> u64 {
        self.ctl_q.len() + self.pending_q.len()
    }

    #[inline]
    pub fn verify(&self) {
        debug_assert!(
            self.pass_offset <= self.peek_offset,
            "pass {} > peek {}",
            self.pass_offset,
            self.peek_offset
        );
        debug_assert!(
            self.ctl_q.offset_first() >= self.pending_q.offset_last(),
            "ctl_q start {} < pending_q end {}",
            self.ctl_q.offset_first(),
            self.pending_q.offset_last()
        );
        debug_assert!(
            self.ctl_q.offset_first() <= self.peeked,
            "ctl_q start {} > peeked {}",
            self.ctl_q.offset_first(),
            self.peeked
        );
    }
}

/// Entry state bits
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntryFlags {
    /// Entry was linked to an agent at attach time
    pub cfil_attached: bool,

    /// SOCKET_ATTACHED delivered
    pub sent_sock_attached: bool,

    /// Agent acknowledged; data events may flow
    pub data_start: bool,

    /// Last dispatch hit backpressure
    pub flow_controlled: bool,

    pub sent_disconnect_out: bool,

    pub sent_disconnect_in: bool,

    pub sent_sock_closed: bool,

    /// Agent is done with this flow
    pub detached: bool,
}

/// One slot of a flow's filter-entry table
#[derive(Debug)]
pub struct FilterEntry {
    /// Agent unit for this slot
    pub unit: u32,

    /// Instance of the agent the entry is linked to, `None` once unlinked
    pub filter: Option<u64>,

    /// Agent's control unit at attach, used for chain order
    pub necp_control_unit: u32,

    pub flags: EntryFlags,

    pub last_event: Option<Instant>,

    /// Last verdict from the agent, initialised at allocation
    pub last_action: Instant,

    pub snd: EntryBuf,

    pub rcv: EntryBuf,
}

impl FilterEntry {
    pub fn new(unit: u32, now: Instant) -> Self {
        Self {
            unit,
            filter: None,
            necp_control_unit: 0,
            flags: EntryFlags::default(),
            last_event: None,
            last_action: now,
            snd: EntryBuf::default(),
            rcv: EntryBuf::default(),
        }
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.filter.is_some()
    }

    #[inline]
    pub fn buf(&self, dir: Direction) -> &EntryBuf {
        match dir {
            Direction::Out => &self.snd,
            Direction::In => &self.rcv,
        }
    }

    #[inline]
    pub fn buf_mut(&mut self, dir: Direction) -> &mut EntryBuf {
        match dir {
            Direction::Out => &mut self.snd,
            Direction::In => &mut self.rcv,
        }
    }

    pub fn sent_disconnect(&self, dir: Direction) -> bool {
        match dir {
            Direction::Out => self.flags.sent_disconnect_out,
            Direction::In => self.flags.sent_disconnect_in,
        }
    }

    pub fn mark_sent_disconnect(&mut self, dir: Direction) {
        match dir {
            Direction::Out => self.flags.sent_disconnect_out = true,
            Direction::In => self.flags.sent_disconnect_in = true,
        }
    }

    /// The agent still owes this flow a final verdict
    pub fn awaits_agent(&self) -> bool {
        self.is_linked() && self.flags.sent_sock_attached && !self.flags.detached
    }

    /// Drop everything buffered for one direction
    pub fn drain(&mut self, dir: Direction) -> u64 {
        let buf = self.buf_mut(dir);
        buf.ctl_q.drain() + buf.pending_q.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Span;

    #[test]
    fn test_new_entry_unlinked() {
        let entry = FilterEntry::new(3, Instant::now());
        assert!(!entry.is_linked());
        assert!(!entry.awaits_agent());
        assert_eq!(entry.snd.pass_offset, 0);
        entry.snd.verify();
    }

    #[test]
    fn test_awaits_agent() {
        let mut entry = FilterEntry::new(1, Instant::now());
        entry.filter = Some(7);
        assert!(!entry.awaits_agent());
        entry.flags.sent_sock_attached = true;
        assert!(entry.awaits_agent());
        entry.flags.detached = true;
        assert!(!entry.awaits_agent());
    }

    #[test]
    fn test_disconnect_flags_per_direction() {
        let mut entry = FilterEntry::new(1, Instant::now());
        entry.mark_sent_disconnect(Direction::In);
        assert!(entry.sent_disconnect(Direction::In));
        assert!(!entry.sent_disconnect(Direction::Out));
    }

    #[test]
    fn test_drain_both_queues() {
        let mut entry = FilterEntry::new(1, Instant::now());
        entry.rcv.ctl_q.enqueue(Span::new(vec![1u8; 10]));
        entry.rcv.pending_q.enqueue(Span::new(vec![2u8; 4]));
        assert_eq!(entry.rcv.buffered(), 14);
        assert_eq!(entry.drain(Direction::In), 14);
        assert_eq!(entry.rcv.buffered(), 0);
        assert_eq!(entry.drain(Direction::Out), 0);
    }
}
