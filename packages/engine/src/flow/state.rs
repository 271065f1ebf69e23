// packages/engine/src/flow/state.rs
//! Per-flow aggregate state, guarded by the flow lock

use crate::filter::MAX_CONTENT_FILTER;
use crate::flow::entry::FilterEntry;
use crate::protocol::message::{ConnDirection, Direction, SockId, MAX_TIME_LOG_ENTRIES};
use crate::queue::ByteRangeQueue;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::thread::ThreadId;
use std::time::Instant;

/// Owner of a direction's socket buffer, reentrant per thread
#[derive(Debug, Default)]
pub struct SockBufOwner {
    pub(crate) owner: Option<ThreadId>,
    pub(crate) refs: u32,
}

impl SockBufOwner {
    pub fn is_owned_by_other(&self, me: ThreadId) -> bool {
        matches!(self.owner, Some(owner) if owner != me)
    }

    pub fn is_held(&self) -> bool {
        self.owner.is_some()
    }
}

/// Aggregate window for one direction across all agents
#[derive(Debug, Default)]
pub struct FlowBuf {
    /// Offset of the oldest byte not yet released to the socket
    pub pending_first: u64,

    /// Offset past the newest byte submitted
    pub pending_last: u64,

    /// Lowest pass offset over linked entries, refreshed when idle
    pub pass_offset: u64,

    /// Storage bytes held
    pub mbcnt: u64,

    /// Storage clusters held
    pub mbnum: u64,

    /// Datagrams refused for exceeding the per-flow budget
    pub tail_drop_cnt: u64,

    /// Fully passed, waiting for reinjection
    pub inject_q: ByteRangeQueue,

    pub sockbuf: SockBufOwner,
}

impl FlowBuf {
    #[inline]
    pub fn pending(&self) -> u64 {
        self.pending_last - self.pending_first
    }

    #[inline]
    pub fn verify(&self) {
        debug_assert!(
            self.pending_first <= self.pending_last,
            "pending_first {} > pending_last {}",
            self.pending_first,
            self.pending_last
        );
    }
}

/// Flow state bits
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowFlags {
    /// A drop verdict was received; latched
    pub drop: bool,

    /// A closer is waiting for agents to detach
    pub close_wait: bool,

    pub sock_closed: bool,

    pub shut_rd: bool,

    pub shut_wr: bool,

    pub initial_verdict: bool,

    /// Transport connected before the first verdict
    pub socket_connected: bool,

    pub retry_inject_out: bool,

    pub retry_inject_in: bool,

    /// Closing must not wait for agents
    pub no_close_wait: bool,
}

impl FlowFlags {
    pub fn retry_inject(&self, dir: Direction) -> bool {
        match dir {
            Direction::Out => self.retry_inject_out,
            Direction::In => self.retry_inject_in,
        }
    }

    pub fn set_retry_inject(&mut self, dir: Direction, on: bool) {
        match dir {
            Direction::Out => self.retry_inject_out = on,
            Direction::In => self.retry_inject_in = on,
        }
    }
}

/// Op codes and their time since the first event
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OpLog {
    pub ops: [u8; MAX_TIME_LOG_ENTRIES],
    pub times_ms: [u32; MAX_TIME_LOG_ENTRIES],
    /// Entries attempted; only the first few are kept
    pub count: u32,
}

impl OpLog {
    pub fn record(&mut self, op: u32, elapsed_ms: u32) {
        let slot = self.count as usize;
        if slot < MAX_TIME_LOG_ENTRIES {
            self.ops[slot] = op as u8;
            self.times_ms[slot] = elapsed_ms;
        }
        self.count = self.count.saturating_add(1);
    }
}

/// Time of the first event, monotonic and wall clock
#[derive(Debug, Clone, Copy)]
pub struct FirstEvent {
    pub at: Instant,
    pub wall: DateTime<Utc>,
}

/// Everything the data path mutates for one flow
#[derive(Debug)]
pub struct FlowState {
    pub sock_id: SockId,

    /// One slot per agent unit, indexed by unit - 1
    pub entries: [FilterEntry; MAX_CONTENT_FILTER],

    /// Units in chain order (ascending control unit)
    pub ordered: Vec<u32>,

    pub snd: FlowBuf,

    pub rcv: FlowBuf,

    pub flags: FlowFlags,

    pub dir: ConnDirection,

    pub local: Option<SocketAddr>,

    pub remote: Option<SocketAddr>,

    /// Policy unit at attach
    pub filter_control_unit: u32,

    /// Policy generation at attach
    pub filter_policy_gencount: u32,

    pub first_event: Option<FirstEvent>,

    pub op_log: OpLog,
}

impl FlowState {
    pub fn new(
        sock_id: SockId,
        dir: ConnDirection,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        now: Instant,
    ) -> Self {
        Self {
            sock_id,
            entries: std::array::from_fn(|i| FilterEntry::new(i as u32 + 1, now)),
            ordered: Vec::with_capacity(MAX_CONTENT_FILTER),
            snd: FlowBuf::default(),
            rcv: FlowBuf::default(),
            flags: FlowFlags::default(),
            dir,
            local,
            remote,
            filter_control_unit: 0,
            filter_policy_gencount: 0,
            first_event: None,
            op_log: OpLog::default(),
        }
    }

    #[inline]
    pub fn buf(&self, dir: Direction) -> &FlowBuf {
        match dir {
            Direction::Out => &self.snd,
            Direction::In => &self.rcv,
        }
    }

    #[inline]
    pub fn buf_mut(&mut self, dir: Direction) -> &mut FlowBuf {
        match dir {
            Direction::Out => &mut self.snd,
            Direction::In => &mut self.rcv,
        }
    }

    /// Entry for `unit`; callers pass a registry-validated unit
    #[inline]
    pub fn entry(&self, unit: u32) -> &FilterEntry {
        &self.entries[unit as usize - 1]
    }

    #[inline]
    pub fn entry_mut(&mut self, unit: u32) -> &mut FilterEntry {
        &mut self.entries[unit as usize - 1]
    }

    /// Link `unit` into the chain, after any entry with the same control unit
    pub fn link_entry(&mut self, unit: u32, instance: u64, necp_control_unit: u32) {
        let entry = self.entry_mut(unit);
        entry.filter = Some(instance);
        entry.necp_control_unit = necp_control_unit;
        entry.flags.cfil_attached = true;

        self.ordered.retain(|u| *u != unit);
        let pos = self
            .ordered
            .iter()
            .position(|u| necp_control_unit < self.entries[*u as usize - 1].necp_control_unit)
            .unwrap_or(self.ordered.len());
        self.ordered.insert(pos, unit);
    }

    /// Detach the entry from its agent; it stays in the chain but is skipped
    pub fn unlink_entry(&mut self, unit: u32) {
        let entry = self.entry_mut(unit);
        entry.filter = None;
        entry.necp_control_unit = 0;
    }

    /// First linked entry in chain order
    pub fn first_linked(&self) -> Option<u32> {
        self.ordered
            .iter()
            .copied()
            .find(|u| self.entry(*u).is_linked())
    }

    /// Units that follow `unit` in chain order
    pub fn units_after(&self, unit: u32) -> Vec<u32> {
        match self.ordered.iter().position(|u| *u == unit) {
            Some(pos) => self.ordered[pos + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Some agent still owes this flow a final verdict
    pub fn filters_attached(&self) -> bool {
        self.entries.iter().any(FilterEntry::awaits_agent)
    }

    pub fn linked_units(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().filter(|e| e.is_linked()).map(|e| e.unit)
    }

    /// Minimum pass offset over linked entries, 0 when none
    pub fn min_pass_offset(&self, dir: Direction) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.is_linked())
            .map(|e| e.buf(dir).pass_offset)
            .min()
            .unwrap_or(0)
    }

    /// Bytes still held by the engine in one direction
    pub fn data_pending(&self, dir: Direction) -> u64 {
        let buf = self.buf(dir);
        buf.pending().min(buf.mbcnt)
    }

    pub fn record_op(&mut self, op: u32, now: Instant) {
        let elapsed_ms = self
            .first_event
            .map(|first| now.saturating_duration_since(first.at).as_millis() as u32)
            .unwrap_or(0);
        self.op_log.record(op, elapsed_ms);
    }

    /// Bytes held across entry queues and the inject queue
    pub fn buffered(&self, dir: Direction) -> u64 {
        let entries: u64 = self.entries.iter().map(|e| e.buf(dir).buffered()).sum();
        entries + self.buf(dir).inject_q.len()
    }

    pub fn verify(&self) {
        for dir in Direction::BOTH {
            self.buf(dir).verify();
            for entry in self.entries.iter().filter(|e| e.is_linked()) {
                entry.buf(dir).verify();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> FlowState {
        FlowState::new(1, ConnDirection::Out, None, None, Instant::now())
    }

    #[test]
    fn test_chain_order_by_control_unit() {
        let mut st = state();
        st.link_entry(3, 1, 0x20);
        st.link_entry(1, 2, 0x40);
        st.link_entry(2, 3, 0x10);
        assert_eq!(st.ordered, vec![2, 3, 1]);
        assert_eq!(st.first_linked(), Some(2));
        assert_eq!(st.units_after(3), vec![1]);
        assert!(st.units_after(1).is_empty());

        // Equal control units keep attach order
        st.link_entry(4, 4, 0x20);
        assert_eq!(st.ordered, vec![2, 3, 4, 1]);
    }

    #[test]
    fn test_unlinked_entries_skipped() {
        let mut st = state();
        st.link_entry(1, 1, 1);
        st.link_entry(2, 2, 2);
        st.unlink_entry(1);
        assert_eq!(st.first_linked(), Some(2));
        assert_eq!(st.linked_units().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_min_pass_offset() {
        let mut st = state();
        assert_eq!(st.min_pass_offset(Direction::Out), 0);
        st.link_entry(1, 1, 1);
        st.link_entry(2, 2, 2);
        st.entry_mut(1).snd.pass_offset = 50;
        st.entry_mut(2).snd.pass_offset = 20;
        assert_eq!(st.min_pass_offset(Direction::Out), 20);
        assert_eq!(st.min_pass_offset(Direction::In), 0);
    }

    #[test]
    fn test_data_pending_capped_by_storage() {
        let mut st = state();
        st.snd.pending_last = 5000;
        st.snd.mbcnt = 4096;
        assert_eq!(st.data_pending(Direction::Out), 4096);
        st.snd.mbcnt = 8192;
        assert_eq!(st.data_pending(Direction::Out), 5000);
    }

    #[test]
    fn test_op_log_keeps_first_entries() {
        let mut log = OpLog::default();
        for op in 1..=8u32 {
            log.record(op, op * 10);
        }
        assert_eq!(log.count, 8);
        assert_eq!(log.ops, [1, 2, 3, 4, 5, 6]);
        assert_eq!(log.times_ms[5], 60);
    }
}
