// packages/engine/src/engine/datapath.rs
//! Submit, queue servicing and chaining
//!
//! # Architecture
//!
//! ```text
//!  submit ──► fast path (pending_last ≤ pass_offset) ──► Pass
//!     │
//!     └──► entry[0].ctl_q ──service_ctl_q──► entry[0].pending_q
//!                                                  │ service_pending_queue
//!                                                  ▼
//!                               entry[1].ctl_q ... ──► inject_q ──► reinject
//! ```
//!
//! A span is never split between agents: a span straddling an agent's
//! pass offset stays in that agent's control queue until the remainder is
//! passed. Offsets only ever move forward.
//!
//! Reinjection runs with the flow lock held. The socket layer may hand
//! reinjected data straight back to [`EngineCore::sock_data_out`] /
//! [`EngineCore::sock_data_in`] for the *same* socket and direction; that
//! re-entry is recognised and passed through without locking. Re-entry
//! for the other direction is not supported.

use crate::engine::{EngineCore, FlowCtx};
use crate::flow::socket::ReinjectScope;
use crate::flow::{is_reinjecting, Flow, FlowState, Socket};
use crate::observability::Counter;
use crate::protocol::message::Direction;
use crate::protocol::sockopt::NECP_MASK_USERSPACE_ONLY;
use crate::queue::Span;
use crate::utils::errors::{EngineError, Result};
use parking_lot::MutexGuard;
use tracing::{debug, info, trace, warn};

/// What the socket layer should do with submitted data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Continue on the normal path
    Pass(Span),

    /// Held by the engine; it returns through `SocketLayer::reinject`
    Held,
}

impl Disposition {
    pub fn is_held(&self) -> bool {
        matches!(self, Disposition::Held)
    }
}

/// A policy unit that routes traffic to agents
#[inline]
pub(crate) fn is_filter_unit(unit: u32) -> bool {
    unit != 0 && unit & NECP_MASK_USERSPACE_ONLY == 0
}

fn counter(dir: Direction, out: Counter, inbound: Counter) -> Counter {
    match dir {
        Direction::Out => out,
        Direction::In => inbound,
    }
}

impl FlowCtx<'_> {
    /// Submit one span in one direction
    pub(crate) fn data_common(
        &self,
        st: &mut FlowState,
        dir: Direction,
        span: Span,
    ) -> Result<Disposition> {
        if st.flags.drop {
            return Err(EngineError::Dropped);
        }
        let len = span.len();
        if len == 0 {
            return Ok(Disposition::Pass(span));
        }
        let (mbcnt, mbnum) = (span.mbcnt(), span.mbnum());

        {
            let buf = st.buf_mut(dir);
            buf.pending_last += len;
            buf.mbcnt += mbcnt;
            buf.mbnum += mbnum;
        }

        if self.flow.socket.flow_db().is_some() {
            let gc = &self.core.config().gc;
            let sock_id = st.sock_id;
            let buf = st.buf_mut(dir);
            if buf.mbnum > gc.mbuf_num_max() || buf.mbcnt > gc.mbuf_cnt_max() {
                buf.tail_drop_cnt += 1;
                buf.pending_last -= len;
                buf.mbcnt -= mbcnt;
                buf.mbnum -= mbnum;
                self.core.incr(Counter::DgramTailDrop);
                debug!(
                    "Flow {:#x} {} tail drop, {} bytes held",
                    sock_id, dir, buf.mbcnt
                );
                return Err(EngineError::Dropped);
            }
        }
        self.flow.add_bytes(dir, len);
        st.buf(dir).verify();

        let mut claimed = false;
        if st.buf(dir).pending_last <= st.buf(dir).pass_offset {
            self.update_entry_offsets(st, dir, len);
        } else {
            let ordered = st.ordered.clone();
            for unit in ordered {
                if self.data_filter(st, unit, dir, span.clone()) {
                    claimed = true;
                    break;
                }
            }
        }

        if claimed {
            return Ok(Disposition::Held);
        }

        let buf = st.buf_mut(dir);
        buf.pending_first += len;
        buf.mbcnt -= mbcnt;
        buf.mbnum -= mbnum;
        buf.verify();
        Ok(Disposition::Pass(span))
    }

    /// Fast-path bookkeeping: every entry already passed these bytes
    fn update_entry_offsets(&self, st: &mut FlowState, dir: Direction, len: u64) {
        for entry in st.entries.iter_mut().filter(|e| e.is_linked()) {
            let eb = entry.buf_mut(dir);
            eb.ctl_q.advance(len);
            eb.pending_q.advance(len);
            let start = eb.ctl_q.offset_first();
            eb.pass_offset = eb.pass_offset.max(start);
            eb.peeked = start;
            eb.peek_offset = eb.peek_offset.max(eb.pass_offset);
            eb.verify();
        }
    }

    /// Offer a span to one entry; true if the entry took it
    pub(crate) fn data_filter(
        &self,
        st: &mut FlowState,
        unit: u32,
        dir: Direction,
        span: Span,
    ) -> bool {
        if !st.entry(unit).is_linked() {
            return false;
        }
        let len = span.len();
        st.entry_mut(unit).buf_mut(dir).ctl_q.enqueue(span);
        self.core
            .add(counter(dir, Counter::CtlQOutEnqueued, Counter::CtlQInEnqueued), len);

        if let Err(e) = self.service_ctl_q(st, unit, dir) {
            warn!("Flow {:#x} unit {} service failed: {}", st.sock_id, unit, e);
        }
        true
    }

    /// Move passed data on, show peekable data to the agent, then chain
    ///
    /// `Ok(true)` means a later entry took data from this one.
    pub(crate) fn service_ctl_q(
        &self,
        st: &mut FlowState,
        unit: u32,
        dir: Direction,
    ) -> Result<bool> {
        let flags = st.entry(unit).flags;
        if !flags.sent_sock_attached {
            match self.dispatch_attach(st, Some(unit)) {
                Ok(()) => {}
                Err(e) if e.is_backpressure() => return Ok(false),
                Err(e) => return Err(e),
            }
        } else if !flags.data_start {
            self.core.incr(Counter::CtlQNotStarted);
            return Ok(false);
        }

        // Passed spans go to the pending queue
        {
            let eb = st.entry_mut(unit).buf_mut(dir);
            while let Some(first) = eb.ctl_q.first() {
                let len = first.len();
                let start = eb.ctl_q.offset_first();
                if start >= eb.pass_offset {
                    break;
                }
                let copylen = if start + len <= eb.pass_offset {
                    len
                } else {
                    eb.pass_offset - start
                };
                eb.peeked = eb.peeked.max(start + copylen);
                if copylen < len {
                    break;
                }
                let span = eb.ctl_q.remove(len)?;
                eb.pending_q.enqueue(span);
                self.core.add(
                    counter(dir, Counter::PendingQOutEnqueued, Counter::PendingQInEnqueued),
                    len,
                );
            }
            eb.verify();
        }

        // Peekable spans are shown to the agent
        let mut index = 0;
        let mut current = st.entry(unit).buf(dir).ctl_q.offset_first();
        loop {
            let (peek, peeked) = {
                let eb = st.entry(unit).buf(dir);
                (eb.peek_offset, eb.peeked)
            };
            if current >= peek {
                break;
            }
            let span = match st.entry(unit).buf(dir).ctl_q.get(index) {
                Some(span) => span.clone(),
                None => break,
            };
            index += 1;
            let len = span.len();
            if current + len <= peeked {
                current += len;
                continue;
            }

            let copyoffset = peeked.saturating_sub(current);
            let copylen = (len - copyoffset).min(peek.saturating_sub(current + copyoffset));
            if copylen == 0 {
                break;
            }
            let payload = span
                .data
                .slice(copyoffset as usize..(copyoffset + copylen) as usize);
            let peer = span.meta.as_ref().and_then(|m| m.peer);
            if let Err(e) = self.dispatch_data(st, unit, dir, payload, peer) {
                trace!("Flow {:#x} unit {} data held: {}", st.sock_id, unit, e);
                break;
            }
            st.entry_mut(unit).buf_mut(dir).peeked += copylen;
            self.core
                .add(counter(dir, Counter::CtlQOutPeeked, Counter::CtlQInPeeked), copylen);

            if copyoffset + copylen < len {
                break;
            }
            current += len;
        }
        st.entry(unit).buf(dir).verify();

        if self.service_pending_queue(st, unit, dir)? {
            return Ok(true);
        }

        // Disconnects held back while data was queued
        let entry = st.entry(unit);
        let deferred = match dir {
            Direction::Out => st.flags.shut_wr && !entry.flags.sent_disconnect_out,
            Direction::In => st.flags.shut_rd && !entry.flags.sent_disconnect_in,
        };
        if deferred {
            let _ = self.dispatch_disconnect(st, unit, dir);
        }
        Ok(false)
    }

    /// Hand passed spans to the following entries, or to the inject queue
    /// once no entry wants them
    pub(crate) fn service_pending_queue(
        &self,
        st: &mut FlowState,
        unit: u32,
        dir: Direction,
    ) -> Result<bool> {
        let after = st.units_after(unit);

        let (passlen, empty) = {
            let eb = st.entry(unit).buf(dir);
            (
                eb.pass_offset.saturating_sub(eb.pending_q.offset_first()),
                eb.pending_q.is_empty(),
            )
        };

        if empty {
            // Let later entries converge without new traffic
            for next in after {
                if self.service_ctl_q(st, next, dir)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        let mut chained = false;
        let mut curlen = 0;
        loop {
            let len = match st.entry(unit).buf(dir).pending_q.first() {
                Some(span) => span.len(),
                None => break,
            };
            if curlen + len > passlen {
                break;
            }
            let span = st.entry_mut(unit).buf_mut(dir).pending_q.remove(len)?;
            curlen += len;

            chained = false;
            for next in after.iter().copied() {
                if self.data_filter(st, next, dir, span.clone()) {
                    chained = true;
                    break;
                }
            }
            if !chained {
                st.buf_mut(dir).inject_q.enqueue(span);
                self.core.add(
                    counter(dir, Counter::InjectQOutEnqueued, Counter::InjectQInEnqueued),
                    len,
                );
            }
        }
        Ok(chained)
    }

    /// Reinject everything in the inject queue
    pub(crate) fn service_inject_queue(&self, st: &mut FlowState, dir: Direction) {
        let sock = &self.flow.socket;
        if sock.is_defunct() {
            return;
        }
        st.flags.set_retry_inject(dir, false);
        if st.buf(dir).inject_q.is_empty() {
            return;
        }

        let layer = &self.core.ports().socket_layer;
        let mut need_wake = false;
        loop {
            let buf = st.buf_mut(dir);
            let len = match buf.inject_q.first() {
                Some(span) => span.len(),
                None => break,
            };
            let span = match buf.inject_q.remove(len) {
                Ok(span) => span,
                Err(_) => break,
            };
            let held = (buf.mbcnt, buf.mbnum);
            buf.pending_first += len;
            buf.mbcnt = buf.mbcnt.saturating_sub(span.mbcnt());
            buf.mbnum = buf.mbnum.saturating_sub(span.mbnum());
            buf.verify();

            let result = {
                let _scope = ReinjectScope::enter(sock, dir);
                layer.reinject(sock, dir, span)
            };
            match result {
                Ok(()) => {
                    need_wake = true;
                    self.core.add(
                        counter(dir, Counter::InjectQOutPassed, Counter::InjectQInPassed),
                        len,
                    );
                }
                Err(e) => {
                    // Back at the head of the queue for the next buffer update
                    let buf = st.buf_mut(dir);
                    buf.pending_first -= len;
                    (buf.mbcnt, buf.mbnum) = held;
                    buf.inject_q.requeue_front(e.span);
                    buf.verify();

                    st.flags.set_retry_inject(dir, true);
                    self.core
                        .incr(counter(dir, Counter::InjectQOutFail, Counter::InjectQInFail));
                    warn!(
                        "Flow {:#x} {} reinject of {} bytes failed: {}",
                        st.sock_id, dir, len, e.reason
                    );
                    break;
                }
            }
        }

        if need_wake {
            layer.wake(sock, dir);
        }

        if st.flags.shut_wr {
            self.notify_disconnect(st, Direction::Out);
            if st.data_pending(Direction::Out) == 0 {
                layer.shutdown_final(sock, Direction::Out);
            }
        }
        if st.flags.close_wait && !st.filters_attached() {
            self.flow.wakeup();
        }
    }

    /// Refresh the fast-path threshold once nothing is pending
    pub(crate) fn set_socket_pass_offset(&self, st: &mut FlowState, dir: Direction) {
        if st.buf(dir).pending() == 0 {
            let pass_offset = st.min_pass_offset(dir);
            st.buf_mut(dir).pass_offset = pass_offset;
        }
    }

    /// Tell every entry one side of the socket is gone
    pub(crate) fn notify_disconnect(&self, st: &mut FlowState, dir: Direction) {
        let ordered = st.ordered.clone();
        for unit in ordered {
            if let Err(e) = self.dispatch_disconnect(st, unit, dir) {
                trace!("Flow {:#x} unit {} disconnect {} held: {}", st.sock_id, unit, dir, e);
            }
        }
    }
}

impl EngineCore {
    /// Outgoing data from a stream socket
    pub fn sock_data_out(&self, sock: &Socket, span: Span) -> Result<Disposition> {
        self.sock_data(sock, Direction::Out, span)
    }

    /// Incoming data for a stream socket
    pub fn sock_data_in(&self, sock: &Socket, span: Span) -> Result<Disposition> {
        self.sock_data(sock, Direction::In, span)
    }

    fn sock_data(&self, sock: &Socket, dir: Direction, span: Span) -> Result<Disposition> {
        if is_reinjecting(sock, dir) {
            return Ok(Disposition::Pass(span));
        }
        if sock.flow_db().is_some() {
            return Err(EngineError::InvalidArgument(
                "datagram socket data goes through dgram_data_out/in".into(),
            ));
        }

        let flow = match sock.flow() {
            Some(flow) => flow,
            None => {
                // Connections that predate the filter
                let (preserve, active) = {
                    let reg = self.registry.read();
                    (reg.preserve_connections(), reg.active_count())
                };
                if !preserve
                    && active > 0
                    && !sock.is_skipped()
                    && is_filter_unit(self.ports().policy.control_unit(sock))
                {
                    info!(
                        "Socket {} {} data dropped, unfiltered pre-existing flow",
                        sock.gencnt, dir
                    );
                    return Err(EngineError::Dropped);
                }
                return Ok(Disposition::Pass(span));
            }
        };

        let mut st = flow.lock();
        self.adopt_policy_unit(sock, &mut st)?;
        if st.flags.drop || sock.is_defunct() {
            return Err(EngineError::Dropped);
        }
        self.with_sockbuf(&flow, &mut st, dir, |ctx, st| ctx.data_common(st, dir, span))
    }

    /// Follow a policy change when allowed, otherwise drop the flow's data
    pub(crate) fn adopt_policy_unit(&self, sock: &Socket, st: &mut FlowState) -> Result<()> {
        let unit = self.ports().policy.control_unit(sock);
        if !is_filter_unit(unit) || unit == st.filter_control_unit || sock.is_skipped() {
            return Ok(());
        }

        let preserve = self.registry.read().preserve_connections();
        if preserve || st.filter_policy_gencount == self.ports().policy.policy_gencount(sock) {
            st.filter_control_unit = unit;
            Ok(())
        } else {
            info!(
                "Flow {:#x} data dropped, control unit {:#x} -> {:#x}",
                st.sock_id, st.filter_control_unit, unit
            );
            Err(EngineError::Dropped)
        }
    }

    /// Discard every queued byte of a flow
    pub(crate) fn flush_queues(&self, flow: &Flow, st: &mut MutexGuard<'_, FlowState>) {
        for dir in Direction::BOTH {
            flow.acquire_sockbuf(st, dir);
            let mut drained = st.buf_mut(dir).inject_q.drain();
            for entry in st.entries.iter_mut() {
                drained += entry.drain(dir);
            }
            flow.release_sockbuf(st, dir);

            if drained > 0 {
                let c = if st.flags.drop {
                    counter(dir, Counter::FlushOutDrop, Counter::FlushInDrop)
                } else {
                    counter(dir, Counter::FlushOutClose, Counter::FlushInClose)
                };
                self.incr(c);
                debug!("Flow {:#x} {} flushed {} bytes", st.sock_id, dir, drained);
            }
        }
    }
}
