// packages/engine/src/engine/dispatch.rs
//! Engine → agent events
//!
//! Every dispatcher runs with the flow lock and a registry read guard
//! held (through [`FlowCtx`]). A dispatch that meets backpressure marks
//! both the entry and the agent flow controlled and leaves the data where
//! it is; [`EngineCore::ctl_rcvd`] re-walks the agent's flows later.

use crate::engine::FlowCtx;
use crate::filter::ContentFilter;
use crate::flow::state::FirstEvent;
use crate::flow::FlowState;
use crate::observability::Counter;
use crate::protocol::message::{
    AttachedEvent, ClosedEvent, DataEvent, Direction, Event, EventOp,
};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use chrono::Utc;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, trace, warn};

impl FlowCtx<'_> {
    /// Signature over the unsigned encoding, empty without a key
    fn signature(&self, cfc: &ContentFilter, unsigned: &Event) -> Bytes {
        match &cfc.crypto_key {
            Some(key) => self.core.ports().signer.sign(key, &unsigned.encode()),
            None => Bytes::new(),
        }
    }

    fn send(&self, unit: u32, event: &Event) -> Result<()> {
        self.core
            .ports()
            .transport
            .enqueue(unit, event.encode())
            .map_err(EngineError::from)
    }

    /// Record a failed dispatch
    fn settle(
        &self,
        st: &mut FlowState,
        unit: u32,
        result: Result<()>,
        flow_control: Counter,
        fail: Counter,
    ) -> Result<()> {
        match &result {
            Ok(()) => {}
            Err(EngineError::FlowControlled) => {
                st.entry_mut(unit).flags.flow_controlled = true;
                if let Some(cfc) = self.reg.get(unit) {
                    cfc.set_flow_controlled();
                }
                self.core.incr(flow_control);
                trace!("Flow {:#x} unit {} flow controlled", st.sock_id, unit);
            }
            Err(e) => {
                self.core.incr(fail);
                warn!("Flow {:#x} unit {} dispatch failed: {}", st.sock_id, unit, e);
            }
        }
        result
    }

    /// Send SOCKET_ATTACHED to `unit`, or to the first linked entry
    pub(crate) fn dispatch_attach(&self, st: &mut FlowState, unit: Option<u32>) -> Result<()> {
        let unit = match unit.or_else(|| st.first_linked()) {
            Some(unit) => unit,
            None => return Ok(()),
        };
        let entry = st.entry(unit);
        if !entry.is_linked() || entry.flags.sent_sock_attached {
            return Ok(());
        }
        let cfc = match self.reg.get(unit) {
            Some(cfc) => cfc,
            None => return Ok(()),
        };

        let result = if cfc.is_flow_controlled() {
            Err(EngineError::FlowControlled)
        } else {
            let socket = &self.flow.socket;
            let mut event = AttachedEvent {
                sock_id: st.sock_id,
                family: socket.family,
                sock_type: socket.sock_type(),
                protocol: socket.protocol,
                pid: socket.pid,
                conn_dir: st.dir,
                local: st.local,
                remote: st.remote,
                signature: Bytes::new(),
            };
            event.signature = self.signature(cfc, &Event::Attached(event.clone()));
            self.send(unit, &Event::Attached(event))
        };

        if result.is_ok() {
            let now = Instant::now();
            if st.first_event.is_none() {
                st.first_event = Some(FirstEvent {
                    at: now,
                    wall: Utc::now(),
                });
            }
            let entry = st.entry_mut(unit);
            entry.last_event = Some(now);
            entry.flags.sent_sock_attached = true;
            self.core.incr(Counter::AttachEventOk);
            debug!("Flow {:#x} attached to unit {}", st.sock_id, unit);
        }

        self.settle(
            st,
            unit,
            result,
            Counter::AttachEventFlowControl,
            Counter::AttachEventFail,
        )
    }

    /// Send DATA_OUT / DATA_IN for the bytes starting at the entry's
    /// `peeked` mark
    pub(crate) fn dispatch_data(
        &self,
        st: &mut FlowState,
        unit: u32,
        dir: Direction,
        payload: Bytes,
        peer: Option<SocketAddr>,
    ) -> Result<()> {
        let cfc = match self.reg.get(unit) {
            Some(cfc) => cfc,
            None => return Ok(()),
        };

        let now = Instant::now();
        let result = if cfc.is_flow_controlled() {
            Err(EngineError::FlowControlled)
        } else {
            st.record_op(dir.data_op() as u32, now);

            let start_offset = st.entry(unit).buf(dir).peeked;
            let mut event = DataEvent {
                sock_id: st.sock_id,
                dir,
                start_offset,
                end_offset: start_offset + payload.len() as u64,
                pid: self.flow.socket.pid,
                flags: 0,
                local: st.local,
                remote: peer.or(st.remote),
                signature: Bytes::new(),
                payload,
            };
            event.signature = self.signature(cfc, &Event::Data(event.clone()));
            self.send(unit, &Event::Data(event))
        };

        if result.is_ok() {
            let entry = st.entry_mut(unit);
            entry.last_event = Some(now);
            entry.flags.flow_controlled = false;
            self.core.incr(Counter::DataEventOk);
        }

        self.settle(
            st,
            unit,
            result,
            Counter::DataEventFlowControl,
            Counter::DataEventFail,
        )
    }

    /// Send DISCONNECT_OUT / DISCONNECT_IN once per direction
    ///
    /// An outgoing disconnect waits for the entry's control queue to
    /// drain and reports `Busy` until then.
    pub(crate) fn dispatch_disconnect(
        &self,
        st: &mut FlowState,
        unit: u32,
        dir: Direction,
    ) -> Result<()> {
        let entry = st.entry(unit);
        if !entry.is_linked() || !entry.flags.sent_sock_attached {
            return Ok(());
        }

        // Loopback peers that go away before any verdict do not hold up close
        if !st.flags.initial_verdict && st.remote.map_or(false, |r| r.ip().is_loopback()) {
            st.flags.no_close_wait = true;
        }

        let entry = st.entry(unit);
        if entry.sent_disconnect(dir) {
            return Ok(());
        }
        if dir.is_out() && !entry.snd.ctl_q.is_empty() {
            return Err(EngineError::Busy(format!(
                "{} bytes awaiting delivery",
                entry.snd.ctl_q.len()
            )));
        }
        let cfc = match self.reg.get(unit) {
            Some(cfc) => cfc,
            None => return Ok(()),
        };

        let result = if cfc.is_flow_controlled() {
            Err(EngineError::FlowControlled)
        } else {
            self.send(
                unit,
                &Event::Disconnect {
                    sock_id: st.sock_id,
                    dir,
                },
            )
        };

        if result.is_ok() {
            let now = Instant::now();
            st.entry_mut(unit).last_event = Some(now);
            st.record_op(dir.disconnect_op() as u32, now);
            st.entry_mut(unit).mark_sent_disconnect(dir);
            self.core.incr(match dir {
                Direction::Out => Counter::DisconnectOutEventOk,
                Direction::In => Counter::DisconnectInEventOk,
            });
            debug!("Flow {:#x} unit {} disconnect {}", st.sock_id, unit, dir);
        }

        self.settle(
            st,
            unit,
            result,
            Counter::DisconnectEventFlowControl,
            Counter::DisconnectEventFail,
        )
    }

    /// Send SOCKET_CLOSED with the flow's byte totals and op log
    pub(crate) fn dispatch_closed(&self, st: &mut FlowState, unit: u32) -> Result<()> {
        if !st.entry(unit).is_linked() {
            return Ok(());
        }
        let cfc = match self.reg.get(unit) {
            Some(cfc) => cfc,
            None => return Ok(()),
        };

        let result = if cfc.is_flow_controlled() {
            Err(EngineError::FlowControlled)
        } else {
            let flags = st.entry(unit).flags;
            if flags.sent_sock_closed || !flags.sent_sock_attached {
                return Ok(());
            }

            let now = Instant::now();
            st.entry_mut(unit).last_event = Some(now);
            st.record_op(EventOp::SocketClosed as u32, now);

            let mut event = ClosedEvent {
                sock_id: st.sock_id,
                first_event_us: st
                    .first_event
                    .map_or(0, |first| first.wall.timestamp_micros()),
                op_time: st.op_log.times_ms,
                op_list: st.op_log.ops,
                op_list_ctr: st.op_log.count,
                byte_inbound_count: self.flow.bytes(Direction::In),
                byte_outbound_count: self.flow.bytes(Direction::Out),
                local: if self.flow.claim_laddr(unit) {
                    self.flow.local
                } else {
                    None
                },
                signature: Bytes::new(),
            };
            event.signature = self.signature(cfc, &Event::Closed(event.clone()));
            self.send(unit, &Event::Closed(event))
        };

        if result.is_ok() {
            st.entry_mut(unit).flags.sent_sock_closed = true;
            self.core.incr(Counter::ClosedEventOk);
            debug!("Flow {:#x} unit {} closed", st.sock_id, unit);
        }

        self.settle(
            st,
            unit,
            result,
            Counter::ClosedEventFlowControl,
            Counter::ClosedEventFail,
        )
    }
}
