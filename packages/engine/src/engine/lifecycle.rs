// packages/engine/src/engine/lifecycle.rs
//! Socket lifecycle: attach, shutdown, close, close-wait
//!
//! ```text
//!   sock_attach ──► flow + entries ──► SOCKET_ATTACHED
//!   sock_shutdown ──► DISCONNECT_IN / DISCONNECT_OUT (out waits for ctl_q)
//!   sock_is_closed ──► SOCKET_CLOSED, last reinject, flush
//!   sock_close_wait ──► sleep until every agent detached or timeout
//!   sock_detach ──► drop the socket's reference
//! ```
//!
//! Datagram sockets apply every per-socket operation to each flow of
//! their flow database.

use crate::engine::datapath::is_filter_unit;
use crate::engine::EngineCore;
use crate::flow::{is_reinjecting, Flow, FlowRef, FlowState, Socket};
use crate::observability::Counter;
use crate::protocol::message::{ConnDirection, Direction};
use crate::protocol::sockopt::{NECP_FILTER_UNIT_NO_FILTER, NECP_MASK_USERSPACE_ONLY};
use crate::utils::errors::{EngineError, Result};
use parking_lot::MutexGuard;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Which side of a socket is being shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

impl ShutdownHow {
    fn reads(self) -> bool {
        matches!(self, ShutdownHow::Read | ShutdownHow::Both)
    }

    fn writes(self) -> bool {
        matches!(self, ShutdownHow::Write | ShutdownHow::Both)
    }
}

/// What the socket layer should do after [`EngineCore::sock_shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Carry on with this (possibly narrowed) shutdown
    Proceed(ShutdownHow),

    /// Outgoing data is still held; the engine completes the write
    /// shutdown through `SocketLayer::shutdown_final`
    Deferred,
}

/// Flows of a socket, retained
fn socket_flows(sock: &Socket) -> Vec<FlowRef> {
    match sock.flow_db() {
        Some(db) => db.entries().iter().filter_map(|e| e.context()).collect(),
        None => sock.flow().into_iter().collect(),
    }
}

impl EngineCore {
    /// Link every agent whose control unit intersects `filter_unit`
    ///
    /// Returns how many entries were linked.
    pub(crate) fn attach_units(&self, st: &mut FlowState, filter_unit: u32) -> usize {
        let mut reg = self.registry.write();
        let matching: Vec<(u32, u64, u32)> = reg
            .iter()
            .filter(|cfc| !cfc.detaching && cfc.necp_control_unit & filter_unit != 0)
            .map(|cfc| (cfc.unit, cfc.instance, cfc.necp_control_unit))
            .collect();

        for (unit, instance, necp_control_unit) in &matching {
            st.link_entry(*unit, *instance, *necp_control_unit);
            if let Some(cfc) = reg.get_mut(*unit) {
                cfc.link(st.sock_id);
            }
        }
        matching.len()
    }

    /// Start filtering a new stream socket
    pub fn sock_attach(
        &self,
        sock: &Arc<Socket>,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        dir: ConnDirection,
    ) -> Result<()> {
        if sock.is_skipped() || !sock.is_stream() || !sock.is_inet() {
            return Ok(());
        }
        let filter_unit = self.ports().policy.control_unit(sock);
        if filter_unit == 0 || filter_unit == NECP_FILTER_UNIT_NO_FILTER {
            return Ok(());
        }
        if filter_unit & NECP_MASK_USERSPACE_ONLY != 0 {
            self.incr(Counter::SockUserspaceOnly);
            return Ok(());
        }
        if self.active_count() == 0 {
            self.incr(Counter::SockAttachInVain);
            return Ok(());
        }
        if sock.flow().is_some() {
            self.incr(Counter::SockAttachAlready);
            return Ok(());
        }

        let sock_id = (sock.gencnt << 32) | u64::from(sock.flowhash);
        let mut state = FlowState::new(sock_id, dir, local, remote, Instant::now());
        state.filter_control_unit = filter_unit;
        state.filter_policy_gencount = self.ports().policy.policy_gencount(sock);

        let flow = self.create_flow(Arc::clone(sock), state);
        let attached = {
            let mut st = flow.lock();
            let attached = self.attach_units(&mut st, filter_unit);
            if attached > 0 {
                let result = self.with_ctx(&flow, &mut st, |ctx, st| ctx.dispatch_attach(st, None));
                if let Err(e) = result {
                    debug!("Flow {:#x} attach deferred: {}", sock_id, e);
                }
            }
            attached
        };

        if attached == 0 {
            self.incr(Counter::SockAttachFailed);
            debug!("Socket {} matched no filter for unit {:#x}", sock.gencnt, filter_unit);
            drop(flow);
            return Ok(());
        }

        let previous = sock.set_flow(Some(flow));
        sock.set_filtered(true);
        self.incr(Counter::SockAttached);
        info!(
            "Socket {} attached as flow {:#x} ({} filters)",
            sock.gencnt, sock_id, attached
        );
        drop(previous);
        Ok(())
    }

    /// The socket is going away; release its flows
    pub fn sock_detach(&self, sock: &Socket) {
        if sock.flow_db().is_some() {
            self.detach_db(sock);
            return;
        }
        let previous = sock.set_flow(None);
        sock.set_filtered(false);
        if let Some(flow) = previous {
            self.incr(Counter::SockDetached);
            debug!("Socket {} detached from flow {:#x}", sock.gencnt, flow.sock_id);
            drop(flow);
        }
    }

    /// Shut down one or both sides
    pub fn sock_shutdown(&self, sock: &Socket, how: ShutdownHow) -> Result<ShutdownOutcome> {
        if sock.flow_db().is_none() {
            let flow = match sock.flow() {
                Some(flow) => flow,
                None => return Ok(ShutdownOutcome::Proceed(how)),
            };
            let mut st = flow.lock();
            return self.shutdown_flow(&flow, &mut st, how);
        }

        let mut affected = 0;
        let mut outcome = ShutdownOutcome::Proceed(how);
        for flow in socket_flows(sock) {
            let mut st = flow.lock();
            match self.shutdown_flow(&flow, &mut st, how) {
                Ok(ShutdownOutcome::Proceed(narrowed)) => {
                    affected += 1;
                    if narrowed != how && outcome == ShutdownOutcome::Proceed(how) {
                        outcome = ShutdownOutcome::Proceed(narrowed);
                    }
                }
                Ok(ShutdownOutcome::Deferred) => {
                    affected += 1;
                    outcome = ShutdownOutcome::Deferred;
                }
                Err(_) => {}
            }
        }
        if affected == 0 {
            return Err(EngineError::NotConnected);
        }
        Ok(outcome)
    }

    fn shutdown_flow(
        &self,
        flow: &Flow,
        st: &mut MutexGuard<'_, FlowState>,
        how: ShutdownHow,
    ) -> Result<ShutdownOutcome> {
        if st.flags.drop {
            return Ok(ShutdownOutcome::Proceed(how));
        }
        if (how.reads() && st.flags.shut_rd) || (how.writes() && st.flags.shut_wr) {
            return Err(EngineError::NotConnected);
        }

        if how.reads() {
            st.flags.shut_rd = true;
            self.with_ctx(flow, st, |ctx, st| ctx.notify_disconnect(st, Direction::In));
        }
        if how.writes() {
            st.flags.shut_wr = true;
            self.with_ctx(flow, st, |ctx, st| ctx.notify_disconnect(st, Direction::Out));
        }

        if st.data_pending(Direction::Out) != 0 {
            match how {
                ShutdownHow::Write => {
                    debug!("Flow {:#x} write shutdown deferred", st.sock_id);
                    return Ok(ShutdownOutcome::Deferred);
                }
                ShutdownHow::Both => return Ok(ShutdownOutcome::Proceed(ShutdownHow::Read)),
                ShutdownHow::Read => {}
            }
        }
        Ok(ShutdownOutcome::Proceed(how))
    }

    /// The socket is closing: tell every agent, push out what was passed,
    /// then discard the rest
    pub fn sock_is_closed(&self, sock: &Socket) {
        for flow in socket_flows(sock) {
            let mut st = flow.lock();
            self.close_flow(&flow, &mut st);
        }
    }

    pub(crate) fn close_flow(&self, flow: &Flow, st: &mut MutexGuard<'_, FlowState>) {
        self.with_ctx(flow, st, |ctx, st| {
            let ordered = st.ordered.clone();
            for unit in ordered {
                let _ = ctx.dispatch_closed(st, unit);
            }
        });
        self.with_sockbuf(flow, st, Direction::Out, |ctx, st| {
            ctx.service_inject_queue(st, Direction::Out)
        });
        st.flags.sock_closed = true;
        self.flush_queues(flow, st);
        debug!("Flow {:#x} closed", st.sock_id);
    }

    /// Block until every agent is done with the socket's flows, bounded by
    /// the close-wait timeout
    pub fn sock_close_wait(&self, sock: &Socket) {
        for flow in socket_flows(sock) {
            let mut st = flow.lock();
            self.close_wait_flow(&flow, &mut st);
        }
    }

    fn close_wait_flow(&self, flow: &Flow, st: &mut MutexGuard<'_, FlowState>) {
        if st.flags.no_close_wait {
            return;
        }
        let deadline = Instant::now() + self.config().close_wait_timeout();

        while st.filters_attached() {
            self.with_ctx(flow, st, |ctx, st| {
                ctx.notify_disconnect(st, Direction::In);
                ctx.notify_disconnect(st, Direction::Out);
            });
            if st.flags.no_close_wait || !st.filters_attached() {
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            st.flags.close_wait = true;
            let timed_out = remaining.is_zero() || flow.wait_for(st, remaining);
            st.flags.close_wait = false;

            if timed_out && st.filters_attached() {
                self.incr(Counter::CloseWaitTimeout);
                for entry in st.entries.iter_mut().filter(|e| e.awaits_agent()) {
                    entry.flags.detached = true;
                }
                warn!(
                    "Flow {:#x} close wait timed out after {}ms",
                    st.sock_id,
                    self.config().datapath.close_wait_timeout_ms
                );
                break;
            }
        }
    }

    /// Bytes the engine still holds for the socket in one direction
    pub fn sock_data_pending(&self, sock: &Socket, dir: Direction) -> u64 {
        if is_reinjecting(sock, dir) {
            return 0;
        }
        socket_flows(sock)
            .iter()
            .map(|flow| flow.lock().data_pending(dir))
            .sum()
    }

    /// Socket-buffer space the engine's holdings take up in one direction
    pub fn sock_data_space(&self, sock: &Socket, dir: Direction) -> u64 {
        if is_reinjecting(sock, dir) {
            return 0;
        }
        socket_flows(sock)
            .iter()
            .map(|flow| {
                let st = flow.lock();
                let buf = st.buf(dir);
                buf.pending().max(buf.mbcnt)
            })
            .sum()
    }

    /// The socket buffer drained; retry a reinjection that failed earlier
    pub fn sock_buf_update(&self, sock: &Socket, dir: Direction) {
        if is_reinjecting(sock, dir) {
            return;
        }
        for flow in socket_flows(sock) {
            let mut st = flow.lock();
            if !st.flags.retry_inject(dir) {
                continue;
            }
            debug!("Flow {:#x} {} retrying reinjection", st.sock_id, dir);
            self.with_sockbuf(&flow, &mut st, dir, |ctx, st| ctx.service_inject_queue(st, dir));
        }
    }

    /// True while the socket should hold back "connected" for the first
    /// verdict; the verdict then calls `SocketLayer::connected`
    pub fn sock_connected_pending_verdict(&self, sock: &Socket) -> bool {
        let flow = match sock.flow() {
            Some(flow) => flow,
            None => return false,
        };
        let mut st = flow.lock();
        if st.flags.initial_verdict {
            return false;
        }
        st.flags.socket_connected = true;
        true
    }

    /// Whether the socket is being filtered at all
    pub fn sock_is_filtered(&self, sock: &Socket) -> bool {
        is_filter_unit(self.ports().policy.control_unit(sock)) && sock.is_filtered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use crate::protocol::message::{Action, Event, EventOp};
    use crate::protocol::sockopt::AF_INET;
    use crate::utils::config::EngineConfig;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_attach_skipped_without_filters() {
        let h = Harness::new();
        let (sock, sock_id) = h.stream(50);
        assert_eq!(sock_id, 0);
        assert!(sock.flow().is_none());
        assert_eq!(h.core.counters().get(Counter::SockAttachInVain), 1);
    }

    #[test]
    fn test_attach_skip_rules() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);

        h.policy.set_unit(51, NECP_FILTER_UNIT_NO_FILTER);
        let (sock, _) = h.stream(51);
        assert!(sock.flow().is_none());

        h.policy.set_unit(52, NECP_MASK_USERSPACE_ONLY | POLICY_UNIT);
        let (sock, _) = h.stream(52);
        assert!(sock.flow().is_none());
        assert_eq!(h.core.counters().get(Counter::SockUserspaceOnly), 1);

        // No agent takes control unit 0x4
        h.policy.set_unit(53, 0x4);
        let (sock, _) = h.stream(53);
        assert!(sock.flow().is_none());
        assert_eq!(h.core.counters().get(Counter::SockAttachFailed), 1);
        assert!(h.core.flow_ids().is_empty());

        let (sock, _) = h.stream(54);
        h.core
            .sock_attach(&sock, None, None, ConnDirection::Out)
            .unwrap();
        assert_eq!(h.core.counters().get(Counter::SockAttachAlready), 1);
        assert!(sock.is_filtered());
        assert!(h.core.sock_is_filtered(&sock));
    }

    #[test]
    fn test_flow_id_layout() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let sock = Arc::new(Socket::stream(55, AF_INET).with_flowhash(0xabcd));
        h.core.sock_attach(&sock, None, None, ConnDirection::In).unwrap();
        let sock_id = sock.flow().map(|f| f.sock_id).unwrap();
        assert_eq!(sock_id, (55 << 32) | 0xabcd);
        h.core.sock_detach(&sock);
    }

    #[test]
    fn test_shutdown_write_deferred_while_data_held() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, sock_id) = h.stream(56);
        h.core.sock_data_out(&sock, payload(0, 40)).unwrap();
        assert_eq!(h.core.sock_data_pending(&sock, Direction::Out), 40);
        h.events(1);

        assert_eq!(
            h.core.sock_shutdown(&sock, ShutdownHow::Write).unwrap(),
            ShutdownOutcome::Deferred
        );
        // DISCONNECT_OUT waits for the control queue to drain
        assert!(h.events(1).is_empty());

        h.send(1, Action::update(sock_id, Direction::Out, 40, 40)).unwrap();
        assert_eq!(h.core.sock_data_pending(&sock, Direction::Out), 0);
        assert_eq!(h.layer.shutdowns(), vec![(56, Direction::Out)]);
        assert!(h
            .events(1)
            .iter()
            .any(|e| e.op() == EventOp::DisconnectOut));
    }

    #[test]
    fn test_shutdown_both_narrowed_to_read() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, _sock_id) = h.stream(57);
        h.core.sock_data_out(&sock, payload(0, 8)).unwrap();

        assert_eq!(
            h.core.sock_shutdown(&sock, ShutdownHow::Both).unwrap(),
            ShutdownOutcome::Proceed(ShutdownHow::Read)
        );
        assert_eq!(
            h.core.sock_shutdown(&sock, ShutdownHow::Write),
            Err(EngineError::NotConnected)
        );
    }

    #[test]
    fn test_unfiltered_shutdown_proceeds() {
        let h = Harness::new();
        let sock = Socket::stream(58, AF_INET);
        assert_eq!(
            h.core.sock_shutdown(&sock, ShutdownHow::Both).unwrap(),
            ShutdownOutcome::Proceed(ShutdownHow::Both)
        );
    }

    #[test]
    fn test_close_flushes_and_reports() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, sock_id) = h.stream(59);
        h.core.sock_data_in(&sock, payload(0, 16)).unwrap();

        h.core.sock_is_closed(&sock);
        let snap = h.snapshot(sock_id);
        assert_eq!(snap.entry(1).unwrap().rcv.ctl_q_len, 0);
        assert_eq!(h.core.counters().get(Counter::FlushInClose), 1);
        assert!(h.events(1).iter().any(|e| matches!(e, Event::Closed(_))));
    }

    #[test]
    fn test_close_wait_returns_once_agent_detaches() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, sock_id) = h.stream(60);

        let core = h.core.clone();
        let agent = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            core.ctl_send(1, &Action::pass_all(sock_id).encode()).unwrap();
        });

        let started = Instant::now();
        h.core.sock_close_wait(&sock);
        agent.join().unwrap();
        assert!(started.elapsed() < Duration::from_millis(900));
        assert!(h.snapshot(sock_id).entry(1).unwrap().detached);
        assert_eq!(h.core.counters().get(Counter::CloseWaitTimeout), 0);
    }

    #[test]
    fn test_close_wait_times_out() {
        let mut config = EngineConfig::default();
        config.datapath.close_wait_timeout_ms = 50;
        let h = Harness::with_config(config);
        h.agent(1, POLICY_UNIT);
        let (sock, sock_id) = h.stream(61);

        let started = Instant::now();
        h.core.sock_close_wait(&sock);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(h.core.counters().get(Counter::CloseWaitTimeout), 1);
        let snap = h.snapshot(sock_id);
        assert!(snap.entry(1).unwrap().detached);
        assert!(!snap.close_wait);
    }

    #[test]
    fn test_loopback_peer_skips_close_wait() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let sock = Arc::new(Socket::stream(62, AF_INET));
        let local: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        h.core
            .sock_attach(&sock, Some(local), Some(remote), ConnDirection::Out)
            .unwrap();

        let started = Instant::now();
        h.core.sock_close_wait(&sock);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(h.core.counters().get(Counter::CloseWaitTimeout), 0);
        h.core.sock_detach(&sock);
    }

    #[test]
    fn test_data_space_counts_storage() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, _sock_id) = h.stream(63);
        h.core.sock_data_in(&sock, payload(0, 100)).unwrap();
        assert_eq!(h.core.sock_data_pending(&sock, Direction::In), 100);
        assert!(h.core.sock_data_space(&sock, Direction::In) >= 100);
        assert_eq!(h.core.sock_data_space(&sock, Direction::Out), 0);
    }
}
