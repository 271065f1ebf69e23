// packages/engine/src/engine/dgram.rs
//! Datagram sockets
//!
//! A connectionless socket carries many flows, one per 4-tuple. Each
//! tuple gets an entry in the socket's [`FlowDb`](crate::ports::FlowDb)
//! whose context is that flow's [`FlowRef`]. Flows whose agent went quiet
//! while holding data, or whose producer overran the per-flow buffer
//! budget, are torn down by [`DgramReaper`].

use crate::engine::datapath::is_filter_unit;
use crate::engine::{Disposition, EngineCore};
use crate::flow::{is_reinjecting, FlowRef, FlowState, Socket};
use crate::observability::Counter;
use crate::ports::DgramFlowEntry;
use crate::protocol::message::{ConnDirection, Direction};
use crate::protocol::sockopt::NECP_MASK_USERSPACE_ONLY;
use crate::queue::{Span, SpanMeta};
use crate::utils::errors::{EngineError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

impl EngineCore {
    /// Outgoing datagram to `remote`
    pub fn dgram_data_out(
        &self,
        sock: &Arc<Socket>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        span: Span,
    ) -> Result<Disposition> {
        self.dgram_data(sock, Direction::Out, local, remote, span)
    }

    /// Incoming datagram from `remote`
    pub fn dgram_data_in(
        &self,
        sock: &Arc<Socket>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        span: Span,
    ) -> Result<Disposition> {
        self.dgram_data(sock, Direction::In, local, remote, span)
    }

    fn dgram_data(
        &self,
        sock: &Arc<Socket>,
        dir: Direction,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        span: Span,
    ) -> Result<Disposition> {
        if is_reinjecting(sock, dir) {
            return Ok(Disposition::Pass(span));
        }
        if self.active_count() == 0 {
            self.incr(Counter::SockAttachInVain);
            return Ok(Disposition::Pass(span));
        }
        if sock.is_skipped() {
            return Ok(Disposition::Pass(span));
        }
        let db = match sock.flow_db() {
            Some(db) => Arc::clone(db),
            None => {
                return Err(EngineError::InvalidArgument(
                    "stream socket data goes through sock_data_out/in".into(),
                ))
            }
        };

        let filter_unit = self.ports().policy.control_unit(sock);
        if !is_filter_unit(filter_unit) {
            if filter_unit & NECP_MASK_USERSPACE_ONLY != 0 {
                self.incr(Counter::SockUserspaceOnly);
            }
            return Ok(Disposition::Pass(span));
        }

        let entry = db.insert(local, remote);
        let flow = match entry.context() {
            Some(flow) => flow,
            None => self.dgram_attach(sock, &entry, dir, filter_unit)?,
        };

        let meta = SpanMeta {
            peer: Some(remote),
            state_change_cnt: sock.state_change_cnt(),
            options: sock.options(),
        };
        let mut st = flow.lock();
        self.adopt_policy_unit(sock, &mut st)?;
        if st.flags.drop {
            return Err(EngineError::Dropped);
        }
        let span = span.with_meta(meta);
        self.with_sockbuf(&flow, &mut st, dir, |ctx, st| ctx.data_common(st, dir, span))
    }

    /// First datagram of a 4-tuple: allocate and attach its flow
    fn dgram_attach(
        &self,
        sock: &Arc<Socket>,
        entry: &DgramFlowEntry,
        dir: Direction,
        filter_unit: u32,
    ) -> Result<FlowRef> {
        let sock_id = (sock.gencnt << 32) | u64::from(entry.flowhash);
        let conn_dir = match dir {
            Direction::Out => ConnDirection::Out,
            Direction::In => ConnDirection::In,
        };
        let mut state = FlowState::new(sock_id, conn_dir, entry.local, Some(entry.remote), Instant::now());
        state.filter_control_unit = filter_unit;
        state.filter_policy_gencount = self.ports().policy.policy_gencount(sock);

        let flow = self.create_flow(Arc::clone(sock), state);
        let outcome = {
            let mut st = flow.lock();
            if self.attach_units(&mut st, filter_unit) == 0 {
                None
            } else {
                Some(self.with_ctx(&flow, &mut st, |ctx, st| ctx.dispatch_attach(st, None)))
            }
        };

        match outcome {
            None => {
                self.incr(Counter::SockAttachFailed);
                if let Some(db) = sock.flow_db() {
                    db.remove(entry.flowhash);
                }
                debug!("Datagram flow {:#x} matched no filter", sock_id);
                drop(flow);
                Err(EngineError::Dropped)
            }
            Some(Err(e)) if !e.is_backpressure() => {
                if let Some(db) = sock.flow_db() {
                    db.remove(entry.flowhash);
                }
                warn!("Datagram flow {:#x} attach failed: {}", sock_id, e);
                drop(flow);
                Err(EngineError::Dropped)
            }
            Some(_) => {
                let previous = entry.set_context(Some(flow.clone()));
                drop(previous);
                sock.set_filtered(true);
                self.register_dgram_socket(sock);
                self.incr(Counter::DgramFlowAttached);
                info!(
                    "Datagram flow {:#x} attached ({} -> {})",
                    sock_id,
                    entry.local.map_or_else(|| "*".to_string(), |a| a.to_string()),
                    entry.remote
                );
                Ok(flow)
            }
        }
    }

    fn register_dgram_socket(&self, sock: &Arc<Socket>) {
        let mut sockets = self.dgram_sockets.lock();
        sockets.retain(|w| w.strong_count() > 0);
        if !sockets.iter().any(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(sock))) {
            sockets.push(Arc::downgrade(sock));
        }
    }

    /// Whether a datagram flow should be reaped
    ///
    /// True when an agent has held data past the action timeout without
    /// responding, or when the flow overran its buffer budget.
    pub fn gc_needed(&self, entry: &DgramFlowEntry, now: Instant) -> bool {
        let flow = match entry.context() {
            Some(flow) => flow,
            None => return false,
        };
        let st = flow.lock();
        if st.snd.tail_drop_cnt > 0 || st.rcv.tail_drop_cnt > 0 {
            return true;
        }

        let timeout = self.config().gc.action_timeout();
        st.entries.iter().filter(|e| e.is_linked()).any(|e| {
            let held = Direction::BOTH
                .iter()
                .any(|&dir| st.buf(dir).pending_last > e.buf(dir).pass_offset);
            held && now.saturating_duration_since(e.last_action) >= timeout
        })
    }

    /// Tear a datagram flow down: tell the agents, discard its data and
    /// drop the table's reference
    pub fn gc_perform(&self, sock: &Socket, entry: &DgramFlowEntry) {
        if let Some(flow) = entry.context() {
            let mut st = flow.lock();
            self.with_ctx(&flow, &mut st, |ctx, st| {
                let ordered = st.ordered.clone();
                for unit in ordered {
                    let _ = ctx.dispatch_closed(st, unit);
                }
            });
            st.flags.drop = true;
            for e in st.entries.iter_mut().filter(|e| e.is_linked()) {
                e.flags.detached = true;
            }
            self.flush_queues(&flow, &mut st);
            warn!(
                "Datagram flow {:#x} reaped ({} bytes out, {} bytes in)",
                st.sock_id,
                flow.bytes(Direction::Out),
                flow.bytes(Direction::In)
            );
        }
        self.detach_entry(sock, entry);
        self.incr(Counter::DgramGcTeardown);
    }

    /// Unlink one datagram flow from its socket and release it
    pub fn detach_entry(&self, sock: &Socket, entry: &DgramFlowEntry) {
        if let Some(db) = sock.flow_db() {
            db.remove(entry.flowhash);
        }
        let context = entry.set_context(None);
        drop(context);
    }

    /// Release every datagram flow of a socket
    pub fn detach_db(&self, sock: &Socket) {
        let db = match sock.flow_db() {
            Some(db) => db,
            None => return,
        };
        let entries = db.entries();
        let attached = entries.iter().filter(|e| e.has_context()).count();
        for entry in &entries {
            self.detach_entry(sock, entry);
        }
        sock.set_filtered(false);
        self.dgram_sockets
            .lock()
            .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), sock));
        if attached > 0 {
            self.incr(Counter::SockDetached);
            debug!("Socket {} released {} datagram flows", sock.gencnt, attached);
        }
    }
}

/// Sweeps registered datagram sockets for flows to tear down
pub struct DgramReaper {
    core: Arc<EngineCore>,
}

impl DgramReaper {
    pub fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    /// One sweep; returns the number of flows torn down
    pub fn run(&self, now: Instant) -> usize {
        let sockets: Vec<Arc<Socket>> = {
            let mut sockets = self.core.dgram_sockets.lock();
            sockets.retain(|w| w.strong_count() > 0);
            sockets.iter().filter_map(|w| w.upgrade()).collect()
        };

        let max = self.core.config().gc.max_flows_per_run;
        let mut reaped = 0;
        'sockets: for sock in &sockets {
            let db = match sock.flow_db() {
                Some(db) => db,
                None => continue,
            };
            for entry in db.entries() {
                if reaped >= max {
                    break 'sockets;
                }
                if self.core.gc_needed(&entry, now) {
                    self.core.gc_perform(sock, &entry);
                    reaped += 1;
                }
            }
        }

        if reaped > 0 {
            debug!("Reaper tore down {} datagram flows", reaped);
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use crate::ports::memory::HashFlowDb;
    use crate::ports::FlowDb;
    use crate::protocol::message::{Action, Event};
    use crate::protocol::sockopt::AF_INET;
    use crate::utils::config::EngineConfig;
    use std::time::Duration;

    fn dgram(h: &Harness, gencnt: u64) -> (Arc<Socket>, Arc<HashFlowDb>) {
        let db = Arc::new(HashFlowDb::new());
        let sock = Arc::new(Socket::datagram(gencnt, AF_INET, db.clone()));
        h.layer.register(&sock);
        (sock, db)
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 7], port))
    }

    fn flow_id(db: &HashFlowDb, remote: SocketAddr) -> u64 {
        db.lookup(None, remote)
            .and_then(|e| e.context())
            .map(|f| f.sock_id)
            .unwrap()
    }

    #[test]
    fn test_one_flow_per_peer() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, db) = dgram(&h, 70);

        for port in [53, 53, 123] {
            let disp = h.core.dgram_data_out(&sock, None, peer(port), payload(0, 20)).unwrap();
            assert!(disp.is_held());
        }
        assert_eq!(db.len(), 2);
        assert_eq!(h.core.counters().get(Counter::DgramFlowAttached), 2);

        let id = flow_id(&db, peer(53));
        assert_eq!(id >> 32, 70);
        assert_eq!(h.snapshot(id).snd.pending_last, 40);
        assert!(sock.is_filtered());
    }

    #[test]
    fn test_reinjected_datagram_keeps_peer() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, db) = dgram(&h, 71);
        sock.set_options(0x4);

        h.core.dgram_data_out(&sock, None, peer(53), payload(0, 10)).unwrap();
        let id = flow_id(&db, peer(53));
        h.send(1, Action::pass_all(id)).unwrap();

        let reinjected = h.layer.reinjected();
        assert_eq!(reinjected.len(), 1);
        let meta = reinjected[0].meta.clone().unwrap();
        assert_eq!(meta.peer, Some(peer(53)));
        assert_eq!(meta.options, 0x4);
    }

    #[test]
    fn test_dgram_passes_without_filters() {
        let h = Harness::new();
        let (sock, db) = dgram(&h, 72);
        let disp = h.core.dgram_data_in(&sock, None, peer(53), payload(0, 5)).unwrap();
        assert_eq!(disp, Disposition::Pass(payload(0, 5)));
        assert!(db.is_empty());
    }

    #[test]
    fn test_stream_entry_points_reject_wrong_kind() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (dsock, _db) = dgram(&h, 73);
        assert!(matches!(
            h.core.sock_data_out(&dsock, payload(0, 1)),
            Err(EngineError::InvalidArgument(_))
        ));
        let ssock = Arc::new(Socket::stream(74, AF_INET));
        assert!(matches!(
            h.core.dgram_data_out(&ssock, None, peer(1), payload(0, 1)),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_no_matching_filter_drops() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        h.policy.set_unit(75, 0x8);
        let (sock, db) = dgram(&h, 75);
        assert_eq!(
            h.core.dgram_data_out(&sock, None, peer(53), payload(0, 1)),
            Err(EngineError::Dropped)
        );
        assert!(db.is_empty());
        assert!(h.core.flow_ids().is_empty());
    }

    #[test]
    fn test_idle_flow_reaped_after_action_timeout() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, db) = dgram(&h, 76);
        h.core.dgram_data_out(&sock, None, peer(53), payload(0, 30)).unwrap();
        h.core.dgram_data_out(&sock, None, peer(54), payload(0, 30)).unwrap();
        let id = flow_id(&db, peer(53));
        h.send(1, Action::pass_all(flow_id(&db, peer(54)))).unwrap();

        let weak = {
            let entry = db.lookup(None, peer(53)).unwrap();
            let flow = entry.context().unwrap();
            Arc::downgrade(flow.arc())
        };
        h.events(1);

        let reaper = DgramReaper::new(h.core.clone());
        assert_eq!(reaper.run(Instant::now()), 0);

        let later = Instant::now() + h.core.config().gc.action_timeout() + Duration::from_secs(1);
        assert_eq!(reaper.run(later), 1);

        assert!(db.lookup(None, peer(53)).is_none());
        assert!(db.lookup(None, peer(54)).is_some());
        assert!(weak.upgrade().is_none());
        assert!(h.core.flow_snapshot(id).is_none());
        assert_eq!(h.core.counters().get(Counter::DgramGcTeardown), 1);
        assert_eq!(h.core.counters().get(Counter::FlushOutDrop), 1);
        assert!(h.events(1).iter().any(|e| matches!(e, Event::Closed(c) if c.sock_id == id)));
    }

    #[test]
    fn test_overrun_flow_tail_drops_then_reaped() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, db) = dgram(&h, 77);
        let limit = h.core.config().gc.mbuf_num_max();

        for _ in 0..limit {
            assert!(h.core.dgram_data_out(&sock, None, peer(53), payload(0, 1)).unwrap().is_held());
        }
        assert_eq!(
            h.core.dgram_data_out(&sock, None, peer(53), payload(0, 1)),
            Err(EngineError::Dropped)
        );
        assert_eq!(h.core.counters().get(Counter::DgramTailDrop), 1);

        let id = flow_id(&db, peer(53));
        let snap = h.snapshot(id);
        assert_eq!(snap.snd.pending_last, limit);
        assert_eq!(snap.snd.tail_drop_cnt, 1);

        let reaper = DgramReaper::new(h.core.clone());
        assert_eq!(reaper.run(Instant::now()), 1);
        assert!(db.is_empty());
    }

    #[test]
    fn test_reaper_bounded_per_run() {
        let mut config = EngineConfig::default();
        config.gc.max_flows_per_run = 2;
        let h = Harness::with_config(config);
        h.agent(1, POLICY_UNIT);
        let (sock, db) = dgram(&h, 78);
        for port in 1..=5 {
            h.core.dgram_data_out(&sock, None, peer(port), payload(0, 4)).unwrap();
        }

        let reaper = DgramReaper::new(h.core.clone());
        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(reaper.run(later), 2);
        assert_eq!(reaper.run(later), 2);
        assert_eq!(reaper.run(later), 1);
        assert!(db.is_empty());
    }

    #[test]
    fn test_socket_wide_operations_fan_out() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, db) = dgram(&h, 79);
        h.core.dgram_data_out(&sock, None, peer(1), payload(0, 10)).unwrap();
        h.core.dgram_data_out(&sock, None, peer(2), payload(0, 15)).unwrap();
        assert_eq!(h.core.sock_data_pending(&sock, Direction::Out), 25);

        h.core.sock_is_closed(&sock);
        assert_eq!(h.core.counters().get(Counter::FlushOutClose), 2);

        assert_eq!(db.len(), 2);
        h.core.sock_detach(&sock);
        assert!(db.is_empty());
        assert!(h.core.flow_ids().is_empty());
        assert!(!sock.is_filtered());
        assert_eq!(h.core.counters().get(Counter::SockDetached), 1);
    }

    #[test]
    fn test_dgram_shutdown_without_flows() {
        let h = Harness::new();
        let (sock, _db) = dgram(&h, 80);
        assert_eq!(
            h.core.sock_shutdown(&sock, crate::engine::ShutdownHow::Write),
            Err(EngineError::NotConnected)
        );
    }
}
