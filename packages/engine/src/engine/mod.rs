// packages/engine/src/engine/mod.rs
//! Content-filter engine
//!
//! # Architecture
//!
//! ```text
//!   socket I/O ──► datapath ──► dispatch ──► Transport ──► agent
//!                     ▲                                      │
//!                     │         verdict ◄── control ◄────────┘
//!                     │            │
//!                     └── inject ◄─┘──► SocketLayer::reinject
//!
//!   StatsReporter thread ──► stats batches, DgramReaper sweeps
//! ```
//!
//! [`EngineCore`] owns the agent registry, the flow-id table, the counters
//! and the collaborators. Every operation lives in one of the submodules as
//! an `impl EngineCore` block.
//!
//! # Locking
//!
//! - Flow lock first, registry lock second. Code that walks the registry
//!   snapshots what it needs, drops the registry lock, then takes the flow
//!   lock and re-validates.
//! - The socket-buffer lock is taken with the flow lock held and before
//!   the registry lock (it may sleep on the flow condition).
//! - The stats tracker mutex is a leaf.
//! - A [`FlowRef`] is never dropped while any of these is held: the last
//!   drop tears the flow down, which takes the flow and registry locks.

pub mod control;
pub mod datapath;
pub mod dgram;
pub mod dispatch;
pub mod lifecycle;
pub mod stats;
pub mod verdict;

pub use datapath::Disposition;
pub use dgram::DgramReaper;
pub use lifecycle::{ShutdownHow, ShutdownOutcome};
pub use stats::{StatsReporter, StatsTracker};

use crate::filter::{FilterRegistry, FilterSummary, RegistryLock};
use crate::flow::{Flow, FlowOwner, FlowRef, FlowState, Socket};
use crate::observability::{Counter, CounterSnapshot, FilterCounters};
use crate::ports::memory::NoopSigner;
use crate::ports::{PolicyOracle, Signer, SocketLayer, Transport};
use crate::protocol::message::{Direction, SockId};
use crate::utils::config::EngineConfig;
use crate::utils::errors::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// The engine's collaborators
#[derive(Clone)]
pub struct Ports {
    pub transport: Arc<dyn Transport>,

    pub policy: Arc<dyn PolicyOracle>,

    pub socket_layer: Arc<dyn SocketLayer>,

    /// Defaults to [`NoopSigner`]
    pub signer: Arc<dyn Signer>,
}

impl Ports {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: Arc<dyn PolicyOracle>,
        socket_layer: Arc<dyn SocketLayer>,
    ) -> Self {
        Self {
            transport,
            policy,
            socket_layer,
            signer: Arc::new(NoopSigner),
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = signer;
        self
    }
}

/// Shared engine state
pub struct EngineCore {
    config: EngineConfig,

    ports: Ports,

    /// Agent registry behind the process-wide reader/writer lock
    pub(crate) registry: RegistryLock,

    /// Live flows by id; lookups must `try_retain`
    pub(crate) flows: DashMap<SockId, Arc<Flow>>,

    counters: FilterCounters,

    pub(crate) stats: StatsTracker,

    /// Datagram sockets the reaper sweeps
    pub(crate) dgram_sockets: Mutex<Vec<Weak<Socket>>>,

    /// Wakes the background reporter
    wake_tx: Sender<()>,

    wake_rx: Receiver<()>,

    self_ref: Weak<EngineCore>,
}

/// Borrowed context for data-path work on one flow: the flow lock is held
/// by the caller and `reg` is a registry read guard.
pub(crate) struct FlowCtx<'a> {
    pub core: &'a EngineCore,

    pub flow: &'a Flow,

    pub reg: &'a FilterRegistry,
}

impl EngineCore {
    pub fn new(config: EngineConfig, ports: Ports) -> Arc<Self> {
        let (wake_tx, wake_rx) = bounded(1);
        let stats = StatsTracker::new(config.stats.clone());

        Arc::new_cyclic(|self_ref| EngineCore {
            config,
            ports,
            registry: RegistryLock::new(),
            flows: DashMap::new(),
            counters: FilterCounters::new(),
            stats,
            dgram_sockets: Mutex::new(Vec::new()),
            wake_tx,
            wake_rx,
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    pub(crate) fn counters_table(&self) -> &FilterCounters {
        &self.counters
    }

    #[inline]
    pub(crate) fn incr(&self, counter: Counter) {
        self.counters.incr(counter);
    }

    #[inline]
    pub(crate) fn add(&self, counter: Counter, n: u64) {
        self.counters.add(counter, n);
    }

    pub(crate) fn owner(&self) -> Weak<dyn FlowOwner> {
        self.self_ref.clone()
    }

    /// Nudge the reporter thread; a pending nudge is enough
    pub(crate) fn wake_reporter(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn wake_receiver(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }

    /// Number of active agents
    pub fn active_count(&self) -> usize {
        self.registry.read().active_count()
    }

    /// Register a new flow and hand back its first reference
    pub(crate) fn create_flow(&self, socket: Arc<Socket>, state: FlowState) -> FlowRef {
        let sock_id = state.sock_id;
        let flow = Flow::create(socket, state, self.owner());
        self.flows.insert(sock_id, Arc::clone(flow.arc()));
        self.incr(Counter::FlowAllocOk);
        debug!("Allocated flow {:#x}", sock_id);
        flow
    }

    /// Look a flow up by id and retain it
    pub(crate) fn lookup_flow(&self, sock_id: SockId) -> Option<FlowRef> {
        let arc = self.flows.get(&sock_id).map(|f| Arc::clone(f.value()))?;
        arc.try_retain()
    }

    /// Run `f` with the registry read lock, the flow lock being held
    pub(crate) fn with_ctx<R>(
        &self,
        flow: &Flow,
        st: &mut FlowState,
        f: impl FnOnce(&FlowCtx<'_>, &mut FlowState) -> R,
    ) -> R {
        let reg = self.registry.read();
        let ctx = FlowCtx {
            core: self,
            flow,
            reg: &reg,
        };
        f(&ctx, st)
    }

    /// Run `f` owning the socket buffer for `dir`, then the registry read lock
    pub(crate) fn with_sockbuf<R>(
        &self,
        flow: &Flow,
        st: &mut MutexGuard<'_, FlowState>,
        dir: Direction,
        f: impl FnOnce(&FlowCtx<'_>, &mut FlowState) -> R,
    ) -> R {
        flow.acquire_sockbuf(st, dir);
        let result = self.with_ctx(flow, st, f);
        flow.release_sockbuf(st, dir);
        result
    }

    /// Tear down a flow whose last reference was dropped
    fn free_flow(&self, flow: &Arc<Flow>) {
        let sock_id = flow.sock_id;
        {
            let mut st = flow.lock();

            let mut out_drained = st.snd.inject_q.drain();
            let mut in_drained = st.rcv.inject_q.drain();
            for entry in st.entries.iter_mut() {
                out_drained += entry.drain(Direction::Out);
                in_drained += entry.drain(Direction::In);
            }
            if out_drained > 0 {
                self.incr(Counter::FlushOutFree);
            }
            if in_drained > 0 {
                self.incr(Counter::FlushInFree);
            }

            let units: Vec<u32> = st.linked_units().collect();
            let mut reg = self.registry.write();
            for unit in units {
                if let Some(cfc) = reg.get_mut(unit) {
                    cfc.unlink(sock_id);
                }
                st.unlink_entry(unit);
            }
        }

        self.stats.remove(sock_id);
        self.flows.remove_if(&sock_id, |_, f| Arc::ptr_eq(f, flow));
        self.incr(Counter::FlowFreed);
        debug!("Freed flow {:#x}", sock_id);
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn filter_summary(&self, unit: u32) -> Option<FilterSummary> {
        self.registry.read().get(unit).map(|cfc| cfc.summary())
    }

    /// Offsets and queue lengths of one flow
    pub fn flow_snapshot(&self, sock_id: SockId) -> Option<FlowSnapshot> {
        let flow = self.lookup_flow(sock_id)?;
        let snapshot = {
            let st = flow.lock();
            FlowSnapshot::capture(&flow, &st)
        };
        Some(snapshot)
    }

    /// Ids of every live flow
    pub fn flow_ids(&self) -> Vec<SockId> {
        self.flows.iter().map(|f| *f.key()).collect()
    }
}

impl FlowOwner for EngineCore {
    fn release(&self, flow: &Arc<Flow>) {
        self.free_flow(flow);
    }
}

/// Per-direction view of a flow
#[derive(Debug, Clone, Serialize)]
pub struct BufSnapshot {
    pub pending_first: u64,
    pub pending_last: u64,
    pub pass_offset: u64,
    pub inject_q_len: u64,
    pub mbcnt: u64,
    pub tail_drop_cnt: u64,
    pub bytes: u64,
}

/// Per-direction view of one entry
#[derive(Debug, Clone, Serialize)]
pub struct EntryBufSnapshot {
    pub pass_offset: u64,
    pub peek_offset: u64,
    pub peeked: u64,
    pub ctl_q_start: u64,
    pub ctl_q_len: u64,
    pub pending_q_start: u64,
    pub pending_q_len: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub unit: u32,
    pub linked: bool,
    pub sent_sock_attached: bool,
    pub data_start: bool,
    pub flow_controlled: bool,
    pub detached: bool,
    pub snd: EntryBufSnapshot,
    pub rcv: EntryBufSnapshot,
}

/// Point-in-time view of a flow, for tests and the demo binary
#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    pub sock_id: SockId,
    pub refs: u32,
    pub drop: bool,
    pub close_wait: bool,
    pub shut_rd: bool,
    pub shut_wr: bool,
    pub initial_verdict: bool,
    pub snd: BufSnapshot,
    pub rcv: BufSnapshot,
    /// Entries in chain order
    pub entries: Vec<EntrySnapshot>,
}

impl FlowSnapshot {
    fn capture(flow: &Flow, st: &FlowState) -> Self {
        let buf = |dir: Direction| {
            let b = st.buf(dir);
            BufSnapshot {
                pending_first: b.pending_first,
                pending_last: b.pending_last,
                pass_offset: b.pass_offset,
                inject_q_len: b.inject_q.len(),
                mbcnt: b.mbcnt,
                tail_drop_cnt: b.tail_drop_cnt,
                bytes: flow.bytes(dir),
            }
        };
        let entry_buf = |unit: u32, dir: Direction| {
            let b = st.entry(unit).buf(dir);
            EntryBufSnapshot {
                pass_offset: b.pass_offset,
                peek_offset: b.peek_offset,
                peeked: b.peeked,
                ctl_q_start: b.ctl_q.offset_first(),
                ctl_q_len: b.ctl_q.len(),
                pending_q_start: b.pending_q.offset_first(),
                pending_q_len: b.pending_q.len(),
            }
        };

        let entries = st
            .ordered
            .iter()
            .map(|unit| {
                let entry = st.entry(*unit);
                EntrySnapshot {
                    unit: *unit,
                    linked: entry.is_linked(),
                    sent_sock_attached: entry.flags.sent_sock_attached,
                    data_start: entry.flags.data_start,
                    flow_controlled: entry.flags.flow_controlled,
                    detached: entry.flags.detached,
                    snd: entry_buf(*unit, Direction::Out),
                    rcv: entry_buf(*unit, Direction::In),
                }
            })
            .collect();

        Self {
            sock_id: st.sock_id,
            refs: flow.ref_count(),
            drop: st.flags.drop,
            close_wait: st.flags.close_wait,
            shut_rd: st.flags.shut_rd,
            shut_wr: st.flags.shut_wr,
            initial_verdict: st.flags.initial_verdict,
            snd: buf(Direction::Out),
            rcv: buf(Direction::In),
            entries,
        }
    }

    pub fn entry(&self, unit: u32) -> Option<&EntrySnapshot> {
        self.entries.iter().find(|e| e.unit == unit)
    }

    pub fn buf(&self, dir: Direction) -> &BufSnapshot {
        match dir {
            Direction::Out => &self.snd,
            Direction::In => &self.rcv,
        }
    }
}

impl EntrySnapshot {
    pub fn buf(&self, dir: Direction) -> &EntryBufSnapshot {
        match dir {
            Direction::Out => &self.snd,
            Direction::In => &self.rcv,
        }
    }
}

/// Engine handle owning the background reporter
pub struct ContentFilterEngine {
    core: Arc<EngineCore>,

    reporter: Option<StatsReporter>,
}

impl ContentFilterEngine {
    pub fn new(config: EngineConfig, ports: Ports) -> Result<Self> {
        config.validate()?;
        info!(
            "Content filter engine starting (close wait {}ms, gc timeout {}s)",
            config.datapath.close_wait_timeout_ms, config.gc.action_timeout_secs
        );
        Ok(Self {
            core: EngineCore::new(config, ports),
            reporter: None,
        })
    }

    /// Start the stats / reaper thread
    pub fn start_reporter(&mut self) -> Result<()> {
        if self.reporter.is_none() {
            self.reporter = Some(StatsReporter::spawn(Arc::clone(&self.core))?);
        }
        Ok(())
    }

    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    /// Stop the reporter and wait for it
    pub fn shutdown(&mut self) {
        if let Some(reporter) = self.reporter.take() {
            reporter.stop();
        }
    }
}

impl Deref for ContentFilterEngine {
    type Target = EngineCore;

    fn deref(&self) -> &EngineCore {
        &self.core
    }
}

impl Drop for ContentFilterEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for the engine tests

    use super::*;
    use crate::ports::memory::{ChannelTransport, RecordingSocketLayer, StaticPolicy};
    use crate::protocol::message::{Action, ConnDirection, Event};
    use crate::protocol::sockopt::{OptValue, SockOpt, AF_INET};
    use std::net::SocketAddr;

    pub struct Harness {
        pub core: Arc<EngineCore>,
        pub transport: Arc<ChannelTransport>,
        pub policy: Arc<StaticPolicy>,
        pub layer: Arc<RecordingSocketLayer>,
    }

    pub const POLICY_UNIT: u32 = 0x1;

    impl Harness {
        pub fn new() -> Self {
            Self::with_config(EngineConfig::default())
        }

        pub fn with_config(config: EngineConfig) -> Self {
            let transport = Arc::new(ChannelTransport::new(4096));
            let policy = Arc::new(StaticPolicy::new(POLICY_UNIT));
            let layer = Arc::new(RecordingSocketLayer::new());
            let ports = Ports::new(transport.clone(), policy.clone(), layer.clone());
            Self {
                core: EngineCore::new(config, ports),
                transport,
                policy,
                layer,
            }
        }

        /// Connect an agent on `unit` receiving `control_unit` traffic
        pub fn agent(&self, unit: u32, control_unit: u32) {
            self.core.ctl_connect(unit).unwrap();
            self.core
                .ctl_setopt(unit, SockOpt::NecpControlUnit, OptValue::ControlUnit(control_unit))
                .unwrap();
        }

        /// Attach a fresh stream socket
        pub fn stream(&self, gencnt: u64) -> (Arc<Socket>, SockId) {
            let sock = Arc::new(Socket::stream(gencnt, AF_INET).with_pid(100));
            self.layer.register(&sock);
            let local: SocketAddr = "10.0.0.1:5000".parse().unwrap();
            let remote: SocketAddr = "93.184.216.34:443".parse().unwrap();
            self.core
                .sock_attach(&sock, Some(local), Some(remote), ConnDirection::Out)
                .unwrap();
            let sock_id = sock.flow().map(|f| f.sock_id).unwrap_or(0);
            (sock, sock_id)
        }

        pub fn send(&self, unit: u32, action: Action) -> Result<()> {
            self.core.ctl_send(unit, &action.encode())
        }

        pub fn events(&self, unit: u32) -> Vec<Event> {
            self.transport.drain_events(unit)
        }

        pub fn snapshot(&self, sock_id: SockId) -> FlowSnapshot {
            self.core.flow_snapshot(sock_id).unwrap()
        }
    }

    /// Bytes `0..len` as a span
    pub fn payload(start: u8, len: usize) -> crate::queue::Span {
        crate::queue::Span::new((0..len).map(|i| start.wrapping_add(i as u8)).collect::<Vec<u8>>())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::ports::memory::{ChannelTransport, RecordingSocketLayer, StaticPolicy};

    #[test]
    fn test_flow_freed_on_detach() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, sock_id) = h.stream(1);
        assert!(h.core.flow_snapshot(sock_id).is_some());
        assert_eq!(h.core.filter_summary(1).unwrap().sock_count, 1);

        h.core.sock_detach(&sock);
        assert!(h.core.flow_snapshot(sock_id).is_none());
        assert!(h.core.flow_ids().is_empty());
        assert_eq!(h.core.filter_summary(1).unwrap().sock_count, 0);

        let counters = h.core.counters();
        assert_eq!(counters.get(Counter::FlowAllocOk), 1);
        assert_eq!(counters.get(Counter::FlowFreed), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (_sock, sock_id) = h.stream(2);
        let json = serde_json::to_value(h.snapshot(sock_id)).unwrap();
        assert_eq!(json["sock_id"], sock_id);
        assert_eq!(json["entries"][0]["unit"], 1);
    }

    #[test]
    fn test_engine_rejects_bad_config() {
        let mut config = EngineConfig::default();
        config.stats.max_flows_per_batch = 0;
        let ports = Ports::new(
            Arc::new(ChannelTransport::default()),
            Arc::new(StaticPolicy::new(1)),
            Arc::new(RecordingSocketLayer::new()),
        );
        assert!(ContentFilterEngine::new(config, ports).is_err());
    }

    #[test]
    fn test_reporter_start_stop() {
        let ports = Ports::new(
            Arc::new(ChannelTransport::default()),
            Arc::new(StaticPolicy::new(1)),
            Arc::new(RecordingSocketLayer::new()),
        );
        let mut engine = ContentFilterEngine::new(EngineConfig::default(), ports).unwrap();
        engine.start_reporter().unwrap();
        engine.start_reporter().unwrap();
        assert_eq!(engine.active_count(), 0);
        engine.shutdown();
    }
}
