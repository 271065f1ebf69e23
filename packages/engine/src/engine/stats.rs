// packages/engine/src/engine/stats.rs
//! Periodic flow statistics
//!
//! ```text
//!  DATA_UPDATE(stats_frequency) ──► StatsTracker ◄── StatsReporter thread
//!                                        │              │  every run_interval_ms
//!                                        ▼              │  or when woken
//!                              per-unit STATS batches ──┘
//!                                                       └─► DgramReaper every gc.interval_ms
//! ```
//!
//! The tracker keeps its own list of reporting flows behind a leaf mutex.
//! Byte counts are read from the flows' atomic counters, so collecting
//! never takes a flow lock.

use crate::engine::{DgramReaper, EngineCore};
use crate::filter::MAX_CONTENT_FILTER;
use crate::flow::Flow;
use crate::observability::Counter;
use crate::protocol::message::{Direction, Event, FlowStatsRecord, SockId};
use crate::utils::config::StatsConfig;
use crate::utils::errors::{EngineError, Result};
use crossbeam_channel::{bounded, select, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Reporting state of one agent on one flow
#[derive(Debug, Clone, Copy)]
struct StatsSlot {
    /// Report interval in milliseconds, already clamped
    frequency_ms: u32,

    last_report: Instant,

    reported_in: u64,

    reported_out: u64,
}

impl StatsSlot {
    fn due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_report)
            >= Duration::from_millis(u64::from(self.frequency_ms))
    }
}

struct TrackedFlow {
    flow: Arc<Flow>,

    slots: [Option<StatsSlot>; MAX_CONTENT_FILTER],
}

impl TrackedFlow {
    fn slot_mut(&mut self, unit: u32) -> Option<&mut Option<StatsSlot>> {
        let idx = (unit as usize).checked_sub(1)?;
        self.slots.get_mut(idx)
    }

    fn reporting(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }
}

/// Flows with at least one agent asking for statistics
pub struct StatsTracker {
    config: StatsConfig,

    /// In insertion order; a report run resumes from a saved flow id
    flows: Mutex<Vec<TrackedFlow>>,
}

impl StatsTracker {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            flows: Mutex::new(Vec::new()),
        }
    }

    /// Number of flows currently reporting
    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.lock().is_empty()
    }

    /// Turn reporting for `unit` on (`frequency_ms > 0`) or off
    ///
    /// Returns true when the list went from empty to non-empty and the
    /// reporter should be woken.
    pub fn toggle(&self, flow: &Arc<Flow>, unit: u32, frequency_ms: u32) -> bool {
        let mut flows = self.flows.lock();
        let pos = flows.iter().position(|t| t.flow.sock_id == flow.sock_id);

        if frequency_ms == 0 {
            if let Some(pos) = pos {
                if let Some(slot) = flows[pos].slot_mut(unit) {
                    *slot = None;
                }
                if !flows[pos].reporting() {
                    flows.remove(pos);
                    trace!("Flow {:#x} stats off", flow.sock_id);
                }
            }
            return false;
        }

        let frequency_ms = frequency_ms.max(self.config.min_interval_ms);
        let was_empty = flows.is_empty();
        let pos = match pos {
            Some(pos) => pos,
            None => {
                flows.push(TrackedFlow {
                    flow: Arc::clone(flow),
                    slots: [None; MAX_CONTENT_FILTER],
                });
                flows.len() - 1
            }
        };
        if let Some(slot) = flows[pos].slot_mut(unit) {
            match slot {
                Some(s) if s.frequency_ms == frequency_ms => {}
                Some(s) => {
                    s.frequency_ms = frequency_ms;
                    s.last_report = Instant::now();
                }
                None => {
                    *slot = Some(StatsSlot {
                        frequency_ms,
                        last_report: Instant::now(),
                        reported_in: 0,
                        reported_out: 0,
                    });
                }
            }
        }
        debug!(
            "Flow {:#x} unit {} stats every {}ms",
            flow.sock_id, unit, frequency_ms
        );
        was_empty
    }

    /// Forget a flow that is being freed
    pub fn remove(&self, sock_id: SockId) {
        self.flows.lock().retain(|t| t.flow.sock_id != sock_id);
    }

    /// Forget every slot of a departing agent
    pub fn remove_unit(&self, unit: u32) {
        let mut flows = self.flows.lock();
        for tracked in flows.iter_mut() {
            if let Some(slot) = tracked.slot_mut(unit) {
                *slot = None;
            }
        }
        flows.retain(TrackedFlow::reporting);
    }

    /// Gather one batch of due records per unit
    ///
    /// Walks from `cursor` (or the head) and stops after
    /// `max_flows_per_batch` flows produced a record, saving the next
    /// flow id in `cursor`. `cursor` is `None` once the walk reached the
    /// end.
    fn collect(
        &self,
        cursor: &mut Option<SockId>,
        now: Instant,
    ) -> BTreeMap<u32, Vec<FlowStatsRecord>> {
        let mut batch: BTreeMap<u32, Vec<FlowStatsRecord>> = BTreeMap::new();
        let mut flows = self.flows.lock();

        let start = cursor
            .take()
            .and_then(|id| flows.iter().position(|t| t.flow.sock_id == id))
            .unwrap_or(0);

        let mut reported_flows = 0;
        for tracked in flows.iter_mut().skip(start) {
            if reported_flows >= self.config.max_flows_per_batch {
                *cursor = Some(tracked.flow.sock_id);
                break;
            }

            let flow = Arc::clone(&tracked.flow);
            let bytes_in = flow.bytes(Direction::In);
            let bytes_out = flow.bytes(Direction::Out);
            let mut reported = false;

            for (idx, slot) in tracked.slots.iter_mut().enumerate() {
                let slot = match slot {
                    Some(slot) if slot.due(now) => slot,
                    _ => continue,
                };
                if slot.reported_in >= bytes_in && slot.reported_out >= bytes_out {
                    continue;
                }
                let unit = idx as u32 + 1;
                let local = if flow.claim_laddr(unit) { flow.local } else { None };
                batch.entry(unit).or_default().push(FlowStatsRecord {
                    sock_id: flow.sock_id,
                    byte_inbound_count: bytes_in,
                    byte_outbound_count: bytes_out,
                    local,
                });
                slot.last_report = now;
                slot.reported_in = bytes_in;
                slot.reported_out = bytes_out;
                reported = true;
            }
            if reported {
                reported_flows += 1;
            }
        }
        batch
    }
}

impl EngineCore {
    /// One stats run; returns the number of flow records sent
    pub fn report_stats(&self, now: Instant) -> usize {
        let mut cursor = None;
        let mut sent = 0;
        loop {
            let batch = self.stats.collect(&mut cursor, now);
            if batch.is_empty() {
                break;
            }

            let reg = self.registry.read();
            for (unit, records) in batch {
                let cfc = match reg.get(unit) {
                    Some(cfc) => cfc,
                    None => continue,
                };
                if cfc.is_flow_controlled() {
                    self.incr(Counter::StatsEventFlowControl);
                    continue;
                }
                let count = records.len();
                let result = self
                    .ports()
                    .transport
                    .enqueue(unit, Event::Stats(records).encode())
                    .map_err(EngineError::from);
                match result {
                    Ok(()) => {
                        self.incr(Counter::StatsEventOk);
                        sent += count;
                        trace!("Sent {} stats records to unit {}", count, unit);
                    }
                    Err(EngineError::FlowControlled) => {
                        cfc.set_flow_controlled();
                        self.incr(Counter::StatsEventFlowControl);
                    }
                    Err(e) => {
                        self.incr(Counter::StatsEventFail);
                        warn!("Stats event to unit {} failed: {}", unit, e);
                    }
                }
            }
            drop(reg);

            if cursor.is_none() {
                break;
            }
        }
        sent
    }
}

/// Background thread sending stats and reaping datagram flows
pub struct StatsReporter {
    shutdown_tx: Sender<()>,

    handle: Option<JoinHandle<()>>,
}

impl StatsReporter {
    pub fn spawn(core: Arc<EngineCore>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let wake_rx = core.wake_receiver();

        let handle = thread::Builder::new()
            .name("cfil-stats".to_string())
            .spawn(move || {
                let run_interval = Duration::from_millis(core.config().stats.run_interval_ms);
                let gc_interval = Duration::from_millis(core.config().gc.interval_ms);
                let reaper = DgramReaper::new(Arc::clone(&core));
                let mut next_gc = Instant::now() + gc_interval;

                loop {
                    let until_gc = next_gc.saturating_duration_since(Instant::now());
                    let timeout = if core.stats.is_empty() {
                        until_gc
                    } else {
                        until_gc.min(run_interval)
                    };

                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(wake_rx) -> _ => {},
                        default(timeout) => {},
                    }

                    let now = Instant::now();
                    if !core.stats.is_empty() {
                        core.report_stats(now);
                    }
                    if now >= next_gc {
                        reaper.run(now);
                        next_gc = now + gc_interval;
                    }
                }
                debug!("Stats reporter exiting");
            })
            .map_err(|e| EngineError::NoMemory(format!("stats thread: {}", e)))?;

        info!("Stats reporter started");
        Ok(Self {
            shutdown_tx,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.shutdown_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Stats reporter panicked");
            }
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use crate::engine::{ContentFilterEngine, Ports};
    use crate::ports::memory::{ChannelTransport, RecordingSocketLayer, StaticPolicy};
    use crate::protocol::message::Action;
    use crate::protocol::sockopt::AF_INET;
    use crate::flow::Socket;
    use crate::protocol::message::ConnDirection;
    use crate::utils::config::EngineConfig;

    fn request_stats(sock_id: SockId, frequency_ms: u32) -> Action {
        Action::DataUpdate {
            sock_id,
            out_pass_offset: 0,
            out_peek_offset: 0,
            in_pass_offset: 0,
            in_peek_offset: 0,
            stats_frequency: frequency_ms,
        }
    }

    fn stats_events(h: &Harness, unit: u32) -> Vec<Vec<FlowStatsRecord>> {
        h.events(unit)
            .into_iter()
            .filter_map(|e| match e {
                Event::Stats(records) => Some(records),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_toggle_wakes_only_first_flow() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock_a, _) = h.stream(90);
        let (sock_b, _) = h.stream(91);
        let a = sock_a.flow().unwrap();
        let b = sock_b.flow().unwrap();

        assert!(h.core.stats.toggle(a.arc(), 1, 100));
        assert!(!h.core.stats.toggle(b.arc(), 1, 100));
        assert!(!h.core.stats.toggle(a.arc(), 1, 2000));
        assert_eq!(h.core.stats.len(), 2);

        h.core.stats.toggle(a.arc(), 1, 0);
        assert_eq!(h.core.stats.len(), 1);
        h.core.stats.remove_unit(1);
        assert!(h.core.stats.is_empty());
    }

    #[test]
    fn test_report_after_interval_with_new_bytes() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, sock_id) = h.stream(92);
        h.send(1, Action::pass_all(sock_id)).unwrap();
        h.send(1, request_stats(sock_id, 10)).unwrap();
        h.core.sock_data_out(&sock, payload(0, 70)).unwrap();
        h.core.sock_data_in(&sock, payload(0, 30)).unwrap();
        h.events(1);

        // Clamped up to the configured minimum
        let min = Duration::from_millis(u64::from(h.core.config().stats.min_interval_ms));
        assert_eq!(h.core.report_stats(Instant::now()), 0);

        let later = Instant::now() + min;
        assert_eq!(h.core.report_stats(later), 1);
        let events = stats_events(&h, 1);
        assert_eq!(events.len(), 1);
        let record = &events[0][0];
        assert_eq!(record.sock_id, sock_id);
        assert_eq!(record.byte_outbound_count, 70);
        assert_eq!(record.byte_inbound_count, 30);
        assert_eq!(record.local, Some("10.0.0.1:5000".parse().unwrap()));

        // Nothing new to report
        assert_eq!(h.core.report_stats(later + min), 0);

        h.core.sock_data_out(&sock, payload(0, 5)).unwrap();
        assert_eq!(h.core.report_stats(later + min * 2), 1);
        let events = stats_events(&h, 1);
        assert_eq!(events[0][0].byte_outbound_count, 75);
        // Local address goes out once per agent
        assert_eq!(events[0][0].local, None);
        assert_eq!(h.core.counters().get(Counter::StatsEventOk), 2);
    }

    #[test]
    fn test_report_batches_bounded() {
        let mut config = EngineConfig::default();
        config.stats.max_flows_per_batch = 2;
        let h = Harness::with_config(config);
        h.agent(1, POLICY_UNIT);

        let mut socks = Vec::new();
        for gencnt in 93..98 {
            let (sock, sock_id) = h.stream(gencnt);
            h.send(1, Action::pass_all(sock_id)).unwrap();
            h.send(1, request_stats(sock_id, 500)).unwrap();
            h.core.sock_data_out(&sock, payload(0, 8)).unwrap();
            socks.push(sock);
        }
        h.events(1);

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(h.core.report_stats(later), 5);
        let sizes: Vec<usize> = stats_events(&h, 1).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_flow_controlled_agent_skipped() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, sock_id) = h.stream(98);
        h.send(1, Action::pass_all(sock_id)).unwrap();
        h.send(1, request_stats(sock_id, 500)).unwrap();
        h.core.sock_data_out(&sock, payload(0, 8)).unwrap();
        h.events(1);

        h.transport.set_backpressure(true);
        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(h.core.report_stats(later), 0);
        assert!(h.core.filter_summary(1).unwrap().flow_controlled);
        assert_eq!(h.core.counters().get(Counter::StatsEventFlowControl), 1);
    }

    #[test]
    fn test_update_without_frequency_stops_reporting() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (_sock, sock_id) = h.stream(89);
        h.send(1, request_stats(sock_id, 500)).unwrap();
        assert_eq!(h.core.stats.len(), 1);
        h.send(1, Action::update(sock_id, Direction::Out, 0, 10)).unwrap();
        assert!(h.core.stats.is_empty());
    }

    #[test]
    fn test_freed_flow_leaves_tracker() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, sock_id) = h.stream(99);
        h.send(1, request_stats(sock_id, 500)).unwrap();
        assert_eq!(h.core.stats.len(), 1);
        h.core.sock_detach(&sock);
        assert!(h.core.stats.is_empty());
        assert!(h.core.flow_ids().is_empty());
    }

    #[test]
    fn test_reporter_thread_sends_stats() {
        let mut config = EngineConfig::default();
        config.stats.min_interval_ms = 10;
        config.stats.run_interval_ms = 10;
        let transport = Arc::new(ChannelTransport::new(1024));
        let policy = Arc::new(StaticPolicy::new(POLICY_UNIT));
        let layer = Arc::new(RecordingSocketLayer::new());
        let ports = Ports::new(transport.clone(), policy, layer);
        let mut engine = ContentFilterEngine::new(config, ports).unwrap();

        engine.ctl_connect(1).unwrap();
        engine
            .ctl_setopt(
                1,
                crate::protocol::sockopt::SockOpt::NecpControlUnit,
                crate::protocol::sockopt::OptValue::ControlUnit(POLICY_UNIT),
            )
            .unwrap();
        let sock = Arc::new(Socket::stream(100, AF_INET));
        engine.sock_attach(&sock, None, None, ConnDirection::Out).unwrap();
        let sock_id = sock.flow().unwrap().sock_id;
        engine.ctl_send(1, &Action::pass_all(sock_id).encode()).unwrap();
        engine.ctl_send(1, &request_stats(sock_id, 10).encode()).unwrap();
        engine.sock_data_out(&sock, payload(0, 12)).unwrap();

        engine.start_reporter().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut found = false;
        while Instant::now() < deadline && !found {
            thread::sleep(Duration::from_millis(20));
            found = transport
                .drain_events(1)
                .iter()
                .any(|e| matches!(e, Event::Stats(r) if r[0].byte_outbound_count == 12));
        }
        engine.shutdown();
        assert!(found);
    }
}
