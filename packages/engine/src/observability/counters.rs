// packages/engine/src/observability/counters.rs
//! Engine-wide traffic and error counters
//!
//! Every counter is a relaxed `AtomicU64` so the data path can bump it
//! under a shared registry lock. Each increment is mirrored to the
//! `metrics` facade as `cfil_<name>_total`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($variant:ident => $name:literal,)+) => {
        /// Named engine counter
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Counter {
            $($variant,)+
        }

        impl Counter {
            pub const ALL: &'static [Counter] = &[$(Counter::$variant,)+];

            /// Short name, used as snapshot key
            pub fn name(self) -> &'static str {
                match self {
                    $(Counter::$variant => $name,)+
                }
            }

            fn metric_name(self) -> &'static str {
                match self {
                    $(Counter::$variant => concat!("cfil_", $name, "_total"),)+
                }
            }
        }
    };
}

counters! {
    CtlConnectOk => "ctl_connect_ok",
    CtlDisconnectOk => "ctl_disconnect_ok",
    CtlSendOk => "ctl_send_ok",
    CtlSendBad => "ctl_send_bad",
    CtlActionDataUpdate => "ctl_action_data_update",
    CtlActionDrop => "ctl_action_drop",
    CtlActionBadOp => "ctl_action_bad_op",
    CtlActionBadLen => "ctl_action_bad_len",
    CtlRcvdFlowLift => "ctl_rcvd_flow_lift",
    CtlQNotStarted => "ctl_q_not_started",
    SockAttached => "sock_attached",
    SockDetached => "sock_detached",
    SockAttachInVain => "sock_attach_in_vain",
    SockAttachAlready => "sock_attach_already",
    SockAttachFailed => "sock_attach_failed",
    SockUserspaceOnly => "sock_userspace_only",
    FlowAllocOk => "flow_alloc_ok",
    FlowFreed => "flow_freed",
    AttachEventOk => "attach_event_ok",
    AttachEventFlowControl => "attach_event_flow_control",
    AttachEventFail => "attach_event_fail",
    DataEventOk => "data_event_ok",
    DataEventFlowControl => "data_event_flow_control",
    DataEventFail => "data_event_fail",
    DisconnectOutEventOk => "disconnect_out_event_ok",
    DisconnectInEventOk => "disconnect_in_event_ok",
    DisconnectEventFlowControl => "disconnect_event_flow_control",
    DisconnectEventFail => "disconnect_event_fail",
    ClosedEventOk => "closed_event_ok",
    ClosedEventFlowControl => "closed_event_flow_control",
    ClosedEventFail => "closed_event_fail",
    StatsEventOk => "stats_event_ok",
    StatsEventFlowControl => "stats_event_flow_control",
    StatsEventFail => "stats_event_fail",
    CtlQOutEnqueued => "ctl_q_out_enqueued_bytes",
    CtlQInEnqueued => "ctl_q_in_enqueued_bytes",
    CtlQOutPeeked => "ctl_q_out_peeked_bytes",
    CtlQInPeeked => "ctl_q_in_peeked_bytes",
    PendingQOutEnqueued => "pending_q_out_enqueued_bytes",
    PendingQInEnqueued => "pending_q_in_enqueued_bytes",
    InjectQOutEnqueued => "inject_q_out_enqueued_bytes",
    InjectQInEnqueued => "inject_q_in_enqueued_bytes",
    InjectQOutPassed => "inject_q_out_passed_bytes",
    InjectQInPassed => "inject_q_in_passed_bytes",
    InjectQOutFail => "inject_q_out_fail",
    InjectQInFail => "inject_q_in_fail",
    FlushOutDrop => "flush_out_drop",
    FlushInDrop => "flush_in_drop",
    FlushOutClose => "flush_out_close",
    FlushInClose => "flush_in_close",
    FlushOutFree => "flush_out_free",
    FlushInFree => "flush_in_free",
    CloseWaitTimeout => "close_wait_timeout",
    DgramTailDrop => "dgram_tail_drop",
    DgramGcTeardown => "dgram_gc_teardown",
    DgramFlowAttached => "dgram_flow_attached",
}

/// Atomic counter table
pub struct FilterCounters {
    values: Vec<AtomicU64>,
}

impl FilterCounters {
    pub fn new() -> Self {
        Self {
            values: Counter::ALL.iter().map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    #[inline]
    pub fn add(&self, counter: Counter, n: u64) {
        if n == 0 {
            return;
        }
        self.values[counter as usize].fetch_add(n, Ordering::Relaxed);
        metrics::counter!(counter.metric_name()).increment(n);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> CounterSnapshot {
        let values = Counter::ALL
            .iter()
            .map(|c| (c.name(), self.get(*c)))
            .collect();
        CounterSnapshot { values }
    }
}

impl Default for FilterCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable counter snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub values: BTreeMap<&'static str, u64>,
}

impl CounterSnapshot {
    pub fn get(&self, counter: Counter) -> u64 {
        self.values.get(counter.name()).copied().unwrap_or(0)
    }

    /// Total control messages seen, good and bad
    pub fn ctl_messages(&self) -> u64 {
        self.get(Counter::CtlSendOk) + self.get(Counter::CtlSendBad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_incr_and_snapshot() {
        let counters = FilterCounters::new();
        counters.incr(Counter::CtlSendOk);
        counters.add(Counter::CtlQOutEnqueued, 100);

        let snap = counters.snapshot();
        assert_eq!(snap.get(Counter::CtlSendOk), 1);
        assert_eq!(snap.get(Counter::CtlQOutEnqueued), 100);
        assert_eq!(snap.get(Counter::CtlSendBad), 0);
        assert_eq!(snap.ctl_messages(), 1);
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = Counter::ALL.iter().map(|c| c.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Counter::ALL.len());
    }

    #[test]
    fn test_snapshot_serializes() {
        let counters = FilterCounters::new();
        counters.incr(Counter::FlowAllocOk);
        let json = serde_json::to_value(counters.snapshot()).unwrap();
        assert_eq!(json["values"]["flow_alloc_ok"], 1);
    }

    #[test]
    fn test_concurrent_increments() {
        use std::thread;

        let counters = Arc::new(FilterCounters::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let c = Arc::clone(&counters);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    c.incr(Counter::DataEventOk);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counters.get(Counter::DataEventOk), 8000);
    }
}
