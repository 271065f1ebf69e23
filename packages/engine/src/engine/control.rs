// packages/engine/src/engine/control.rs
//! Agent control surface
//!
//! Entry points driven by the agent side of the transport: connect,
//! disconnect, verdict messages, resume after backpressure, and socket
//! options. All of them follow the lock order of the engine: the registry
//! is consulted, released, and the flow lock is taken before it is
//! consulted again.

use crate::engine::EngineCore;
use crate::observability::Counter;
use crate::protocol::message::{Action, ActionOp, DecodeError, Direction, SockId, CFM_MAX_OFFSET};
use crate::protocol::sockopt::{OptValue, SockInfo, SockOpt};
use crate::utils::errors::{EngineError, Result};
use std::time::Instant;
use tracing::{debug, info, warn};

impl EngineCore {
    /// An agent connected on `unit`
    pub fn ctl_connect(&self, unit: u32) -> Result<()> {
        let instance = self.registry.write().connect(unit)?;
        self.incr(Counter::CtlConnectOk);
        info!("Filter unit {} connected (instance {})", unit, instance);
        Ok(())
    }

    /// The agent on `unit` went away: pass everything it was holding and
    /// free the slot
    pub fn ctl_disconnect(&self, unit: u32) -> Result<()> {
        let instance = {
            let mut reg = self.registry.write();
            let cfc = reg.get_mut(unit).ok_or_else(|| {
                EngineError::InvalidArgument(format!("no filter on unit {}", unit))
            })?;
            cfc.detaching = true;
            cfc.instance
        };
        info!("Filter unit {} disconnecting", unit);

        loop {
            let sock_id = {
                let reg = self.registry.read();
                match reg.get(unit).and_then(|cfc| cfc.sock_entries().first().copied()) {
                    Some(sock_id) => sock_id,
                    None => break,
                }
            };

            let flow = match self.lookup_flow(sock_id) {
                Some(flow) => flow,
                None => {
                    // Being torn down; the teardown unlinks the entry too
                    if let Some(cfc) = self.registry.write().get_mut(unit) {
                        cfc.unlink(sock_id);
                    }
                    continue;
                }
            };

            let mut st = flow.lock();
            if st.entry(unit).filter == Some(instance) {
                {
                    let entry = st.entry_mut(unit);
                    entry.flags.sent_sock_attached = true;
                    entry.flags.data_start = true;
                }
                for dir in Direction::BOTH {
                    if let Err(e) = self.action_data_pass(
                        &flow,
                        &mut st,
                        unit,
                        dir,
                        CFM_MAX_OFFSET,
                        CFM_MAX_OFFSET,
                    ) {
                        debug!("Flow {:#x} unit {} release {}: {}", sock_id, unit, dir, e);
                    }
                }
                st.entry_mut(unit).flags.detached = true;
                if st.flags.close_wait && !st.filters_attached() {
                    flow.wakeup();
                }
            }

            let mut reg = self.registry.write();
            if st.entry(unit).filter == Some(instance) {
                st.unlink_entry(unit);
            }
            if let Some(cfc) = reg.get_mut(unit) {
                cfc.unlink(sock_id);
            }
            if reg.active_count() == 1 {
                st.filter_control_unit = 0;
                st.filter_policy_gencount = 0;
            }
            drop(reg);
            drop(st);
        }

        self.registry.write().remove(unit);
        self.stats.remove_unit(unit);
        self.incr(Counter::CtlDisconnectOk);
        info!("Filter unit {} disconnected", unit);
        Ok(())
    }

    /// A message from the agent on `unit`
    pub fn ctl_send(&self, unit: u32, msg: &[u8]) -> Result<()> {
        let action = match Action::decode(msg) {
            Ok(action) => action,
            Err(e) => {
                match e {
                    DecodeError::BadOp(_) => self.incr(Counter::CtlActionBadOp),
                    ref e if e.is_length_error() => self.incr(Counter::CtlActionBadLen),
                    _ => {}
                }
                self.incr(Counter::CtlSendBad);
                warn!("Unit {} sent a bad message: {}", unit, e);
                return Err(EngineError::BadMessage(e.to_string()));
            }
        };

        let result = self.apply_action(unit, action);
        match &result {
            Ok(()) => self.incr(Counter::CtlSendOk),
            Err(e) => {
                self.incr(Counter::CtlSendBad);
                debug!("Unit {} action rejected: {}", unit, e);
            }
        }
        result
    }

    fn apply_action(&self, unit: u32, action: Action) -> Result<()> {
        match action.op() {
            ActionOp::DataUpdate => self.incr(Counter::CtlActionDataUpdate),
            ActionOp::Drop => self.incr(Counter::CtlActionDrop),
            _ => {}
        }

        let instance = self
            .registry
            .read()
            .get(unit)
            .map(|cfc| cfc.instance)
            .ok_or_else(|| EngineError::InvalidArgument(format!("no filter on unit {}", unit)))?;

        let sock_id = match action {
            Action::SetCryptoKey { key } => return self.set_crypto_key(unit, key),
            Action::BlessClient { sock_id, client_id } => {
                return self.action_bless(unit, sock_id, &client_id)
            }
            Action::DataUpdate { sock_id, .. } | Action::Drop { sock_id } => sock_id,
        };

        let flow = self
            .lookup_flow(sock_id)
            .ok_or_else(|| EngineError::NotFound(format!("flow {:#x}", sock_id)))?;
        let mut st = flow.lock();
        if st.flags.drop {
            return Err(EngineError::Dropped);
        }
        let entry = st.entry(unit);
        if entry.filter != Some(instance) || !entry.flags.sent_sock_attached {
            return Err(EngineError::InvalidArgument(format!(
                "flow {:#x} not attached to unit {}",
                sock_id, unit
            )));
        }

        let now = Instant::now();
        {
            let entry = st.entry_mut(unit);
            entry.flags.data_start = true;
            entry.last_action = now;
        }
        st.record_op(action.op() as u32, now);

        match action {
            Action::DataUpdate {
                out_pass_offset,
                out_peek_offset,
                in_pass_offset,
                in_peek_offset,
                stats_frequency,
                ..
            } => {
                self.received_verdict(&flow, &mut st);
                if out_pass_offset != 0 || out_peek_offset != 0 {
                    self.action_data_pass(
                        &flow,
                        &mut st,
                        unit,
                        Direction::Out,
                        out_pass_offset,
                        out_peek_offset,
                    )?;
                }
                if in_pass_offset != 0 || in_peek_offset != 0 {
                    self.action_data_pass(
                        &flow,
                        &mut st,
                        unit,
                        Direction::In,
                        in_pass_offset,
                        in_peek_offset,
                    )?;
                }
                if self.stats.toggle(flow.arc(), unit, stats_frequency) {
                    self.wake_reporter();
                }
                Ok(())
            }
            Action::Drop { .. } => {
                self.action_drop(&flow, &mut st, unit)?;
                self.received_verdict(&flow, &mut st);
                Ok(())
            }
            Action::BlessClient { .. } | Action::SetCryptoKey { .. } => Ok(()),
        }
    }

    /// The transport to `unit` has room again: retry what backpressure held
    pub fn ctl_rcvd(&self, unit: u32) -> Result<()> {
        let (instance, sock_ids) = {
            let reg = self.registry.read();
            let cfc = reg.get(unit).ok_or_else(|| {
                EngineError::InvalidArgument(format!("no filter on unit {}", unit))
            })?;
            cfc.clear_flow_controlled();
            (cfc.instance, cfc.sock_entries().to_vec())
        };

        let mut lifted = 0;
        for sock_id in sock_ids {
            let blocked = self
                .registry
                .read()
                .get(unit)
                .map_or(true, |cfc| cfc.is_flow_controlled());
            if blocked {
                debug!("Unit {} flow controlled again, resume stops", unit);
                break;
            }

            let flow = match self.lookup_flow(sock_id) {
                Some(flow) => flow,
                None => continue,
            };
            let mut st = flow.lock();
            let entry = st.entry(unit);
            if entry.filter != Some(instance) || !entry.flags.flow_controlled {
                continue;
            }
            st.entry_mut(unit).flags.flow_controlled = false;
            lifted += 1;
            self.incr(Counter::CtlRcvdFlowLift);

            for dir in Direction::BOTH {
                let result =
                    self.with_sockbuf(&flow, &mut st, dir, |ctx, st| ctx.service_ctl_q(st, unit, dir));
                if let Err(e) = result {
                    debug!("Flow {:#x} unit {} resume {}: {}", sock_id, unit, dir, e);
                    break;
                }
            }
        }

        if lifted == 0 {
            debug!("Unit {} resumed with no flow-controlled flows", unit);
        }
        Ok(())
    }

    /// Read an option of the agent on `unit`
    ///
    /// `SocketInfo` needs the flow id in `sock_id`.
    pub fn ctl_getopt(&self, unit: u32, opt: SockOpt, sock_id: Option<SockId>) -> Result<OptValue> {
        let (necp_control_unit, preserve) = {
            let reg = self.registry.read();
            let cfc = reg.get(unit).ok_or_else(|| {
                EngineError::InvalidArgument(format!("no filter on unit {}", unit))
            })?;
            (cfc.necp_control_unit, cfc.preserve_connections)
        };

        match opt {
            SockOpt::NecpControlUnit => Ok(OptValue::ControlUnit(necp_control_unit)),
            SockOpt::PreserveConnections => Ok(OptValue::Preserve(preserve)),
            SockOpt::SocketInfo => {
                let sock_id = sock_id.ok_or_else(|| {
                    EngineError::InvalidArgument("socket info needs a flow id".into())
                })?;
                let flow = self
                    .lookup_flow(sock_id)
                    .ok_or_else(|| EngineError::NotFound(format!("flow {:#x}", sock_id)))?;
                let info = {
                    let st = flow.lock();
                    SockInfo {
                        sock_id,
                        family: flow.socket.family,
                        sock_type: flow.socket.sock_type(),
                        protocol: flow.socket.protocol,
                        local: st.local,
                        remote: st.remote,
                    }
                };
                Ok(OptValue::SocketInfo(info))
            }
        }
    }

    /// Change an option of the agent on `unit`
    pub fn ctl_setopt(&self, unit: u32, opt: SockOpt, value: OptValue) -> Result<()> {
        let mut reg = self.registry.write();
        let cfc = reg
            .get_mut(unit)
            .ok_or_else(|| EngineError::InvalidArgument(format!("no filter on unit {}", unit)))?;

        match (opt, value) {
            (SockOpt::NecpControlUnit, OptValue::ControlUnit(control_unit)) => {
                if cfc.necp_control_unit != 0 {
                    if cfc.necp_control_unit == control_unit {
                        return Ok(());
                    }
                    return Err(EngineError::AlreadyInUse(format!(
                        "unit {} control unit already {:#x}",
                        unit, cfc.necp_control_unit
                    )));
                }
                cfc.necp_control_unit = control_unit;
                info!("Unit {} receives control unit {:#x}", unit, control_unit);
                Ok(())
            }
            (SockOpt::PreserveConnections, OptValue::Preserve(on)) => {
                cfc.preserve_connections = on;
                reg.recompute_behavior();
                info!("Unit {} preserve connections {}", unit, on);
                Ok(())
            }
            (SockOpt::SocketInfo, _) => {
                Err(EngineError::NotSupported("socket info is read-only".into()))
            }
            (opt, value) => Err(EngineError::InvalidArgument(format!(
                "{:?} does not take {:?}",
                opt, value
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::testing::*;
    use crate::observability::Counter;
    use crate::protocol::message::{Action, ActionOp, Direction, Event, ACTION_MSG_LEN};
    use crate::protocol::sockopt::{OptValue, SockOpt, AF_INET, IPPROTO_TCP, SOCK_STREAM};
    use crate::utils::errors::EngineError;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_connect_twice_rejected() {
        let h = Harness::new();
        h.core.ctl_connect(2).unwrap();
        assert!(matches!(h.core.ctl_connect(2), Err(EngineError::AlreadyInUse(_))));
        assert!(matches!(h.core.ctl_connect(9), Err(EngineError::InvalidArgument(_))));
        assert_eq!(h.core.active_count(), 1);
        assert_eq!(h.core.counters().get(Counter::CtlConnectOk), 1);
    }

    #[test]
    fn test_bad_messages_counted() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);

        let mut msg = Action::pass_all(1).encode().to_vec();
        // Unknown op
        msg[12..16].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(h.core.ctl_send(1, &msg), Err(EngineError::BadMessage(_))));

        // Truncated
        let msg = Action::pass_all(1).encode();
        assert!(matches!(
            h.core.ctl_send(1, &msg[..ACTION_MSG_LEN - 8]),
            Err(EngineError::BadMessage(_))
        ));

        let counters = h.core.counters();
        assert_eq!(counters.get(Counter::CtlActionBadOp), 1);
        assert_eq!(counters.get(Counter::CtlSendBad), 2);
    }

    #[test]
    fn test_verdict_for_unknown_flow_or_unit() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (_sock, sock_id) = h.stream(40);

        assert!(matches!(
            h.send(1, Action::pass_all(sock_id + 1)),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            h.send(3, Action::pass_all(sock_id)),
            Err(EngineError::InvalidArgument(_))
        ));
        // Flow state untouched
        let entry = h.snapshot(sock_id).entry(1).unwrap().clone();
        assert_eq!(entry.snd.pass_offset, 0);
        assert!(!entry.data_start);
    }

    #[test]
    fn test_verdict_before_attach_sent_rejected() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        h.transport.set_backpressure(true);
        let (_sock, sock_id) = h.stream(41);
        h.transport.set_backpressure(false);

        assert!(matches!(
            h.send(1, Action::pass_all(sock_id)),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_verdict_records_op_and_action_time() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (_sock, sock_id) = h.stream(42);
        h.send(1, Action::update(sock_id, Direction::In, 10, 10)).unwrap();

        let flow = h.core.lookup_flow(sock_id).unwrap();
        {
            let st = flow.lock();
            assert_eq!(st.op_log.count, 1);
            assert_eq!(st.op_log.ops[0], ActionOp::DataUpdate as u8);
            assert!(st.entry(1).flags.data_start);
        }
        drop(flow);
        assert_eq!(h.core.counters().get(Counter::CtlActionDataUpdate), 1);
        assert_eq!(h.core.counters().get(Counter::CtlSendOk), 1);
    }

    #[test]
    fn test_disconnect_releases_held_data() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, sock_id) = h.stream(43);
        h.core.sock_data_out(&sock, payload(0, 30)).unwrap();
        h.core.sock_data_in(&sock, payload(0, 12)).unwrap();

        h.core.ctl_disconnect(1).unwrap();
        assert_eq!(h.layer.reinjected_bytes(43, Direction::Out).len(), 30);
        assert_eq!(h.layer.reinjected_bytes(43, Direction::In).len(), 12);
        assert!(h.core.filter_summary(1).is_none());
        assert_eq!(h.core.active_count(), 0);

        let snap = h.snapshot(sock_id);
        let entry = snap.entry(1).unwrap();
        assert!(!entry.linked);
        assert!(entry.detached);

        // The last agent left: a flow the policy still routes is dropped
        assert_eq!(
            h.core.sock_data_out(&sock, payload(0, 5)),
            Err(EngineError::Dropped)
        );
        h.policy.set_default_unit(0);
        assert!(!h.core.sock_data_out(&sock, payload(0, 5)).unwrap().is_held());
        assert_eq!(h.core.counters().get(Counter::CtlDisconnectOk), 1);
    }

    #[test]
    fn test_disconnect_with_chain_keeps_other_agent() {
        let h = Harness::new();
        h.agent(1, 0x1);
        h.agent(2, 0x3);
        h.policy.set_default_unit(0x3);
        let (sock, sock_id) = h.stream(44);
        h.core.sock_data_out(&sock, payload(0, 20)).unwrap();

        h.core.ctl_disconnect(1).unwrap();
        let snap = h.snapshot(sock_id);
        assert_eq!(snap.entry(2).unwrap().snd.ctl_q_len, 20);
        assert!(h.layer.reinjected().is_empty());
        assert!(h.events(2).iter().any(|e| matches!(e, Event::Attached(_))));
    }

    #[test]
    fn test_resume_with_nothing_held() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (_sock, _sock_id) = h.stream(45);
        h.core.ctl_rcvd(1).unwrap();
        assert_eq!(h.core.counters().get(Counter::CtlRcvdFlowLift), 0);
        assert!(matches!(h.core.ctl_rcvd(4), Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn test_control_unit_set_once() {
        let h = Harness::new();
        h.agent(1, 0x10);
        assert_eq!(
            h.core.ctl_getopt(1, SockOpt::NecpControlUnit, None).unwrap(),
            OptValue::ControlUnit(0x10)
        );
        h.core
            .ctl_setopt(1, SockOpt::NecpControlUnit, OptValue::ControlUnit(0x10))
            .unwrap();
        assert!(matches!(
            h.core.ctl_setopt(1, SockOpt::NecpControlUnit, OptValue::ControlUnit(0x20)),
            Err(EngineError::AlreadyInUse(_))
        ));
        assert!(matches!(
            h.core.ctl_setopt(1, SockOpt::NecpControlUnit, OptValue::Preserve(true)),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_preserve_needs_every_agent() {
        let h = Harness::new();
        h.agent(1, 0x1);
        h.agent(2, 0x2);
        h.core
            .ctl_setopt(1, SockOpt::PreserveConnections, OptValue::Preserve(true))
            .unwrap();
        assert!(!h.core.registry.read().preserve_connections());
        h.core
            .ctl_setopt(2, SockOpt::PreserveConnections, OptValue::Preserve(true))
            .unwrap();
        assert!(h.core.registry.read().preserve_connections());
        assert_eq!(
            h.core.ctl_getopt(2, SockOpt::PreserveConnections, None).unwrap(),
            OptValue::Preserve(true)
        );
    }

    #[test]
    fn test_socket_info() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (_sock, sock_id) = h.stream(46);

        let info = match h.core.ctl_getopt(1, SockOpt::SocketInfo, Some(sock_id)).unwrap() {
            OptValue::SocketInfo(info) => info,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(info.sock_id, sock_id);
        assert_eq!(info.family, AF_INET);
        assert_eq!(info.sock_type, SOCK_STREAM);
        assert_eq!(info.protocol, IPPROTO_TCP);
        assert_eq!(info.remote, Some("93.184.216.34:443".parse().unwrap()));

        assert!(matches!(
            h.core.ctl_getopt(1, SockOpt::SocketInfo, Some(sock_id ^ 1)),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            h.core.ctl_setopt(1, SockOpt::SocketInfo, OptValue::Preserve(false)),
            Err(EngineError::NotSupported(_))
        ));
        assert!(matches!(SockOpt::parse(77), Err(EngineError::NotSupported(_))));
    }

    #[test]
    fn test_verdicts_race_with_data() {
        let h = Harness::new();
        h.agent(1, POLICY_UNIT);
        let (sock, sock_id) = h.stream(47);

        let core = h.core.clone();
        let writer_sock = sock.clone();
        let writer = thread::spawn(move || {
            let mut passed = 0usize;
            for i in 0..50u8 {
                if !core.sock_data_out(&writer_sock, payload(i, 10)).unwrap().is_held() {
                    passed += 10;
                }
            }
            passed
        });
        for step in 1..=50u64 {
            h.send(1, Action::update(sock_id, Direction::Out, step * 10, step * 10))
                .unwrap();
            thread::sleep(Duration::from_micros(50));
        }
        let passed = writer.join().unwrap();
        h.send(1, Action::update(sock_id, Direction::Out, 500, 500)).unwrap();

        // Verdicts ahead of the data let later spans through directly
        assert_eq!(h.layer.reinjected_bytes(47, Direction::Out).len() + passed, 500);
        let snap = h.snapshot(sock_id);
        assert_eq!(snap.snd.pending_first, 500);
        assert_eq!(snap.snd.inject_q_len, 0);
    }
}
