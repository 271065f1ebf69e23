// packages/engine/src/engine/verdict.rs
//! Verdict processing
//!
//! Per entry and direction the offsets move
//! `Unresolved → PartiallyPassed → FullyPassed/Detached`. A verdict that
//! would move an offset backwards is ignored, so duplicates are harmless.
//! A drop verdict is terminal for the whole flow.

use crate::engine::{EngineCore, FlowCtx};
use crate::flow::{Flow, FlowState};
use crate::protocol::message::{Direction, SockId, CFM_MAX_OFFSET, CRYPTO_KEY_LEN};
use crate::utils::errors::{EngineError, Result};
use parking_lot::MutexGuard;
use tracing::{debug, info};

impl FlowCtx<'_> {
    /// Apply one `(pass, peek)` pair to an entry and service its queue
    pub(crate) fn update_data_offsets(
        &self,
        st: &mut FlowState,
        unit: u32,
        dir: Direction,
        pass: u64,
        peek: u64,
    ) -> Result<()> {
        if st.flags.drop {
            return Err(EngineError::Dropped);
        }

        let mut updated = false;
        {
            let eb = st.entry_mut(unit).buf_mut(dir);
            if pass > eb.pass_offset {
                eb.pass_offset = pass;
                eb.peek_offset = eb.peek_offset.max(pass);
                updated = true;
            }
            if peek > eb.pass_offset && peek > eb.peek_offset {
                eb.peek_offset = peek;
                updated = true;
            }
            eb.verify();
        }

        let result = if updated {
            self.service_ctl_q(st, unit, dir).map(|_| ())
        } else {
            Ok(())
        };

        let entry = st.entry(unit);
        let passed_all = entry.snd.pass_offset == CFM_MAX_OFFSET
            && entry.rcv.pass_offset == CFM_MAX_OFFSET;
        let drained =
            st.flags.close_wait && entry.snd.ctl_q.is_empty() && entry.rcv.ctl_q.is_empty();
        if passed_all || drained {
            st.entry_mut(unit).flags.detached = true;
            debug!("Flow {:#x} unit {} detached", st.sock_id, unit);
            if st.flags.close_wait && !st.filters_attached() {
                self.flow.wakeup();
            }
        }
        result
    }
}

impl EngineCore {
    /// Apply a pass verdict for one direction and push out what it freed
    pub(crate) fn action_data_pass(
        &self,
        flow: &Flow,
        st: &mut MutexGuard<'_, FlowState>,
        unit: u32,
        dir: Direction,
        pass: u64,
        peek: u64,
    ) -> Result<()> {
        self.with_sockbuf(flow, st, dir, |ctx, st| {
            if st.flags.drop {
                return Err(EngineError::Dropped);
            }
            let result = ctx.update_data_offsets(st, unit, dir, pass, peek);
            ctx.service_inject_queue(st, dir);
            ctx.set_socket_pass_offset(st, dir);
            result
        })
    }

    /// Latch the flow dropped and throw away everything it holds
    pub(crate) fn action_drop(
        &self,
        flow: &Flow,
        st: &mut MutexGuard<'_, FlowState>,
        unit: u32,
    ) -> Result<()> {
        if !st.entry(unit).is_linked() {
            return Ok(());
        }

        st.flags.drop = true;
        // A datagram socket carries other flows; only this one dies
        if flow.socket.flow_db().is_none() {
            self.ports().socket_layer.defunct(&flow.socket);
        }
        st.entry_mut(unit).flags.detached = true;
        self.flush_queues(flow, st);

        if st.flags.close_wait && !st.filters_attached() {
            flow.wakeup();
        }
        info!("Flow {:#x} dropped by unit {}", st.sock_id, unit);
        Ok(())
    }

    /// First verdict seen; release a connect that was waiting on it
    pub(crate) fn received_verdict(&self, flow: &Flow, st: &mut FlowState) {
        st.flags.initial_verdict = true;
        if st.flags.socket_connected {
            st.flags.socket_connected = false;
            self.ports().socket_layer.connected(&flow.socket);
        }
    }

    /// Exempt a client's socket from filtering, or pass everything if
    /// it is already being filtered
    pub(crate) fn action_bless(
        &self,
        unit: u32,
        sock_id: SockId,
        client_id: &[u8; 16],
    ) -> Result<()> {
        let sock = self
            .ports()
            .socket_layer
            .find_by_client_uuid(client_id)
            .ok_or_else(|| EngineError::NotFound("no socket for client id".into()))?;

        let flow = match sock.flow_db() {
            Some(db) => db.get(sock_id as u32).and_then(|entry| entry.context()),
            None => sock.flow(),
        };

        match flow {
            Some(flow) => {
                let mut st = flow.lock();
                self.received_verdict(&flow, &mut st);
                if st.entry(unit).is_linked() {
                    if st.entry(unit).flags.sent_sock_attached {
                        st.entry_mut(unit).flags.data_start = true;
                    }
                    for dir in Direction::BOTH {
                        let _ = self.action_data_pass(
                            &flow,
                            &mut st,
                            unit,
                            dir,
                            CFM_MAX_OFFSET,
                            CFM_MAX_OFFSET,
                        );
                    }
                }
                info!("Flow {:#x} blessed by unit {}", st.sock_id, unit);
            }
            None => {
                sock.set_skip();
                info!("Socket {} blessed by unit {}", sock.gencnt, unit);
            }
        }
        Ok(())
    }

    /// Install the key events to `unit` are signed with
    pub(crate) fn set_crypto_key(&self, unit: u32, key: [u8; CRYPTO_KEY_LEN]) -> Result<()> {
        let mut reg = self.registry.write();
        let cfc = reg
            .get_mut(unit)
            .ok_or_else(|| EngineError::InvalidArgument(format!("no filter on unit {}", unit)))?;
        cfc.crypto_key = Some(key);
        info!("Unit {} crypto key set", unit);
        Ok(())
    }
}
