// packages/engine/src/ports/memory.rs
//! In-process collaborators
//!
//! Used by the tests and the demo binary. Nothing here touches the network.

use crate::flow::Socket;
use crate::ports::{
    DgramFlowEntry, FlowDb, PolicyOracle, ReinjectError, Signer, SocketLayer, Transport,
    TransportError,
};
use crate::protocol::message::{Direction, Event, CRYPTO_KEY_LEN, SIGNATURE_LEN};
use crate::queue::{Span, SpanMeta};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Bounded per-unit channels; a full channel is backpressure
pub struct ChannelTransport {
    capacity: usize,

    channels: DashMap<u32, (Sender<Bytes>, Receiver<Bytes>)>,

    /// Report backpressure regardless of channel space
    backpressure: AtomicBool,

    /// Report hard failure
    failing: AtomicBool,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: DashMap::new(),
            backpressure: AtomicBool::new(false),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_backpressure(&self, on: bool) {
        self.backpressure.store(on, Ordering::SeqCst);
    }

    pub fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    fn channel(&self, unit: u32) -> (Sender<Bytes>, Receiver<Bytes>) {
        self.channels
            .entry(unit)
            .or_insert_with(|| bounded(self.capacity))
            .clone()
    }

    /// Agent side of a unit's channel
    pub fn receiver(&self, unit: u32) -> Receiver<Bytes> {
        self.channel(unit).1
    }

    /// Take every queued message for a unit
    pub fn drain(&self, unit: u32) -> Vec<Bytes> {
        self.receiver(unit).try_iter().collect()
    }

    /// Take and decode every queued event for a unit
    pub fn drain_events(&self, unit: u32) -> Vec<Event> {
        self.drain(unit)
            .iter()
            .filter_map(|msg| Event::decode(msg))
            .collect()
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Transport for ChannelTransport {
    fn enqueue(&self, unit: u32, msg: Bytes) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Failure(format!("unit {} unavailable", unit)));
        }
        if self.backpressure.load(Ordering::SeqCst) {
            return Err(TransportError::Backpressure);
        }

        let (tx, _) = self.channel(unit);
        match tx.try_send(msg) {
            Ok(()) => {
                trace!("Queued message for unit {}", unit);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(TransportError::Backpressure),
            Err(TrySendError::Disconnected(_)) => {
                Err(TransportError::Failure(format!("unit {} disconnected", unit)))
            }
        }
    }
}

/// Policy with a default unit, per-socket overrides and a bumpable generation
pub struct StaticPolicy {
    default_unit: AtomicU32,
    gencount: AtomicU32,
    units: DashMap<u64, u32>,
}

impl StaticPolicy {
    pub fn new(default_unit: u32) -> Self {
        Self {
            default_unit: AtomicU32::new(default_unit),
            gencount: AtomicU32::new(1),
            units: DashMap::new(),
        }
    }

    pub fn set_default_unit(&self, unit: u32) {
        self.default_unit.store(unit, Ordering::SeqCst);
    }

    /// Override the unit for one socket generation
    pub fn set_unit(&self, gencnt: u64, unit: u32) {
        self.units.insert(gencnt, unit);
    }

    /// Simulate a policy re-evaluation
    pub fn bump_gencount(&self) {
        self.gencount.fetch_add(1, Ordering::SeqCst);
    }
}

impl PolicyOracle for StaticPolicy {
    fn control_unit(&self, sock: &Socket) -> u32 {
        self.units
            .get(&sock.gencnt)
            .map(|u| *u)
            .unwrap_or_else(|| self.default_unit.load(Ordering::SeqCst))
    }

    fn policy_gencount(&self, _sock: &Socket) -> u32 {
        self.gencount.load(Ordering::SeqCst)
    }
}

/// One reinjected span
#[derive(Debug, Clone)]
pub struct Reinjected {
    pub gencnt: u64,
    pub dir: Direction,
    pub data: Bytes,
    pub meta: Option<Arc<SpanMeta>>,
}

/// Socket layer that records every callback
#[derive(Default)]
pub struct RecordingSocketLayer {
    reinjected: Mutex<Vec<Reinjected>>,
    defunct: Mutex<Vec<u64>>,
    shutdowns: Mutex<Vec<(u64, Direction)>>,
    connected: Mutex<Vec<u64>>,
    wakeups: AtomicU64,
    fail_reinject: AtomicBool,
    sockets: DashMap<[u8; 16], Arc<Socket>>,
}

impl RecordingSocketLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a socket findable by its client uuid
    pub fn register(&self, sock: &Arc<Socket>) {
        if let Some(uuid) = sock.client_uuid {
            self.sockets.insert(uuid, Arc::clone(sock));
        }
    }

    pub fn set_fail_reinject(&self, on: bool) {
        self.fail_reinject.store(on, Ordering::SeqCst);
    }

    pub fn reinjected(&self) -> Vec<Reinjected> {
        self.reinjected.lock().clone()
    }

    /// Concatenated bytes reinjected for one socket direction
    pub fn reinjected_bytes(&self, gencnt: u64, dir: Direction) -> Vec<u8> {
        self.reinjected
            .lock()
            .iter()
            .filter(|r| r.gencnt == gencnt && r.dir == dir)
            .flat_map(|r| r.data.iter().copied())
            .collect()
    }

    pub fn defuncted(&self) -> Vec<u64> {
        self.defunct.lock().clone()
    }

    pub fn shutdowns(&self) -> Vec<(u64, Direction)> {
        self.shutdowns.lock().clone()
    }

    pub fn connected_sockets(&self) -> Vec<u64> {
        self.connected.lock().clone()
    }

    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::SeqCst)
    }
}

impl SocketLayer for RecordingSocketLayer {
    fn reinject(&self, sock: &Socket, dir: Direction, span: Span) -> Result<(), ReinjectError> {
        if self.fail_reinject.load(Ordering::SeqCst) {
            return Err(ReinjectError::new("no buffer space", span));
        }
        self.reinjected.lock().push(Reinjected {
            gencnt: sock.gencnt,
            dir,
            data: span.data,
            meta: span.meta,
        });
        Ok(())
    }

    fn defunct(&self, sock: &Socket) {
        sock.set_defunct();
        self.defunct.lock().push(sock.gencnt);
    }

    fn wake(&self, _sock: &Socket, _dir: Direction) {
        self.wakeups.fetch_add(1, Ordering::SeqCst);
    }

    fn shutdown_final(&self, sock: &Socket, dir: Direction) {
        self.shutdowns.lock().push((sock.gencnt, dir));
    }

    fn connected(&self, sock: &Socket) {
        self.connected.lock().push(sock.gencnt);
    }

    fn find_by_client_uuid(&self, client_id: &[u8; 16]) -> Option<Arc<Socket>> {
        self.sockets.get(client_id).map(|s| Arc::clone(&s))
    }
}

/// Datagram flow table keyed by a hash of the 4-tuple
#[derive(Default)]
pub struct HashFlowDb {
    flows: DashMap<u32, Arc<DgramFlowEntry>>,
}

impl HashFlowDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

fn flowhash(local: Option<SocketAddr>, remote: SocketAddr) -> u32 {
    let mut hasher = DefaultHasher::new();
    local.hash(&mut hasher);
    remote.hash(&mut hasher);
    hasher.finish() as u32
}

impl FlowDb for HashFlowDb {
    fn lookup(&self, local: Option<SocketAddr>, remote: SocketAddr) -> Option<Arc<DgramFlowEntry>> {
        self.flows
            .get(&flowhash(local, remote))
            .map(|e| Arc::clone(&e))
    }

    fn insert(&self, local: Option<SocketAddr>, remote: SocketAddr) -> Arc<DgramFlowEntry> {
        let hash = flowhash(local, remote);
        let entry = self
            .flows
            .entry(hash)
            .or_insert_with(|| Arc::new(DgramFlowEntry::new(hash, local, remote)));
        Arc::clone(&entry)
    }

    fn get(&self, flowhash: u32) -> Option<Arc<DgramFlowEntry>> {
        self.flows.get(&flowhash).map(|e| Arc::clone(&e))
    }

    fn remove(&self, flowhash: u32) -> Option<Arc<DgramFlowEntry>> {
        self.flows.remove(&flowhash).map(|(_, e)| e)
    }

    fn entries(&self) -> Vec<Arc<DgramFlowEntry>> {
        self.flows.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

/// Produces empty signatures
#[derive(Debug, Default)]
pub struct NoopSigner;

impl Signer for NoopSigner {
    fn sign(&self, _key: &[u8; CRYPTO_KEY_LEN], _msg: &[u8]) -> Bytes {
        Bytes::new()
    }
}

/// Folds the message into the key; deterministic, not cryptographic
#[derive(Debug, Default)]
pub struct FoldSigner;

impl Signer for FoldSigner {
    fn sign(&self, key: &[u8; CRYPTO_KEY_LEN], msg: &[u8]) -> Bytes {
        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(&key[..SIGNATURE_LEN]);
        for (i, b) in msg.iter().enumerate() {
            sig[i % SIGNATURE_LEN] ^= *b;
        }
        Bytes::copy_from_slice(&sig)
    }
}
