// packages/engine/src/flow/socket.rs
//! Engine-side view of a socket
//!
//! The socket layer owns the real socket; the engine keeps the attributes
//! it filters on, a few state bits, and the flow attachment: one flow for
//! stream sockets, a flow database for datagram sockets.

use crate::flow::handle::FlowRef;
use crate::ports::FlowDb;
use crate::protocol::message::Direction;
use crate::protocol::sockopt::{
    AF_INET, AF_INET6, IPPROTO_TCP, IPPROTO_UDP, SOCK_DGRAM, SOCK_STREAM,
};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Socket type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    Stream,
    Datagram,
}

pub struct Socket {
    /// Socket generation, unique for the life of the process
    pub gencnt: u64,

    pub kind: SockKind,

    pub family: u32,

    pub protocol: u32,

    /// Owning process
    pub pid: u32,

    /// Low half of a stream socket's flow id
    pub flowhash: u32,

    /// Identity agents use to bless a socket
    pub client_uuid: Option<[u8; 16]>,

    /// Blessed; never filtered
    skip: AtomicBool,

    defunct: AtomicBool,

    /// Content filtering is active on this socket
    filtered: AtomicBool,

    state_change_cnt: AtomicU32,

    options: AtomicU32,

    flow: Mutex<Option<FlowRef>>,

    flow_db: Option<Arc<dyn FlowDb>>,
}

impl Socket {
    fn new(gencnt: u64, kind: SockKind, family: u32, protocol: u32) -> Self {
        let mut hasher = DefaultHasher::new();
        gencnt.hash(&mut hasher);

        Self {
            gencnt,
            kind,
            family,
            protocol,
            pid: 0,
            flowhash: hasher.finish() as u32,
            client_uuid: None,
            skip: AtomicBool::new(false),
            defunct: AtomicBool::new(false),
            filtered: AtomicBool::new(false),
            state_change_cnt: AtomicU32::new(0),
            options: AtomicU32::new(0),
            flow: Mutex::new(None),
            flow_db: None,
        }
    }

    /// A TCP socket
    pub fn stream(gencnt: u64, family: u32) -> Self {
        Self::new(gencnt, SockKind::Stream, family, IPPROTO_TCP)
    }

    /// A UDP socket whose flows live in `db`
    pub fn datagram(gencnt: u64, family: u32, db: Arc<dyn FlowDb>) -> Self {
        let mut sock = Self::new(gencnt, SockKind::Datagram, family, IPPROTO_UDP);
        sock.flow_db = Some(db);
        sock
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_client_uuid(mut self, uuid: [u8; 16]) -> Self {
        self.client_uuid = Some(uuid);
        self
    }

    pub fn with_flowhash(mut self, flowhash: u32) -> Self {
        self.flowhash = flowhash;
        self
    }

    pub fn sock_type(&self) -> u32 {
        match self.kind {
            SockKind::Stream => SOCK_STREAM,
            SockKind::Datagram => SOCK_DGRAM,
        }
    }

    pub fn is_inet(&self) -> bool {
        self.family == AF_INET || self.family == AF_INET6
    }

    pub fn is_stream(&self) -> bool {
        self.kind == SockKind::Stream
    }

    pub fn is_skipped(&self) -> bool {
        self.skip.load(Ordering::Acquire)
    }

    pub fn set_skip(&self) {
        self.skip.store(true, Ordering::Release);
    }

    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Acquire)
    }

    pub fn set_defunct(&self) {
        self.defunct.store(true, Ordering::Release);
    }

    pub fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::Acquire)
    }

    pub(crate) fn set_filtered(&self, on: bool) {
        self.filtered.store(on, Ordering::Release);
    }

    pub fn state_change_cnt(&self) -> u32 {
        self.state_change_cnt.load(Ordering::Relaxed)
    }

    pub fn bump_state_change(&self) {
        self.state_change_cnt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn options(&self) -> u32 {
        self.options.load(Ordering::Relaxed)
    }

    pub fn set_options(&self, options: u32) {
        self.options.store(options, Ordering::Relaxed);
    }

    /// The stream flow, retained
    pub fn flow(&self) -> Option<FlowRef> {
        self.flow.lock().clone()
    }

    /// Replace the stream flow, handing back the previous one
    pub(crate) fn set_flow(&self, flow: Option<FlowRef>) -> Option<FlowRef> {
        std::mem::replace(&mut *self.flow.lock(), flow)
    }

    pub fn flow_db(&self) -> Option<&Arc<dyn FlowDb>> {
        self.flow_db.as_ref()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("gencnt", &self.gencnt)
            .field("kind", &self.kind)
            .field("family", &self.family)
            .field("pid", &self.pid)
            .field("skip", &self.is_skipped())
            .field("defunct", &self.is_defunct())
            .field("filtered", &self.is_filtered())
            .finish()
    }
}

thread_local! {
    static REINJECTING: RefCell<Vec<(u64, Direction)>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as reinjecting into a socket direction
///
/// Data the socket layer hands back to the engine from inside the
/// reinjection callback is recognised by [`is_reinjecting`] and not
/// filtered again.
pub(crate) struct ReinjectScope {
    key: (u64, Direction),
}

impl ReinjectScope {
    pub(crate) fn enter(sock: &Socket, dir: Direction) -> Self {
        let key = (sock.gencnt, dir);
        REINJECTING.with(|r| r.borrow_mut().push(key));
        Self { key }
    }
}

impl Drop for ReinjectScope {
    fn drop(&mut self) {
        REINJECTING.with(|r| {
            let mut r = r.borrow_mut();
            if let Some(pos) = r.iter().rposition(|k| *k == self.key) {
                r.remove(pos);
            }
        });
    }
}

/// The current thread is reinjecting into this socket direction
pub fn is_reinjecting(sock: &Socket, dir: Direction) -> bool {
    REINJECTING.with(|r| r.borrow().contains(&(sock.gencnt, dir)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_socket_attributes() {
        let sock = Socket::stream(5, AF_INET).with_pid(42);
        assert!(sock.is_stream());
        assert!(sock.is_inet());
        assert_eq!(sock.sock_type(), SOCK_STREAM);
        assert_eq!(sock.protocol, IPPROTO_TCP);
        assert_eq!(sock.pid, 42);
        assert!(sock.flow().is_none());
        assert!(sock.flow_db().is_none());
    }

    #[test]
    fn test_flowhash_stable_per_gencnt() {
        let a = Socket::stream(9, AF_INET6);
        let b = Socket::stream(9, AF_INET6);
        assert_eq!(a.flowhash, b.flowhash);
        assert_eq!(Socket::stream(9, AF_INET).with_flowhash(7).flowhash, 7);
    }

    #[test]
    fn test_state_bits() {
        let sock = Socket::stream(1, AF_INET);
        assert!(!sock.is_skipped() && !sock.is_defunct());
        sock.set_skip();
        sock.set_defunct();
        assert!(sock.is_skipped() && sock.is_defunct());
    }

    #[test]
    fn test_reinject_scope_nesting() {
        let sock = Socket::stream(1, AF_INET);
        assert!(!is_reinjecting(&sock, Direction::Out));
        {
            let _outer = ReinjectScope::enter(&sock, Direction::Out);
            assert!(is_reinjecting(&sock, Direction::Out));
            assert!(!is_reinjecting(&sock, Direction::In));
            {
                let _inner = ReinjectScope::enter(&sock, Direction::Out);
            }
            assert!(is_reinjecting(&sock, Direction::Out));
        }
        assert!(!is_reinjecting(&sock, Direction::Out));
    }
}
