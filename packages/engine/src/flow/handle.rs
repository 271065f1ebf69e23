// packages/engine/src/flow/handle.rs
//! Reference-counted flow handle
//!
//! A [`Flow`] is shared through [`FlowRef`] guards. The logical count lives
//! in the flow itself so lookups by flow id can *try* to retain: once the
//! count has reached zero the flow is being torn down and `try_retain`
//! fails. The last guard to drop hands the flow to its [`FlowOwner`].
//!
//! Never drop a `FlowRef` while holding the flow lock or the registry lock.

use crate::filter::registry::registry_held;
use crate::flow::socket::Socket;
use crate::flow::state::FlowState;
use crate::protocol::message::{Direction, SockId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Receives flows whose last reference was released
pub trait FlowOwner: Send + Sync {
    fn release(&self, flow: &Arc<Flow>);
}

pub struct Flow {
    pub sock_id: SockId,

    pub socket: Arc<Socket>,

    /// Local endpoint captured at attach
    pub local: Option<SocketAddr>,

    refs: AtomicU32,

    /// The flow ("socket") lock
    state: Mutex<FlowState>,

    /// Close-wait and socket-buffer waiters
    cond: Condvar,

    bytes_in: AtomicU64,

    bytes_out: AtomicU64,

    /// Units that have been sent the local endpoint, one bit per unit
    laddr_sent: AtomicU32,

    owner: Weak<dyn FlowOwner>,
}

impl Flow {
    /// Create a flow holding one reference
    pub fn create(socket: Arc<Socket>, state: FlowState, owner: Weak<dyn FlowOwner>) -> FlowRef {
        let flow = Arc::new(Flow {
            sock_id: state.sock_id,
            socket,
            local: state.local,
            refs: AtomicU32::new(1),
            state: Mutex::new(state),
            cond: Condvar::new(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            laddr_sent: AtomicU32::new(0),
            owner,
        });
        FlowRef { flow }
    }

    /// Take the flow lock. The registry lock must not be held.
    pub fn lock(&self) -> MutexGuard<'_, FlowState> {
        debug_assert!(!registry_held(), "flow lock taken under the registry lock");
        self.state.lock()
    }

    /// Retain unless teardown has begun
    pub fn try_retain(self: &Arc<Self>) -> Option<FlowRef> {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(FlowRef {
                        flow: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Sleep on the flow condition, releasing the flow lock
    pub fn wait(&self, guard: &mut MutexGuard<'_, FlowState>) {
        self.cond.wait(guard);
    }

    /// Bounded sleep; true on timeout
    pub fn wait_for(&self, guard: &mut MutexGuard<'_, FlowState>, timeout: Duration) -> bool {
        self.cond.wait_for(guard, timeout).timed_out()
    }

    pub fn wakeup(&self) {
        self.cond.notify_all();
    }

    pub fn add_bytes(&self, dir: Direction, n: u64) {
        match dir {
            Direction::Out => self.bytes_out.fetch_add(n, Ordering::Relaxed),
            Direction::In => self.bytes_in.fetch_add(n, Ordering::Relaxed),
        };
    }

    /// Cumulative bytes submitted in one direction
    pub fn bytes(&self, dir: Direction) -> u64 {
        match dir {
            Direction::Out => self.bytes_out.load(Ordering::Relaxed),
            Direction::In => self.bytes_in.load(Ordering::Relaxed),
        }
    }

    /// Claim the one-time local endpoint report for `unit`; false if
    /// already claimed or there is no endpoint to report
    pub fn claim_laddr(&self, unit: u32) -> bool {
        if self.local.is_none() {
            return false;
        }
        let bit = 1u32 << unit;
        self.laddr_sent.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Take the advisory socket-buffer lock for `dir`, reentrant per thread
    pub fn acquire_sockbuf(&self, guard: &mut MutexGuard<'_, FlowState>, dir: Direction) {
        let me = thread::current().id();
        while guard.buf(dir).sockbuf.is_owned_by_other(me) {
            self.cond.wait(guard);
        }
        let sb = &mut guard.buf_mut(dir).sockbuf;
        sb.owner = Some(me);
        sb.refs += 1;
    }

    pub fn release_sockbuf(&self, st: &mut FlowState, dir: Direction) {
        let sb = &mut st.buf_mut(dir).sockbuf;
        debug_assert_eq!(sb.owner, Some(thread::current().id()));
        sb.refs = sb.refs.saturating_sub(1);
        if sb.refs == 0 {
            sb.owner = None;
            self.cond.notify_all();
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("sock_id", &format_args!("{:#x}", self.sock_id))
            .field("refs", &self.ref_count())
            .field("gencnt", &self.socket.gencnt)
            .finish()
    }
}

/// An owned reference to a flow
pub struct FlowRef {
    flow: Arc<Flow>,
}

impl FlowRef {
    pub fn arc(&self) -> &Arc<Flow> {
        &self.flow
    }
}

impl Deref for FlowRef {
    type Target = Flow;

    fn deref(&self) -> &Flow {
        &self.flow
    }
}

impl Clone for FlowRef {
    fn clone(&self) -> Self {
        self.flow.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            flow: Arc::clone(&self.flow),
        }
    }
}

impl Drop for FlowRef {
    fn drop(&mut self) {
        if self.flow.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(owner) = self.flow.owner.upgrade() {
                owner.release(&self.flow);
            }
        }
    }
}

impl fmt::Debug for FlowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.flow.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::ConnDirection;
    use crate::protocol::sockopt::AF_INET;
    use std::time::Instant;

    #[derive(Default)]
    struct CountingOwner {
        released: AtomicU32,
    }

    impl FlowOwner for CountingOwner {
        fn release(&self, _flow: &Arc<Flow>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flow(owner: &Arc<CountingOwner>) -> FlowRef {
        let owner: Arc<dyn FlowOwner> = owner.clone();
        let sock = Arc::new(Socket::stream(1, AF_INET));
        let st = FlowState::new(1 << 32, ConnDirection::Out, None, None, Instant::now());
        Flow::create(sock, st, Arc::downgrade(&owner))
    }

    #[test]
    fn test_last_release_notifies_owner() {
        let owner = Arc::new(CountingOwner::default());
        let first = flow(&owner);
        let second = first.clone();
        assert_eq!(first.ref_count(), 2);

        drop(first);
        assert_eq!(owner.released.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(owner.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_retain_fails_after_teardown() {
        let owner = Arc::new(CountingOwner::default());
        let handle = flow(&owner);
        let arc = Arc::clone(handle.arc());

        let extra = arc.try_retain().unwrap();
        assert_eq!(arc.ref_count(), 2);
        drop(extra);
        drop(handle);

        assert_eq!(arc.ref_count(), 0);
        assert!(arc.try_retain().is_none());
        assert_eq!(owner.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_byte_counters() {
        let owner = Arc::new(CountingOwner::default());
        let handle = flow(&owner);
        handle.add_bytes(Direction::Out, 10);
        handle.add_bytes(Direction::In, 3);
        handle.add_bytes(Direction::Out, 5);
        assert_eq!(handle.bytes(Direction::Out), 15);
        assert_eq!(handle.bytes(Direction::In), 3);
    }

    #[test]
    fn test_laddr_claimed_once_per_unit() {
        let owner = Arc::new(CountingOwner::default());
        let dyn_owner: Arc<dyn FlowOwner> = owner.clone();
        let sock = Arc::new(Socket::stream(2, AF_INET));
        let local = Some("10.0.0.1:4000".parse().unwrap());
        let st = FlowState::new(2 << 32, ConnDirection::Out, local, None, Instant::now());
        let handle = Flow::create(sock, st, Arc::downgrade(&dyn_owner));

        assert!(handle.claim_laddr(1));
        assert!(!handle.claim_laddr(1));
        assert!(handle.claim_laddr(2));

        // No endpoint, nothing to claim
        let bare = flow(&owner);
        assert!(!bare.claim_laddr(1));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "flow lock taken under the registry lock")]
    fn test_flow_lock_under_registry_panics() {
        let owner = Arc::new(CountingOwner::default());
        let handle = flow(&owner);
        let registry = crate::filter::RegistryLock::new();

        // A reinjection callback reaching another socket would do this
        let _reg = registry.read();
        let _st = handle.lock();
    }

    #[test]
    fn test_sockbuf_reentrant_and_exclusive() {
        let owner = Arc::new(CountingOwner::default());
        let handle = flow(&owner);

        {
            let mut st = handle.lock();
            handle.acquire_sockbuf(&mut st, Direction::Out);
            handle.acquire_sockbuf(&mut st, Direction::Out);
            assert_eq!(st.snd.sockbuf.refs, 2);
            handle.release_sockbuf(&mut st, Direction::Out);
            assert!(st.snd.sockbuf.is_held());
        }

        // Another thread blocks until the last release
        let other = handle.clone();
        let waiter = thread::spawn(move || {
            let mut st = other.lock();
            other.acquire_sockbuf(&mut st, Direction::Out);
            let refs = st.snd.sockbuf.refs;
            other.release_sockbuf(&mut st, Direction::Out);
            refs
        });

        thread::sleep(Duration::from_millis(20));
        {
            let mut st = handle.lock();
            handle.release_sockbuf(&mut st, Direction::Out);
        }
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_retain_release() {
        let owner = Arc::new(CountingOwner::default());
        let handle = flow(&owner);
        let arc = Arc::clone(handle.arc());

        let mut handles = vec![];
        for _ in 0..8 {
            let arc = Arc::clone(&arc);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    if let Some(r) = arc.try_retain() {
                        drop(r);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(arc.ref_count(), 1);
        drop(handle);
        assert_eq!(owner.released.load(Ordering::SeqCst), 1);
    }
}
