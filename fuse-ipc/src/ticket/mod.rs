//! Tickets: one pooled request/response transaction each.
//!
//! A [`TicketRef`] is a counted handle to a pooled [`TicketSlot`]. Cloning
//! takes a reference, dropping gives it back, and the last drop returns the
//! slot to its [`TicketPool`] with both buffers still allocated.
//!
//! The outbound queue and the answer registry each keep their own clone
//! while the ticket is linked into them and flag the link on the slot.
//! Dropping the last reference of a ticket that is still flagged as linked,
//! or dropping a reference more times than it was taken, panics.
//!
//! Completion is resolved exactly once. Every producer (the device write
//! path, a timeout, a cancellation, session death) goes through
//! [`TicketSlot::resolve`], which flips `completed` with a single
//! compare-and-swap under the ticket's state lock and wakes waiters.

mod iov;
mod pool;

pub use iov::{Iov, IovPolicy, MIN_ALLOC};
pub use pool::{PoolCounters, TicketPool};

use crate::error::ProtocolError;
use crate::lock;
use crate::protocol::{InHeader, Opcode, OutHeader, IN_HEADER_SIZE};
use crate::session::Session;
use pool::PoolShared;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use zerocopy::FromBytes;

/// Link flags kept on a slot.
pub(crate) const LINK_QUEUED: u8 = 1;
pub(crate) const LINK_REGISTERED: u8 = 2;
/// Set once the ticket has been handed to the daemon.
pub(crate) const LINK_DIRTY: u8 = 4;

/// Why a ticket completed without a usable answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    ConnectionClosed,
    TimedOut,
    Interrupted,
    /// The answer arrived but failed validation.
    BadResponse,
}

/// Callback run by the device write path when the ticket's answer arrives.
///
/// The ticket has already been removed from the answer registry and its
/// `errno` recorded. `body` is the answer payload following the header. A
/// handler must leave the reference count as it found it.
pub trait ResponseHandler: Send + Sync {
    fn on_answer(
        &self,
        session: &Session,
        ticket: &TicketRef,
        body: &[u8],
    ) -> Result<(), ProtocolError>;
}

/// Mutable per-activation state, guarded by the ticket lock.
pub struct TicketState {
    /// Request header followed by the opcode payload.
    pub request: Iov,
    /// Answer payload, without the header.
    pub response: Iov,
    /// Header of the answer as received.
    pub out_header: OutHeader,
    /// Positive daemon errno, 0 on success.
    pub errno: i32,
    pub fault: Option<Fault>,
    pub handler: Option<Arc<dyn ResponseHandler>>,
}

impl TicketState {
    fn new(policy: IovPolicy) -> Self {
        Self {
            request: Iov::new(policy),
            response: Iov::new(policy),
            out_header: OutHeader::default(),
            errno: 0,
            fault: None,
            handler: None,
        }
    }

    fn reset(&mut self) {
        self.request.refresh();
        self.response.refresh();
        self.out_header = OutHeader::default();
        self.errno = 0;
        self.fault = None;
        self.handler = None;
    }

    /// The request header, if one has been written.
    pub fn in_header(&self) -> Option<InHeader> {
        InHeader::read_from_prefix(self.request.as_slice())
            .ok()
            .map(|(hdr, _)| hdr)
    }

    /// Request payload following the header.
    pub fn request_payload(&self) -> &[u8] {
        self.request
            .as_slice()
            .get(IN_HEADER_SIZE..)
            .unwrap_or_default()
    }
}

/// Pooled storage behind a [`TicketRef`].
pub struct TicketSlot {
    unique: AtomicU64,
    refs: AtomicUsize,
    links: AtomicU8,
    completed: AtomicBool,
    interrupt_unique: AtomicU64,
    state: Mutex<TicketState>,
    answered: Condvar,
}

impl TicketSlot {
    fn new(policy: IovPolicy) -> Self {
        Self {
            unique: AtomicU64::new(0),
            refs: AtomicUsize::new(0),
            links: AtomicU8::new(0),
            completed: AtomicBool::new(false),
            interrupt_unique: AtomicU64::new(0),
            state: Mutex::new(TicketState::new(policy)),
            answered: Condvar::new(),
        }
    }

    /// Clear per-activation state and stamp a new unique id.
    fn reset(&self, unique: u64) {
        assert_eq!(
            self.links.load(Ordering::Acquire),
            0,
            "activating a ticket that is still linked"
        );
        lock(&self.state).reset();
        self.completed.store(false, Ordering::Release);
        self.interrupt_unique.store(0, Ordering::Release);
        self.unique.store(unique, Ordering::Release);
        self.refs.store(1, Ordering::Release);
    }

    #[inline]
    pub fn unique(&self) -> u64 {
        self.unique.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Unique id of the interrupt issued for this ticket, 0 if none.
    #[inline]
    pub fn interrupt_unique(&self) -> u64 {
        self.interrupt_unique.load(Ordering::Acquire)
    }

    /// Record `unique` as this ticket's interrupt unless one is already recorded.
    pub(crate) fn try_set_interrupt_unique(&self, unique: u64) -> bool {
        self.interrupt_unique
            .compare_exchange(0, unique, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the interrupt correlation if it still names `unique`.
    pub(crate) fn clear_interrupt_unique(&self, unique: u64) -> bool {
        self.interrupt_unique
            .compare_exchange(unique, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn take_interrupt_unique(&self) -> u64 {
        self.interrupt_unique.swap(0, Ordering::AcqRel)
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn lock(&self) -> MutexGuard<'_, TicketState> {
        lock(&self.state)
    }

    /// Opcode from the request header.
    pub fn opcode(&self) -> Option<Opcode> {
        self.lock()
            .in_header()
            .and_then(|hdr| Opcode::try_from(hdr.opcode).ok())
    }

    /// Resolve the ticket with the state lock already held.
    ///
    /// Returns false when another producer got there first, in which case
    /// `fault` is discarded.
    pub fn resolve(&self, state: &mut TicketState, fault: Option<Fault>) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        state.fault = fault;
        self.answered.notify_all();
        true
    }

    /// Lock the ticket and resolve it.
    pub fn complete(&self, fault: Option<Fault>) -> bool {
        let mut state = self.lock();
        self.resolve(&mut state, fault)
    }

    /// Block on the answer condition for at most `timeout`.
    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, TicketState>,
        timeout: Duration,
    ) -> MutexGuard<'a, TicketState> {
        match self.answered.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Wake anyone blocked on this ticket without resolving it.
    pub(crate) fn nudge(&self) {
        let _state = self.lock();
        self.answered.notify_all();
    }

    pub(crate) fn link(&self, flag: u8) {
        let prev = self.links.fetch_or(flag, Ordering::AcqRel);
        if prev & flag != 0 {
            panic!("ticket {} linked twice (flag {flag})", self.unique());
        }
    }

    pub(crate) fn unlink(&self, flag: u8) {
        let prev = self.links.fetch_and(!flag, Ordering::AcqRel);
        if prev & flag == 0 {
            panic!("ticket {} unlinked while not linked (flag {flag})", self.unique());
        }
    }

    pub(crate) fn mark_dirty(&self) {
        self.links.fetch_or(LINK_DIRTY, Ordering::AcqRel);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.links.load(Ordering::Acquire) & LINK_DIRTY != 0
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.links.load(Ordering::Acquire) & (LINK_QUEUED | LINK_REGISTERED) != 0
    }
}

impl fmt::Debug for TicketSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("unique", &self.unique())
            .field("refs", &self.ref_count())
            .field("links", &self.links.load(Ordering::Relaxed))
            .field("completed", &self.is_completed())
            .field("interrupt_unique", &self.interrupt_unique())
            .finish()
    }
}

/// Counted handle to an active ticket.
pub struct TicketRef {
    slot: Arc<TicketSlot>,
    pool: Arc<PoolShared>,
}

impl TicketRef {
    fn activate(slot: Arc<TicketSlot>, pool: Arc<PoolShared>, unique: u64) -> Self {
        slot.reset(unique);
        Self { slot, pool }
    }

    /// Whether two handles name the same ticket.
    #[inline]
    pub fn ptr_eq(a: &TicketRef, b: &TicketRef) -> bool {
        Arc::ptr_eq(&a.slot, &b.slot)
    }

    /// Give this reference back.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for TicketRef {
    type Target = TicketSlot;

    fn deref(&self) -> &TicketSlot {
        &self.slot
    }
}

impl Clone for TicketRef {
    fn clone(&self) -> Self {
        self.slot.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            slot: Arc::clone(&self.slot),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl Drop for TicketRef {
    fn drop(&mut self) {
        let prev = self.slot.refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("ticket {} released more times than referenced", self.slot.unique());
        }
        if prev > 1 {
            return;
        }
        if self.slot.is_linked() {
            // Already unwinding: leak the slot rather than abort.
            if std::thread::panicking() {
                return;
            }
            panic!("ticket {} released while still linked", self.slot.unique());
        }
        self.pool.recycle(Arc::clone(&self.slot));
    }
}

impl fmt::Debug for TicketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.slot.fmt(f)
    }
}
