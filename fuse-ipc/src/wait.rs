//! Blocking wait for a ticket's answer, with timeout and cancellation.
//!
//! A waiter sleeps on its ticket's condition variable until one of four
//! producers resolves the ticket: the device write path, session teardown,
//! the deadline, or a cancellation raised through a [`CancelToken`].
//!
//! A [`CancelToken::interrupt`] is honoured only when the session allows
//! interruption and the daemon may implement `FUSE_INTERRUPT`. The first
//! signal starts the interrupt sub-protocol and keeps waiting; a second
//! signal returns at once. [`CancelToken::kill`] always returns at once.
//! A request abandoned before delivery never reaches the daemon.

use crate::error::IpcError;
use crate::interrupt;
use crate::lock;
use crate::protocol::Opcode;
use crate::session::Session;
use crate::ticket::{Fault, TicketRef};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Cancellation signal for one in-flight operation.
///
/// Shared between the waiting caller and whoever wants to cancel it.
#[derive(Debug, Default)]
pub struct CancelToken {
    raised: AtomicU32,
    killed: AtomicBool,
    waiter: Mutex<Option<TicketRef>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the operation to stop. The daemon is told through an interrupt.
    pub fn interrupt(&self) {
        self.raised.fetch_add(1, Ordering::AcqRel);
        self.wake();
    }

    /// Abandon the operation immediately.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.raised.fetch_add(1, Ordering::AcqRel);
        self.wake();
    }

    /// Signals raised so far.
    pub fn signals(&self) -> u32 {
        self.raised.load(Ordering::Acquire)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if let Some(ticket) = lock(&self.waiter).as_ref() {
            ticket.nudge();
        }
    }

    fn attach(&self, ticket: &TicketRef) {
        *lock(&self.waiter) = Some(ticket.clone());
    }

    fn detach(&self) {
        lock(&self.waiter).take();
    }
}

struct Attached<'a>(Option<&'a CancelToken>);

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.0 {
            token.detach();
        }
    }
}

/// Block until `ticket` is resolved.
///
/// `Ok(())` means the daemon answered; the daemon's errno, if any, is in the
/// ticket state.
pub fn wait_answer(
    session: &Session,
    ticket: &TicketRef,
    cancel: Option<&CancelToken>,
) -> Result<(), IpcError> {
    let deadline = Instant::now() + session.daemon_timeout();
    if let Some(token) = cancel {
        token.attach(ticket);
    }
    let _attached = Attached(cancel);

    let mut seen = 0;
    let mut interrupted = false;
    let mut timed_out = false;
    let mut abandoned = false;

    let mut state = ticket.lock();
    loop {
        if ticket.is_completed() {
            break;
        }
        if session.is_dead() {
            ticket.resolve(&mut state, Some(Fault::ConnectionClosed));
            break;
        }
        if let Some(token) = cancel {
            if token.is_killed() {
                abandoned = ticket.resolve(&mut state, Some(Fault::Interrupted));
                break;
            }
            let raised = token.signals();
            if raised != seen {
                seen = raised;
                // Without interrupt support a plain signal changes nothing.
                if session.interruptible() && session.maybe_impl(Opcode::Interrupt) {
                    if interrupted {
                        abandoned = ticket.resolve(&mut state, Some(Fault::Interrupted));
                        break;
                    }
                    interrupted = true;
                    tracing::debug!(target: "fuse-ipc::wait", unique = ticket.unique(), "interrupting");
                    drop(state);
                    interrupt::send(session, ticket, Fault::Interrupted);
                    state = ticket.lock();
                    continue;
                }
            }
        }
        let now = Instant::now();
        if now >= deadline {
            timed_out = ticket.resolve(&mut state, Some(Fault::TimedOut));
            break;
        }
        state = ticket.wait_timeout(state, deadline - now);
    }

    if timed_out || abandoned {
        // A late answer is discarded.
        state.handler = None;
    }
    let completed = ticket.is_completed();
    let fault = state.fault;
    drop(state);

    if timed_out {
        session.counters().timed_out();
        tracing::warn!(
            target: "fuse-ipc::wait",
            unique = ticket.unique(),
            timeout_secs = session.daemon_timeout().as_secs(),
            "daemon did not answer in time"
        );
    }
    if timed_out || abandoned {
        unlink_undelivered(session, ticket);
    }

    if !completed {
        return Err(IpcError::Internal);
    }
    match fault {
        None => Ok(()),
        Some(Fault::ConnectionClosed) => Err(IpcError::ConnectionClosed),
        Some(Fault::TimedOut) => Err(IpcError::TimedOut),
        Some(Fault::Interrupted) => Err(IpcError::Interrupted),
        Some(Fault::BadResponse) => Err(IpcError::BadResponse),
    }
}

/// Keep a ticket the caller gave up on from ever reaching the daemon.
fn unlink_undelivered(session: &Session, ticket: &TicketRef) {
    if let Some(queued) = session.queue().unqueue(ticket) {
        queued.release();
        if let Some(registered) = session.registry().remove(ticket) {
            registered.release();
        }
    }
}
