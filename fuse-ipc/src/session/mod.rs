//! Per-connection state shared by callers, the device endpoint and the
//! interrupt machinery.
//!
//! # Lock order
//!
//! The outbound queue lock and the registry shards are always taken before
//! a ticket's state lock, never while one is held. Teardown collects the
//! tickets under the queue/registry locks and completes them afterwards.
//!
//! # Teardown
//!
//! [`Session::mark_dead`] sets the dead flag, closes the queue and drains
//! the registry, completing every drained ticket with
//! [`Fault::ConnectionClosed`]. Registration re-checks the flag after
//! inserting, so a ticket registered concurrently with teardown is still
//! failed exactly once.

mod capabilities;
mod config;
mod queue;
mod registry;
mod stats;

pub use capabilities::{Capabilities, ImplementedOps, OpcodeSet, SessionFlags};
pub use config::{
    SessionConfig, DEFAULT_DAEMON_TIMEOUT_SECS, MAX_DAEMON_TIMEOUT_SECS, MIN_DAEMON_TIMEOUT_SECS,
};
pub use queue::{Dequeued, OutboundQueue};
pub use registry::AnswerRegistry;
pub use stats::{SessionStats, StatsSnapshot};

use crate::error::IpcError;
use crate::lock;
use crate::notify::{LogNotifier, Notifier};
use crate::protocol::{AbiVersion, Opcode};
use crate::ticket::{Fault, TicketPool, TicketRef};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// One kernel/daemon connection.
pub struct Session {
    config: SessionConfig,
    pool: TicketPool,
    queue: OutboundQueue,
    registry: AnswerRegistry,
    dead: AtomicBool,
    caps: RwLock<Capabilities>,
    impls: RwLock<ImplementedOps>,
    inited: Mutex<bool>,
    init_cv: Condvar,
    rename: Mutex<()>,
    notifier: Box<dyn Notifier>,
    stats: SessionStats,
}

impl Session {
    /// Create a session whose notifications are logged and dropped.
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Self::with_notifier(config, Box::new(LogNotifier))
    }

    pub fn with_notifier(config: SessionConfig, notifier: Box<dyn Notifier>) -> Arc<Self> {
        let mut flags = SessionFlags::empty();
        if config.allow_interrupt {
            flags |= SessionFlags::INTR;
        }
        if config.linux_errnos {
            flags |= SessionFlags::LINUX_ERRNOS;
        }
        let caps = Capabilities::new(config.max_read, config.max_readahead, flags);
        tracing::debug!(
            target: "fuse-ipc::session",
            timeout_secs = config.daemon_timeout().as_secs(),
            allow_interrupt = config.allow_interrupt,
            linux_errnos = config.linux_errnos,
            "session created"
        );
        Arc::new(Self {
            pool: TicketPool::new(config.iov_policy),
            config,
            queue: OutboundQueue::new(),
            registry: AnswerRegistry::new(),
            dead: AtomicBool::new(false),
            caps: RwLock::new(caps),
            impls: RwLock::new(ImplementedOps::default()),
            inited: Mutex::new(false),
            init_cv: Condvar::new(),
            rename: Mutex::new(()),
            notifier,
            stats: SessionStats::default(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// How long a caller waits for an answer.
    pub fn daemon_timeout(&self) -> Duration {
        self.config.daemon_timeout()
    }

    /// Obtain a cleared ticket with a fresh unique id.
    pub fn activate(&self) -> TicketRef {
        self.pool.activate()
    }

    /// Queue `ticket` for delivery. Does nothing once the session is dead.
    pub fn enqueue(&self, ticket: &TicketRef, urgent: bool) -> bool {
        let queued = self.queue.enqueue(ticket, urgent);
        if !queued {
            tracing::debug!(
                target: "fuse-ipc::session",
                unique = ticket.unique(),
                "session dead, request not queued"
            );
        }
        queued
    }

    /// Make `ticket` findable by the device write path.
    ///
    /// Returns false, and completes the ticket with
    /// [`Fault::ConnectionClosed`], if the session died meanwhile.
    pub fn register(&self, ticket: &TicketRef) -> bool {
        self.registry.register(ticket);
        if !self.is_dead() {
            return true;
        }
        if let Some(linked) = self.registry.remove(ticket) {
            linked.complete(Some(Fault::ConnectionClosed));
        }
        false
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn registry(&self) -> &AnswerRegistry {
        &self.registry
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Stop accepting work and fail every queued or registered ticket.
    pub fn mark_dead(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        let queued = self.queue.close();
        let registered = self.registry.drain();
        let (n_queued, n_registered) = (queued.len(), registered.len());

        let failed = queued
            .iter()
            .chain(registered.iter())
            .filter(|ticket| ticket.complete(Some(Fault::ConnectionClosed)))
            .count();
        drop(queued);
        drop(registered);

        {
            let _inited = lock(&self.inited);
            self.init_cv.notify_all();
        }

        self.stats.failed_on_close(failed);
        tracing::info!(
            target: "fuse-ipc::session",
            queued = n_queued,
            registered = n_registered,
            failed,
            "session marked dead"
        );
    }

    /// Tear the session down.
    pub fn destroy(&self) {
        tracing::info!(target: "fuse-ipc::session", "session destroyed");
        self.mark_dead();
    }

    /// Cached capabilities. Never blocks on the daemon.
    pub fn capabilities(&self) -> Capabilities {
        *self.caps.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn abi(&self) -> AbiVersion {
        self.capabilities().abi
    }

    pub fn flags(&self) -> SessionFlags {
        self.capabilities().flags
    }

    pub(crate) fn update_capabilities(&self, f: impl FnOnce(&mut Capabilities)) {
        let mut caps = self.caps.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut caps);
    }

    /// Whether callers may interrupt in-flight requests.
    pub fn interruptible(&self) -> bool {
        self.flags().contains(SessionFlags::INTR)
    }

    pub fn implemented_ops(&self) -> ImplementedOps {
        *self.impls.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn maybe_impl(&self, opcode: Opcode) -> bool {
        self.implemented_ops().maybe_impl(opcode)
    }

    pub fn is_impl(&self, opcode: Opcode) -> bool {
        self.implemented_ops().is_impl(opcode)
    }

    pub fn set_impl(&self, opcode: Opcode) {
        if self.is_impl(opcode) {
            return;
        }
        self.impls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_impl(opcode);
    }

    pub fn set_not_impl(&self, opcode: Opcode) {
        tracing::debug!(target: "fuse-ipc::session", ?opcode, "daemon does not implement opcode");
        self.impls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_not_impl(opcode);
    }

    /// Flag the handshake as answered and wake [`wait_init`](Self::wait_init).
    pub(crate) fn mark_inited(&self) {
        self.update_capabilities(|caps| caps.flags |= SessionFlags::INITED);
        let mut inited = lock(&self.inited);
        *inited = true;
        self.init_cv.notify_all();
    }

    pub fn is_inited(&self) -> bool {
        *lock(&self.inited)
    }

    /// Block until the handshake is answered, the session dies or `timeout`
    /// passes.
    pub fn wait_init(&self, timeout: Duration) -> Result<Capabilities, IpcError> {
        let deadline = Instant::now() + timeout;
        let mut inited = lock(&self.inited);
        loop {
            if self.is_dead() {
                return Err(IpcError::ConnectionClosed);
            }
            if *inited {
                return Ok(self.capabilities());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(IpcError::TimedOut);
            }
            inited = match self.init_cv.wait_timeout(inited, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Serialize rename operations across the session.
    pub fn rename_lock(&self) -> MutexGuard<'_, ()> {
        lock(&self.rename)
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    pub(crate) fn counters(&self) -> &SessionStats {
        &self.stats
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .snapshot(self.pool.counters(), self.registry.high_water())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_dead() {
            self.mark_dead();
        }
    }
}
