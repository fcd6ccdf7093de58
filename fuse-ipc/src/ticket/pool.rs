//! Ticket pool: recycles slots and stamps unique ids.

use super::{IovPolicy, TicketRef, TicketSlot, LINK_DIRTY};
use crate::lock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) struct PoolShared {
    free: Mutex<Vec<Arc<TicketSlot>>>,
    policy: IovPolicy,
    allocated: AtomicUsize,
    activations: AtomicU64,
    reused: AtomicU64,
}

impl PoolShared {
    /// Return an unreferenced slot to the free list.
    pub(super) fn recycle(&self, slot: Arc<TicketSlot>) {
        slot.links.fetch_and(!LINK_DIRTY, Ordering::AcqRel);
        // Handlers may hold references of their own; drop them now.
        slot.lock().handler = None;
        lock(&self.free).push(slot);
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounters {
    /// Slots ever allocated.
    pub allocated: usize,
    /// Slots currently on the free list.
    pub free: usize,
    pub activations: u64,
    /// Activations served from the free list.
    pub reused: u64,
}

/// Allocator handing out [`TicketRef`]s with session-unique ids.
pub struct TicketPool {
    shared: Arc<PoolShared>,
    next_unique: AtomicU64,
}

impl TicketPool {
    pub fn new(policy: IovPolicy) -> Self {
        Self::starting_at(policy, 1)
    }

    pub(crate) fn starting_at(policy: IovPolicy, first_unique: u64) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::new()),
                policy,
                allocated: AtomicUsize::new(0),
                activations: AtomicU64::new(0),
                reused: AtomicU64::new(0),
            }),
            next_unique: AtomicU64::new(first_unique),
        }
    }

    /// Next unique id; never 0.
    fn next_unique(&self) -> u64 {
        loop {
            let unique = self.next_unique.fetch_add(1, Ordering::Relaxed);
            if unique != 0 {
                return unique;
            }
        }
    }

    /// Obtain a cleared ticket with a fresh unique id and one reference.
    pub fn activate(&self) -> TicketRef {
        let recycled = lock(&self.shared.free).pop();
        let slot = match recycled {
            Some(slot) => {
                self.shared.reused.fetch_add(1, Ordering::Relaxed);
                slot
            }
            None => {
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                Arc::new(TicketSlot::new(self.shared.policy))
            }
        };
        self.shared.activations.fetch_add(1, Ordering::Relaxed);
        TicketRef::activate(slot, Arc::clone(&self.shared), self.next_unique())
    }

    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            free: lock(&self.shared.free).len(),
            activations: self.shared.activations.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::{Fault, LINK_QUEUED};
    use std::collections::HashSet;

    #[test]
    fn test_unique_ids_are_distinct() {
        let pool = TicketPool::new(IovPolicy::default());
        let tickets: Vec<TicketRef> = (0..64).map(|_| pool.activate()).collect();
        let ids: HashSet<u64> = tickets.iter().map(|t| t.unique()).collect();
        assert_eq!(ids.len(), 64);
        assert!(!ids.contains(&0));
    }

    #[test]
    fn test_unique_skips_zero_on_wrap() {
        let pool = TicketPool::starting_at(IovPolicy::default(), u64::MAX);
        let a = pool.activate();
        let b = pool.activate();
        assert_eq!(a.unique(), u64::MAX);
        assert_eq!(b.unique(), 1);
    }

    #[test]
    fn test_release_recycles_slot_and_keeps_buffers() {
        let pool = TicketPool::new(IovPolicy::default());
        let ticket = pool.activate();
        ticket.lock().request.adjust(4096);
        let first = ticket.unique();
        ticket.release();

        let counters = pool.counters();
        assert_eq!(counters.allocated, 1);
        assert_eq!(counters.free, 1);

        let again = pool.activate();
        assert_ne!(again.unique(), first);
        assert_eq!(pool.counters().reused, 1);
        assert_eq!(pool.counters().allocated, 1);

        let state = again.lock();
        assert_eq!(state.request.len(), 0);
        assert_eq!(state.request.capacity(), 4096);
    }

    #[test]
    fn test_reactivation_clears_state() {
        let pool = TicketPool::new(IovPolicy::default());
        let ticket = pool.activate();
        assert!(ticket.try_set_interrupt_unique(99));
        assert!(!ticket.try_set_interrupt_unique(100));
        assert!(ticket.complete(Some(Fault::TimedOut)));
        drop(ticket);

        let ticket = pool.activate();
        assert!(!ticket.is_completed());
        assert_eq!(ticket.interrupt_unique(), 0);
        assert_eq!(ticket.lock().fault, None);
    }

    #[test]
    fn test_clones_keep_slot_out_of_pool() {
        let pool = TicketPool::new(IovPolicy::default());
        let ticket = pool.activate();
        let clone = ticket.clone();
        assert_eq!(ticket.ref_count(), 2);
        drop(ticket);
        assert_eq!(pool.counters().free, 0);
        assert_eq!(clone.ref_count(), 1);
        drop(clone);
        assert_eq!(pool.counters().free, 1);
    }

    #[test]
    fn test_complete_only_once() {
        let pool = TicketPool::new(IovPolicy::default());
        let ticket = pool.activate();
        assert!(ticket.complete(Some(Fault::Interrupted)));
        assert!(!ticket.complete(Some(Fault::TimedOut)));
        assert!(!ticket.complete(None));
        assert_eq!(ticket.lock().fault, Some(Fault::Interrupted));
    }

    #[test]
    fn test_concurrent_completion_has_one_winner() {
        let pool = TicketPool::new(IovPolicy::default());
        let ticket = pool.activate();
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let t = ticket.clone();
                    s.spawn(move || t.complete(Some(Fault::TimedOut)) as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    #[should_panic(expected = "released while still linked")]
    fn test_release_while_linked_panics() {
        let pool = TicketPool::new(IovPolicy::default());
        let ticket = pool.activate();
        ticket.link(LINK_QUEUED);
        ticket.release();
    }

    #[test]
    #[should_panic(expected = "linked twice")]
    fn test_double_link_panics() {
        let pool = TicketPool::new(IovPolicy::default());
        let ticket = pool.activate();
        ticket.link(LINK_QUEUED);
        ticket.link(LINK_QUEUED);
    }
}
