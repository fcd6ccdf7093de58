//! Tickets awaiting an answer, keyed by unique id.

use crate::ticket::{TicketRef, LINK_REGISTERED};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct AnswerRegistry {
    map: DashMap<u64, TicketRef>,
    high_water: AtomicUsize,
}

impl AnswerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a reference to `ticket` under its unique id.
    ///
    /// # Panics
    /// If another ticket is registered under the same id.
    pub fn register(&self, ticket: &TicketRef) {
        ticket.link(LINK_REGISTERED);
        if let Some(previous) = self.map.insert(ticket.unique(), ticket.clone()) {
            panic!(
                "unique id {} registered twice ({previous:?})",
                ticket.unique()
            );
        }
        let registered = self.map.len();
        let mut max = self.high_water.load(Ordering::Relaxed);
        while registered > max {
            match self.high_water.compare_exchange_weak(
                max,
                registered,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }
    }

    /// Unlink `ticket` if this exact ticket is still registered. The
    /// registry's reference moves to the caller.
    pub fn remove(&self, ticket: &TicketRef) -> Option<TicketRef> {
        let (_, found) = self
            .map
            .remove_if(&ticket.unique(), |_, t| TicketRef::ptr_eq(t, ticket))?;
        found.unlink(LINK_REGISTERED);
        Some(found)
    }

    /// Unlink whatever is registered under `unique`.
    pub fn take(&self, unique: u64) -> Option<TicketRef> {
        let (_, found) = self.map.remove(&unique)?;
        found.unlink(LINK_REGISTERED);
        Some(found)
    }

    /// A new reference to the ticket registered under `unique`, leaving it linked.
    pub fn find(&self, unique: u64) -> Option<TicketRef> {
        self.map.get(&unique).map(|entry| entry.value().clone())
    }

    /// Unlink everything.
    pub fn drain(&self) -> Vec<TicketRef> {
        // Collect keys first so no shard lock is held while unlinking.
        let keys: Vec<u64> = self.map.iter().map(|entry| *entry.key()).collect();
        keys.into_iter().filter_map(|key| self.take(key)).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Most tickets ever registered at once.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}
