//! Outbound queue of requests awaiting delivery to the daemon.
//!
//! Non-urgent tickets are delivered FIFO. Urgent tickets (interrupts) go
//! ahead of every non-urgent one and are FIFO among themselves.

use crate::lock;
use crate::ticket::{TicketRef, LINK_QUEUED};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct QueueInner {
    urgent: VecDeque<TicketRef>,
    normal: VecDeque<TicketRef>,
    closed: bool,
}

impl QueueInner {
    fn len(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }

    fn pop(&mut self) -> Option<TicketRef> {
        self.urgent.pop_front().or_else(|| self.normal.pop_front())
    }
}

/// Result of a blocking dequeue.
#[derive(Debug)]
pub enum Dequeued {
    Ticket(TicketRef),
    /// Nothing pending and the caller asked not to block.
    Empty,
    /// The queue was closed by session teardown.
    Closed,
}

pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                urgent: VecDeque::new(),
                normal: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, QueueInner> {
        lock(&self.inner)
    }

    /// Queue a reference to `ticket`. Returns false, queueing nothing, once
    /// the queue is closed.
    ///
    /// # Panics
    /// If the ticket was already delivered or is already queued.
    pub fn enqueue(&self, ticket: &TicketRef, urgent: bool) -> bool {
        if ticket.is_dirty() {
            panic!("ticket {} re-enqueued after delivery", ticket.unique());
        }
        let mut inner = self.inner();
        if inner.closed {
            return false;
        }
        ticket.link(LINK_QUEUED);
        if urgent {
            inner.urgent.push_back(ticket.clone());
        } else {
            inner.normal.push_back(ticket.clone());
        }
        drop(inner);
        self.ready.notify_one();
        true
    }

    /// Pop the head without blocking. The queue's reference moves to the caller.
    pub fn dequeue(&self) -> Option<TicketRef> {
        let ticket = self.inner().pop()?;
        ticket.unlink(LINK_QUEUED);
        Some(ticket)
    }

    /// Pop the head, blocking while the queue is empty and open.
    pub fn dequeue_wait(&self, block: bool) -> Dequeued {
        let mut inner = self.inner();
        loop {
            if let Some(ticket) = inner.pop() {
                ticket.unlink(LINK_QUEUED);
                return Dequeued::Ticket(ticket);
            }
            if inner.closed {
                return Dequeued::Closed;
            }
            if !block {
                return Dequeued::Empty;
            }
            inner = self
                .ready
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`dequeue_wait`](Self::dequeue_wait) but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Dequeued {
        let inner = self.inner();
        let (mut inner, _) = self
            .ready
            .wait_timeout_while(inner, timeout, |q| q.len() == 0 && !q.closed)
            .unwrap_or_else(PoisonError::into_inner);
        match inner.pop() {
            Some(ticket) => {
                ticket.unlink(LINK_QUEUED);
                Dequeued::Ticket(ticket)
            }
            None if inner.closed => Dequeued::Closed,
            None => Dequeued::Empty,
        }
    }

    /// Remove `ticket` if it is still waiting for delivery.
    pub fn unqueue(&self, ticket: &TicketRef) -> Option<TicketRef> {
        let mut guard = self.inner();
        let inner = &mut *guard;
        let found = [&mut inner.urgent, &mut inner.normal]
            .into_iter()
            .find_map(|list| {
                let pos = list.iter().position(|t| TicketRef::ptr_eq(t, ticket))?;
                list.remove(pos)
            })?;
        drop(guard);
        found.unlink(LINK_QUEUED);
        Some(found)
    }

    /// Refuse further tickets, hand back everything pending and wake all
    /// blocked readers.
    pub fn close(&self) -> Vec<TicketRef> {
        let mut inner = self.inner();
        inner.closed = true;
        let mut drained: Vec<TicketRef> = inner.urgent.drain(..).collect();
        drained.extend(inner.normal.drain(..));
        drop(inner);
        self.ready.notify_all();
        for ticket in &drained {
            ticket.unlink(LINK_QUEUED);
        }
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.inner().closed
    }

    pub fn len(&self) -> usize {
        self.inner().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
