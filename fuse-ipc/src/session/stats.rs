//! Per-session counters.
//!
//! Every counter is also mirrored to the `metrics` facade, which is a no-op
//! until a recorder is installed.

use crate::ticket::PoolCounters;
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SessionStats {
    messages_delivered: AtomicU64,
    responses_received: AtomicU64,
    interrupts_sent: AtomicU64,
    timeouts: AtomicU64,
    protocol_errors: AtomicU64,
    stale_interrupt_echoes: AtomicU64,
    notifications: AtomicU64,
    tickets_failed_on_close: AtomicU64,
}

impl SessionStats {
    pub(crate) fn message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
        counter!("fuse_ipc.messages.delivered").increment(1);
    }

    pub(crate) fn response_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
        counter!("fuse_ipc.responses.total").increment(1);
    }

    pub(crate) fn interrupt_sent(&self) {
        self.interrupts_sent.fetch_add(1, Ordering::Relaxed);
        counter!("fuse_ipc.interrupts.sent").increment(1);
    }

    pub(crate) fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        counter!("fuse_ipc.errors", "reason" => "timeout").increment(1);
    }

    pub(crate) fn protocol_error(&self, fatal: bool) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        let reason = if fatal { "protocol_fatal" } else { "protocol" };
        counter!("fuse_ipc.errors", "reason" => reason).increment(1);
    }

    pub(crate) fn stale_interrupt_echo(&self) {
        self.stale_interrupt_echoes.fetch_add(1, Ordering::Relaxed);
        counter!("fuse_ipc.errors", "reason" => "stale_interrupt_echo").increment(1);
    }

    pub(crate) fn notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        counter!("fuse_ipc.notifications.total").increment(1);
    }

    pub(crate) fn failed_on_close(&self, count: usize) {
        self.tickets_failed_on_close
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!("fuse_ipc.errors", "reason" => "disconnected").increment(count as u64);
    }

    pub(crate) fn snapshot(&self, pool: PoolCounters, registered_high_water: usize) -> StatsSnapshot {
        StatsSnapshot {
            activations: pool.activations,
            pool_reuse_hits: pool.reused,
            slots_allocated: pool.allocated,
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            interrupts_sent: self.interrupts_sent.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            stale_interrupt_echoes: self.stale_interrupt_echoes.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            tickets_failed_on_close: self.tickets_failed_on_close.load(Ordering::Relaxed),
            registered_high_water,
        }
    }
}

/// Plain copy of the session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub activations: u64,
    pub pool_reuse_hits: u64,
    pub slots_allocated: usize,
    pub messages_delivered: u64,
    pub responses_received: u64,
    pub interrupts_sent: u64,
    pub timeouts: u64,
    pub protocol_errors: u64,
    pub stale_interrupt_echoes: u64,
    pub notifications: u64,
    pub tickets_failed_on_close: u64,
    pub registered_high_water: usize,
}
