//! Resizable message buffer with shrink reluctance.
//!
//! Tickets are reused many times, and most messages are small. An [`Iov`]
//! keeps its allocation across reuse and only gives back an oversized
//! allocation after it has been oversized for `credit` consecutive
//! adjustments, so a workload alternating between one large and many small
//! messages does not reallocate on every message.

use serde::{Deserialize, Serialize};

/// Smallest allocation an [`Iov`] makes; covers every fixed-size message.
pub const MIN_ALLOC: usize = 160;

/// Buffer reclamation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IovPolicy {
    /// Excess capacity tolerated without spending credit. `None` never shrinks.
    pub permanent_bufsize: Option<usize>,
    /// Oversized adjustments allowed before the allocation is shrunk.
    pub credit: u32,
}

impl Default for IovPolicy {
    fn default() -> Self {
        Self {
            permanent_bufsize: Some(1 << 19),
            credit: 16,
        }
    }
}

/// A byte buffer with a valid length distinct from its capacity.
#[derive(Debug)]
pub struct Iov {
    buf: Vec<u8>,
    len: usize,
    credit: i64,
    policy: IovPolicy,
}

impl Iov {
    pub fn new(policy: IovPolicy) -> Self {
        Self {
            buf: vec![0; MIN_ALLOC],
            len: 0,
            credit: i64::from(policy.credit),
            policy,
        }
    }

    /// Set the valid length to `size`, reallocating when needed.
    ///
    /// Growing keeps the existing bytes and zero-fills the extension.
    pub fn adjust(&mut self, size: usize) {
        let capacity = self.buf.len();
        let oversized = match self.policy.permanent_bufsize {
            Some(permanent) if capacity > size.saturating_add(permanent) => {
                self.credit -= 1;
                self.credit < 0
            }
            _ => false,
        };

        if capacity < size || oversized {
            let new_capacity = size.max(MIN_ALLOC);
            let keep = self.len.min(new_capacity);
            let mut buf = vec![0u8; new_capacity];
            buf[..keep].copy_from_slice(&self.buf[..keep]);
            self.buf = buf;
            self.credit = i64::from(self.policy.credit);
        }
        self.len = size;
    }

    /// Reset to an empty message, applying the shrink policy.
    pub fn refresh(&mut self) {
        self.adjust(0);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }

    /// Replace the contents with `data`.
    pub fn fill_from(&mut self, data: &[u8]) {
        self.adjust(data.len());
        self.buf[..data.len()].copy_from_slice(data);
    }
}
