//! State learned from the daemon during the handshake.

use crate::protocol::{AbiVersion, Opcode, KERNEL_MINOR_VERSION, KERNEL_VERSION};
use bitflags::bitflags;
use serde::Serialize;

bitflags! {
    /// Session feature flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
    #[serde(transparent)]
    pub struct SessionFlags: u32 {
        /// Handshake answered.
        const INITED = 1 << 0;
        const ASYNC_READ = 1 << 1;
        const POSIX_LOCKS = 1 << 2;
        const EXPORT_SUPPORT = 1 << 3;
        /// Callers may interrupt in-flight requests.
        const INTR = 1 << 4;
        /// Translate Linux errno numbers in answers.
        const LINUX_ERRNOS = 1 << 5;
    }
}

/// Negotiated capabilities, cached after the handshake.
///
/// Until the daemon answers, `abi` is the version this engine advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub abi: AbiVersion,
    pub max_readahead: u32,
    pub max_write: u32,
    pub max_read: u32,
    /// Timestamp granularity in nanoseconds.
    pub time_gran: u32,
    pub flags: SessionFlags,
}

impl Capabilities {
    pub(crate) fn new(max_read: u32, max_readahead: u32, flags: SessionFlags) -> Self {
        Self {
            abi: AbiVersion::new(KERNEL_VERSION, KERNEL_MINOR_VERSION),
            max_readahead,
            max_write: 0,
            max_read,
            time_gran: 1,
            flags,
        }
    }
}

/// Fixed-size set of opcodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpcodeSet(u64);

impl OpcodeSet {
    #[inline]
    pub fn contains(self, opcode: Opcode) -> bool {
        self.0 & opcode.bit() != 0
    }

    #[inline]
    pub fn insert(&mut self, opcode: Opcode) {
        self.0 |= opcode.bit();
    }

    #[inline]
    pub fn remove(&mut self, opcode: Opcode) {
        self.0 &= !opcode.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Opcode> {
        Opcode::ALL.into_iter().filter(move |op| self.contains(*op))
    }
}

/// What the daemon is known to implement.
///
/// An opcode is in at most one of the two sets; one that is in neither has
/// not been exercised yet and may be implemented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImplementedOps {
    pub not_impl: OpcodeSet,
    pub is_impl: OpcodeSet,
}

impl ImplementedOps {
    pub fn maybe_impl(&self, opcode: Opcode) -> bool {
        !self.not_impl.contains(opcode)
    }

    pub fn is_impl(&self, opcode: Opcode) -> bool {
        self.is_impl.contains(opcode)
    }

    pub fn set_impl(&mut self, opcode: Opcode) {
        self.is_impl.insert(opcode);
        self.not_impl.remove(opcode);
    }

    pub fn set_not_impl(&mut self, opcode: Opcode) {
        self.not_impl.insert(opcode);
        self.is_impl.remove(opcode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_opcode_may_be_implemented() {
        let ops = ImplementedOps::default();
        assert!(ops.maybe_impl(Opcode::Interrupt));
        assert!(!ops.is_impl(Opcode::Interrupt));
    }

    #[test]
    fn test_sets_are_exclusive() {
        let mut ops = ImplementedOps::default();
        ops.set_impl(Opcode::Lseek);
        assert!(ops.is_impl(Opcode::Lseek));
        ops.set_not_impl(Opcode::Lseek);
        assert!(!ops.is_impl(Opcode::Lseek));
        assert!(!ops.maybe_impl(Opcode::Lseek));
        ops.set_impl(Opcode::Lseek);
        assert!(ops.maybe_impl(Opcode::Lseek));
    }

    #[test]
    fn test_opcode_set_iter() {
        let mut set = OpcodeSet::default();
        assert!(set.is_empty());
        set.insert(Opcode::CopyFileRange);
        set.insert(Opcode::Lookup);
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![Opcode::Lookup, Opcode::CopyFileRange]
        );
    }
}
