//! Per-opcode validation of response body sizes.
//!
//! Every successful answer is checked against the shape the kernel expects
//! for its opcode before the body is copied into the ticket. A few opcodes
//! changed size across minor versions; those consult the negotiated
//! [`AbiVersion`].

use super::abi::{
    AbiVersion, AttrOut, BmapOut, EntryOut, InitOut, LkOut, LseekOut, Opcode, OpenOut,
    StatfsOut, WriteOut, COMPAT_22_INIT_OUT_SIZE, COMPAT_ATTR_OUT_SIZE, COMPAT_ENTRY_OUT_SIZE,
    COMPAT_INIT_OUT_SIZE, COMPAT_STATFS_SIZE, PAGE_SIZE,
};
use crate::error::ProtocolError;
use std::fmt;
use std::mem::size_of;

static INIT_OUT_SIZES: [usize; 3] = [
    size_of::<InitOut>(),
    COMPAT_22_INIT_OUT_SIZE,
    COMPAT_INIT_OUT_SIZE,
];

/// Acceptable size of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyShape {
    Exact(usize),
    AtMost(usize),
    Zero,
    Unconstrained,
    OneOf(&'static [usize]),
    /// The opcode is never answered; any body fails.
    NoReply,
}

impl BodyShape {
    pub fn admits(&self, len: usize) -> bool {
        match *self {
            BodyShape::Exact(n) => len == n,
            BodyShape::AtMost(n) => len <= n,
            BodyShape::Zero => len == 0,
            BodyShape::Unconstrained => true,
            BodyShape::OneOf(sizes) => sizes.contains(&len),
            BodyShape::NoReply => false,
        }
    }
}

impl fmt::Display for BodyShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyShape::Exact(n) => write!(f, "exactly {n} bytes"),
            BodyShape::AtMost(n) => write!(f, "at most {n} bytes"),
            BodyShape::Zero => f.write_str("no body"),
            BodyShape::Unconstrained => f.write_str("any size"),
            BodyShape::OneOf(sizes) => write!(f, "one of {sizes:?} bytes"),
            BodyShape::NoReply => f.write_str("no reply"),
        }
    }
}

fn entry_out_size(abi: AbiVersion) -> usize {
    if abi.at_least(7, 9) {
        size_of::<EntryOut>()
    } else {
        COMPAT_ENTRY_OUT_SIZE
    }
}

fn attr_out_size(abi: AbiVersion) -> usize {
    if abi.at_least(7, 9) {
        size_of::<AttrOut>()
    } else {
        COMPAT_ATTR_OUT_SIZE
    }
}

/// The body shape a successful `opcode` answer must have.
///
/// `read_size` is the `size` field of the request's read payload and only
/// matters for the read family; without it those opcodes are unconstrained.
pub fn expected_body(opcode: Opcode, abi: AbiVersion, read_size: Option<u32>) -> BodyShape {
    match opcode {
        Opcode::Lookup | Opcode::Link | Opcode::Mkdir | Opcode::Mknod | Opcode::Symlink => {
            BodyShape::Exact(entry_out_size(abi))
        }
        Opcode::Getattr | Opcode::Setattr => BodyShape::Exact(attr_out_size(abi)),
        Opcode::Readlink => BodyShape::AtMost(PAGE_SIZE),

        Opcode::Unlink
        | Opcode::Rmdir
        | Opcode::Rename
        | Opcode::Rename2
        | Opcode::Release
        | Opcode::Releasedir
        | Opcode::Fsync
        | Opcode::Fsyncdir
        | Opcode::Setxattr
        | Opcode::Removexattr
        | Opcode::Flush
        | Opcode::Setlk
        | Opcode::Setlkw
        | Opcode::Access
        | Opcode::Destroy
        | Opcode::Fallocate
        | Opcode::Interrupt => BodyShape::Zero,

        Opcode::Open | Opcode::Opendir => BodyShape::Exact(size_of::<OpenOut>()),
        Opcode::Write | Opcode::CopyFileRange => BodyShape::Exact(size_of::<WriteOut>()),
        Opcode::Getlk => BodyShape::Exact(size_of::<LkOut>()),
        Opcode::Bmap => BodyShape::Exact(size_of::<BmapOut>()),
        Opcode::Lseek => BodyShape::Exact(size_of::<LseekOut>()),

        Opcode::Read | Opcode::Readdir | Opcode::Readdirplus => match read_size {
            Some(size) => BodyShape::AtMost(size as usize),
            None => BodyShape::Unconstrained,
        },

        Opcode::Statfs => {
            if abi.at_least(7, 4) {
                BodyShape::Exact(size_of::<StatfsOut>())
            } else {
                BodyShape::Exact(COMPAT_STATFS_SIZE)
            }
        }
        Opcode::Create => BodyShape::Exact(entry_out_size(abi) + size_of::<OpenOut>()),
        Opcode::Init => BodyShape::OneOf(&INIT_OUT_SIZES),

        Opcode::Getxattr | Opcode::Listxattr | Opcode::Ioctl | Opcode::Poll => {
            BodyShape::Unconstrained
        }

        Opcode::Forget | Opcode::BatchForget | Opcode::NotifyReply => BodyShape::NoReply,
    }
}

/// Check a `len`-byte answer body against the table.
pub fn audit(
    opcode: Opcode,
    abi: AbiVersion,
    read_size: Option<u32>,
    len: usize,
) -> Result<(), ProtocolError> {
    let expected = expected_body(opcode, abi, read_size);
    if expected.admits(len) {
        Ok(())
    } else {
        Err(ProtocolError::BodyAudit {
            opcode,
            expected,
            actual: len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: AbiVersion = AbiVersion::new(7, 3);
    const PRE_79: AbiVersion = AbiVersion::new(7, 8);
    const CURRENT: AbiVersion = AbiVersion::new(7, 28);

    fn assert_exact(opcode: Opcode, abi: AbiVersion, size: usize) {
        assert!(audit(opcode, abi, None, size).is_ok(), "{opcode} {abi} {size}");
        assert!(audit(opcode, abi, None, size + 1).is_err(), "{opcode} {abi} {size}+1");
        if size > 0 {
            assert!(audit(opcode, abi, None, size - 1).is_err(), "{opcode} {abi} {size}-1");
        }
    }

    #[test]
    fn test_entry_ops_by_version() {
        for op in [
            Opcode::Lookup,
            Opcode::Link,
            Opcode::Mkdir,
            Opcode::Mknod,
            Opcode::Symlink,
        ] {
            assert_exact(op, CURRENT, 128);
            assert_exact(op, PRE_79, 120);
        }
        assert_exact(Opcode::Create, CURRENT, 144);
        assert_exact(Opcode::Create, PRE_79, 136);
    }

    #[test]
    fn test_attr_ops_by_version() {
        for op in [Opcode::Getattr, Opcode::Setattr] {
            assert_exact(op, CURRENT, 104);
            assert_exact(op, PRE_79, 96);
        }
    }

    #[test]
    fn test_statfs_by_version() {
        assert_exact(Opcode::Statfs, CURRENT, 80);
        assert_exact(Opcode::Statfs, AbiVersion::new(7, 4), 80);
        assert_exact(Opcode::Statfs, OLD, 48);
    }

    #[test]
    fn test_fixed_size_ops() {
        assert_exact(Opcode::Open, CURRENT, 16);
        assert_exact(Opcode::Opendir, CURRENT, 16);
        assert_exact(Opcode::Write, CURRENT, 8);
        assert_exact(Opcode::CopyFileRange, CURRENT, 8);
        assert_exact(Opcode::Getlk, CURRENT, 24);
        assert_exact(Opcode::Bmap, CURRENT, 8);
        assert_exact(Opcode::Lseek, CURRENT, 8);
    }

    #[test]
    fn test_zero_body_ops() {
        for op in Opcode::ALL {
            if expected_body(op, CURRENT, None) == BodyShape::Zero {
                assert!(audit(op, CURRENT, None, 0).is_ok());
                assert!(audit(op, CURRENT, None, 1).is_err());
            }
        }
        assert_eq!(expected_body(Opcode::Rename2, CURRENT, None), BodyShape::Zero);
        assert_eq!(expected_body(Opcode::Interrupt, CURRENT, None), BodyShape::Zero);
    }

    #[test]
    fn test_readlink_bound() {
        assert!(audit(Opcode::Readlink, CURRENT, None, 0).is_ok());
        assert!(audit(Opcode::Readlink, CURRENT, None, 4096).is_ok());
        assert!(audit(Opcode::Readlink, CURRENT, None, 4097).is_err());
    }

    #[test]
    fn test_read_family_uses_requested_size() {
        for op in [Opcode::Read, Opcode::Readdir, Opcode::Readdirplus] {
            assert!(audit(op, CURRENT, Some(100), 0).is_ok());
            assert!(audit(op, CURRENT, Some(100), 100).is_ok());
            assert!(audit(op, CURRENT, Some(100), 101).is_err());
            assert!(audit(op, CURRENT, None, 1 << 20).is_ok());
        }
    }

    #[test]
    fn test_init_sizes() {
        for len in [64, 24, 8] {
            assert!(audit(Opcode::Init, CURRENT, None, len).is_ok());
        }
        for len in [0, 7, 9, 23, 25, 63, 65] {
            assert!(audit(Opcode::Init, CURRENT, None, len).is_err());
        }
    }

    #[test]
    fn test_unconstrained_and_no_reply() {
        for op in [Opcode::Getxattr, Opcode::Listxattr, Opcode::Ioctl, Opcode::Poll] {
            assert!(audit(op, CURRENT, None, 0).is_ok());
            assert!(audit(op, CURRENT, None, 65536).is_ok());
        }
        for op in [Opcode::Forget, Opcode::BatchForget, Opcode::NotifyReply] {
            assert!(audit(op, CURRENT, None, 0).is_err());
        }
    }

    #[test]
    fn test_audit_error_details() {
        let err = audit(Opcode::Getattr, CURRENT, None, 3).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::BodyAudit {
                opcode: Opcode::Getattr,
                expected: BodyShape::Exact(104),
                actual: 3,
            }
        );
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "getattr answer of 3 bytes, expected exactly 104 bytes"
        );
    }
}
