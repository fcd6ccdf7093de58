//! FUSE kernel ABI as spoken over the device endpoint.
//!
//! Only the structures the dispatch engine itself touches are defined here:
//! the two fixed headers, the handshake payloads, the payloads whose sizes the
//! body audit checks, and the notification payloads. Operation encoders live
//! above this crate.
//!
//! All structures are `#[repr(C)]`, padding-free and in host byte order on
//! the wire, matching `fuse_kernel.h`. Items without a version annotation are
//! valid with ABI 7.9 and later.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Major protocol version advertised in `FUSE_INIT`.
pub const KERNEL_VERSION: u32 = 7;

/// Minor protocol version advertised in `FUSE_INIT`.
pub const KERNEL_MINOR_VERSION: u32 = 28;

/// Upper bound for `FUSE_READLINK` replies.
pub const PAGE_SIZE: usize = 4096;

/// Longest name accepted in an entry invalidation.
pub const NAME_MAX: usize = 1024;

/// Largest errno value a daemon may return.
pub const MAX_ERRNO: i32 = 4095;

/// Request operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, Serialize, Deserialize)]
#[repr(u32)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2, // no reply
    Getattr = 3,
    Setattr = 4,
    Readlink = 5,
    Symlink = 6,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Link = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Fsync = 20,
    Setxattr = 21,
    Getxattr = 22,
    Listxattr = 23,
    Removexattr = 24,
    Flush = 25,
    Init = 26,
    Opendir = 27,
    Readdir = 28,
    Releasedir = 29,
    Fsyncdir = 30,
    Getlk = 31,
    Setlk = 32,
    Setlkw = 33,
    Access = 34,
    Create = 35,
    Interrupt = 36,
    Bmap = 37,
    Destroy = 38,
    Ioctl = 39,
    Poll = 40,
    NotifyReply = 41,
    BatchForget = 42, // no reply
    Fallocate = 43,
    Readdirplus = 44,
    Rename2 = 45,
    Lseek = 46,
    CopyFileRange = 47,
}

impl Opcode {
    /// Every opcode, in numeric order.
    pub const ALL: [Opcode; 45] = [
        Opcode::Lookup,
        Opcode::Forget,
        Opcode::Getattr,
        Opcode::Setattr,
        Opcode::Readlink,
        Opcode::Symlink,
        Opcode::Mknod,
        Opcode::Mkdir,
        Opcode::Unlink,
        Opcode::Rmdir,
        Opcode::Rename,
        Opcode::Link,
        Opcode::Open,
        Opcode::Read,
        Opcode::Write,
        Opcode::Statfs,
        Opcode::Release,
        Opcode::Fsync,
        Opcode::Setxattr,
        Opcode::Getxattr,
        Opcode::Listxattr,
        Opcode::Removexattr,
        Opcode::Flush,
        Opcode::Init,
        Opcode::Opendir,
        Opcode::Readdir,
        Opcode::Releasedir,
        Opcode::Fsyncdir,
        Opcode::Getlk,
        Opcode::Setlk,
        Opcode::Setlkw,
        Opcode::Access,
        Opcode::Create,
        Opcode::Interrupt,
        Opcode::Bmap,
        Opcode::Destroy,
        Opcode::Ioctl,
        Opcode::Poll,
        Opcode::NotifyReply,
        Opcode::BatchForget,
        Opcode::Fallocate,
        Opcode::Readdirplus,
        Opcode::Rename2,
        Opcode::Lseek,
        Opcode::CopyFileRange,
    ];

    /// Bit used for this opcode in capability sets.
    #[inline]
    pub fn bit(self) -> u64 {
        1u64 << (self as u32)
    }

    /// Whether the daemon answers this opcode at all.
    pub fn expects_reply(self) -> bool {
        !matches!(
            self,
            Opcode::Forget | Opcode::BatchForget | Opcode::NotifyReply
        )
    }

    /// Short lowercase name used in logs and metrics labels.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Lookup => "lookup",
            Opcode::Forget => "forget",
            Opcode::Getattr => "getattr",
            Opcode::Setattr => "setattr",
            Opcode::Readlink => "readlink",
            Opcode::Symlink => "symlink",
            Opcode::Mknod => "mknod",
            Opcode::Mkdir => "mkdir",
            Opcode::Unlink => "unlink",
            Opcode::Rmdir => "rmdir",
            Opcode::Rename => "rename",
            Opcode::Link => "link",
            Opcode::Open => "open",
            Opcode::Read => "read",
            Opcode::Write => "write",
            Opcode::Statfs => "statfs",
            Opcode::Release => "release",
            Opcode::Fsync => "fsync",
            Opcode::Setxattr => "setxattr",
            Opcode::Getxattr => "getxattr",
            Opcode::Listxattr => "listxattr",
            Opcode::Removexattr => "removexattr",
            Opcode::Flush => "flush",
            Opcode::Init => "init",
            Opcode::Opendir => "opendir",
            Opcode::Readdir => "readdir",
            Opcode::Releasedir => "releasedir",
            Opcode::Fsyncdir => "fsyncdir",
            Opcode::Getlk => "getlk",
            Opcode::Setlk => "setlk",
            Opcode::Setlkw => "setlkw",
            Opcode::Access => "access",
            Opcode::Create => "create",
            Opcode::Interrupt => "interrupt",
            Opcode::Bmap => "bmap",
            Opcode::Destroy => "destroy",
            Opcode::Ioctl => "ioctl",
            Opcode::Poll => "poll",
            Opcode::NotifyReply => "notify_reply",
            Opcode::BatchForget => "batch_forget",
            Opcode::Fallocate => "fallocate",
            Opcode::Readdirplus => "readdirplus",
            Opcode::Rename2 => "rename2",
            Opcode::Lseek => "lseek",
            Opcode::CopyFileRange => "copy_file_range",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Codes carried in the `error` field of an unsolicited notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum NotifyCode {
    Poll = 1,
    InvalInode = 2,
    InvalEntry = 3,
    Store = 4,
    Retrieve = 5,
    Delete = 6,
}

/// Negotiated protocol version.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AbiVersion {
    pub major: u32,
    pub minor: u32,
}

impl AbiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// True when this version is `major.minor` or newer.
    #[inline]
    pub fn at_least(self, major: u32, minor: u32) -> bool {
        self >= AbiVersion::new(major, minor)
    }
}

impl fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

bitflags! {
    /// `FUSE_INIT` request/reply flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct InitFlags: u32 {
        /// asynchronous read requests
        const ASYNC_READ = 1 << 0;
        /// remote locking for POSIX file locks
        const POSIX_LOCKS = 1 << 1;
        /// kernel sends file handle for fstat, etc...
        const FILE_OPS = 1 << 2;
        /// handles the O_TRUNC open flag in the filesystem
        const ATOMIC_O_TRUNC = 1 << 3;
        /// filesystem handles lookups of "." and ".."
        const EXPORT_SUPPORT = 1 << 4;
        /// filesystem can handle write size larger than 4kB
        const BIG_WRITES = 1 << 5;
        /// don't apply umask to file mode on create operations
        const DONT_MASK = 1 << 6;
        /// remote locking for BSD style file locks
        const FLOCK_LOCKS = 1 << 10;
        /// automatically invalidate cached pages
        const AUTO_INVAL_DATA = 1 << 12;
        /// use writeback cache for buffered writes
        const WRITEBACK_CACHE = 1 << 16;
        /// kernel supports zero-message opens
        const NO_OPEN_SUPPORT = 1 << 17;
    }
}

/// Header preceding every request sent to the daemon.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

/// Header preceding every message written by the daemon.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct OutHeader {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

pub const IN_HEADER_SIZE: usize = size_of::<InHeader>();
pub const OUT_HEADER_SIZE: usize = size_of::<OutHeader>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct EntryOut {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: Attr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct AttrOut {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub dummy: u32,
    pub attr: Attr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct OpenOut {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct WriteOut {
    pub size: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct Kstatfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
    pub padding: u32,
    pub spare: [u32; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct StatfsOut {
    pub st: Kstatfs,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct FileLock {
    pub start: u64,
    pub end: u64,
    pub typ: u32,
    pub pid: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct LkOut {
    pub lk: FileLock,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct BmapOut {
    pub block: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct LseekOut {
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub read_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct InterruptIn {
    pub unique: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct InitIn {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
    // 7.23
    pub time_gran: u32,
    // 7.28
    pub max_pages: u16,
    pub padding: u16,
    pub unused: [u32; 8],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct NotifyInvalInodeOut {
    pub ino: u64,
    pub off: i64,
    pub len: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct NotifyInvalEntryOut {
    pub parent: u64,
    pub namelen: u32,
    pub padding: u32,
}

/// `fuse_entry_out` before 7.9 (no `attr.blksize`/`attr.padding`).
pub const COMPAT_ENTRY_OUT_SIZE: usize = 120;
/// `fuse_attr_out` before 7.9.
pub const COMPAT_ATTR_OUT_SIZE: usize = 96;
/// `fuse_statfs_out` before 7.4.
pub const COMPAT_STATFS_SIZE: usize = 48;
/// `fuse_init_out` before 7.5.
pub const COMPAT_INIT_OUT_SIZE: usize = 8;
/// `fuse_init_out` from 7.5 through 7.22.
pub const COMPAT_22_INIT_OUT_SIZE: usize = 24;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes_match_kernel_header() {
        assert_eq!(IN_HEADER_SIZE, 40);
        assert_eq!(OUT_HEADER_SIZE, 16);
        assert_eq!(size_of::<Attr>(), 88);
        assert_eq!(size_of::<EntryOut>(), 128);
        assert_eq!(size_of::<AttrOut>(), 104);
        assert_eq!(size_of::<OpenOut>(), 16);
        assert_eq!(size_of::<WriteOut>(), 8);
        assert_eq!(size_of::<StatfsOut>(), 80);
        assert_eq!(size_of::<LkOut>(), 24);
        assert_eq!(size_of::<ReadIn>(), 40);
        assert_eq!(size_of::<InitIn>(), 16);
        assert_eq!(size_of::<InitOut>(), 64);
        assert_eq!(size_of::<NotifyInvalEntryOut>(), 16);
    }

    #[test]
    fn test_opcode_from_u32() {
        assert_eq!(Opcode::try_from(26u32).unwrap(), Opcode::Init);
        assert_eq!(Opcode::try_from(36u32).unwrap(), Opcode::Interrupt);
        assert!(Opcode::try_from(7u32).is_err());
        assert!(Opcode::try_from(19u32).is_err());
        assert!(Opcode::try_from(4096u32).is_err());
    }

    #[test]
    fn test_opcode_table_is_complete() {
        let from_numbers: Vec<Opcode> = (0u32..64)
            .filter_map(|n| Opcode::try_from(n).ok())
            .collect();
        assert_eq!(from_numbers, Opcode::ALL.to_vec());
        assert!(Opcode::ALL.iter().all(|op| (*op as u32) < 64));
    }

    #[test]
    fn test_abi_version_ordering() {
        let v = AbiVersion::new(7, 9);
        assert!(v.at_least(7, 9));
        assert!(v.at_least(7, 4));
        assert!(!v.at_least(7, 10));
        assert!(AbiVersion::new(8, 0).at_least(7, 28));
        assert_eq!(v.to_string(), "7.9");
    }

    #[test]
    fn test_header_layout_is_host_order() {
        let hdr = OutHeader {
            len: 16,
            error: -2,
            unique: 0x0102,
        };
        let bytes = hdr.as_bytes();
        assert_eq!(&bytes[0..4], &16u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &(-2i32).to_ne_bytes());
        assert_eq!(&bytes[8..16], &0x0102u64.to_ne_bytes());
    }
}
