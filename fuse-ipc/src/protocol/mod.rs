//! Wire protocol spoken between the engine and the filesystem daemon.
//!
//! - [`abi`]: fixed headers, payload layouts and opcode numbering
//! - [`audit`]: per-opcode response size table
//! - [`errno`]: Linux to host errno translation

pub mod abi;
pub mod audit;
pub mod errno;

pub use abi::{
    AbiVersion, InHeader, InitFlags, NotifyCode, Opcode, OutHeader, IN_HEADER_SIZE,
    KERNEL_MINOR_VERSION, KERNEL_VERSION, MAX_ERRNO, OUT_HEADER_SIZE,
};
pub use audit::{audit, expected_body, BodyShape};

/// Largest frame accepted from a byte-stream transport (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
