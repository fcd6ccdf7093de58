//! Error types for the dispatch engine.

use crate::protocol::{BodyShape, Opcode};
use std::io;

/// Outcome of a request that did not produce a successful answer.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The session is dead: the daemon went away or the session was torn down.
    #[error("connection to the filesystem daemon is closed")]
    ConnectionClosed,

    /// The daemon did not answer within the session's timeout.
    #[error("timed out waiting for the filesystem daemon")]
    TimedOut,

    /// The caller cancelled the request.
    #[error("request interrupted")]
    Interrupted,

    /// The daemon reported that it does not implement this operation.
    #[error("daemon does not implement {0}")]
    NotImplemented(Opcode),

    /// Unsolicited notification code this engine does not handle.
    #[error("notification {0} is not implemented")]
    UnsupportedNotification(i32),

    /// The daemon answered with an errno.
    #[error("daemon returned errno {0}")]
    Daemon(i32),

    /// The daemon's answer to this request could not be accepted.
    #[error("malformed answer from the filesystem daemon")]
    BadResponse,

    /// The daemon violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The request payload cannot be framed in one message.
    #[error("request payload of {0} bytes is too large")]
    RequestTooLarge(usize),

    /// Nothing to read and the device is in non-blocking mode.
    #[error("operation would block")]
    WouldBlock,

    /// A waiter woke up without its ticket being answered.
    #[error("woken without an answer")]
    Internal,
}

impl IpcError {
    /// The errno a filesystem caller should see for this outcome.
    pub fn errno(&self) -> i32 {
        match self {
            IpcError::ConnectionClosed => libc::ENOTCONN,
            IpcError::TimedOut => libc::ETIMEDOUT,
            IpcError::Interrupted => libc::EINTR,
            IpcError::NotImplemented(_) | IpcError::UnsupportedNotification(_) => libc::ENOSYS,
            IpcError::Daemon(errno) => *errno,
            IpcError::BadResponse => libc::EIO,
            IpcError::Protocol(_) => libc::EINVAL,
            IpcError::RequestTooLarge(_) => libc::E2BIG,
            IpcError::WouldBlock => libc::EAGAIN,
            IpcError::Internal => libc::ENXIO,
        }
    }

    /// True when the error came from the daemon violating the protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(self, IpcError::Protocol(_))
    }
}

impl From<IpcError> for io::Error {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::ConnectionClosed => io::Error::new(io::ErrorKind::NotConnected, err),
            IpcError::TimedOut => io::Error::new(io::ErrorKind::TimedOut, err),
            IpcError::Interrupted => io::Error::new(io::ErrorKind::Interrupted, err),
            IpcError::WouldBlock => io::Error::new(io::ErrorKind::WouldBlock, err),
            IpcError::Protocol(_) => io::Error::new(io::ErrorKind::InvalidData, err),
            other => io::Error::from_raw_os_error(other.errno()),
        }
    }
}

/// A malformed or inconsistent message from the daemon.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message of {len} bytes is shorter than the response header")]
    ShortHeader { len: usize },

    #[error("header declares {declared} bytes but {actual} were written")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("error {error} carries a {body_len}-byte body")]
    ErrorWithBody { error: i32, body_len: usize },

    #[error("{opcode} answer of {actual} bytes, expected {expected}")]
    BodyAudit {
        opcode: Opcode,
        expected: BodyShape,
        actual: usize,
    },

    #[error("no request with unique id {0} is waiting")]
    UnknownUnique(u64),

    #[error("error value {0} is out of range")]
    BadErrno(i32),

    #[error("unexpected answer {0} to an interrupt")]
    BadInterruptReply(i32),

    #[error("malformed notification {code}: {reason}")]
    BadNotification { code: i32, reason: &'static str },

    #[error("daemon speaks protocol {major}.{minor}, need 7.4 or newer")]
    UnsupportedVersion { major: u32, minor: u32 },

    #[error("init answer of {0} bytes does not match the negotiated version")]
    BadInitReply(usize),

    #[error("read buffer of {available} bytes cannot hold a {needed}-byte message")]
    ReadBufferTooSmall { needed: usize, available: usize },
}

impl ProtocolError {
    /// Whether this violation leaves the session unusable.
    ///
    /// Fatal violations mark the session dead; the others only fail the
    /// write call that carried them.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProtocolError::ShortHeader { .. }
            | ProtocolError::LengthMismatch { .. }
            | ProtocolError::ErrorWithBody { .. }
            | ProtocolError::BodyAudit { .. }
            | ProtocolError::UnsupportedVersion { .. }
            | ProtocolError::BadInitReply(_)
            | ProtocolError::ReadBufferTooSmall { .. } => true,
            ProtocolError::UnknownUnique(_)
            | ProtocolError::BadErrno(_)
            | ProtocolError::BadInterruptReply(_)
            | ProtocolError::BadNotification { .. } => false,
        }
    }
}
