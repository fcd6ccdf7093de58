//! Byte-stream transport for a [`Device`](crate::Device).
//!
//! Every FUSE message, in either direction, starts with a `u32` holding the
//! length of the whole message including its header. That prefix is all the
//! framing a stream needs, so requests and answers travel unchanged.
//!
//! # Example
//!
//! ```rust,ignore
//! use fuse_ipc::transport;
//!
//! let (engine_end, daemon_end) = UnixStream::pair()?;
//! let bridge = transport::bridge(Arc::clone(&device), engine_end)?;
//! // hand `daemon_end` to the filesystem daemon
//! ```

mod bridge;

pub use bridge::{bridge, Bridge};

use crate::protocol::{MAX_MESSAGE_SIZE, OUT_HEADER_SIZE};
use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;

/// A bidirectional stream that can be split across two threads.
pub trait DuplexStream: Read + io::Write + Send + Sized + 'static {
    /// A second handle to the same stream.
    fn try_clone(&self) -> io::Result<Self>;

    /// Close both directions so a peer blocked in `read` sees end of stream.
    fn shutdown(&self) -> io::Result<()>;
}

impl DuplexStream for UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)
    }
}

impl DuplexStream for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Read one length-prefixed FUSE message.
///
/// Returns `UnexpectedEof` when the stream ends cleanly between messages and
/// `InvalidData` for a length below the smallest header or above
/// [`MAX_MESSAGE_SIZE`].
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_ne_bytes(len_buf) as usize;
    if !(OUT_HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} out of range"),
        ));
    }

    let mut frame = vec![0u8; len];
    frame[..4].copy_from_slice(&len_buf);
    reader.read_exact(&mut frame[4..])?;
    Ok(frame)
}
