//! Ticket-based request/response engine for the FUSE device protocol.
//!
//! `fuse-ipc` is the kernel half of a FUSE connection, moved to user space:
//!
//! - **Tickets**: pooled request/response slots with intrusive-style link
//!   tracking and single-resolution completion
//! - **Session**: outbound queue (urgent before normal), answer registry,
//!   capabilities and teardown
//! - **Device**: the read/write surface a daemon drives, with header and body
//!   audit
//! - **Interrupts**: local cancellation of queued requests and the
//!   `FUSE_INTERRUPT` sub-protocol for delivered ones
//! - **Transport**: a thread pair bridging a [`Device`] onto a byte stream
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use fuse_ipc::{Credentials, Device, Dispatch, Opcode, Session, SessionConfig};
//!
//! let session = Session::new(SessionConfig::new().allow_interrupt(true));
//! let device = Arc::new(Device::new(Arc::clone(&session)));
//! fuse_ipc::transport::bridge(device, daemon_socket)?;
//!
//! session.send_init()?;
//! session.wait_init(Duration::from_secs(5))?;
//!
//! let answer = Dispatch::new(&session, Opcode::Getattr, 1, Credentials::current(), 16)
//!     .wait_answer(None)?;
//! let attr: AttrOut = answer.parse()?;
//! ```

pub mod device;
pub mod dispatch;
pub mod error;
mod init;
pub mod interrupt;
pub mod notify;
pub mod protocol;
pub mod session;
pub mod ticket;
pub mod transport;
pub mod wait;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use device::Device;
pub use dispatch::{Answer, Credentials, Dispatch};
pub use error::{IpcError, ProtocolError};
pub use notify::{LogNotifier, Notifier};
pub use protocol::{AbiVersion, InHeader, InitFlags, Opcode, OutHeader, MAX_MESSAGE_SIZE};
pub use session::{Capabilities, Session, SessionConfig, SessionFlags, StatsSnapshot};
pub use ticket::{Fault, IovPolicy, TicketRef};
pub use wait::{wait_answer, CancelToken};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::device::Device;
    pub use crate::dispatch::{Answer, Credentials, Dispatch};
    pub use crate::error::{IpcError, ProtocolError};
    pub use crate::protocol::{InHeader, Opcode, OutHeader};
    pub use crate::session::{Session, SessionConfig};
    pub use crate::wait::CancelToken;
}

/// Lock a mutex, ignoring poisoning. Every critical section in this crate
/// leaves its data consistent before anything that can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
