//! Request/answer convenience for filesystem operation layers.
//!
//! [`Dispatch`] wraps the common sequence: activate a ticket, encode the
//! request header and payload, register and queue it, wait, and turn the
//! outcome into a `Result`.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut req = Dispatch::new(&session, Opcode::Getattr, ino, Credentials::current(), 16);
//! req.write_payload(|p| p.copy_from_slice(getattr_in.as_bytes()));
//! let attr: AttrOut = req.wait_answer(None)?.parse()?;
//! ```

use crate::error::{IpcError, ProtocolError};
use crate::protocol::abi::ReadIn;
use crate::protocol::{audit, InHeader, Opcode, IN_HEADER_SIZE, MAX_MESSAGE_SIZE};
use crate::session::Session;
use crate::ticket::{Fault, ResponseHandler, TicketRef, TicketState};
use crate::wait::{wait_answer, CancelToken};
use std::sync::{Arc, OnceLock};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Identity of the process on whose behalf a request is made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credentials {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    /// Credentials of the calling process.
    pub fn current() -> Self {
        // SAFETY: these calls have no preconditions and cannot fail.
        unsafe {
            Self {
                pid: libc::getpid() as u32,
                uid: libc::getuid(),
                gid: libc::getgid(),
            }
        }
    }
}

/// Total length of a request carrying `payload_len` bytes, if it can be sent.
fn request_len(payload_len: usize) -> Option<u32> {
    IN_HEADER_SIZE
        .checked_add(payload_len)
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .and_then(|len| u32::try_from(len).ok())
}

/// Write a request header followed by a fixed-layout payload into the ticket.
pub(crate) fn encode_request<T: IntoBytes + Immutable>(
    state: &mut TicketState,
    opcode: Opcode,
    unique: u64,
    nodeid: u64,
    creds: Credentials,
    payload: &T,
) {
    let payload = payload.as_bytes();
    // ABI structs are a few dozen bytes.
    let len = (IN_HEADER_SIZE + payload.len()) as u32;
    encode_header(state, opcode, unique, nodeid, creds, len);
    state.request.as_mut_slice()[IN_HEADER_SIZE..].copy_from_slice(payload);
}

/// Write a header for a `len`-byte request; the payload is zero filled.
fn encode_header(
    state: &mut TicketState,
    opcode: Opcode,
    unique: u64,
    nodeid: u64,
    creds: Credentials,
    len: u32,
) {
    let hdr = InHeader {
        len,
        opcode: opcode as u32,
        unique,
        nodeid,
        uid: creds.uid,
        gid: creds.gid,
        pid: creds.pid,
        padding: 0,
    };
    state.request.adjust(len as usize);
    let buf = state.request.as_mut_slice();
    buf[..IN_HEADER_SIZE].copy_from_slice(hdr.as_bytes());
    buf[IN_HEADER_SIZE..].fill(0);
}

/// Default answer handler: audit the body, copy it into the ticket and
/// resolve it.
pub(crate) struct StandardHandler;

fn standard_handler() -> Arc<dyn ResponseHandler> {
    static HANDLER: OnceLock<Arc<dyn ResponseHandler>> = OnceLock::new();
    Arc::clone(HANDLER.get_or_init(|| Arc::new(StandardHandler)))
}

impl StandardHandler {
    fn pull(session: &Session, state: &mut TicketState, body: &[u8]) -> Result<(), ProtocolError> {
        if let Some(opcode) = state
            .in_header()
            .and_then(|hdr| Opcode::try_from(hdr.opcode).ok())
        {
            let read_size = match opcode {
                Opcode::Read | Opcode::Readdir | Opcode::Readdirplus => {
                    ReadIn::read_from_prefix(state.request_payload())
                        .ok()
                        .map(|(read_in, _)| read_in.size)
                }
                _ => None,
            };
            audit(opcode, session.abi(), read_size, body.len())?;
        }
        state.response.fill_from(body);
        Ok(())
    }
}

impl ResponseHandler for StandardHandler {
    fn on_answer(
        &self,
        session: &Session,
        ticket: &TicketRef,
        body: &[u8],
    ) -> Result<(), ProtocolError> {
        let mut state = ticket.lock();
        let pulled = if state.errno == 0 {
            Self::pull(session, &mut state, body)
        } else {
            Ok(())
        };
        let fault = pulled.is_err().then_some(Fault::BadResponse);
        ticket.resolve(&mut state, fault);
        pulled
    }
}

/// One outgoing request.
pub struct Dispatch<'s> {
    session: &'s Session,
    ticket: TicketRef,
    opcode: Opcode,
    /// Set when the payload cannot be framed; the request is never sent.
    oversized: Option<usize>,
}

impl<'s> Dispatch<'s> {
    /// Activate a ticket and write a header for a `payload_len`-byte payload,
    /// zero filled.
    ///
    /// A request longer than [`MAX_MESSAGE_SIZE`] is not encoded; sending it
    /// fails with [`IpcError::RequestTooLarge`].
    pub fn new(
        session: &'s Session,
        opcode: Opcode,
        nodeid: u64,
        creds: Credentials,
        payload_len: usize,
    ) -> Self {
        let ticket = session.activate();
        let oversized = match request_len(payload_len) {
            Some(len) => {
                encode_header(&mut ticket.lock(), opcode, ticket.unique(), nodeid, creds, len);
                None
            }
            None => {
                tracing::warn!(
                    target: "fuse-ipc::dispatch",
                    ?opcode,
                    payload_len,
                    "request too large to send"
                );
                Some(payload_len)
            }
        };
        Self {
            session,
            ticket,
            opcode,
            oversized,
        }
    }

    pub fn with_payload(
        session: &'s Session,
        opcode: Opcode,
        nodeid: u64,
        creds: Credentials,
        payload: &[u8],
    ) -> Self {
        let dispatch = Self::new(session, opcode, nodeid, creds, payload.len());
        dispatch.write_payload(|buf| buf.copy_from_slice(payload));
        dispatch
    }

    pub fn unique(&self) -> u64 {
        self.ticket.unique()
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn ticket(&self) -> &TicketRef {
        &self.ticket
    }

    /// Fill in the request payload. Does nothing for an oversized request.
    pub fn write_payload(&self, f: impl FnOnce(&mut [u8])) {
        if self.oversized.is_some() {
            return;
        }
        let mut state = self.ticket.lock();
        f(&mut state.request.as_mut_slice()[IN_HEADER_SIZE..]);
    }

    /// Send the request and block for its answer.
    pub fn wait_answer(self, cancel: Option<&CancelToken>) -> Result<Answer, IpcError> {
        let Dispatch {
            session,
            ticket,
            opcode,
            oversized,
        } = self;
        if let Some(len) = oversized {
            return Err(IpcError::RequestTooLarge(len));
        }

        ticket.lock().handler = Some(standard_handler());
        if !session.register(&ticket) {
            return Err(IpcError::ConnectionClosed);
        }
        session.enqueue(&ticket, false);
        wait_answer(session, &ticket, cancel)?;

        let errno = ticket.lock().errno;
        match errno {
            0 => {
                session.set_impl(opcode);
                Ok(Answer { ticket, opcode })
            }
            libc::ENOSYS => {
                session.set_not_impl(opcode);
                Err(IpcError::NotImplemented(opcode))
            }
            errno => Err(IpcError::Daemon(errno)),
        }
    }

    /// Queue a request the daemon never answers, such as `FORGET`.
    pub fn send_no_reply(self) -> Result<(), IpcError> {
        if let Some(len) = self.oversized {
            return Err(IpcError::RequestTooLarge(len));
        }
        if self.session.enqueue(&self.ticket, false) {
            Ok(())
        } else {
            Err(IpcError::ConnectionClosed)
        }
    }
}

/// Successful answer to a [`Dispatch`].
#[derive(Debug)]
pub struct Answer {
    ticket: TicketRef,
    opcode: Opcode,
}

impl Answer {
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn unique(&self) -> u64 {
        self.ticket.unique()
    }

    pub fn len(&self) -> usize {
        self.ticket.lock().response.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the answer body.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.ticket.lock().response.as_slice())
    }

    /// Copy of the answer body.
    pub fn bytes(&self) -> Vec<u8> {
        self.with_bytes(<[u8]>::to_vec)
    }

    /// Decode a fixed-layout structure from the start of the body.
    pub fn parse<T: FromBytes>(&self) -> Result<T, IpcError> {
        self.with_bytes(|body| {
            T::read_from_prefix(body)
                .map(|(value, _)| value)
                .map_err(|_| IpcError::BadResponse)
        })
    }
}
