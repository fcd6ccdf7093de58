//! The read/write surface the daemon drives.
//!
//! # Read
//!
//! Each [`Device::read`] returns exactly one queued request. A buffer too
//! small for the request is fatal to the session; there is no partial read.
//!
//! # Write
//!
//! Each [`Device::write`] carries exactly one response header and its body.
//! The header is audited, the ticket named by `unique` is taken out of the
//! answer registry, and its handler runs with the body. Unique id 0 marks an
//! unsolicited notification instead.
//!
//! Violations that leave the stream untrustworthy mark the session dead;
//! the rest only fail the write call (see [`ProtocolError::is_fatal`]).

use crate::error::{IpcError, ProtocolError};
use crate::notify;
use crate::protocol::{errno, OutHeader, MAX_ERRNO};
use crate::session::{Dequeued, Session, SessionFlags};
use crate::ticket::TicketRef;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zerocopy::FromBytes;

/// Daemon-facing endpoint of a [`Session`].
pub struct Device {
    session: Arc<Session>,
    nonblocking: AtomicBool,
}

impl Device {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            nonblocking: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Make [`read`](Self::read) return [`IpcError::WouldBlock`] instead of
    /// blocking on an empty queue.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    /// True when a read would not block.
    pub fn poll_readable(&self) -> bool {
        self.session.is_dead() || !self.session.queue().is_empty()
    }

    /// Copy the next queued request into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, IpcError> {
        let block = !self.nonblocking.load(Ordering::Relaxed);
        let ticket = match self.session.queue().dequeue_wait(block) {
            Dequeued::Ticket(ticket) => ticket,
            Dequeued::Empty => return Err(IpcError::WouldBlock),
            Dequeued::Closed => return Err(IpcError::ConnectionClosed),
        };
        ticket.mark_dirty();
        self.deliver(ticket, buf)
    }

    /// Copy one dequeued request out; the dequeue reference is dropped on
    /// every path.
    fn deliver(&self, ticket: TicketRef, buf: &mut [u8]) -> Result<usize, IpcError> {
        if self.session.is_dead() {
            return Err(IpcError::ConnectionClosed);
        }

        let state = ticket.lock();
        let msg = state.request.as_slice();
        if msg.len() > buf.len() {
            let err = ProtocolError::ReadBufferTooSmall {
                needed: msg.len(),
                available: buf.len(),
            };
            drop(state);
            tracing::error!(
                target: "fuse-ipc::device",
                unique = ticket.unique(),
                error = %err,
                "read buffer too small, killing session"
            );
            self.session.counters().protocol_error(true);
            self.session.mark_dead();
            return Err(err.into());
        }

        let len = msg.len();
        buf[..len].copy_from_slice(msg);
        drop(state);

        self.session.counters().message_delivered();
        tracing::trace!(
            target: "fuse-ipc::device",
            unique = ticket.unique(),
            len,
            "request delivered"
        );
        Ok(len)
    }

    /// Consume one response or notification written by the daemon.
    pub fn write(&self, buf: &[u8]) -> Result<usize, IpcError> {
        if self.session.is_dead() {
            return Err(IpcError::ConnectionClosed);
        }

        match self.consume(buf) {
            Ok(()) => Ok(buf.len()),
            Err(IpcError::Protocol(err)) => {
                let fatal = err.is_fatal();
                self.session.counters().protocol_error(fatal);
                if fatal {
                    tracing::error!(
                        target: "fuse-ipc::device",
                        error = %err,
                        "protocol violation, killing session"
                    );
                    self.session.mark_dead();
                } else {
                    tracing::warn!(target: "fuse-ipc::device", error = %err, "protocol error");
                }
                Err(IpcError::Protocol(err))
            }
            Err(err) => Err(err),
        }
    }

    fn consume(&self, buf: &[u8]) -> Result<(), IpcError> {
        let (mut hdr, body) = OutHeader::read_from_prefix(buf)
            .map_err(|_| ProtocolError::ShortHeader { len: buf.len() })?;

        if hdr.len as usize != buf.len() {
            return Err(ProtocolError::LengthMismatch {
                declared: hdr.len as usize,
                actual: buf.len(),
            }
            .into());
        }
        // Notifications carry their code in `error` alongside a body.
        if hdr.unique != 0 && hdr.error != 0 && !body.is_empty() {
            return Err(ProtocolError::ErrorWithBody {
                error: hdr.error,
                body_len: body.len(),
            }
            .into());
        }

        if hdr.unique == 0 {
            return notify::deliver(&self.session, hdr.error, body);
        }

        let mut bad_errno = None;
        if hdr.error != 0 && self.session.flags().contains(SessionFlags::LINUX_ERRNOS) {
            match errno::translate_wire_error(hdr.error) {
                Some(translated) => hdr.error = translated,
                None => {
                    bad_errno = Some(ProtocolError::BadErrno(hdr.error));
                    hdr.error = -libc::EIO;
                }
            }
        }

        self.session.counters().response_received();
        match self.session.registry().take(hdr.unique) {
            Some(ticket) => self.answer(ticket, hdr, body, bad_errno),
            None if hdr.error == -libc::EAGAIN => {
                // A daemon may answer an interrupt with EAGAIN after the
                // interrupted request already completed.
                tracing::debug!(
                    target: "fuse-ipc::device",
                    unique = hdr.unique,
                    "ignoring EAGAIN for unknown unique id"
                );
                self.session.counters().stale_interrupt_echo();
                Ok(())
            }
            None => Err(ProtocolError::UnknownUnique(hdr.unique).into()),
        }
    }

    /// Run the handler of a ticket taken out of the registry, then drop the
    /// registry's reference.
    fn answer(
        &self,
        ticket: TicketRef,
        hdr: OutHeader,
        body: &[u8],
        bad_errno: Option<ProtocolError>,
    ) -> Result<(), IpcError> {
        let interrupt = ticket.take_interrupt_unique();
        if interrupt != 0 {
            // The request finished; its interrupt no longer matters.
            if let Some(itick) = self.session.registry().take(interrupt) {
                if let Some(queued) = self.session.queue().unqueue(&itick) {
                    queued.release();
                }
                itick.complete(None);
            }
        }

        let (errno, bad_errno) = match hdr.error.checked_neg() {
            Some(errno) if (0..=MAX_ERRNO).contains(&errno) => (errno, bad_errno),
            _ => (libc::EIO, Some(ProtocolError::BadErrno(hdr.error))),
        };

        let handler = {
            let mut state = ticket.lock();
            state.out_header = hdr;
            state.errno = errno;
            state.handler.take()
        };

        tracing::trace!(
            target: "fuse-ipc::device",
            unique = hdr.unique,
            errno,
            body_len = body.len(),
            "answer received"
        );

        let handled = match handler {
            Some(handler) => handler
                .on_answer(&self.session, &ticket, body)
                .map_err(IpcError::from),
            None => {
                tracing::debug!(
                    target: "fuse-ipc::device",
                    unique = hdr.unique,
                    "no handler, discarding answer"
                );
                Ok(())
            }
        };
        ticket.release();

        handled?;
        match bad_errno {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl io::Read for &Device {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Device::read(*self, buf).map_err(io::Error::from)
    }
}

impl io::Write for &Device {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Device::write(*self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
