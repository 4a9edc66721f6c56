//! Suspend/resume protocol for long-running operations.
//!
//! Every session and handle operation is a [`Resumable`] value. Driving it
//! either completes with the result or suspends with a [`Readiness`] request:
//! the socket descriptor and the direction the engine is waiting on. The host
//! waits for that readiness however it likes and then drives the same value
//! again. Operation state (chosen auth method, read buffer, progress through
//! the handshake) lives inside the operation or its session, never in the
//! host's call stack.
//!
//! Two ready-made host drivers are provided:
//!
//! - [`wait`]: blocks the current thread on `poll(2)` between drives
//! - [`complete`]: awaits readiness on the tokio reactor between drives

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::io::unix::AsyncFd;
use tracing::trace;

use super::error::{Error, Result};

/// Socket direction an operation is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    Both,
}

impl Interest {
    fn poll_flags(self) -> PollFlags {
        match self {
            Interest::Readable => PollFlags::POLLIN,
            Interest::Writable => PollFlags::POLLOUT,
            Interest::Both => PollFlags::POLLIN | PollFlags::POLLOUT,
        }
    }

    fn tokio_interest(self) -> tokio::io::Interest {
        match self {
            Interest::Readable => tokio::io::Interest::READABLE,
            Interest::Writable => tokio::io::Interest::WRITABLE,
            Interest::Both => tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
        }
    }
}

/// What a suspended operation needs before it can make progress.
///
/// Only produced by this crate, from the socket of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    fd: RawFd,
    interest: Interest,
}

/// Result of driving a [`Resumable`] once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    Done(T),
    Suspended(Readiness),
}

impl<T> Progress<T> {
    pub fn is_suspended(&self) -> bool {
        matches!(self, Progress::Suspended(_))
    }
}

/// An operation that can be driven repeatedly until it completes.
///
/// Driving again after `Done` fails with [`Error::Finished`] unless the
/// operation documents otherwise.
pub trait Resumable {
    type Output;

    fn drive(&mut self) -> Result<Progress<Self::Output>>;
}

/// Descriptor registered with the tokio reactor for the duration of one wait.
struct Registered(RawFd);

impl AsRawFd for Registered {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Readiness {
    pub(crate) fn new(fd: RawFd, interest: Interest) -> Self {
        Self { fd, interest }
    }

    /// Descriptor to wait on, for hosts running their own event loop.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    fn checked_fd(&self) -> Result<RawFd> {
        if self.fd < 0 {
            return Err(Error::Io(io::Error::from(Errno::EBADF)));
        }
        Ok(self.fd)
    }

    /// Block the current thread until the descriptor is ready.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Upper bound on the wait, `None` waits indefinitely
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the bound elapses first, an I/O error with
    /// `EBADF` when the descriptor is invalid or was closed.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let raw = self.checked_fd()?;
        // SAFETY: `raw` is non-negative and the borrow only lives for the
        // poll(2) calls below, which look the number up in the descriptor
        // table and report a closed descriptor as POLLNVAL.
        let fd = unsafe { BorrowedFd::borrow_raw(raw) };
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::Timeout);
                    }
                    let millis = remaining.as_millis().clamp(1, u16::MAX as u128) as u16;
                    PollTimeout::from(millis)
                }
                None => PollTimeout::NONE,
            };

            let mut poll_fds = [PollFd::new(fd, self.interest.poll_flags())];
            match poll(&mut poll_fds, slice) {
                Ok(0) => continue,
                Ok(_) => {
                    let revents = poll_fds[0].revents().unwrap_or(PollFlags::empty());
                    if revents.contains(PollFlags::POLLNVAL) {
                        return Err(Error::Io(io::Error::from(Errno::EBADF)));
                    }
                    return Ok(());
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Io(io::Error::from(e))),
            }
        }
    }

    /// Wait on the tokio reactor until the descriptor is ready.
    pub async fn ready(&self) -> Result<()> {
        let registered = AsyncFd::with_interest(
            Registered(self.checked_fd()?),
            self.interest.tokio_interest(),
        )?;
        match self.interest {
            Interest::Readable => {
                registered.readable().await?;
            }
            Interest::Writable => {
                registered.writable().await?;
            }
            Interest::Both => {
                tokio::select! {
                    ready = registered.readable() => { ready?; }
                    ready = registered.writable() => { ready?; }
                }
            }
        }
        Ok(())
    }
}

/// Drive `op` to completion, blocking on `poll(2)` whenever it suspends.
///
/// # Arguments
///
/// * `op` - The operation to drive
/// * `timeout` - Bound on each individual readiness wait
pub fn wait<R: Resumable>(op: &mut R, timeout: Option<Duration>) -> Result<R::Output> {
    loop {
        match op.drive()? {
            Progress::Done(output) => return Ok(output),
            Progress::Suspended(readiness) => {
                trace!("Suspended on fd {} ({:?})", readiness.fd, readiness.interest);
                readiness.wait(timeout)?;
            }
        }
    }
}

/// Drive `op` to completion on the tokio reactor.
pub async fn complete<R: Resumable>(op: &mut R) -> Result<R::Output> {
    loop {
        match op.drive()? {
            Progress::Done(output) => return Ok(output),
            Progress::Suspended(readiness) => {
                trace!("Suspended on fd {} ({:?})", readiness.fd, readiness.interest);
                readiness.ready().await?;
            }
        }
    }
}
