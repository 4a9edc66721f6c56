//! TCP transport for a session: name resolution and socket connect.
//!
//! The socket is created with `nix` so that it can be put into non-blocking
//! mode before `connect(2)` runs. In non-blocking mode a connect in progress
//! is reported as [`ConnectStatus::InProgress`] and completed by calling
//! [`TransportSocket::connect`] again once the socket is writable. In blocking
//! mode interrupted or in-progress connects are finished internally.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, SockaddrStorage, connect, socket};
use tracing::debug;

use super::drive::{Interest, Readiness};
use super::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectStatus {
    Connected,
    InProgress,
}

/// Resolve `host:port` to the first address the resolver returns.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let resolution_error = |reason: String| Error::Resolve {
        host: host.to_string(),
        reason,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(|e| resolution_error(e.to_string()))?
        .next()
        .ok_or_else(|| resolution_error("no addresses found".to_string()))
}

/// Connected (or connecting) TCP socket. Dropping it closes the descriptor.
#[derive(Debug)]
pub(crate) struct TransportSocket {
    fd: OwnedFd,
    addr: SocketAddr,
    blocking: bool,
}

impl TransportSocket {
    pub(crate) fn open(addr: SocketAddr, blocking: bool) -> Result<Self> {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        let mut flags = SockFlag::SOCK_CLOEXEC;
        if !blocking {
            flags |= SockFlag::SOCK_NONBLOCK;
        }
        let fd = socket(family, SockType::Stream, flags, None)
            .map_err(|e| Error::Socket(io::Error::from(e)))?;
        debug!("Opened socket {} for {}", fd.as_raw_fd(), addr);
        Ok(Self { fd, addr, blocking })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Readiness a pending connect waits on.
    pub(crate) fn readiness(&self) -> Readiness {
        Readiness::new(self.fd(), Interest::Writable)
    }

    /// Start or continue connecting to the resolved address.
    pub(crate) fn connect(&self) -> Result<ConnectStatus> {
        let dest = SockaddrStorage::from(self.addr);
        loop {
            match connect(self.fd(), &dest) {
                Ok(()) | Err(Errno::EISCONN) => return Ok(ConnectStatus::Connected),
                Err(Errno::EINTR) => continue,
                Err(Errno::EINPROGRESS | Errno::EALREADY | Errno::EAGAIN) => {
                    if !self.blocking {
                        return Ok(ConnectStatus::InProgress);
                    }
                    self.wait_writable()?;
                }
                Err(e) => return Err(Error::Connect(io::Error::from(e))),
            }
        }
    }

    fn wait_writable(&self) -> Result<()> {
        let mut poll_fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLOUT)];
        loop {
            match poll(&mut poll_fds, PollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Connect(io::Error::from(e))),
            }
        }
    }

    /// Close the descriptor.
    pub(crate) fn close(self) {
        debug!("Closing socket {} for {}", self.fd(), self.addr);
        drop(self.fd);
    }
}
