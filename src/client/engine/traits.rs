use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use crate::client::drive::Interest;
use crate::client::types::{Attributes, OpenMode};

pub type EngineResult<T> = Result<T, EngineError>;

/// Outcome of a failed engine primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The primitive cannot progress until the socket is ready.
    WouldBlock,
    /// Session-level failure with the engine's last-error message.
    Transport { code: i32, message: String },
    /// The SFTP server answered with a non-OK status.
    Protocol { status: u32, message: String },
}

impl EngineError {
    pub fn transport(code: i32, message: impl Into<String>) -> Self {
        EngineError::Transport {
            code,
            message: message.into(),
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, EngineError::WouldBlock)
    }
}

/// SSH transport primitives.
///
/// Every fallible primitive may return [`EngineError::WouldBlock`] when the
/// engine runs in non-blocking mode. Callers retry the same primitive once
/// the socket is ready in the direction reported by
/// [`block_directions`](SshEngine::block_directions).
pub trait SshEngine {
    type Sftp: SftpChannel;

    fn set_blocking(&mut self, blocking: bool);

    /// Run (or continue) the key exchange over the connected socket.
    fn handshake(&mut self, socket: RawFd) -> EngineResult<()>;

    fn auth_password(&mut self, username: &str, password: &str) -> EngineResult<()>;

    /// Authenticate with an in-memory PEM private key.
    fn auth_publickey(
        &mut self,
        username: &str,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> EngineResult<()>;

    fn open_sftp(&mut self) -> EngineResult<Self::Sftp>;

    /// Direction the engine was waiting on when it last returned `WouldBlock`.
    fn block_directions(&self) -> Interest;

    /// Send an SSH disconnect message. Failures are not reported.
    fn disconnect(&mut self, description: &str);
}

/// SFTP subsystem primitives. Dropping the channel shuts it down.
pub trait SftpChannel {
    type File: RemoteFileOps;
    type Dir: RemoteDirOps;

    fn open(&self, path: &Path, mode: OpenMode, permissions: i32) -> EngineResult<Self::File>;
    fn opendir(&self, path: &Path) -> EngineResult<Self::Dir>;
    fn stat(&self, path: &Path) -> EngineResult<Attributes>;
    fn mkdir(&self, path: &Path, permissions: i32) -> EngineResult<()>;
    fn rmdir(&self, path: &Path) -> EngineResult<()>;
    fn rename(&self, from: &Path, to: &Path) -> EngineResult<()>;
    fn unlink(&self, path: &Path) -> EngineResult<()>;
    fn realpath(&self, path: &Path) -> EngineResult<PathBuf>;
}

/// Common behaviour of open remote handles.
///
/// Handles are closed (or dropped) before the channel and engine that
/// issued them.
pub trait RemoteHandle {
    fn close(&mut self) -> EngineResult<()>;
}

pub trait RemoteFileOps: RemoteHandle {
    /// Read up to `buf.len()` bytes. `Ok(0)` means end of file.
    fn read(&mut self, buf: &mut [u8]) -> EngineResult<usize>;

    /// Write a prefix of `buf`, returning how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> EngineResult<usize>;

    /// Set the absolute offset. Local bookkeeping only, never blocks.
    fn seek(&mut self, offset: u64);
}

pub trait RemoteDirOps: RemoteHandle {
    /// Next entry name and attributes, or `None` at end of listing.
    fn readdir(&mut self) -> EngineResult<Option<(Vec<u8>, Attributes)>>;
}
