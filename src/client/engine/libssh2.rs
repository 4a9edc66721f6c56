//! Production engine backed by libssh2 through the `ssh2` crate.
//!
//! The session never owns the socket: it is attached as a borrowed descriptor
//! so that closing stays with the transport layer, which closes it exactly
//! once after the engine has been released.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use ssh2::{BlockDirections, ErrorCode, File, OpenFlags, OpenType, Session, Sftp};
use tracing::{debug, warn};

use super::traits::{
    EngineError, EngineResult, RemoteDirOps, RemoteFileOps, RemoteHandle, SftpChannel, SshEngine,
};
use crate::client::drive::Interest;
use crate::client::types::{Attributes, OpenMode};

const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// Socket descriptor lent to libssh2. Dropping it does not close anything.
struct LentSocket(RawFd);

impl AsRawFd for LentSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

pub struct Libssh2Engine {
    session: Session,
    attached: bool,
}

impl Libssh2Engine {
    /// Allocate a fresh libssh2 session.
    pub fn new() -> EngineResult<Self> {
        let session = Session::new().map_err(engine_error)?;
        Ok(Self {
            session,
            attached: false,
        })
    }
}

impl SshEngine for Libssh2Engine {
    type Sftp = Sftp;

    fn set_blocking(&mut self, blocking: bool) {
        self.session.set_blocking(blocking);
    }

    fn handshake(&mut self, socket: RawFd) -> EngineResult<()> {
        if !self.attached {
            self.session.set_tcp_stream(LentSocket(socket));
            self.attached = true;
        }
        self.session.handshake().map_err(engine_error)
    }

    fn auth_password(&mut self, username: &str, password: &str) -> EngineResult<()> {
        self.session
            .userauth_password(username, password)
            .map_err(engine_error)
    }

    fn auth_publickey(
        &mut self,
        username: &str,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> EngineResult<()> {
        self.session
            .userauth_pubkey_memory(username, None, private_key, passphrase)
            .map_err(engine_error)
    }

    fn open_sftp(&mut self) -> EngineResult<Sftp> {
        self.session.sftp().map_err(engine_error)
    }

    fn block_directions(&self) -> Interest {
        match self.session.block_directions() {
            BlockDirections::Inbound => Interest::Readable,
            BlockDirections::Outbound => Interest::Writable,
            BlockDirections::Both | BlockDirections::None => Interest::Both,
        }
    }

    fn disconnect(&mut self, description: &str) {
        // Non-blocking mode would drop the message on EAGAIN.
        self.session.set_blocking(true);
        if let Err(err) = self.session.disconnect(None, description, None) {
            debug!("SSH disconnect message not delivered: {}", err);
        }
    }
}

impl SftpChannel for Sftp {
    type File = File;
    type Dir = File;

    fn open(&self, path: &Path, mode: OpenMode, permissions: i32) -> EngineResult<File> {
        Sftp::open_mode(self, path, open_flags(mode), permissions, OpenType::File)
            .map_err(engine_error)
    }

    fn opendir(&self, path: &Path) -> EngineResult<File> {
        Sftp::opendir(self, path).map_err(engine_error)
    }

    fn stat(&self, path: &Path) -> EngineResult<Attributes> {
        let stat = Sftp::stat(self, path).map_err(engine_error)?;
        Ok(Attributes::from_raw(stat.size, stat.perm, stat.mtime))
    }

    fn mkdir(&self, path: &Path, permissions: i32) -> EngineResult<()> {
        Sftp::mkdir(self, path, permissions).map_err(engine_error)
    }

    fn rmdir(&self, path: &Path) -> EngineResult<()> {
        Sftp::rmdir(self, path).map_err(engine_error)
    }

    fn rename(&self, from: &Path, to: &Path) -> EngineResult<()> {
        Sftp::rename(self, from, to, None).map_err(engine_error)
    }

    fn unlink(&self, path: &Path) -> EngineResult<()> {
        Sftp::unlink(self, path).map_err(engine_error)
    }

    fn realpath(&self, path: &Path) -> EngineResult<PathBuf> {
        Sftp::realpath(self, path).map_err(engine_error)
    }
}

impl RemoteHandle for File {
    fn close(&mut self) -> EngineResult<()> {
        File::close(self).map_err(engine_error)
    }
}

impl RemoteFileOps for File {
    fn read(&mut self, buf: &mut [u8]) -> EngineResult<usize> {
        Read::read(self, buf).map_err(io_engine_error)
    }

    fn write(&mut self, buf: &[u8]) -> EngineResult<usize> {
        Write::write(self, buf).map_err(io_engine_error)
    }

    fn seek(&mut self, offset: u64) {
        if let Err(err) = Seek::seek(self, SeekFrom::Start(offset)) {
            warn!("SFTP seek to {} failed: {}", offset, err);
        }
    }
}

impl RemoteDirOps for File {
    fn readdir(&mut self) -> EngineResult<Option<(Vec<u8>, Attributes)>> {
        match File::readdir(self) {
            Ok((name, stat)) => Ok(Some((
                name.into_os_string().into_vec(),
                Attributes::from_raw(stat.size, stat.perm, stat.mtime),
            ))),
            Err(err) if matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_FILE)) => Ok(None),
            Err(err) => Err(engine_error(err)),
        }
    }
}

fn open_flags(mode: OpenMode) -> OpenFlags {
    let mut flags = OpenFlags::empty();
    if mode.read {
        flags |= OpenFlags::READ;
    }
    if mode.write {
        flags |= OpenFlags::WRITE;
    }
    if mode.create {
        flags |= OpenFlags::CREATE;
    }
    if mode.truncate {
        flags |= OpenFlags::TRUNCATE;
    }
    if mode.append {
        flags |= OpenFlags::APPEND;
    }
    flags
}

fn classify(err: &ssh2::Error) -> EngineError {
    match err.code() {
        ErrorCode::Session(LIBSSH2_ERROR_EAGAIN) => EngineError::WouldBlock,
        ErrorCode::Session(code) => EngineError::transport(code, err.message()),
        ErrorCode::SFTP(status) => EngineError::Protocol {
            status: status as u32,
            message: err.message().to_string(),
        },
    }
}

fn engine_error(err: ssh2::Error) -> EngineError {
    classify(&err)
}

/// `ssh2` reports handle I/O through `std::io`; recover the libssh2 error
/// when it is wrapped inside.
fn io_engine_error(err: io::Error) -> EngineError {
    if err.kind() == io::ErrorKind::WouldBlock {
        return EngineError::WouldBlock;
    }
    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<ssh2::Error>())
    {
        Some(inner) => classify(inner),
        None => EngineError::transport(-1, err.to_string()),
    }
}
