//! Engine seam between the orchestration layer and the SSH implementation.
//!
//! The session and handle types only talk to the traits defined here, which
//! keeps the resumable state machine independent of the wire implementation.
//!
//! # Components
//!
//! - [`SshEngine`]: transport primitives (handshake, auth, SFTP init)
//! - [`SftpChannel`]: path-based SFTP requests
//! - [`RemoteFileOps`] / [`RemoteDirOps`]: per-handle requests
//! - [`Libssh2Engine`]: production engine on top of the `ssh2` crate

mod libssh2;
mod traits;

#[cfg(test)]
pub(crate) mod fake;

pub use libssh2::Libssh2Engine;
pub use traits::{
    EngineError, EngineResult, RemoteDirOps, RemoteFileOps, RemoteHandle, SftpChannel, SshEngine,
};
