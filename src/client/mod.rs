//! SSH client session and SFTP orchestration.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Connection states, attributes, directory entries and open modes
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy, SFTP status translation and retry classification
//! - `drive`: Resumable operations and readiness waiting
//! - `transport`: Host resolution and TCP socket connect
//! - `engine`: Seam over the SSH implementation (libssh2 in production)
//! - `auth`: Password and public key strategies
//! - `session`: Connect state machine and path-based SFTP requests
//! - `handle`: Remote file and directory handles

pub mod auth;
pub mod config;
pub mod drive;
pub mod engine;
pub mod error;
pub mod handle;
pub mod session;
pub(crate) mod transport;
pub mod types;

pub use config::{Identity, RetryPolicy, SessionConfig};
pub use drive::{Interest, Progress, Readiness, Resumable};
pub use engine::Libssh2Engine;
pub use error::{Error, ErrorKind, HandleKind, Result};
pub use handle::{RemoteDir, RemoteFile};
pub use session::{Session, connect_with_retry};
pub use types::{Attributes, ConnectionState, DirEntry, FileKind, OpenMode, SessionInfo};
