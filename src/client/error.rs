//! Error type for sessions, handles and resumable operations.
//!
//! Every failure a caller can observe is an [`Error`]. Engine failures are
//! translated at a single point, [`translate`], with these rules:
//!
//! 1. **Protocol failures**: the SFTP server returned a non-OK status. The
//!    status is mapped to the closest POSIX errno and rendered with the
//!    platform's error text, so a missing path reads
//!    "No such file or directory" on every backend.
//!
//! 2. **Transport failures**: anything else the engine reports. The message
//!    is the engine's last-error string, passed through unchanged.
//!
//! # Retry Classification
//!
//! [`Error::is_retryable`] decides whether a whole connect attempt is worth
//! repeating. Authentication failures are never retried and take precedence
//! over connection keywords, to avoid locking accounts with bad credentials.

use std::fmt;
use std::io;

use nix::errno::Errno;
use thiserror::Error;

use super::engine::EngineError;

/// SFTP `SSH_FX_*` status codes.
pub mod status {
    pub const OK: u32 = 0;
    pub const EOF: u32 = 1;
    pub const NO_SUCH_FILE: u32 = 2;
    pub const PERMISSION_DENIED: u32 = 3;
    pub const FAILURE: u32 = 4;
    pub const BAD_MESSAGE: u32 = 5;
    pub const NO_CONNECTION: u32 = 6;
    pub const CONNECTION_LOST: u32 = 7;
    pub const OP_UNSUPPORTED: u32 = 8;
    pub const INVALID_HANDLE: u32 = 9;
    pub const NO_SUCH_PATH: u32 = 10;
    pub const FILE_ALREADY_EXISTS: u32 = 11;
    pub const WRITE_PROTECT: u32 = 12;
    pub const NO_MEDIA: u32 = 13;
    pub const NO_SPACE_ON_FILESYSTEM: u32 = 14;
    pub const QUOTA_EXCEEDED: u32 = 15;
    pub const UNKNOWN_PRINCIPAL: u32 = 16;
    pub const LOCK_CONFLICT: u32 = 17;
    pub const DIR_NOT_EMPTY: u32 = 18;
    pub const NOT_A_DIRECTORY: u32 = 19;
    pub const INVALID_FILENAME: u32 = 20;
    pub const LINK_LOOP: u32 = 21;
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "username/password",
    "unable to extract public key",
    "unable to initialize private key",
    "invalid passphrase",
    "permission denied",
    "publickey",
    "requires either a password or an identity",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "timed out",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "unable to exchange encryption keys",
    "failed getting banner",
    "socket disconnect",
    "broken pipe",
];

/// Kind of handle an operation was attempted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Directory,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::File => write!(f, "file"),
            HandleKind::Directory => write!(f, "directory"),
        }
    }
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Resolution,
    Connect,
    Transport,
    Protocol,
    InvalidHandle,
    Usage,
    Io,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Config(String),

    #[error("unable to resolve hostname {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("unable to create socket: {0}")]
    Socket(#[source] io::Error),

    #[error("unable to connect: {0}")]
    Connect(#[source] io::Error),

    /// Session-level failure carrying the engine's last-error message.
    #[error("{message}")]
    Transport { code: i32, message: String },

    /// SFTP status failure rendered through the POSIX errno table.
    #[error("{message}")]
    Protocol { status: u32, message: String },

    #[error("invalid {0} handle")]
    InvalidHandle(HandleKind),

    #[error("session is not connected")]
    NotConnected,

    #[error("operation already completed")]
    Finished,

    #[error("timed out waiting for socket readiness")]
    Timeout,

    #[error("session lock poisoned")]
    Poisoned,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::Resolve { .. } => ErrorKind::Resolution,
            Error::Socket(_) | Error::Connect(_) => ErrorKind::Connect,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Protocol { .. } => ErrorKind::Protocol,
            Error::InvalidHandle(_) => ErrorKind::InvalidHandle,
            Error::NotConnected | Error::Finished | Error::Poisoned => ErrorKind::Usage,
            Error::Timeout | Error::Io(_) => ErrorKind::Io,
        }
    }

    /// SFTP status code, when the server reported one.
    pub fn sftp_status(&self) -> Option<u32> {
        match self {
            Error::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether repeating the whole connect attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connect(err) => {
                matches!(
                    err.kind(),
                    io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::TimedOut
                ) || is_retryable_message(&err.to_string())
            }
            Error::Transport { message, .. } => is_retryable_message(message),
            Error::Resolve { reason, .. } => is_retryable_message(reason),
            Error::Timeout => true,
            _ => false,
        }
    }
}

/// Map an SFTP status code to the closest POSIX errno.
///
/// `EOF` has no errno counterpart and returns `None`.
pub fn status_errno(code: u32) -> Option<Errno> {
    let errno = match code {
        status::EOF => return None,
        status::NO_SUCH_FILE | status::NO_SUCH_PATH => Errno::ENOENT,
        status::PERMISSION_DENIED => Errno::EACCES,
        status::FAILURE => Errno::EIO,
        status::BAD_MESSAGE => Errno::EBADMSG,
        status::NO_CONNECTION => Errno::ENOTCONN,
        status::CONNECTION_LOST => Errno::ECONNRESET,
        status::OP_UNSUPPORTED => Errno::EOPNOTSUPP,
        status::INVALID_HANDLE => Errno::EBADF,
        status::FILE_ALREADY_EXISTS => Errno::EEXIST,
        status::WRITE_PROTECT => Errno::EROFS,
        status::NO_MEDIA => Errno::ENODEV,
        status::NO_SPACE_ON_FILESYSTEM => Errno::ENOSPC,
        status::QUOTA_EXCEEDED => Errno::EDQUOT,
        status::UNKNOWN_PRINCIPAL | status::INVALID_FILENAME => Errno::EINVAL,
        status::LOCK_CONFLICT => Errno::ENOLCK,
        status::DIR_NOT_EMPTY => Errno::ENOTEMPTY,
        status::NOT_A_DIRECTORY => Errno::ENOTDIR,
        status::LINK_LOOP => Errno::ELOOP,
        _ => Errno::EIO,
    };
    Some(errno)
}

/// Render an SFTP status code as user-facing text.
pub fn status_message(code: u32) -> String {
    match status_errno(code) {
        Some(errno) => errno.desc().to_string(),
        None => "end of file".to_string(),
    }
}

/// Translate an engine failure into the caller-facing error.
pub(crate) fn translate(err: EngineError) -> Error {
    match err {
        EngineError::Protocol { status, .. } => Error::Protocol {
            status,
            message: status_message(status),
        },
        EngineError::Transport { code, message } => Error::Transport { code, message },
        EngineError::WouldBlock => Error::Io(io::ErrorKind::WouldBlock.into()),
    }
}

/// Classify an error message as transient (`true`) or permanent (`false`).
///
/// Authentication keywords are checked first and win. Messages matching no
/// pattern are retried only when they mention the connection or a timeout.
pub(crate) fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();

    if AUTH_ERRORS.iter().any(|pattern| lower.contains(pattern)) {
        return false;
    }

    if RETRYABLE_ERRORS.iter().any(|pattern| lower.contains(pattern)) {
        return true;
    }

    lower.contains("connect") && !lower.contains("ssh")
}

#[cfg(test)]
mod tests {
    use super::*;

    mod status_translation {
        use super::*;

        #[test]
        fn test_no_such_file_renders_posix_text() {
            let err = translate(EngineError::Protocol {
                status: status::NO_SUCH_FILE,
                message: "No such file".to_string(),
            });
            assert_eq!(err.kind(), ErrorKind::Protocol);
            assert_eq!(err.sftp_status(), Some(status::NO_SUCH_FILE));
            assert_eq!(err.to_string(), Errno::ENOENT.desc());
        }

        #[test]
        fn test_eof_has_custom_message() {
            assert_eq!(status_errno(status::EOF), None);
            assert_eq!(status_message(status::EOF), "end of file");
        }

        #[test]
        fn test_errno_table() {
            assert_eq!(status_errno(status::PERMISSION_DENIED), Some(Errno::EACCES));
            assert_eq!(status_errno(status::FAILURE), Some(Errno::EIO));
            assert_eq!(status_errno(status::BAD_MESSAGE), Some(Errno::EBADMSG));
            assert_eq!(status_errno(status::NO_CONNECTION), Some(Errno::ENOTCONN));
            assert_eq!(status_errno(status::CONNECTION_LOST), Some(Errno::ECONNRESET));
            assert_eq!(status_errno(status::OP_UNSUPPORTED), Some(Errno::EOPNOTSUPP));
            assert_eq!(status_errno(status::INVALID_HANDLE), Some(Errno::EBADF));
            assert_eq!(status_errno(status::NO_SUCH_PATH), Some(Errno::ENOENT));
            assert_eq!(status_errno(status::FILE_ALREADY_EXISTS), Some(Errno::EEXIST));
            assert_eq!(status_errno(status::WRITE_PROTECT), Some(Errno::EROFS));
            assert_eq!(status_errno(status::NO_MEDIA), Some(Errno::ENODEV));
            assert_eq!(status_errno(status::NO_SPACE_ON_FILESYSTEM), Some(Errno::ENOSPC));
            assert_eq!(status_errno(status::QUOTA_EXCEEDED), Some(Errno::EDQUOT));
            assert_eq!(status_errno(status::UNKNOWN_PRINCIPAL), Some(Errno::EINVAL));
            assert_eq!(status_errno(status::LOCK_CONFLICT), Some(Errno::ENOLCK));
            assert_eq!(status_errno(status::DIR_NOT_EMPTY), Some(Errno::ENOTEMPTY));
            assert_eq!(status_errno(status::NOT_A_DIRECTORY), Some(Errno::ENOTDIR));
            assert_eq!(status_errno(status::INVALID_FILENAME), Some(Errno::EINVAL));
            assert_eq!(status_errno(status::LINK_LOOP), Some(Errno::ELOOP));
        }

        #[test]
        fn test_unknown_status_is_io_error() {
            assert_eq!(status_errno(99), Some(Errno::EIO));
        }

        #[test]
        fn test_transport_message_passes_through() {
            let err = translate(EngineError::Transport {
                code: -18,
                message: "Authentication failed (username/password)".to_string(),
            });
            assert_eq!(err.kind(), ErrorKind::Transport);
            assert_eq!(err.to_string(), "Authentication failed (username/password)");
        }
    }

    mod rendering {
        use super::*;

        #[test]
        fn test_resolution_message() {
            let err = Error::Resolve {
                host: "nowhere.invalid".to_string(),
                reason: "Name or service not known".to_string(),
            };
            assert_eq!(
                err.to_string(),
                "unable to resolve hostname nowhere.invalid: Name or service not known"
            );
            assert_eq!(err.kind(), ErrorKind::Resolution);
        }

        #[test]
        fn test_connect_message() {
            let err = Error::Connect(io::Error::from(io::ErrorKind::ConnectionRefused));
            assert!(err.to_string().starts_with("unable to connect: "));
            assert_eq!(err.kind(), ErrorKind::Connect);
        }

        #[test]
        fn test_invalid_handle_message() {
            assert_eq!(
                Error::InvalidHandle(HandleKind::File).to_string(),
                "invalid file handle"
            );
            assert_eq!(
                Error::InvalidHandle(HandleKind::Directory).to_string(),
                "invalid directory handle"
            );
        }
    }

    mod retry_classification {
        use super::*;

        #[test]
        fn test_auth_failures_not_retryable() {
            assert!(!is_retryable_message("Authentication failed (username/password)"));
            assert!(!is_retryable_message("Unable to extract public key from private key"));
            assert!(!is_retryable_message("Permission denied (publickey)"));
        }

        #[test]
        fn test_connection_failures_retryable() {
            assert!(is_retryable_message("Connection refused"));
            assert!(is_retryable_message("Timeout waiting for banner"));
            assert!(is_retryable_message("Unable to exchange encryption keys"));
            assert!(is_retryable_message("Network is unreachable"));
        }

        #[test]
        fn test_auth_takes_precedence() {
            assert!(!is_retryable_message("Connection timed out: authentication failed"));
        }

        #[test]
        fn test_unknown_protocol_message_not_retryable() {
            assert!(!is_retryable_message("Invalid MAC received"));
            assert!(!is_retryable_message("SSH protocol error"));
        }

        #[test]
        fn test_error_variants() {
            assert!(Error::Connect(io::Error::from(io::ErrorKind::ConnectionRefused)).is_retryable());
            assert!(Error::Timeout.is_retryable());
            assert!(!Error::Config("requires either a password or an identity".into()).is_retryable());
            assert!(!Error::Protocol {
                status: status::NO_SUCH_FILE,
                message: status_message(status::NO_SUCH_FILE),
            }
            .is_retryable());
        }
    }
}
