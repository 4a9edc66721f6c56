//! Value types shared by the session, the handles and the engine seam.
//!
//! `Attributes` and `DirEntry` serialize to the record shape handed to hosts:
//! `{size, type: "file" | "dir" | null, modified, path}` where `path` is only
//! present on directory entries.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use super::error::Error;

/// Permission bits used when creating files and directories (owner rwx).
pub const CREATE_PERMISSIONS: i32 = 0o700;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;

/// Connection state of a [`Session`](super::session::Session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Authenticating,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Handshaking => write!(f, "handshaking"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Remote entry classification.
///
/// Symbolic links and special files have no variant; they surface as `None`
/// in [`Attributes::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
}

impl FileKind {
    /// Classify POSIX permission bits as reported by SFTP attributes.
    pub fn from_permissions(permissions: u32) -> Option<Self> {
        match permissions & S_IFMT {
            S_IFREG => Some(FileKind::File),
            S_IFDIR => Some(FileKind::Dir),
            _ => None,
        }
    }
}

/// Size, type and modification time of a remote path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: Option<FileKind>,
    /// Seconds since the Unix epoch.
    pub modified: u64,
}

impl Attributes {
    /// Build attributes from the optional fields an SFTP server may report.
    pub fn from_raw(size: Option<u64>, permissions: Option<u32>, mtime: Option<u64>) -> Self {
        Self {
            size: size.unwrap_or(0),
            kind: permissions.and_then(FileKind::from_permissions),
            modified: mtime.unwrap_or(0),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == Some(FileKind::File)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == Some(FileKind::Dir)
    }
}

/// One entry produced by reading a directory handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    /// Raw entry name as sent by the server.
    #[serde(rename = "path", serialize_with = "serialize_lossy")]
    pub name: Vec<u8>,
    #[serde(flatten)]
    pub attributes: Attributes,
}

impl DirEntry {
    /// Entry name with invalid UTF-8 replaced.
    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}

fn serialize_lossy<S: Serializer>(name: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(name))
}

/// Open flags composed from a mode string.
///
/// Characters compose flags: `r` reads, `w` and `a` write, `w` also creates
/// and truncates, `a` also appends, `+` reads and writes. Other characters
/// (such as `b`) are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenMode {
    /// Mode string used when the caller does not supply one.
    pub const DEFAULT: &'static str = "rb";
}

impl FromStr for OpenMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        let mut flags = OpenMode {
            read: false,
            write: false,
            create: false,
            truncate: false,
            append: false,
        };
        for c in mode.chars() {
            match c {
                'r' => flags.read = true,
                'w' => {
                    flags.write = true;
                    flags.create = true;
                    flags.truncate = true;
                }
                'a' => {
                    flags.write = true;
                    flags.append = true;
                }
                '+' => {
                    flags.read = true;
                    flags.write = true;
                }
                _ => {}
            }
        }
        if !flags.read && !flags.write {
            return Err(Error::Config(format!("invalid open mode '{}'", mode)));
        }
        Ok(flags)
    }
}

/// Serializable snapshot of a session for host-side bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: ConnectionState,
    /// RFC 3339 timestamp of the last successful authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod open_mode {
        use super::*;

        #[test]
        fn test_read_mode() {
            let mode: OpenMode = "r".parse().unwrap();
            assert!(mode.read);
            assert!(!mode.write);
            assert!(!mode.create);
        }

        #[test]
        fn test_default_mode_is_read_only() {
            let mode: OpenMode = OpenMode::DEFAULT.parse().unwrap();
            assert!(mode.read);
            assert!(!mode.write);
        }

        #[test]
        fn test_write_creates_and_truncates() {
            let mode: OpenMode = "w".parse().unwrap();
            assert!(mode.write);
            assert!(mode.create);
            assert!(mode.truncate);
            assert!(!mode.read);
            assert!(!mode.append);
        }

        #[test]
        fn test_append_writes_without_truncating() {
            let mode: OpenMode = "a".parse().unwrap();
            assert!(mode.write);
            assert!(mode.append);
            assert!(!mode.truncate);
            assert!(!mode.create);
        }

        #[test]
        fn test_plus_reads_and_writes() {
            let mode: OpenMode = "r+".parse().unwrap();
            assert!(mode.read);
            assert!(mode.write);
            assert!(!mode.truncate);
        }

        #[test]
        fn test_mode_without_access_is_rejected() {
            let err = "b".parse::<OpenMode>().unwrap_err();
            assert!(err.to_string().contains("invalid open mode"));
        }
    }

    mod classification {
        use super::*;

        #[test]
        fn test_regular_file() {
            assert_eq!(FileKind::from_permissions(0o100644), Some(FileKind::File));
        }

        #[test]
        fn test_directory() {
            assert_eq!(FileKind::from_permissions(0o040755), Some(FileKind::Dir));
        }

        #[test]
        fn test_symlink_is_unknown() {
            assert_eq!(FileKind::from_permissions(0o120777), None);
        }

        #[test]
        fn test_missing_fields_default_to_zero() {
            let attrs = Attributes::from_raw(None, None, None);
            assert_eq!(attrs.size, 0);
            assert_eq!(attrs.kind, None);
            assert_eq!(attrs.modified, 0);
        }
    }

    mod records {
        use super::*;

        #[test]
        fn test_attributes_record_shape() {
            let attrs = Attributes::from_raw(Some(5), Some(0o100600), Some(1_700_000_000));
            let json = serde_json::to_value(&attrs).unwrap();
            assert_eq!(json["size"], 5);
            assert_eq!(json["type"], "file");
            assert_eq!(json["modified"], 1_700_000_000u64);
        }

        #[test]
        fn test_unknown_type_serializes_as_null() {
            let attrs = Attributes::from_raw(Some(0), Some(0o120777), Some(0));
            let json = serde_json::to_value(&attrs).unwrap();
            assert!(json["type"].is_null());
        }

        #[test]
        fn test_dir_entry_record_includes_path() {
            let entry = DirEntry {
                name: b"notes.txt".to_vec(),
                attributes: Attributes::from_raw(Some(12), Some(0o100644), Some(7)),
            };
            let json = serde_json::to_value(&entry).unwrap();
            assert_eq!(json["path"], "notes.txt");
            assert_eq!(json["size"], 12);
            assert_eq!(json["type"], "file");
        }

        #[test]
        fn test_state_display() {
            assert_eq!(ConnectionState::Handshaking.to_string(), "handshaking");
            let json = serde_json::to_string(&ConnectionState::Connected).unwrap();
            assert_eq!(json, "\"connected\"");
        }
    }
}
