//! Scripted in-memory engine for exercising the orchestration layer.
//!
//! Every primitive first passes through a gate that logs the call, returns
//! `WouldBlock` while a scripted count for that primitive is non-zero, and
//! then returns any scripted one-shot failure. Only after the gate does the
//! primitive touch the in-memory filesystem, so a blocked call never has a
//! side effect.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{
    EngineError, EngineResult, RemoteDirOps, RemoteFileOps, RemoteHandle, SftpChannel, SshEngine,
};
use crate::client::drive::Interest;
use crate::client::error::status;
use crate::client::types::{Attributes, OpenMode};

pub(crate) const FAKE_MTIME: u64 = 1_700_000_000;

#[derive(Default)]
pub(crate) struct Script {
    pub calls: Vec<&'static str>,
    pub blocks: HashMap<&'static str, usize>,
    pub failures: HashMap<&'static str, EngineError>,
    pub credentials: Vec<(String, String)>,
    pub files: BTreeMap<PathBuf, Vec<u8>>,
    pub dirs: BTreeSet<PathBuf>,
    pub write_chunk: Option<usize>,
    pub handshake_fds: Vec<RawFd>,
    pub open_handles: usize,
    pub blocking: Option<bool>,
}

impl Script {
    pub fn count(&self, name: &str) -> usize {
        self.calls.iter().filter(|call| **call == name).count()
    }

    fn has_children(&self, dir: &Path) -> bool {
        self.files.keys().chain(self.dirs.iter()).any(|p| p.parent() == Some(dir))
    }
}

#[derive(Clone)]
pub(crate) struct FakeEngine {
    script: Arc<Mutex<Script>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        let mut script = Script::default();
        script.dirs.insert(PathBuf::from("/"));
        script.dirs.insert(PathBuf::from("/tmp"));
        script.dirs.insert(PathBuf::from("/home"));
        script.dirs.insert(PathBuf::from("/home/fake"));
        Self {
            script: Arc::new(Mutex::new(script)),
        }
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Make the next `times` calls of `primitive` return `WouldBlock`.
    pub fn block(&self, primitive: &'static str, times: usize) -> &Self {
        self.script().blocks.insert(primitive, times);
        self
    }

    /// Make the next call of `primitive` fail with `err`.
    pub fn fail(&self, primitive: &'static str, err: EngineError) -> &Self {
        self.script().failures.insert(primitive, err);
        self
    }

    pub fn put_file(&self, path: &str, data: &[u8]) -> &Self {
        self.script().files.insert(PathBuf::from(path), data.to_vec());
        self
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.script().files.get(Path::new(path)).cloned()
    }

    pub fn count(&self, primitive: &str) -> usize {
        self.script().count(primitive)
    }

    /// Factory handing out engines that share this script.
    pub fn factory(&self) -> impl FnMut() -> EngineResult<FakeEngine> + Send + Clone + 'static {
        let engine = self.clone();
        move || {
            engine.script().calls.push("new");
            Ok(engine.clone())
        }
    }
}

fn gate(script: &Mutex<Script>, primitive: &'static str) -> EngineResult<()> {
    let mut script = script.lock().unwrap();
    script.calls.push(primitive);
    if let Some(remaining) = script.blocks.get_mut(primitive)
        && *remaining > 0
    {
        *remaining -= 1;
        return Err(EngineError::WouldBlock);
    }
    match script.failures.remove(primitive) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn protocol(code: u32) -> EngineError {
    EngineError::Protocol {
        status: code,
        message: format!("SFTP status {}", code),
    }
}

fn file_attributes(size: usize) -> Attributes {
    Attributes::from_raw(Some(size as u64), Some(0o100644), Some(FAKE_MTIME))
}

fn dir_attributes() -> Attributes {
    Attributes::from_raw(Some(4096), Some(0o040755), Some(FAKE_MTIME))
}

impl SshEngine for FakeEngine {
    type Sftp = FakeSftp;

    fn set_blocking(&mut self, blocking: bool) {
        let mut script = self.script();
        script.calls.push("set_blocking");
        script.blocking = Some(blocking);
    }

    fn handshake(&mut self, socket: RawFd) -> EngineResult<()> {
        self.script().handshake_fds.push(socket);
        gate(&self.script, "handshake")
    }

    fn auth_password(&mut self, username: &str, password: &str) -> EngineResult<()> {
        gate(&self.script, "auth_password")?;
        self.script()
            .credentials
            .push((username.to_string(), password.to_string()));
        Ok(())
    }

    fn auth_publickey(
        &mut self,
        username: &str,
        _private_key: &str,
        passphrase: Option<&str>,
    ) -> EngineResult<()> {
        gate(&self.script, "auth_publickey")?;
        self.script()
            .credentials
            .push((username.to_string(), passphrase.unwrap_or_default().to_string()));
        Ok(())
    }

    fn open_sftp(&mut self) -> EngineResult<FakeSftp> {
        gate(&self.script, "sftp_init")?;
        Ok(FakeSftp {
            script: Arc::clone(&self.script),
        })
    }

    fn block_directions(&self) -> Interest {
        // A connected loopback socket is always writable.
        Interest::Writable
    }

    fn disconnect(&mut self, _description: &str) {
        let mut script = self.script();
        script.calls.push("disconnect");
        if script.blocking == Some(true) {
            script.calls.push("disconnect_blocking");
        }
    }
}

pub(crate) struct FakeSftp {
    script: Arc<Mutex<Script>>,
}

impl Drop for FakeSftp {
    fn drop(&mut self) {
        if let Ok(mut script) = self.script.lock() {
            script.calls.push("sftp_shutdown");
        }
    }
}

impl SftpChannel for FakeSftp {
    type File = FakeFile;
    type Dir = FakeDir;

    fn open(&self, path: &Path, mode: OpenMode, _permissions: i32) -> EngineResult<FakeFile> {
        gate(&self.script, "open")?;
        let mut script = self.script.lock().unwrap();
        if script.dirs.contains(path) {
            return Err(protocol(status::FAILURE));
        }
        let parent_exists = path.parent().is_some_and(|p| script.dirs.contains(p));
        let exists = script.files.contains_key(path);
        if !exists && !(mode.create && parent_exists) {
            return Err(protocol(status::NO_SUCH_FILE));
        }
        let data = script.files.entry(path.to_path_buf()).or_default();
        if mode.truncate {
            data.clear();
        }
        let position = if mode.append { data.len() } else { 0 };
        script.open_handles += 1;
        Ok(FakeFile {
            script: Arc::clone(&self.script),
            path: path.to_path_buf(),
            mode,
            position,
        })
    }

    fn opendir(&self, path: &Path) -> EngineResult<FakeDir> {
        gate(&self.script, "opendir")?;
        let mut script = self.script.lock().unwrap();
        if !script.dirs.contains(path) {
            return Err(protocol(status::NO_SUCH_FILE));
        }
        let mut entries = VecDeque::new();
        entries.push_back((b".".to_vec(), dir_attributes()));
        entries.push_back((b"..".to_vec(), dir_attributes()));
        for dir in script.dirs.iter().filter(|d| d.parent() == Some(path)) {
            if let Some(name) = dir.file_name() {
                entries.push_back((name.as_bytes().to_vec(), dir_attributes()));
            }
        }
        for (file, data) in script.files.iter().filter(|(f, _)| f.parent() == Some(path)) {
            if let Some(name) = file.file_name() {
                entries.push_back((name.as_bytes().to_vec(), file_attributes(data.len())));
            }
        }
        script.open_handles += 1;
        Ok(FakeDir {
            script: Arc::clone(&self.script),
            entries,
        })
    }

    fn stat(&self, path: &Path) -> EngineResult<Attributes> {
        gate(&self.script, "stat")?;
        let script = self.script.lock().unwrap();
        if script.dirs.contains(path) {
            return Ok(dir_attributes());
        }
        match script.files.get(path) {
            Some(data) => Ok(file_attributes(data.len())),
            None => Err(protocol(status::NO_SUCH_FILE)),
        }
    }

    fn mkdir(&self, path: &Path, _permissions: i32) -> EngineResult<()> {
        gate(&self.script, "mkdir")?;
        let mut script = self.script.lock().unwrap();
        if script.dirs.contains(path) || script.files.contains_key(path) {
            return Err(protocol(status::FAILURE));
        }
        if !path.parent().is_some_and(|p| script.dirs.contains(p)) {
            return Err(protocol(status::NO_SUCH_FILE));
        }
        script.dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> EngineResult<()> {
        gate(&self.script, "rmdir")?;
        let mut script = self.script.lock().unwrap();
        if !script.dirs.contains(path) {
            return Err(protocol(status::NO_SUCH_FILE));
        }
        if script.has_children(path) {
            return Err(protocol(status::FAILURE));
        }
        script.dirs.remove(path);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> EngineResult<()> {
        gate(&self.script, "rename")?;
        let mut script = self.script.lock().unwrap();
        if let Some(data) = script.files.remove(from) {
            script.files.insert(to.to_path_buf(), data);
            return Ok(());
        }
        if script.dirs.contains(from) && !script.has_children(from) {
            script.dirs.remove(from);
            script.dirs.insert(to.to_path_buf());
            return Ok(());
        }
        Err(protocol(status::NO_SUCH_FILE))
    }

    fn unlink(&self, path: &Path) -> EngineResult<()> {
        gate(&self.script, "unlink")?;
        let mut script = self.script.lock().unwrap();
        match script.files.remove(path) {
            Some(_) => Ok(()),
            None => Err(protocol(status::NO_SUCH_FILE)),
        }
    }

    fn realpath(&self, path: &Path) -> EngineResult<PathBuf> {
        gate(&self.script, "realpath")?;
        let mut resolved = if path.is_absolute() {
            PathBuf::new()
        } else {
            PathBuf::from("/home/fake")
        };
        for component in path.components() {
            match component {
                Component::RootDir => resolved.push("/"),
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::Normal(part) => resolved.push(part),
                Component::CurDir | Component::Prefix(_) => {}
            }
        }
        Ok(resolved)
    }
}

pub(crate) struct FakeFile {
    script: Arc<Mutex<Script>>,
    path: PathBuf,
    mode: OpenMode,
    position: usize,
}

impl RemoteHandle for FakeFile {
    fn close(&mut self) -> EngineResult<()> {
        gate(&self.script, "close")?;
        self.script.lock().unwrap().open_handles -= 1;
        Ok(())
    }
}

impl RemoteFileOps for FakeFile {
    fn read(&mut self, buf: &mut [u8]) -> EngineResult<usize> {
        gate(&self.script, "read")?;
        if !self.mode.read {
            return Err(protocol(status::PERMISSION_DENIED));
        }
        let script = self.script.lock().unwrap();
        let data = script
            .files
            .get(&self.path)
            .ok_or_else(|| protocol(status::NO_SUCH_FILE))?;
        let start = self.position.min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.position = start + n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> EngineResult<usize> {
        gate(&self.script, "write")?;
        if !self.mode.write {
            return Err(protocol(status::PERMISSION_DENIED));
        }
        let mut script = self.script.lock().unwrap();
        let n = buf.len().min(script.write_chunk.unwrap_or(usize::MAX));
        let data = script
            .files
            .get_mut(&self.path)
            .ok_or_else(|| protocol(status::NO_SUCH_FILE))?;
        if data.len() < self.position {
            data.resize(self.position, 0);
        }
        let overlap = (data.len() - self.position).min(n);
        data[self.position..self.position + overlap].copy_from_slice(&buf[..overlap]);
        data.extend_from_slice(&buf[overlap..n]);
        self.position += n;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) {
        self.script.lock().unwrap().calls.push("seek");
        self.position = offset as usize;
    }
}

pub(crate) struct FakeDir {
    script: Arc<Mutex<Script>>,
    entries: VecDeque<(Vec<u8>, Attributes)>,
}

impl RemoteHandle for FakeDir {
    fn close(&mut self) -> EngineResult<()> {
        gate(&self.script, "closedir")?;
        self.script.lock().unwrap().open_handles -= 1;
        Ok(())
    }
}

impl RemoteDirOps for FakeDir {
    fn readdir(&mut self) -> EngineResult<Option<(Vec<u8>, Attributes)>> {
        gate(&self.script, "readdir")?;
        Ok(self.entries.pop_front())
    }
}
