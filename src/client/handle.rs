//! Remote file and directory handles.
//!
//! Engine handles live in a registry inside the session's link. A
//! [`RemoteFile`] or [`RemoteDir`] only holds the registry id and a weak
//! link, so it never keeps the session alive. Disconnecting closes every
//! registered engine handle while the socket is still open; afterwards the
//! ids are dead and every operation reports an invalid handle.
//!
//! Each operation returns a [`Resumable`] value. A suspended read keeps its
//! buffer inside the operation, so resuming continues the same logical read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use super::drive::{self, Progress, Resumable};
use super::engine::{
    EngineError, EngineResult, RemoteDirOps, RemoteFileOps, RemoteHandle, SftpChannel, SshEngine,
};
use super::error::{Error, HandleKind, Result, translate};
use super::session::{Link, WeakLink, lock};
use super::types::DirEntry;

pub type FileOf<E> = <<E as SshEngine>::Sftp as SftpChannel>::File;
pub type DirOf<E> = <<E as SshEngine>::Sftp as SftpChannel>::Dir;

/// Key of an engine handle in a link's registry. Never reused within a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HandleId(u64);

/// Engine handles of one kind owned by a link.
pub(crate) struct Handles<H> {
    next: u64,
    live: HashMap<HandleId, H>,
}

impl<H> Default for Handles<H> {
    fn default() -> Self {
        Self {
            next: 0,
            live: HashMap::new(),
        }
    }
}

impl<H> Handles<H> {
    pub(crate) fn insert(&mut self, handle: H) -> HandleId {
        let id = HandleId(self.next);
        self.next += 1;
        self.live.insert(id, handle);
        id
    }

    fn get_mut(&mut self, id: HandleId) -> Option<&mut H> {
        self.live.get_mut(&id)
    }

    fn remove(&mut self, id: HandleId) -> Option<H> {
        self.live.remove(&id)
    }

}

impl<H: RemoteHandle> Handles<H> {
    /// Close and drop every handle. Close failures are logged.
    pub(crate) fn close_all(&mut self, kind: HandleKind) -> usize {
        let count = self.live.len();
        for (_, mut handle) in self.live.drain() {
            if let Err(err) = handle.close() {
                warn!("Closing {} handle during teardown failed: {}", kind, translate(err));
            }
        }
        count
    }
}

type Table<E, H> = for<'l> fn(&'l mut Link<E>) -> &'l mut Handles<H>;

/// An open remote file.
pub struct RemoteFile<E: SshEngine> {
    id: Option<HandleId>,
    link: WeakLink<E>,
    path: PathBuf,
}

impl<E: SshEngine> RemoteFile<E> {
    pub(crate) fn new(id: HandleId, link: WeakLink<E>, path: PathBuf) -> Self {
        Self {
            id: Some(id),
            link,
            path,
        }
    }

    /// Remote path this handle was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True until the handle is closed or its session disconnects.
    pub fn is_open(&self) -> bool {
        self.id.is_some() && self.link.strong_count() > 0
    }

    /// Read up to `len` bytes from the current offset.
    ///
    /// Completes with fewer bytes near the end of the file and with an empty
    /// buffer at end of file.
    pub fn read(&mut self, len: usize) -> HandleOp<'_, E, FileOf<E>, Vec<u8>> {
        let mut buffer = vec![0u8; len];
        HandleOp::new(
            self.id,
            &self.link,
            HandleKind::File,
            Link::files,
            move |file: &mut FileOf<E>| {
                let n = file.read(&mut buffer)?;
                buffer.truncate(n);
                Ok(std::mem::take(&mut buffer))
            },
        )
    }

    /// Write a prefix of `data`, completing with the number of bytes the
    /// server accepted. Callers loop to write the remainder.
    pub fn write<'a>(&'a mut self, data: &'a [u8]) -> HandleOp<'a, E, FileOf<E>, usize> {
        HandleOp::new(
            self.id,
            &self.link,
            HandleKind::File,
            Link::files,
            move |file: &mut FileOf<E>| file.write(data),
        )
    }

    /// Move the offset for subsequent reads and writes. Never suspends.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        let invalid = || Error::InvalidHandle(HandleKind::File);
        let id = self.id.ok_or_else(invalid)?;
        let link = self.link.upgrade().ok_or_else(invalid)?;
        let mut guard = lock(&link)?;
        let file = guard.files().get_mut(id).ok_or_else(invalid)?;
        file.seek(offset);
        Ok(())
    }

    /// Close the handle. Idempotent; closing twice is not an error.
    pub fn close(&mut self) -> CloseOp<'_, E, FileOf<E>> {
        CloseOp {
            id: &mut self.id,
            link: &self.link,
            kind: HandleKind::File,
            table: Link::files,
        }
    }
}

impl<E: SshEngine> Drop for RemoteFile<E> {
    fn drop(&mut self) {
        release(self.id.take(), &self.link, HandleKind::File, Link::files);
    }
}

/// An open remote directory listing.
pub struct RemoteDir<E: SshEngine> {
    id: Option<HandleId>,
    link: WeakLink<E>,
    path: PathBuf,
    exhausted: bool,
}

impl<E: SshEngine> RemoteDir<E> {
    pub(crate) fn new(id: HandleId, link: WeakLink<E>, path: PathBuf) -> Self {
        Self {
            id: Some(id),
            link,
            path,
            exhausted: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.id.is_some() && self.link.strong_count() > 0
    }

    /// Next entry, or `None` once the listing is exhausted. Later reads keep
    /// returning `None` until the handle is closed.
    ///
    /// The `.` and `..` entries are skipped, so a new empty directory ends
    /// immediately.
    pub fn read(&mut self) -> HandleOp<'_, E, DirOf<E>, Option<DirEntry>> {
        let exhausted = &mut self.exhausted;
        HandleOp::new(
            self.id,
            &self.link,
            HandleKind::Directory,
            Link::dirs,
            move |dir: &mut DirOf<E>| {
                if *exhausted {
                    return Ok(None);
                }
                loop {
                    match dir.readdir()? {
                        Some((name, _)) if is_dot_entry(&name) => continue,
                        Some((name, attributes)) => {
                            return Ok(Some(DirEntry { name, attributes }));
                        }
                        None => {
                            *exhausted = true;
                            return Ok(None);
                        }
                    }
                }
            },
        )
    }

    /// Blocking iterator over the remaining entries.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Bound on each readiness wait while the listing suspends
    pub fn entries(&mut self, timeout: Option<Duration>) -> Entries<'_, E> {
        Entries {
            dir: self,
            timeout,
            done: false,
        }
    }

    pub fn close(&mut self) -> CloseOp<'_, E, DirOf<E>> {
        CloseOp {
            id: &mut self.id,
            link: &self.link,
            kind: HandleKind::Directory,
            table: Link::dirs,
        }
    }
}

impl<E: SshEngine> Drop for RemoteDir<E> {
    fn drop(&mut self) {
        release(self.id.take(), &self.link, HandleKind::Directory, Link::dirs);
    }
}

fn is_dot_entry(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

/// Iterator returned by [`RemoteDir::entries`].
pub struct Entries<'d, E: SshEngine> {
    dir: &'d mut RemoteDir<E>,
    timeout: Option<Duration>,
    done: bool,
}

impl<E: SshEngine> Iterator for Entries<'_, E> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match drive::wait(&mut self.dir.read(), self.timeout) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// A pending request on an open handle.
pub struct HandleOp<'h, E: SshEngine, H, T> {
    id: Option<HandleId>,
    link: &'h WeakLink<E>,
    kind: HandleKind,
    table: Table<E, H>,
    request: Box<dyn FnMut(&mut H) -> EngineResult<T> + 'h>,
    finished: bool,
}

impl<'h, E: SshEngine, H, T> HandleOp<'h, E, H, T> {
    fn new<F>(
        id: Option<HandleId>,
        link: &'h WeakLink<E>,
        kind: HandleKind,
        table: Table<E, H>,
        request: F,
    ) -> Self
    where
        F: FnMut(&mut H) -> EngineResult<T> + 'h,
    {
        Self {
            id,
            link,
            kind,
            table,
            request: Box::new(request),
            finished: false,
        }
    }

    fn invalid(&mut self) -> Error {
        self.finished = true;
        Error::InvalidHandle(self.kind)
    }
}

impl<E: SshEngine, H, T> Resumable for HandleOp<'_, E, H, T> {
    type Output = T;

    fn drive(&mut self) -> Result<Progress<T>> {
        if self.finished {
            return Err(Error::Finished);
        }
        let (Some(id), Some(link)) = (self.id, self.link.upgrade()) else {
            return Err(self.invalid());
        };

        let mut guard = lock(&link)?;
        let outcome = match (self.table)(&mut *guard).get_mut(id) {
            Some(handle) => (self.request)(handle),
            None => return Err(self.invalid()),
        };
        match outcome {
            Ok(value) => {
                self.finished = true;
                Ok(Progress::Done(value))
            }
            Err(EngineError::WouldBlock) => Ok(Progress::Suspended(guard.readiness())),
            Err(err) => {
                self.finished = true;
                let err = translate(err);
                debug!("Request on {} handle failed: {}", self.kind, err);
                Err(err)
            }
        }
    }
}

/// A pending close of a handle.
///
/// Completes immediately when the handle is already closed or its session
/// has disconnected (the disconnect closed it).
pub struct CloseOp<'h, E: SshEngine, H> {
    id: &'h mut Option<HandleId>,
    link: &'h WeakLink<E>,
    kind: HandleKind,
    table: Table<E, H>,
}

impl<E: SshEngine, H: RemoteHandle> Resumable for CloseOp<'_, E, H> {
    type Output = ();

    fn drive(&mut self) -> Result<Progress<()>> {
        let Some(id) = *self.id else {
            return Ok(Progress::Done(()));
        };
        let Some(link) = self.link.upgrade() else {
            *self.id = None;
            return Ok(Progress::Done(()));
        };

        let mut guard = lock(&link)?;
        let table = (self.table)(&mut *guard);
        let Some(handle) = table.get_mut(id) else {
            *self.id = None;
            return Ok(Progress::Done(()));
        };
        let outcome = handle.close();
        match outcome {
            Ok(()) => {
                table.remove(id);
                *self.id = None;
                debug!("Closed {} handle", self.kind);
                Ok(Progress::Done(()))
            }
            Err(EngineError::WouldBlock) => Ok(Progress::Suspended(guard.readiness())),
            Err(err) => {
                table.remove(id);
                *self.id = None;
                warn!("Closing {} handle failed: {}", self.kind, translate(err));
                Ok(Progress::Done(()))
            }
        }
    }
}

/// Drop-time cleanup: close a still-registered handle best-effort.
fn release<E: SshEngine, H: RemoteHandle>(
    id: Option<HandleId>,
    link: &WeakLink<E>,
    kind: HandleKind,
    table: Table<E, H>,
) {
    let (Some(id), Some(link)) = (id, link.upgrade()) else {
        return;
    };
    let Ok(mut guard) = lock(&link) else {
        return;
    };
    if let Some(mut handle) = table(&mut *guard).remove(id) {
        debug!("Closing {} handle on drop", kind);
        if let Err(err) = handle.close() {
            debug!("Close of dropped {} handle failed: {}", kind, translate(err));
        }
    }
}
