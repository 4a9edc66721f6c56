//! Session lifecycle: resumable connect, SFTP requests and teardown.
//!
//! A [`Session`] walks `Disconnected → Connecting → Handshaking →
//! Authenticating → Connected`. Each step either advances, suspends with a
//! readiness request, or fails. A suspended connect resumes at the step where
//! it stopped: the socket is never reconnected once the handshake started,
//! and the authentication method chosen on first entry is kept until the
//! step completes.
//!
//! # Failure Semantics
//!
//! - Resolution, socket and connect failures release everything and leave
//!   the session `Disconnected`.
//! - Handshake and authentication failures leave the state where it failed;
//!   call [`Session::disconnect`] before reusing the session.
//!
//! # Shared Link
//!
//! The engine, socket descriptor, lazily opened SFTP channel and every open
//! engine handle live in a link owned by the session. Handles hold only a
//! registry id and a weak reference. Disconnecting closes the registered
//! handles, then the channel, then the engine, so nothing outlives the
//! session and every handle is invalidated at once.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::auth::{AuthMethod, AuthStrategy};
use super::config::{RetryPolicy, SessionConfig, resolve_connect_timeout};
use super::drive::{self, Progress, Readiness, Resumable};
use super::engine::{EngineError, EngineResult, Libssh2Engine, SftpChannel, SshEngine};
use super::error::{Error, HandleKind, Result, translate};
use super::handle::{DirOf, FileOf, Handles, RemoteDir, RemoteFile};
use super::transport::{self, ConnectStatus, TransportSocket};
use super::types::{Attributes, CREATE_PERMISSIONS, ConnectionState, OpenMode, SessionInfo};

const DISCONNECT_DESCRIPTION: &str = "manual disconnection";

/// Engine, socket, SFTP channel and open engine handles shared between a
/// session and its handles. Fields drop in issue order reversed: handles,
/// channel, engine.
pub(crate) struct Link<E: SshEngine> {
    files: Handles<FileOf<E>>,
    dirs: Handles<DirOf<E>>,
    sftp: Option<E::Sftp>,
    engine: E,
    socket: RawFd,
}

impl<E: SshEngine> Link<E> {
    fn new(engine: E, socket: RawFd) -> Self {
        Self {
            files: Handles::default(),
            dirs: Handles::default(),
            sftp: None,
            engine,
            socket,
        }
    }

    pub(crate) fn readiness(&self) -> Readiness {
        Readiness::new(self.socket, self.engine.block_directions())
    }

    pub(crate) fn files(&mut self) -> &mut Handles<FileOf<E>> {
        &mut self.files
    }

    pub(crate) fn dirs(&mut self) -> &mut Handles<DirOf<E>> {
        &mut self.dirs
    }

    /// Open the SFTP channel on first use. `false` means the init would block.
    fn ensure_sftp(&mut self) -> Result<bool> {
        if self.sftp.is_none() {
            match self.engine.open_sftp() {
                Ok(channel) => {
                    debug!("SFTP channel opened on fd {}", self.socket);
                    self.sftp = Some(channel);
                }
                Err(EngineError::WouldBlock) => return Ok(false),
                Err(err) => return Err(translate(err)),
            }
        }
        Ok(true)
    }

    fn channel(&self) -> EngineResult<&E::Sftp> {
        self.sftp
            .as_ref()
            .ok_or_else(|| EngineError::transport(-1, "SFTP channel is not open"))
    }

    /// Release everything in order: handles, channel, then the SSH session.
    /// Runs in blocking mode so pending closes and the disconnect message are
    /// not dropped on `EAGAIN`.
    fn shutdown(&mut self, send_disconnect: bool) {
        self.engine.set_blocking(true);
        let closed = self.files.close_all(HandleKind::File)
            + self.dirs.close_all(HandleKind::Directory);
        if closed > 0 {
            debug!("Closed {} open handle(s) on fd {}", closed, self.socket);
        }
        if self.sftp.take().is_some() {
            debug!("SFTP channel on fd {} shut down", self.socket);
        }
        if send_disconnect {
            self.engine.disconnect(DISCONNECT_DESCRIPTION);
        }
    }
}

pub(crate) type SharedLink<E> = Arc<Mutex<Link<E>>>;
pub(crate) type WeakLink<E> = Weak<Mutex<Link<E>>>;

pub(crate) fn lock<E: SshEngine>(link: &Mutex<Link<E>>) -> Result<MutexGuard<'_, Link<E>>> {
    link.lock().map_err(|_| Error::Poisoned)
}

type EngineFactory<E> = Box<dyn FnMut() -> EngineResult<E> + Send>;

enum Step {
    Advance(ConnectionState),
    Suspend(Readiness),
}

/// A client session with one remote SSH server.
pub struct Session<E: SshEngine = Libssh2Engine> {
    id: Uuid,
    config: SessionConfig,
    factory: EngineFactory<E>,
    state: ConnectionState,
    auth: Option<AuthMethod>,
    transport: Option<TransportSocket>,
    link: Option<SharedLink<E>>,
    connected_at: Option<String>,
}

impl Session<Libssh2Engine> {
    /// Create a disconnected libssh2-backed session.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_engine(config, Libssh2Engine::new)
    }
}

impl<E: SshEngine> Session<E> {
    /// Create a disconnected session whose engine is built by `factory` on
    /// every connect.
    pub fn with_engine<F>(config: SessionConfig, factory: F) -> Self
    where
        F: FnMut() -> EngineResult<E> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            config,
            factory: Box::new(factory),
            state: ConnectionState::Disconnected,
            auth: None,
            transport: None,
            link: None,
            connected_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Descriptor of the transport socket while one is open.
    pub fn socket_fd(&self) -> Option<RawFd> {
        self.transport.as_ref().map(TransportSocket::fd)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.to_string(),
            host: self.config.host().to_string(),
            port: self.config.resolved_port(),
            username: self.config.username().to_string(),
            state: self.state,
            connected_at: self.connected_at.clone(),
        }
    }

    /// Start or resume connecting. Driving it on a connected session
    /// completes immediately.
    pub fn connect(&mut self) -> Connect<'_, E> {
        Connect { session: self }
    }

    /// Tear the session down. Safe to call in any state and more than once.
    ///
    /// Shuts down the SFTP channel, sends the SSH disconnect message,
    /// releases the engine and then closes the socket. Every handle opened
    /// from this session becomes invalid.
    pub fn disconnect(&mut self) {
        let was = self.state;
        self.teardown();
        if was != ConnectionState::Disconnected {
            info!("Session {} disconnected from {}", self.id, self.config.host());
        }
    }

    pub fn open(&mut self, path: impl AsRef<Path>, mode: OpenMode) -> SftpOp<'_, E, RemoteFile<E>> {
        let path = path.as_ref().to_path_buf();
        self.request("open", move |link, weak| {
            let file = link.channel()?.open(&path, mode, CREATE_PERMISSIONS)?;
            let id = link.files.insert(file);
            Ok(RemoteFile::new(id, weak.clone(), path.clone()))
        })
    }

    pub fn opendir(&mut self, path: impl AsRef<Path>) -> SftpOp<'_, E, RemoteDir<E>> {
        let path = path.as_ref().to_path_buf();
        self.request("opendir", move |link, weak| {
            let dir = link.channel()?.opendir(&path)?;
            let id = link.dirs.insert(dir);
            Ok(RemoteDir::new(id, weak.clone(), path.clone()))
        })
    }

    pub fn stat(&mut self, path: impl AsRef<Path>) -> SftpOp<'_, E, Attributes> {
        let path = path.as_ref().to_path_buf();
        self.request("stat", move |link, _| link.channel()?.stat(&path))
    }

    /// Create a directory with owner-only permissions.
    pub fn mkdir(&mut self, path: impl AsRef<Path>) -> SftpOp<'_, E, ()> {
        let path = path.as_ref().to_path_buf();
        self.request("mkdir", move |link, _| {
            link.channel()?.mkdir(&path, CREATE_PERMISSIONS)
        })
    }

    pub fn rmdir(&mut self, path: impl AsRef<Path>) -> SftpOp<'_, E, ()> {
        let path = path.as_ref().to_path_buf();
        self.request("rmdir", move |link, _| link.channel()?.rmdir(&path))
    }

    pub fn rename(&mut self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> SftpOp<'_, E, ()> {
        let from = from.as_ref().to_path_buf();
        let to = to.as_ref().to_path_buf();
        self.request("rename", move |link, _| link.channel()?.rename(&from, &to))
    }

    pub fn unlink(&mut self, path: impl AsRef<Path>) -> SftpOp<'_, E, ()> {
        let path = path.as_ref().to_path_buf();
        self.request("unlink", move |link, _| link.channel()?.unlink(&path))
    }

    /// Canonicalise a remote path on the server.
    pub fn realpath(&mut self, path: impl AsRef<Path>) -> SftpOp<'_, E, PathBuf> {
        let path = path.as_ref().to_path_buf();
        self.request("realpath", move |link, _| link.channel()?.realpath(&path))
    }

    fn request<'s, T, F>(&'s mut self, name: &'static str, request: F) -> SftpOp<'s, E, T>
    where
        F: FnMut(&mut Link<E>, &WeakLink<E>) -> EngineResult<T> + 's,
    {
        SftpOp {
            session: self,
            name,
            request: Box::new(request),
            finished: false,
        }
    }

    fn connected_link(&self) -> Result<&SharedLink<E>> {
        match (&self.link, self.state) {
            (Some(link), ConnectionState::Connected) => Ok(link),
            _ => Err(Error::NotConnected),
        }
    }

    fn drive_connect(&mut self) -> Result<Progress<()>> {
        loop {
            let step = match self.state {
                ConnectionState::Disconnected => self.begin()?,
                ConnectionState::Connecting => self.step_connecting()?,
                ConnectionState::Handshaking => self.step_handshaking()?,
                ConnectionState::Authenticating => self.step_authenticating()?,
                ConnectionState::Connected => return Ok(Progress::Done(())),
            };
            match step {
                Step::Advance(next) => {
                    debug!("Session {} {} -> {}", self.id, self.state, next);
                    self.state = next;
                }
                Step::Suspend(readiness) => {
                    debug!(
                        "Session {} suspended while {} (fd {}, {:?})",
                        self.id, self.state, readiness.fd(), readiness.interest()
                    );
                    return Ok(Progress::Suspended(readiness));
                }
            }
        }
    }

    /// Resolve the host, open the socket and allocate the engine.
    fn begin(&mut self) -> Result<Step> {
        let host = self.config.host();
        let port = self.config.resolved_port();
        let blocking = !self.config.is_nonblocking();

        let addr = transport::resolve(host, port).inspect_err(|err| {
            error!("Session {}: {}", self.id, err);
        })?;
        let socket = TransportSocket::open(addr, blocking)?;
        let mut engine = (self.factory)().map_err(|err| {
            error!("Session {}: unable to allocate new ssh session", self.id);
            translate(err)
        })?;
        engine.set_blocking(blocking);

        debug!(
            "Session {} resolved {}:{} to {} ({})",
            self.id,
            host,
            port,
            addr,
            if blocking { "blocking" } else { "non-blocking" }
        );
        self.link = Some(Arc::new(Mutex::new(Link::new(engine, socket.fd()))));
        self.transport = Some(socket);
        Ok(Step::Advance(ConnectionState::Connecting))
    }

    fn step_connecting(&mut self) -> Result<Step> {
        let Some(socket) = &self.transport else {
            return Err(self.abort_connect(Error::NotConnected));
        };
        match socket.connect() {
            Ok(ConnectStatus::Connected) => {
                info!("Session {} connected to {}", self.id, socket.addr());
                Ok(Step::Advance(ConnectionState::Handshaking))
            }
            Ok(ConnectStatus::InProgress) => Ok(Step::Suspend(socket.readiness())),
            Err(err) => Err(self.abort_connect(err)),
        }
    }

    fn step_handshaking(&mut self) -> Result<Step> {
        let link = self.link.as_ref().ok_or(Error::NotConnected)?;
        let mut guard = lock(link)?;
        let socket = guard.socket;
        let outcome = guard.engine.handshake(socket);
        match outcome {
            Ok(()) => Ok(Step::Advance(ConnectionState::Authenticating)),
            Err(EngineError::WouldBlock) => Ok(Step::Suspend(guard.readiness())),
            Err(err) => {
                let err = translate(err);
                error!("Session {} handshake failed: {}", self.id, err);
                Err(err)
            }
        }
    }

    fn step_authenticating(&mut self) -> Result<Step> {
        let method = match self.auth.take() {
            Some(method) => method,
            None => {
                let method = AuthMethod::select(&self.config)?;
                debug!(
                    "Session {} authenticating as {} with {}",
                    self.id,
                    self.config.username(),
                    AuthStrategy::<E>::name(&method)
                );
                method
            }
        };

        let link = self.link.as_ref().ok_or(Error::NotConnected)?;
        let mut guard = lock(link)?;
        let outcome = method.authenticate(&mut guard.engine, self.config.username());
        match outcome {
            Ok(()) => {
                drop(guard);
                self.connected_at = Some(Utc::now().to_rfc3339());
                info!(
                    "Session {} authenticated as {}@{}",
                    self.id,
                    self.config.username(),
                    self.config.host()
                );
                Ok(Step::Advance(ConnectionState::Connected))
            }
            Err(EngineError::WouldBlock) => {
                let readiness = guard.readiness();
                drop(guard);
                self.auth = Some(method);
                Ok(Step::Suspend(readiness))
            }
            Err(err) => {
                drop(guard);
                let err = translate(err);
                error!("Session {} authentication failed: {}", self.id, err);
                self.auth = Some(method);
                Err(err)
            }
        }
    }

    fn abort_connect(&mut self, err: Error) -> Error {
        error!("Session {}: {}", self.id, err);
        self.teardown();
        err
    }

    fn teardown(&mut self) {
        let handshake_started = matches!(
            self.state,
            ConnectionState::Handshaking
                | ConnectionState::Authenticating
                | ConnectionState::Connected
        );

        if let Some(link) = self.link.take() {
            let mut guard = match link.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    warn!("Session {} link poisoned during teardown", self.id);
                    poisoned.into_inner()
                }
            };
            guard.shutdown(handshake_started);
            drop(guard);
        }

        if let Some(socket) = self.transport.take() {
            socket.close();
        }

        self.auth = None;
        self.connected_at = None;
        self.state = ConnectionState::Disconnected;
    }
}

impl<E: SshEngine> Drop for Session<E> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Resumable connect returned by [`Session::connect`].
pub struct Connect<'s, E: SshEngine> {
    session: &'s mut Session<E>,
}

impl<E: SshEngine> Resumable for Connect<'_, E> {
    type Output = ();

    fn drive(&mut self) -> Result<Progress<()>> {
        self.session.drive_connect()
    }
}

/// Resumable SFTP request returned by the session's filesystem operations.
pub struct SftpOp<'s, E: SshEngine, T> {
    session: &'s mut Session<E>,
    name: &'static str,
    request: Box<dyn FnMut(&mut Link<E>, &WeakLink<E>) -> EngineResult<T> + 's>,
    finished: bool,
}

impl<E: SshEngine, T> Resumable for SftpOp<'_, E, T> {
    type Output = T;

    fn drive(&mut self) -> Result<Progress<T>> {
        if self.finished {
            return Err(Error::Finished);
        }
        let link = self.session.connected_link()?;
        let weak = Arc::downgrade(link);
        let mut guard = lock(link)?;

        if !guard.ensure_sftp()? {
            return Ok(Progress::Suspended(guard.readiness()));
        }
        let outcome = (self.request)(&mut *guard, &weak);
        match outcome {
            Ok(value) => {
                self.finished = true;
                Ok(Progress::Done(value))
            }
            Err(EngineError::WouldBlock) => Ok(Progress::Suspended(guard.readiness())),
            Err(err) => {
                self.finished = true;
                let err = translate(err);
                debug!(
                    "Session {} {} failed: {}",
                    self.session.id, self.name, err
                );
                Err(err)
            }
        }
    }
}

/// Connect a fresh session, retrying the whole connect on transient errors.
///
/// Each attempt builds a new session from `config` and `factory` and drives
/// it on the tokio reactor, bounded by `SSH_CONNECT_TIMEOUT`.
///
/// # Returns
///
/// The connected session and the number of retries that were needed.
///
/// # Retry Behavior
///
/// - Exponential backoff from `policy.min_delay`, capped at `policy.max_delay`
/// - Random jitter between attempts
/// - Only retries errors classified by [`Error::is_retryable`]
pub async fn connect_with_retry<E, F>(
    config: SessionConfig,
    factory: F,
    policy: RetryPolicy,
) -> Result<(Session<E>, u32)>
where
    E: SshEngine,
    F: FnMut() -> EngineResult<E> + Send + Clone + 'static,
{
    let attempt_counter = AtomicU32::new(0);
    let attempt_timeout = resolve_connect_timeout(None);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(policy.min_delay)
        .with_max_delay(policy.max_delay)
        .with_max_times(policy.max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
        if current_attempt > 0 {
            warn!(
                "SSH connection retry attempt {} to {}@{}",
                current_attempt,
                config.username(),
                config.host()
            );
        }

        let mut session = Session::with_engine(config.clone(), factory.clone());
        {
            let mut connect = session.connect();
            tokio::time::timeout(attempt_timeout, drive::complete(&mut connect))
                .await
                .map_err(|_| Error::Timeout)??;
        }
        Ok::<_, Error>(session)
    })
    .retry(backoff)
    .when(|e: &Error| {
        let retryable = e.is_retryable();
        if !retryable {
            warn!(
                "SSH connection to {}@{} failed with non-retryable error: {}",
                config.username(),
                config.host(),
                e
            );
        }
        retryable
    })
    .notify(|err: &Error, dur| {
        warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    let total_attempts = attempt_counter.load(Ordering::SeqCst);
    let retry_count = total_attempts.saturating_sub(1);

    match result {
        Ok(session) => {
            if retry_count > 0 {
                info!(
                    "SSH connection to {}@{} succeeded after {} retry attempt(s)",
                    config.username(),
                    config.host(),
                    retry_count
                );
            }
            Ok((session, retry_count))
        }
        Err(e) => {
            error!(
                "SSH connection to {}@{} failed after {} attempt(s). Last error: {}",
                config.username(),
                config.host(),
                total_attempts,
                e
            );
            Err(e)
        }
    }
}
