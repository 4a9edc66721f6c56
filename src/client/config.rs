//! Session configuration and environment resolution.
//!
//! Tunables follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_PORT` | 22 | Remote port when none is configured |
//! | `SSH_NONBLOCKING` | false | Run the engine in non-blocking mode |
//! | `SSH_CONNECT_TIMEOUT` | 30s | Readiness wait bound used by blocking drivers |
//! | `SSH_MAX_RETRIES` | 3 | Maximum connect retry attempts |
//! | `SSH_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |

use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default SSH port
pub(crate) const DEFAULT_PORT: u16 = 22;

/// Default readiness wait bound in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default maximum retry attempts for a connect
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap in seconds
pub(crate) const MAX_RETRY_DELAY_SECS: u64 = 10;

pub(crate) const PORT_ENV_VAR: &str = "SSH_PORT";
pub(crate) const NONBLOCKING_ENV_VAR: &str = "SSH_NONBLOCKING";
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "SSH_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_RETRY_DELAY_MS";

/// Resolve a value with priority: parameter -> env var -> default.
/// Unparseable environment values fall back to the default.
fn resolve<T: FromStr>(param: Option<T>, var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

pub(crate) fn resolve_port(port_param: Option<u16>) -> u16 {
    resolve(port_param, PORT_ENV_VAR, DEFAULT_PORT)
}

/// Resolve the engine mode. Only `true` (any case) and `1` enable it.
pub(crate) fn resolve_nonblocking(nonblocking_param: Option<bool>) -> bool {
    if let Some(nonblocking) = nonblocking_param {
        return nonblocking;
    }

    match env::var(NONBLOCKING_ENV_VAR) {
        Ok(value) => value.eq_ignore_ascii_case("true") || value == "1",
        Err(_) => false,
    }
}

pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    resolve(max_retries_param, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

pub(crate) fn resolve_retry_delay(retry_delay_param: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        retry_delay_param,
        RETRY_DELAY_MS_ENV_VAR,
        DEFAULT_RETRY_DELAY_MS,
    ))
}

/// Private key material for public-key authentication.
#[derive(Clone)]
pub struct Identity {
    private_key: Vec<u8>,
    passphrase: Option<String>,
}

impl Identity {
    /// Create an identity from PEM-encoded private key bytes.
    pub fn new(private_key: impl Into<Vec<u8>>) -> Self {
        Self {
            private_key: private_key.into(),
            passphrase: None,
        }
    }

    /// Load PEM-encoded private key bytes from a local file.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(fs::read(path)?))
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("private_key", &format_args!("<{} bytes>", self.private_key.len()))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Connection parameters for a [`Session`](super::session::Session).
///
/// When an identity is present it is used for authentication, and the
/// configured password (if any) is ignored.
#[derive(Clone)]
pub struct SessionConfig {
    host: String,
    port: Option<u16>,
    username: String,
    password: Option<String>,
    identity: Option<Identity>,
    nonblocking: Option<bool>,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            username: username.into(),
            password: None,
            identity: None,
            nonblocking: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Select engine mode. Non-blocking sessions suspend instead of waiting.
    pub fn nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = Some(nonblocking);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Configured port, falling back to `SSH_PORT` and then 22.
    pub fn resolved_port(&self) -> u16 {
        resolve_port(self.port)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password_secret(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn identity_ref(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_nonblocking(&self) -> bool {
        resolve_nonblocking(self.nonblocking)
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity", &self.identity)
            .field("nonblocking", &self.nonblocking)
            .finish()
    }
}

/// Backoff parameters for [`connect_with_retry`](super::session::connect_with_retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy from `SSH_MAX_RETRIES` and `SSH_RETRY_DELAY_MS`, or defaults.
    pub fn from_env() -> Self {
        Self {
            max_retries: resolve_max_retries(None),
            min_delay: resolve_retry_delay(None),
            max_delay: Duration::from_secs(MAX_RETRY_DELAY_SECS),
        }
    }
}
