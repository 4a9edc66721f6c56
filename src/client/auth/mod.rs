//! Authentication strategies for SSH sessions.
//!
//! A session picks exactly one strategy when it first reaches the
//! authenticating state and keeps it across every resume of that connect.
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: Password-based authentication
//! - [`KeyAuth`]: In-memory PEM private key authentication
//!
//! # Selection
//!
//! An identity always wins over a password. Configuring neither is a
//! configuration error reported before any authentication traffic.

mod key;
mod password;
mod traits;

pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;

use super::config::SessionConfig;
use super::engine::{EngineResult, SshEngine};
use super::error::{Error, Result};

/// The strategy chosen for one connect.
#[derive(Clone)]
pub enum AuthMethod {
    Password(PasswordAuth),
    PublicKey(KeyAuth),
}

impl AuthMethod {
    /// Choose the strategy for `config`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when neither credential is present or
    /// when the identity is not valid UTF-8 PEM text.
    pub fn select(config: &SessionConfig) -> Result<Self> {
        if let Some(identity) = config.identity_ref() {
            let pem = std::str::from_utf8(identity.private_key())
                .map_err(|_| Error::Config("identity must be PEM-encoded text".to_string()))?;
            let passphrase = identity
                .passphrase()
                .or(config.password_secret())
                .map(str::to_string);
            return Ok(AuthMethod::PublicKey(KeyAuth::new(pem, passphrase)));
        }

        if let Some(password) = config.password_secret() {
            return Ok(AuthMethod::Password(PasswordAuth::new(password)));
        }

        Err(Error::Config(
            "requires either a password or an identity".to_string(),
        ))
    }
}

impl<E: SshEngine> AuthStrategy<E> for AuthMethod {
    fn authenticate(&self, engine: &mut E, username: &str) -> EngineResult<()> {
        match self {
            AuthMethod::Password(auth) => auth.authenticate(engine, username),
            AuthMethod::PublicKey(auth) => auth.authenticate(engine, username),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password(auth) => AuthStrategy::<E>::name(auth),
            AuthMethod::PublicKey(auth) => AuthStrategy::<E>::name(auth),
        }
    }
}
