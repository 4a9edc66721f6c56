//! Public key SSH authentication from in-memory PEM material.

use crate::client::engine::{EngineResult, SshEngine};

use super::traits::AuthStrategy;

/// Private key authentication strategy.
///
/// The key is held as PEM text and handed to the engine directly, so no key
/// file needs to exist on the local filesystem.
#[derive(Clone)]
pub struct KeyAuth {
    private_key: String,
    passphrase: Option<String>,
}

impl KeyAuth {
    /// Create a new key authentication strategy.
    ///
    /// # Arguments
    ///
    /// * `private_key` - PEM-encoded private key
    /// * `passphrase` - Optional passphrase for encrypted keys
    pub fn new(private_key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self {
            private_key: private_key.into(),
            passphrase,
        }
    }
}

impl<E: SshEngine> AuthStrategy<E> for KeyAuth {
    fn authenticate(&self, engine: &mut E, username: &str) -> EngineResult<()> {
        engine.auth_publickey(username, &self.private_key, self.passphrase.as_deref())
    }

    fn name(&self) -> &'static str {
        "publickey"
    }
}
