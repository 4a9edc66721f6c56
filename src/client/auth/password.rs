//! Password-based SSH authentication.

use crate::client::engine::{EngineResult, SshEngine};

use super::traits::AuthStrategy;

/// Password authentication strategy.
#[derive(Clone)]
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    /// Create a new password authentication strategy.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl<E: SshEngine> AuthStrategy<E> for PasswordAuth {
    fn authenticate(&self, engine: &mut E, username: &str) -> EngineResult<()> {
        engine.auth_password(username, &self.password)
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
