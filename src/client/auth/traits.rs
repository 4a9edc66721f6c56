//! Authentication strategy trait definition.

use crate::client::engine::{EngineResult, SshEngine};

/// Trait for SSH authentication strategies.
///
/// A strategy is invoked once per drive while the session is
/// authenticating. In non-blocking mode it may return `WouldBlock`, in which
/// case the session calls the same strategy again after readiness.
pub trait AuthStrategy<E: SshEngine> {
    /// Attempt to authenticate with the SSH server.
    ///
    /// # Arguments
    ///
    /// * `engine` - The engine that completed the handshake
    /// * `username` - Username for authentication
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Authentication succeeded
    /// * `Err(WouldBlock)` - Retry after the socket is ready
    /// * `Err(_)` - Credentials rejected or transport failure
    fn authenticate(&self, engine: &mut E, username: &str) -> EngineResult<()>;

    /// Get the name of this authentication strategy.
    ///
    /// Used for logging and debugging purposes.
    fn name(&self) -> &'static str;
}
