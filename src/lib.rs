//! Client-side SSH sessions with resumable SFTP file and directory access.
//!
//! Every network-facing operation returns a [`Resumable`](client::Resumable)
//! value. Driving it either completes or reports which socket readiness it
//! is waiting for, so callers can block with [`client::drive::wait`], await
//! with [`client::drive::complete`], or plug the descriptor into their own
//! event loop.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod client;
