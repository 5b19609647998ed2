//! Delivery transport abstraction.
//!
//! The dispatch pipeline never constructs sessions itself. It asks a
//! [`TransportProvider`] for a freshly opened, authenticated [`Transport`] and
//! then only calls [`Transport::send`], [`Transport::is_broken`] and
//! [`Transport::close`] on it.
//!
//! A transport is owned by exactly one worker and is never shared across
//! tasks, so its methods take `&mut self` and the trait does not require
//! `Sync`.
//!
//! ## Implementations
//!
//! - [`smtp::SmtpProvider`] - persistent SMTP sessions via `lettre`.
//! - `memory::MemoryProvider` (tests only) - scripted in-process transport.

use core::future::Future;
use mailly_core::{Result, types::MessageRequest};

#[cfg(test)]
pub mod memory;
pub mod smtp;

/// One open session to the delivery endpoint.
pub trait Transport: Send + 'static {
    /// Delivers a single message over the open session.
    ///
    /// # Errors
    ///
    /// Returns [`mailly_core::Error::Delivery`] when the endpoint rejects the
    /// message or the session fails mid-transaction.
    fn send(&mut self, message: &MessageRequest) -> impl Future<Output = Result<()>> + Send;

    /// Whether the session can no longer carry messages. A failed send may
    /// leave the session aborted (SMTP sends `QUIT` after a rejected
    /// transaction), in which case the owner must open a new one.
    fn is_broken(&self) -> bool;

    /// Ends the session. Consumes the transport so it can only happen once.
    ///
    /// # Errors
    ///
    /// Returns [`mailly_core::Error::Transport`] when the polite shutdown
    /// fails. The underlying socket is released either way.
    fn close(self) -> impl Future<Output = Result<()>> + Send;
}

/// Opens new sessions from configured endpoint and credentials.
pub trait TransportProvider: Send + Sync + 'static {
    type Connection: Transport;

    /// Opens and authenticates a new session.
    ///
    /// # Errors
    ///
    /// Returns [`mailly_core::Error::Transport`] when the endpoint cannot be
    /// reached, the TLS upgrade fails or authentication is refused.
    fn open(&self) -> impl Future<Output = Result<Self::Connection>> + Send;
}
