//! Scripted in-process transport used by the dispatch tests.
//!
//! Behavior is driven by the provider's settings and by the recipient
//! address:
//!
//! - the first `failing_opens` calls to `open` fail;
//! - recipients containing `reject` are refused;
//! - recipients containing `abort` are refused and break the session, after
//!   which every send on it fails;
//! - recipients containing `hang` never complete;
//! - every other send succeeds after `send_delay`.

use super::{Transport, TransportProvider};
use core::time::Duration;
use mailly_core::{Error, Result, types::MessageRequest};
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Stats {
    pub open_attempts: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub send_attempts: AtomicUsize,
    pub delivered: Mutex<Vec<String>>,
}

impl Stats {
    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    pub failing_opens: usize,
    pub send_delay: Duration,
    pub stats: Arc<Stats>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_failing_opens(mut self, failing_opens: usize) -> Self {
        self.failing_opens = failing_opens;
        self
    }

    #[must_use]
    pub fn with_send_delay(mut self, send_delay: Duration) -> Self {
        self.send_delay = send_delay;
        self
    }
}

impl TransportProvider for MemoryProvider {
    type Connection = MemoryConnection;

    async fn open(&self) -> Result<MemoryConnection> {
        let attempt = self.stats.open_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failing_opens {
            return Err(Error::transport("connection refused"));
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            send_delay: self.send_delay,
            broken: false,
            stats: Arc::clone(&self.stats),
        })
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    send_delay: Duration,
    broken: bool,
    stats: Arc<Stats>,
}

impl Transport for MemoryConnection {
    async fn send(&mut self, message: &MessageRequest) -> Result<()> {
        self.stats.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(Error::delivery("network error: Broken pipe"));
        }
        if message.recipient.contains("hang") {
            core::future::pending::<()>().await;
        }
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        if message.recipient.contains("reject") {
            return Err(Error::delivery("550 mailbox unavailable"));
        }
        if message.recipient.contains("abort") {
            self.broken = true;
            return Err(Error::delivery("554 transaction failed"));
        }
        self.stats.delivered.lock().push(message.recipient.clone());
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn close(self) -> Result<()> {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
