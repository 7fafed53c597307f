//! Bounded-concurrency admission for expensive background work.
//!
//! A [`TokenGate`] lets at most `capacity` tasks run at once. Callers that
//! find no free token wait in FIFO order. Every call carries a
//! [`CancellationToken`]: a task whose token is cancelled before it gets a
//! turn resolves to `None` without running, and a running task is dropped
//! at its next await point.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct TokenGate {
    tokens: Arc<Semaphore>,
    capacity: usize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// Counts a task as running until dropped, even if the caller abandons
/// the future mid-task.
struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for TokenGate {
    /// A strict serializer.
    fn default() -> Self {
        Self::new(1)
    }
}

impl TokenGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            tokens: Arc::new(Semaphore::new(capacity)),
            capacity,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Run `task` once a token is free.
    ///
    /// Returns `None` if `cancel` fires before or while the task runs.
    pub async fn execute_when_token_is_free<F, Fut, T>(&self, cancel: &CancellationToken, task: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if cancel.is_cancelled() {
            return None;
        }
        let _token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            token = self.tokens.acquire() => token.ok()?,
        };
        if cancel.is_cancelled() {
            return None;
        }

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let _running = Running(&self.running);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            out = task() => Some(out),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks currently holding a token.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Most tasks ever observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}
