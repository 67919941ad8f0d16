//! Per-call context: caller identity, trace id, deadline and cancellation.
//!
//! A context also identifies a logical lock owner. Clones share the owner and
//! its held-lock stack, so a reconcile can re-enter locks it already holds.
//! [`SyncContext::fork`] gives an independent owner for parallel work.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::lockman::{HeldLock, OwnerToken};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Cancels every context derived from the one it was created with.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct SyncContext {
    caller: Arc<str>,
    trace_id: Arc<str>,
    deadline: Option<Instant>,
    cancel: watch::Receiver<bool>,
    owner: OwnerToken,
    held: Arc<Mutex<Vec<HeldLock>>>,
}

impl SyncContext {
    /// A cancellable context.
    pub fn new(caller: &str) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self::with_receiver(caller, rx);
        (ctx, CancelHandle { tx: Arc::new(tx) })
    }

    /// A context that is never cancelled (its sender is dropped right away).
    pub fn background(caller: &str) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::with_receiver(caller, rx)
    }

    /// A context cancelled by an external shutdown channel.
    pub fn from_shutdown(caller: &str, shutdown: watch::Receiver<bool>) -> Self {
        Self::with_receiver(caller, shutdown)
    }

    fn with_receiver(caller: &str, cancel: watch::Receiver<bool>) -> Self {
        Self {
            caller: Arc::from(caller),
            trace_id: Arc::from(Uuid::new_v4().to_string()),
            deadline: None,
            cancel,
            owner: OwnerToken::next(),
            held: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Same caller, trace, deadline and cancellation, but a new lock owner.
    pub fn fork(&self) -> Self {
        Self {
            caller: Arc::clone(&self.caller),
            trace_id: Arc::clone(&self.trace_id),
            deadline: self.deadline,
            cancel: self.cancel.clone(),
            owner: OwnerToken::next(),
            held: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Same caller and trace, but a new lock owner that is never cancelled
    /// and has no deadline. For undo steps that must land after a failure.
    pub fn detached(&self) -> Self {
        let mut ctx = Self::background(&self.caller);
        ctx.trace_id = Arc::clone(&self.trace_id);
        ctx
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    pub(crate) fn held(&self) -> &Arc<Mutex<Vec<HeldLock>>> {
        &self.held
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        let signal = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender gone: nobody can cancel any more.
                    std::future::pending::<()>().await;
                }
            }
        };
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = signal => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => signal.await,
        }
    }

    /// Run `fut` unless the context is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Cancelled>
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Cancelled),
            value = fut => Ok(value),
        }
    }
}
