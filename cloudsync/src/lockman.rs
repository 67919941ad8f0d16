//! In-process advisory lock manager.
//!
//! Locks are keyed by `(class, key)` and owned by a [`SyncContext`]. They are
//! re-entrant for the same owner and granted first-come-first-served
//! (tokio's semaphore queue is FIFO). Every acquisition carries a
//! [`LockLevel`]; taking a lock at a level not above one already held by the
//! same owner is rejected, which rules out child -> parent nesting.
//!
//! Long waits are logged and bounded by an optional timeout. An operator can
//! [`LockManager::force_release`] a lock held by a hung peer; the old guard
//! becomes inert.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::audit::SyncAuditLogger;
use crate::context::SyncContext;

/// Identifies a lock owner. Clones of a context share one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerToken(u64);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

impl OwnerToken {
    pub fn next() -> Self {
        OwnerToken(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub class: String,
    pub key: String,
}

impl LockKey {
    pub fn new(class: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class, self.key)
    }
}

/// Position of a lock in the global acquisition order.
///
/// Each depth of the kind graph gets a band of four levels: the scope lock,
/// then the naming lock, then row locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockLevel(pub u32);

impl LockLevel {
    pub fn scope(depth: u32) -> Self {
        LockLevel(depth * 4)
    }

    pub fn name(depth: u32) -> Self {
        LockLevel(depth * 4 + 1)
    }

    pub fn row(depth: u32) -> Self {
        LockLevel(depth * 4 + 2)
    }
}

#[derive(Debug, Clone)]
pub struct HeldLock {
    pub key: LockKey,
    pub level: LockLevel,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock order violation: {requested} at {requested_level:?} while holding {held} at {held_level:?}")]
    OrderViolation {
        requested: LockKey,
        requested_level: LockLevel,
        held: LockKey,
        held_level: LockLevel,
    },

    #[error("timed out after {waited:?} waiting for {key}")]
    Timeout { key: LockKey, waited: Duration },

    #[error("cancelled while waiting for {key}")]
    Cancelled { key: LockKey },
}

pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    pub warn_after: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(300)),
            warn_after: Duration::from_secs(30),
        }
    }
}

/// Diagnostic view of a held lock.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub key: LockKey,
    pub owner: OwnerToken,
    pub depth: u32,
    pub held_for: Duration,
}

struct SlotState {
    owner: Option<OwnerToken>,
    depth: u32,
    generation: u64,
    permit: Option<OwnedSemaphorePermit>,
    acquired_at: Option<Instant>,
}

struct Slot {
    semaphore: Arc<Semaphore>,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            state: Mutex::new(SlotState {
                owner: None,
                depth: 0,
                generation: 0,
                permit: None,
                acquired_at: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        // A panic while holding the state lock leaves it consistent enough to
        // keep going; every field is written in one step.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct Inner {
    slots: Mutex<HashMap<LockKey, Arc<Slot>>>,
    config: LockConfig,
    audit: SyncAuditLogger,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<LockKey, Arc<Slot>>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn slot(&self, key: &LockKey) -> Arc<Slot> {
        let mut slots = self.slots();
        Arc::clone(
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    /// Drop the slot once nobody holds or waits on it. New references are
    /// only handed out under the map lock, so the count check is exact.
    fn gc(&self, key: &LockKey, slot: &Arc<Slot>) {
        let mut slots = self.slots();
        let idle = match slots.get(key) {
            Some(current) => {
                Arc::ptr_eq(current, slot)
                    && Arc::strong_count(slot) == 2
                    && slot.state().owner.is_none()
            }
            None => false,
        };
        if idle {
            slots.remove(key);
        }
    }
}

/// Process-wide lock table. Cheap to clone.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

impl LockManager {
    pub fn new(config: LockConfig) -> Self {
        Self::with_audit(config, SyncAuditLogger::new_noop())
    }

    pub fn with_audit(config: LockConfig, audit: SyncAuditLogger) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                config,
                audit,
            }),
        }
    }

    /// Acquire `(class, key)` for the owner of `ctx`.
    pub async fn acquire(
        &self,
        ctx: &SyncContext,
        class: &str,
        key: &str,
        level: LockLevel,
    ) -> Result<LockGuard> {
        let lock_key = LockKey::new(class, key);
        let owner = ctx.owner();

        self.check_order(ctx, &lock_key, level)?;

        let slot = self.inner.slot(&lock_key);

        // Re-entry by the same owner.
        {
            let mut state = slot.state();
            if state.owner == Some(owner) {
                state.depth += 1;
                let generation = state.generation;
                drop(state);
                return Ok(self.guard(ctx, lock_key, level, slot, generation));
            }
        }

        let started = Instant::now();
        let deadline = self.inner.config.timeout.map(|t| started + t);
        let warn_after = self.inner.config.warn_after;

        // Pinned once so the waiter keeps its place in the FIFO queue
        // across warning ticks.
        let acquire = Arc::clone(&slot.semaphore).acquire_owned();
        tokio::pin!(acquire);
        let mut next_warn = started + warn_after;

        let permit = loop {
            let timeout = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                permit = &mut acquire => {
                    match permit {
                        Ok(p) => break p,
                        // The semaphore is never closed.
                        Err(_) => return Err(LockError::Cancelled { key: lock_key }),
                    }
                }
                _ = ctx.cancelled() => {
                    self.inner.gc(&lock_key, &slot);
                    return Err(LockError::Cancelled { key: lock_key });
                }
                _ = timeout => {
                    self.inner.gc(&lock_key, &slot);
                    return Err(LockError::Timeout { key: lock_key, waited: started.elapsed() });
                }
                _ = tokio::time::sleep_until(next_warn) => {
                    let holder = slot.state().owner.map(|o| o.as_u64());
                    warn!(
                        lock = %lock_key,
                        waited = ?started.elapsed(),
                        holder = ?holder,
                        trace_id = %ctx.trace_id(),
                        "Still waiting for lock"
                    );
                    next_warn += warn_after;
                }
            }
        };

        let generation = {
            let mut state = slot.state();
            state.owner = Some(owner);
            state.depth = 1;
            state.generation += 1;
            state.permit = Some(permit);
            state.acquired_at = Some(Instant::now());
            state.generation
        };
        debug!(lock = %lock_key, owner = owner.as_u64(), waited = ?started.elapsed(), "Lock acquired");

        Ok(self.guard(ctx, lock_key, level, slot, generation))
    }

    fn check_order(&self, ctx: &SyncContext, key: &LockKey, level: LockLevel) -> Result<()> {
        let held = match ctx.held().lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        if held.iter().any(|h| &h.key == key) {
            return Ok(());
        }
        if let Some(h) = held.iter().find(|h| h.level >= level) {
            return Err(LockError::OrderViolation {
                requested: key.clone(),
                requested_level: level,
                held: h.key.clone(),
                held_level: h.level,
            });
        }
        Ok(())
    }

    fn guard(
        &self,
        ctx: &SyncContext,
        key: LockKey,
        level: LockLevel,
        slot: Arc<Slot>,
        generation: u64,
    ) -> LockGuard {
        let held = Arc::clone(ctx.held());
        if let Ok(mut stack) = held.lock() {
            stack.push(HeldLock {
                key: key.clone(),
                level,
            });
        }
        LockGuard {
            manager: self.clone(),
            key,
            slot,
            owner: ctx.owner(),
            generation,
            held,
        }
    }

    /// Release `(class, key)` regardless of its owner. Returns whether a
    /// holder was evicted.
    pub fn force_release(&self, class: &str, key: &str) -> bool {
        let lock_key = LockKey::new(class, key);
        let slot = match self.inner.slots().get(&lock_key) {
            Some(slot) => Arc::clone(slot),
            None => return false,
        };
        let evicted = {
            let mut state = slot.state();
            let Some(owner) = state.owner.take() else {
                return false;
            };
            state.depth = 0;
            state.generation += 1;
            state.acquired_at = None;
            state.permit.take();
            owner
        };
        warn!(lock = %lock_key, owner = evicted.as_u64(), "Lock force released");
        self.inner
            .audit
            .lock_force_released(class, key, evicted.as_u64());
        true
    }

    pub fn held(&self) -> Vec<LockInfo> {
        let slots: Vec<(LockKey, Arc<Slot>)> = self
            .inner
            .slots()
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();
        let mut out: Vec<LockInfo> = slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let state = slot.state();
                state.owner.map(|owner| LockInfo {
                    key,
                    owner,
                    depth: state.depth,
                    held_for: state.acquired_at.map(|t| t.elapsed()).unwrap_or_default(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        out
    }

    pub fn is_locked(&self, class: &str, key: &str) -> bool {
        let lock_key = LockKey::new(class, key);
        let slot = self.inner.slots().get(&lock_key).cloned();
        slot.is_some_and(|s| s.state().owner.is_some())
    }
}

/// Releases its lock on drop, on every exit path.
pub struct LockGuard {
    manager: LockManager,
    key: LockKey,
    slot: Arc<Slot>,
    owner: OwnerToken,
    generation: u64,
    held: Arc<Mutex<Vec<HeldLock>>>,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Ok(mut stack) = self.held.lock() {
            if let Some(pos) = stack.iter().rposition(|h| h.key == self.key) {
                stack.remove(pos);
            }
        }

        let released = {
            let mut state = self.slot.state();
            if state.generation != self.generation || state.owner != Some(self.owner) {
                // Force released in the meantime.
                false
            } else {
                state.depth = state.depth.saturating_sub(1);
                if state.depth == 0 {
                    state.owner = None;
                    state.acquired_at = None;
                    state.permit.take();
                    true
                } else {
                    false
                }
            }
        };
        if released {
            debug!(lock = %self.key, owner = self.owner.as_u64(), "Lock released");
            self.manager.inner.gc(&self.key, &self.slot);
        }
    }
}
