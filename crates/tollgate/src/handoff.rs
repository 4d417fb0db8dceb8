//! # One-shot cross-thread handoff.
//!
//! [`SyncedReference`] passes a single value from one thread (or task) to
//! another exactly once. The writer calls [`set`](SyncedReference::set); the
//! reader either blocks ([`get`](SyncedReference::get),
//! [`get_timeout`](SyncedReference::get_timeout)) or awaits
//! ([`wait`](SyncedReference::wait), [`wait_timeout`](SyncedReference::wait_timeout)).
//!
//! ```text
//!  UI thread                         worker / caller thread
//!  ─────────                         ──────────────────────
//!  reference.set(result) ──────────► reference.get_timeout(5s) -> Ok(result)
//!  (second set: ignored, warned)
//! ```
//!
//! ## Rules
//! - The first `set` wins; later calls are no-ops that return `false`.
//! - `cancel` resolves the reference without a value; readers get
//!   [`HandoffError::Cancelled`].
//! - Clones share the same cell.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::warn;

use crate::error::HandoffError;

enum Slot<T> {
    Empty,
    Set(T),
    Cancelled,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
    notify: Notify,
}

/// Single-assignment cell shared between a writer and a reader.
pub struct SyncedReference<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SyncedReference<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send> SyncedReference<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Empty),
                cond: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Stores `value` and wakes every reader.
    ///
    /// Returns `false` (and logs a warning) when the reference was already set
    /// or cancelled; the stored value is left untouched.
    pub fn set(&self, value: T) -> bool {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Empty) {
            warn!("synced reference already resolved; ignoring second set");
            return false;
        }
        *slot = Slot::Set(value);
        drop(slot);
        self.wake();
        true
    }

    /// Resolves the reference without a value.
    ///
    /// Returns `false` when it was already resolved.
    pub fn cancel(&self) -> bool {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Empty) {
            return false;
        }
        *slot = Slot::Cancelled;
        drop(slot);
        self.wake();
        true
    }

    /// True once a value was set or the reference was cancelled.
    pub fn is_resolved(&self) -> bool {
        !matches!(*self.lock(), Slot::Empty)
    }

    /// Returns the value if one is already set, without waiting.
    pub fn peek(&self) -> Option<T> {
        match &*self.lock() {
            Slot::Set(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Blocks the calling thread until the reference resolves.
    ///
    /// Do not call this from an async task; use [`wait`](Self::wait) there.
    pub fn get(&self) -> Result<T, HandoffError> {
        let mut slot = self.lock();
        loop {
            match &*slot {
                Slot::Set(value) => return Ok(value.clone()),
                Slot::Cancelled => return Err(HandoffError::Cancelled),
                Slot::Empty => {
                    slot = self
                        .inner
                        .cond
                        .wait(slot)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Blocks the calling thread for at most `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, HandoffError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            match &*slot {
                Slot::Set(value) => return Ok(value.clone()),
                Slot::Cancelled => return Err(HandoffError::Cancelled),
                Slot::Empty => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(HandoffError::Timeout(timeout));
                    }
                    slot = self
                        .inner
                        .cond
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Waits asynchronously until the reference resolves.
    pub async fn wait(&self) -> Result<T, HandoffError> {
        loop {
            // registered before the check so a concurrent set cannot be missed
            let notified = self.inner.notify.notified();
            if let Some(result) = self.resolved() {
                return result;
            }
            notified.await;
        }
    }

    /// Waits asynchronously for at most `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<T, HandoffError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(HandoffError::Timeout(timeout)),
        }
    }

    /// True if both handles point at the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn resolved(&self) -> Option<Result<T, HandoffError>> {
        match &*self.lock() {
            Slot::Set(value) => Some(Ok(value.clone())),
            Slot::Cancelled => Some(Err(HandoffError::Cancelled)),
            Slot::Empty => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.inner.cond.notify_all();
        self.inner.notify.notify_waiters();
    }
}

impl<T: Clone + Send> Default for SyncedReference<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SyncedReference<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner) {
            Slot::Empty => "empty",
            Slot::Set(_) => "set",
            Slot::Cancelled => "cancelled",
        };
        f.debug_struct("SyncedReference").field("state", &state).finish()
    }
}
