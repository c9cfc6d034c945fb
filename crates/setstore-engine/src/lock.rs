//! Shared lock handle injected into the engine.
//!
//! The caller owns the lock and may hold it across several engine calls
//! (or across several tables that share it). Every engine entry point
//! re-acquires it, which is cheap when the current thread already holds it.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Guard proving the shared lock is held by the current thread
pub type SharedGuard<'a> = ReentrantMutexGuard<'a, ()>;

/// Cloneable handle to a re-entrant process-local lock
#[derive(Clone, Default)]
pub struct SharedLock {
    inner: Arc<ReentrantMutex<()>>,
}

impl SharedLock {
    /// Create a fresh lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, blocking until it is available
    pub fn lock(&self) -> SharedGuard<'_> {
        self.inner.lock()
    }

    /// Try to acquire the lock within `timeout`
    pub fn try_lock_for(&self, timeout: Duration) -> Option<SharedGuard<'_>> {
        self.inner.try_lock_for(timeout)
    }

    /// Check if two handles refer to the same underlying lock
    #[must_use]
    pub fn same_lock(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SharedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLock")
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}
