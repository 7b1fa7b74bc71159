//! # Ordered Locking Primitives
//!
//! Lock wrappers that encode their position in the lock hierarchy.
//!
//! Veil has three registries (correlation queue, channel registry, watch
//! registry), each behind its own lock. All three are leaves: no other
//! lock is taken while one is held, and nothing blocking (bus calls,
//! deferred flushes, user event waits) runs under them. Handlers that
//! need to call out first copy what they need and drop the guard.

use spin::{Mutex, MutexGuard};

/// Lock ordering levels.
///
/// Locks must be acquired in increasing level order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// Level 0: correlation queue of parked operations
    Queue = 0,
    /// Level 1: per-device lists (channels, watches)
    List = 1,
}

/// A mutex with an associated ordering level.
pub struct OrderedMutex<T, const LEVEL: u8> {
    inner: Mutex<T>,
    name: &'static str,
}

impl<T, const LEVEL: u8> OrderedMutex<T, LEVEL> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            inner: Mutex::new(value),
            name,
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    /// Run `f` with the lock held
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    #[inline]
    pub const fn level(&self) -> u8 {
        LEVEL
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// Level 0 lock - correlation queue
pub type QueueLock<T> = OrderedMutex<T, 0>;

/// Level 1 lock - channel and watch lists
pub type ListLock<T> = OrderedMutex<T, 1>;

/// Create a queue-level lock (Level 0)
#[macro_export]
macro_rules! queue_lock {
    ($value:expr, $name:literal) => {
        $crate::sync::QueueLock::new($value, $name)
    };
}

/// Create a list-level lock (Level 1)
#[macro_export]
macro_rules! list_lock {
    ($value:expr, $name:literal) => {
        $crate::sync::ListLock::new($value, $name)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_levels() {
        assert!(LockLevel::Queue < LockLevel::List);
        assert_eq!(LockLevel::Queue as u8, 0);
        assert_eq!(LockLevel::List as u8, 1);
    }

    #[test]
    fn test_ordered_mutex() {
        let lock: ListLock<Vec<u32>> = list_lock!(Vec::new(), "TEST_LIST");
        assert_eq!(lock.level(), 1);
        assert_eq!(lock.name(), "TEST_LIST");

        lock.with(|v| v.push(3));
        assert_eq!(*lock.lock(), vec![3]);
    }

    #[test]
    fn test_try_lock_contended() {
        let lock: QueueLock<u32> = queue_lock!(0, "TEST_QUEUE");
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
