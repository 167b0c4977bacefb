//! CPU lock
//!
//! The CPU lock serializes all scheduler state of one CPU. It is a plain
//! flag: taking it stands for "interrupts off on this CPU", so it never
//! spins and taking it twice is a kernel bug.
//!
//! # Lock Token
//!
//! Operations that skip atomic read-modify-write cycles because the lock
//! already serializes them take a [`Held`] token. The token can only be
//! obtained from [`CpuLock::held`], which asserts the lock is held.

use core::sync::atomic::{AtomicBool, Ordering};

/// Proof that the CPU lock was held when the token was created.
#[derive(Clone, Copy, Debug)]
pub struct Held {
    _private: (),
}

/// Per-CPU lock flag.
#[derive(Debug, Default)]
pub struct CpuLock {
    locked: AtomicBool,
}

impl CpuLock {
    /// Create an unlocked CPU lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Take the lock.
    ///
    /// # Panics
    ///
    /// Panics if the lock is already held.
    pub fn lock(&self) -> Held {
        let was = self.locked.swap(true, Ordering::Acquire);
        assert!(!was, "CPU lock taken twice");
        Held { _private: () }
    }

    /// Release the lock.
    pub fn clear(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Check if the lock is held.
    #[inline]
    #[must_use]
    pub fn test(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Get a token for an already held lock.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held.
    #[track_caller]
    pub fn held(&self) -> Held {
        assert!(self.test(), "CPU lock not held");
        Held { _private: () }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_and_clear() {
        let lock = CpuLock::new();
        assert!(!lock.test());
        let _held = lock.lock();
        assert!(lock.test());
        let _again = lock.held();
        lock.clear();
        assert!(!lock.test());
    }

    #[test]
    #[should_panic(expected = "CPU lock taken twice")]
    fn test_double_lock_panics() {
        let lock = CpuLock::new();
        let _a = lock.lock();
        let _b = lock.lock();
    }

    #[test]
    #[should_panic(expected = "CPU lock not held")]
    fn test_held_requires_lock() {
        let lock = CpuLock::new();
        let _ = lock.held();
    }
}
