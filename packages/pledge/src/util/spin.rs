//! Short-critical-section spinlock.

use std::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicBool,
        Ordering::{Acquire, Relaxed, Release},
    },
    thread,
};


// number of busy-wait iterations before falling back to yielding the thread.
const SPINS_BEFORE_YIELD: u32 = 64;


/// Spin-then-yield lock for very short critical sections.
///
/// Critical sections guarded by this lock must never block, perform I/O, call user code, or
/// acquire the same lock recursively.
pub(crate) struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

/// Guard for a locked [`SpinLock`]. Unlocks when dropped.
pub(crate) struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    /// Construct unlocked.
    pub(crate) const fn new(value: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Lock, spinning and then yielding until the lock is acquired.
    pub(crate) fn lock(&self) -> SpinGuard<'_, T> {
        let mut spins = 0;
        loop {
            if self.locked.compare_exchange_weak(false, true, Acquire, Relaxed).is_ok() {
                return SpinGuard { lock: self };
            }
            // wait for it to look unlocked before trying the CAS again
            while self.locked.load(Relaxed) {
                if spins < SPINS_BEFORE_YIELD {
                    spins += 1;
                    spin_loop();
                } else {
                    thread::yield_now();
                }
            }
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

impl<'a, T> Deref for SpinGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // safety: holding the guard means we hold the lock
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for SpinGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // safety: holding the guard means we hold the lock
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> Drop for SpinGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Release);
    }
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}
