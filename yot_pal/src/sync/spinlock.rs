//! A lock for critical sections that only push or pop a list entry.
//!
//! The lock word is `0` (free), `1` (held) or `2` (held, someone may be sleeping). An
//! uncontended lock/unlock is one CAS and one swap. Under contention the lock spins briefly
//! and then sleeps on the word with [`wait_on_address`], so a holder that gets preempted does
//! not burn the waiters' CPU.

use std::cell::UnsafeCell;
use std::hint::spin_loop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

use super::{INFINITE, wait_on_address, wake_by_address_single};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

const SPIN_LIMIT: u32 = 100;

pub struct SpinLock<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

/// Releases the [`SpinLock`] when dropped.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

// Safety: the lock hands out at most one guard at a time.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        SpinGuard { lock: self }
    }

    #[cold]
    fn lock_contended(&self) {
        let mut spins = 0;
        while self.state.load(Ordering::Relaxed) == LOCKED && spins < SPIN_LIMIT {
            spins += 1;
            spin_loop();
        }

        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }

        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            wait_on_address(&self.state, CONTENDED, INFINITE);
        }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        if self.lock.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            wake_by_address_single(&self.lock.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guard_releases_on_drop() {
        let lock = SpinLock::new(10);
        {
            let mut guard = lock.lock();
            *guard += 5;
            assert!(lock.try_lock().is_none());
        }
        assert!(!lock.is_locked());
        assert_eq!(lock.into_inner(), 15);
    }

    #[test]
    fn concurrent_list_operations_are_serialized() {
        let list = Arc::new(SpinLock::new(VecDeque::new()));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for i in 0..5_000 {
                        list.lock().push_back(t * 10_000 + i);
                        if i % 2 == 0 {
                            list.lock().pop_front();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(list.lock().len(), 8 * 2_500);
    }
}
