//! Shared/exclusive latch protecting the data it owns.
//!
//! A [`Latch`] pairs a `parking_lot::RwLock<()>` with an `UnsafeCell<T>`. Access is only possible
//! through the RAII guards returned by [`Latch::shared`] and [`Latch::exclusive`] (or their `try_`
//! variants), so the borrow rules are enforced by the lock instead of the compiler.
//!
//! Besides the lock itself a latch keeps a version counter, odd while exclusively latched, that
//! makes [`Latch::is_exclusively_latched`] a single atomic load. Neither mode is reentrant.
//!
//! Exclusive guards can be downgraded to shared guards atomically, no other writer can get in
//! between.
//!
//! ```
//! use pagedtree::latch::Latch;
//!
//! let latch = Latch::new(10usize);
//! {
//!     let mut guard = latch.exclusive();
//!     *guard += 1;
//!     let guard = guard.downgrade();
//!     assert_eq!(*guard, 11);
//!     assert!(latch.try_exclusive().is_none());
//! }
//! assert!(latch.try_exclusive().is_some());
//! ```

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A shared/exclusive latch owning the data it protects.
pub struct Latch<T: ?Sized> {
    version: AtomicUsize,
    lock: RwLock<()>,
    data: UnsafeCell<T>
}

unsafe impl<T: ?Sized + Send> Send for Latch<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Latch<T> {}

impl<T> Latch<T> {
    /// Creates a new instance of a `Latch<T>` which is unlocked.
    #[inline]
    pub fn new(data: T) -> Latch<T> {
        Latch {
            version: AtomicUsize::new(0),
            lock: RwLock::new(()),
            data: UnsafeCell::new(data)
        }
    }
}

impl<T: ?Sized> Latch<T> {
    /// Latches with exclusive access, blocking the thread until it can be acquired.
    ///
    /// Returns an RAII guard which will release the exclusive access when dropped
    #[inline]
    pub fn exclusive(&self) -> ExclusiveGuard<'_, T> {
        let guard = self.lock.write();
        self.exclusive_guard(guard)
    }

    /// Attempts to latch with exclusive access.
    ///
    /// This function does not block, if the latch cannot be acquired it returns `None` instead.
    #[inline]
    pub fn try_exclusive(&self) -> Option<ExclusiveGuard<'_, T>> {
        let guard = self.lock.try_write()?;
        Some(self.exclusive_guard(guard))
    }

    #[inline]
    fn exclusive_guard<'a>(&'a self, guard: RwLockWriteGuard<'a, ()>) -> ExclusiveGuard<'a, T> {
        let version = self.version.load(Ordering::Relaxed) + 1;
        self.version.store(version, Ordering::Release);
        ExclusiveGuard {
            latch: self,
            guard: Some(guard),
            version
        }
    }

    /// Latches with shared access, blocking the thread until it can be acquired.
    ///
    /// Returns an RAII guard which will release the shared access when dropped
    #[inline]
    pub fn shared(&self) -> SharedGuard<'_, T> {
        let guard = self.lock.read();
        SharedGuard {
            latch: self,
            _guard: guard
        }
    }

    /// Attempts to latch with shared access.
    ///
    /// This function does not block, if the latch cannot be acquired it returns `None` instead.
    #[inline]
    pub fn try_shared(&self) -> Option<SharedGuard<'_, T>> {
        let guard = self.lock.try_read()?;
        Some(SharedGuard {
            latch: self,
            _guard: guard
        })
    }

    #[inline]
    pub fn is_exclusively_latched(&self) -> bool {
        (self.version.load(Ordering::Acquire) & 1) == 1
    }

    #[inline]
    pub fn version(&self) -> usize {
        self.version.load(Ordering::Acquire)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_shared() {
            Some(guard) => f.debug_struct("Latch").field("data", &&*guard).finish(),
            None => {
                struct LockedPlaceholder;
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<latched>")
                    }
                }

                f.debug_struct("Latch")
                    .field("data", &LockedPlaceholder)
                    .finish()
            }
        }
    }
}

/// RAII structure used to release the exclusive access of a latch when dropped.
pub struct ExclusiveGuard<'a, T: ?Sized> {
    latch: &'a Latch<T>,
    guard: Option<RwLockWriteGuard<'a, ()>>,
    version: usize
}

unsafe impl<'a, T: ?Sized + Sync> Sync for ExclusiveGuard<'a, T> {}

impl<'a, T: ?Sized> ExclusiveGuard<'a, T> {
    /// Turns this guard into a shared one without releasing the latch in between.
    #[inline]
    pub fn downgrade(mut self) -> SharedGuard<'a, T> {
        let latch = self.latch;
        match self.guard.take() {
            Some(guard) => {
                // Drop publishes the new version
                drop(self);
                SharedGuard {
                    latch,
                    _guard: RwLockWriteGuard::downgrade(guard)
                }
            }
            None => unreachable!("exclusive guard without lock")
        }
    }

    /// Returns a reference to the original `Latch` struct
    pub fn latch(&self) -> &'a Latch<T> {
        self.latch
    }
}

impl<'a, T: ?Sized> Drop for ExclusiveGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.latch.version.store(self.version + 1, Ordering::Release);
    }
}

impl<'a, T: ?Sized> std::ops::Deref for ExclusiveGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.latch.data.get() }
    }
}

impl<'a, T: ?Sized> std::ops::DerefMut for ExclusiveGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.latch.data.get() }
    }
}

impl<'a, T: ?Sized + fmt::Debug> fmt::Debug for ExclusiveGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// RAII structure used to release the shared access of a latch when dropped.
pub struct SharedGuard<'a, T: ?Sized> {
    latch: &'a Latch<T>,
    _guard: RwLockReadGuard<'a, ()>
}

unsafe impl<'a, T: ?Sized + Sync> Sync for SharedGuard<'a, T> {}

impl<'a, T: ?Sized> SharedGuard<'a, T> {
    /// Returns a reference to the original `Latch` struct
    pub fn latch(&self) -> &'a Latch<T> {
        self.latch
    }
}

impl<'a, T: ?Sized> std::ops::Deref for SharedGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.latch.data.get() }
    }
}

impl<'a, T: ?Sized + fmt::Debug> fmt::Debug for SharedGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::Latch;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use serial_test::serial;

    #[test]
    fn exclusive_excludes_everyone() {
        let latch = Latch::new(0usize);
        let guard = latch.exclusive();
        assert!(latch.is_exclusively_latched());
        assert!(latch.try_shared().is_none());
        assert!(latch.try_exclusive().is_none());
        drop(guard);
        assert!(!latch.is_exclusively_latched());
        assert!(latch.try_shared().is_some());
    }

    #[test]
    fn shared_guards_coexist() {
        let latch = Latch::new(7u32);
        let a = latch.shared();
        let b = latch.try_shared().expect("second reader");
        assert_eq!(*a + *b, 14);
        assert!(latch.try_exclusive().is_none());
    }

    #[test]
    fn version_is_odd_while_exclusive() {
        let latch = Latch::new(());
        let v0 = latch.version();
        assert_eq!(v0 & 1, 0);
        let guard = latch.exclusive();
        assert_eq!(latch.version() & 1, 1);
        drop(guard);
        assert_eq!(latch.version(), v0 + 2);
    }

    #[test]
    fn downgrade_keeps_writers_out() {
        let latch = Latch::new(vec![1, 2, 3]);
        let mut guard = latch.exclusive();
        guard.push(4);
        let shared = guard.downgrade();
        assert!(!latch.is_exclusively_latched());
        assert!(latch.try_exclusive().is_none());
        assert!(latch.try_shared().is_some());
        assert_eq!(shared.len(), 4);
    }

    #[test]
    fn exclusive_state_is_visible_to_other_threads() {
        let latch = Arc::new(Latch::new(()));
        let guard = latch.exclusive();

        let other = {
            let latch = latch.clone();
            thread::spawn(move || (latch.is_exclusively_latched(), latch.try_shared().is_some()))
        };
        assert_eq!(other.join().unwrap(), (true, false));

        drop(guard);
        assert!(!latch.is_exclusively_latched());
    }

    #[test]
    #[serial]
    fn concurrent_increments_are_not_lost() {
        let latch = Arc::new(Latch::new(0usize));
        let n_threads = 8;
        let per_thread = 10_000;
        let barrier = Arc::new(Barrier::new(n_threads));

        let mut handles = vec![];
        for _ in 0..n_threads {
            let latch = latch.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    if i % 4 == 0 {
                        let guard = latch.shared();
                        assert!(*guard <= n_threads * per_thread);
                    } else {
                        *latch.exclusive() += 1;
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let expected = n_threads * (per_thread - per_thread / 4);
        assert_eq!(*latch.shared(), expected);
    }
}
