//! Page latches and the index tree lock.
//!
//! A [`HybridLatch`] protects one buffer frame. Besides the usual shared and exclusive modes it
//! keeps a version counter that is bumped when exclusive access is acquired and again when it is
//! released, so the counter is odd exactly while a writer holds the latch. Every exclusive
//! acquisition therefore advances the version, which makes it usable as the page *modify clock*:
//! a reader that remembers the version observed under a shared latch can later tell whether the
//! page could have been changed in between, without holding anything in the meantime.
//!
//! Resuming from a remembered version goes through [`HybridLatch::optimistic_at`], which yields an
//! [`OptimisticGuard`] that only grants access after validation:
//! ```
//! use treescan::latch::HybridLatch;
//!
//! let latch = HybridLatch::new(10usize);
//! let clock = latch.shared().version();
//!
//! // Nothing changed, the optimistic guard upgrades.
//! assert!(latch.optimistic_at(clock).to_shared().is_ok());
//!
//! *latch.exclusive() = 11;
//!
//! // A writer came through, validation fails with `Error::Unwind`.
//! assert!(latch.optimistic_at(clock).to_shared().is_err());
//! ```
//!
//! The [`TreeLock`] is the index-wide reader/writer lock. Shared acquisition is recursive so that
//! a thread already inside a shared section never queues behind a waiting writer, and the raw
//! shared entry points may be released by a different thread than the one that acquired them.

use parking_lot::lock_api::{RawRwLock as _, RawRwLockRecursive as _, RawRwLockTimed as _};
use parking_lot::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error;

/// A latch that uses versioning to enable optimistic, shared or exclusive access to the
/// underlying data
pub struct HybridLatch<T: ?Sized> {
    version: AtomicUsize,
    lock: RwLock<()>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for HybridLatch<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for HybridLatch<T> {}

impl<T> HybridLatch<T> {
    /// Creates a new instance of a `HybridLatch<T>` which is unlocked.
    #[inline]
    pub fn new(data: T) -> HybridLatch<T> {
        HybridLatch {
            version: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
            lock: RwLock::new(()),
        }
    }
}

impl<T: ?Sized> HybridLatch<T> {
    /// Locks this `HybridLatch` with exclusive write access, blocking the thread until it can be
    /// acquired.
    ///
    /// Returns an RAII guard which will release the exclusive access when dropped
    #[inline]
    pub fn exclusive(&self) -> ExclusiveGuard<'_, T> {
        let guard = self.lock.write();
        self.exclusive_from(guard)
    }

    /// Attempts to acquire this `HybridLatch` with exclusive write access.
    ///
    /// This function does not block, if the lock cannot be acquired it returns `None` instead.
    #[inline]
    pub fn try_exclusive(&self) -> Option<ExclusiveGuard<'_, T>> {
        let guard = self.lock.try_write()?;
        Some(self.exclusive_from(guard))
    }

    #[inline]
    fn exclusive_from<'a>(&'a self, guard: RwLockWriteGuard<'a, ()>) -> ExclusiveGuard<'a, T> {
        let version = self.version.load(Ordering::Relaxed) + 1;
        self.version.store(version, Ordering::Release);
        ExclusiveGuard {
            latch: self,
            _guard: guard,
            data: self.data.get(),
            version,
        }
    }

    /// Locks this `HybridLatch` with shared read access, blocking the thread until it can be
    /// acquired.
    #[inline]
    pub fn shared(&self) -> SharedGuard<'_, T> {
        let guard = self.lock.read();
        self.shared_from(guard)
    }

    /// Attempts to acquire this `HybridLatch` with shared read access.
    ///
    /// This function does not block, if the lock cannot be acquired it returns `None` instead.
    #[inline]
    pub fn try_shared(&self) -> Option<SharedGuard<'_, T>> {
        let guard = self.lock.try_read()?;
        Some(self.shared_from(guard))
    }

    #[inline]
    fn shared_from<'a>(&'a self, guard: RwLockReadGuard<'a, ()>) -> SharedGuard<'a, T> {
        let version = self.version.load(Ordering::Relaxed);
        SharedGuard {
            latch: self,
            _guard: guard,
            data: self.data.get(),
            version,
        }
    }

    /// Resumes optimistic access at a previously observed version.
    ///
    /// No memory is touched until the returned guard is validated, so any version can be passed,
    /// including one observed a long time ago by another thread.
    #[inline]
    pub fn optimistic_at(&self, version: usize) -> OptimisticGuard<'_, T> {
        OptimisticGuard {
            latch: self,
            version,
        }
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

impl<T: ?Sized> std::convert::AsMut<T> for HybridLatch<T> {
    #[inline]
    fn as_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for HybridLatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_shared() {
            Some(guard) => f.debug_struct("HybridLatch").field("data", &&*guard).finish(),
            None => f
                .debug_struct("HybridLatch")
                .field("version", &self.version())
                .finish_non_exhaustive(),
        }
    }
}

/// A remembered version of a latch, validated before any access is granted.
pub struct OptimisticGuard<'a, T: ?Sized> {
    latch: &'a HybridLatch<T>,
    version: usize,
}

impl<'a, T: ?Sized> OptimisticGuard<'a, T> {
    /// Checks that no writer went through the latch since the guard's version was observed.
    ///
    /// If validation fails it returns [`error::Error::Unwind`].
    #[inline]
    pub fn recheck(&self) -> error::Result<()> {
        if (self.version & 1) == 1 || self.version != self.latch.version.load(Ordering::Acquire) {
            return Err(error::Error::Unwind);
        }
        Ok(())
    }

    /// Acquires exclusive access if the version is still current, blocking on the latch.
    ///
    /// If validation fails it returns [`error::Error::Unwind`].
    #[inline]
    pub fn to_exclusive(self) -> error::Result<ExclusiveGuard<'a, T>> {
        let locked = self.latch.lock.write();
        self.validated_exclusive(locked)
    }

    /// Attempts to acquire exclusive access, failing if already latched or if the version moved.
    ///
    /// If validation fails it returns [`error::Error::Unwind`].
    #[inline]
    pub fn try_to_exclusive(self) -> error::Result<ExclusiveGuard<'a, T>> {
        match self.latch.lock.try_write() {
            Some(locked) => self.validated_exclusive(locked),
            None => Err(error::Error::Unwind),
        }
    }

    #[inline]
    fn validated_exclusive(
        self,
        locked: RwLockWriteGuard<'a, ()>,
    ) -> error::Result<ExclusiveGuard<'a, T>> {
        let new_version = self.version + 1;
        if self
            .latch
            .version
            .compare_exchange(self.version, new_version, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            drop(locked);
            return Err(error::Error::Unwind);
        }

        Ok(ExclusiveGuard {
            latch: self.latch,
            _guard: locked,
            data: self.latch.data.get(),
            version: new_version,
        })
    }

    /// Acquires shared access if the version is still current, blocking on the latch.
    ///
    /// If validation fails it returns [`error::Error::Unwind`].
    #[inline]
    pub fn to_shared(self) -> error::Result<SharedGuard<'a, T>> {
        let guard = self.latch.lock.read();
        if self.version != self.latch.version.load(Ordering::Relaxed) {
            return Err(error::Error::Unwind);
        }

        Ok(SharedGuard {
            latch: self.latch,
            _guard: guard,
            data: self.latch.data.get(),
            version: self.version,
        })
    }

    #[inline]
    pub fn version(&self) -> usize {
        self.version
    }

    /// Returns a reference to the original `HybridLatch` struct
    pub fn latch(&self) -> &'a HybridLatch<T> {
        self.latch
    }
}

/// RAII structure used to release the exclusive write access of a latch when dropped.
pub struct ExclusiveGuard<'a, T: ?Sized> {
    latch: &'a HybridLatch<T>,
    _guard: RwLockWriteGuard<'a, ()>,
    data: *mut T,
    version: usize,
}

unsafe impl<'a, T: ?Sized + Sync> Sync for ExclusiveGuard<'a, T> {}

impl<'a, T: ?Sized> ExclusiveGuard<'a, T> {
    /// The version the latch will carry once this guard is released.
    #[inline]
    pub fn version_after_release(&self) -> usize {
        self.version + 1
    }

    /// Returns a reference to the original `HybridLatch` struct
    pub fn latch(&self) -> &'a HybridLatch<T> {
        self.latch
    }
}

impl<'a, T: ?Sized> Drop for ExclusiveGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        let new_version = self.version + 1;
        self.latch.version.store(new_version, Ordering::Release);
    }
}

impl<'a, T: ?Sized> std::ops::Deref for ExclusiveGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.data }
    }
}

impl<'a, T: ?Sized> std::ops::DerefMut for ExclusiveGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data }
    }
}

impl<'a, T: ?Sized + fmt::Debug> fmt::Debug for ExclusiveGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// RAII structure used to release the shared read access of a latch when dropped.
pub struct SharedGuard<'a, T: ?Sized> {
    latch: &'a HybridLatch<T>,
    _guard: RwLockReadGuard<'a, ()>,
    data: *const T,
    version: usize,
}

unsafe impl<'a, T: ?Sized + Sync> Sync for SharedGuard<'a, T> {}

impl<'a, T: ?Sized> SharedGuard<'a, T> {
    /// The version observed when the shared access was granted. It cannot move while the guard
    /// is alive.
    #[inline]
    pub fn version(&self) -> usize {
        self.version
    }

    /// Returns a reference to the original `HybridLatch` struct
    pub fn latch(&self) -> &'a HybridLatch<T> {
        self.latch
    }
}

impl<'a, T: ?Sized> std::ops::Deref for SharedGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.data }
    }
}

impl<'a, T: ?Sized + fmt::Debug> fmt::Debug for SharedGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Reader/writer lock over a whole index.
pub struct TreeLock {
    raw: RawRwLock,
    waiters: AtomicUsize,
}

impl Default for TreeLock {
    fn default() -> Self {
        TreeLock::new()
    }
}

impl TreeLock {
    pub fn new() -> TreeLock {
        TreeLock {
            raw: RawRwLock::INIT,
            waiters: AtomicUsize::new(0),
        }
    }

    /// Acquires the lock in shared mode, returning a guard releasing it on drop.
    #[inline]
    pub fn shared(&self) -> TreeSharedGuard<'_> {
        self.lock_shared_raw();
        TreeSharedGuard { lock: self }
    }

    /// Acquires the lock in exclusive mode, returning a guard releasing it on drop.
    #[inline]
    pub fn exclusive(&self) -> TreeExclusiveGuard<'_> {
        if !self.raw.try_lock_exclusive() {
            self.waiters.fetch_add(1, Ordering::AcqRel);
            self.raw.lock_exclusive();
            self.waiters.fetch_sub(1, Ordering::AcqRel);
        }
        TreeExclusiveGuard { lock: self }
    }

    /// Like [`TreeLock::exclusive`] but gives up after `timeout`.
    pub fn try_exclusive_for(&self, timeout: Duration) -> Option<TreeExclusiveGuard<'_>> {
        if !self.raw.try_lock_exclusive() {
            self.waiters.fetch_add(1, Ordering::AcqRel);
            let locked = self.raw.try_lock_exclusive_for(timeout);
            self.waiters.fetch_sub(1, Ordering::AcqRel);
            if !locked {
                return None;
            }
        }
        Some(TreeExclusiveGuard { lock: self })
    }

    /// Acquires a shared lock that is not tied to a guard. Must be paired with
    /// [`TreeLock::unlock_shared_raw`], possibly from another thread.
    #[inline]
    pub fn lock_shared_raw(&self) {
        if !self.raw.try_lock_shared_recursive() {
            self.waiters.fetch_add(1, Ordering::AcqRel);
            self.raw.lock_shared_recursive();
            self.waiters.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Releases a shared lock taken with [`TreeLock::lock_shared_raw`].
    ///
    /// # Safety
    /// The caller must own one shared acquisition of this lock.
    #[inline]
    pub unsafe fn unlock_shared_raw(&self) {
        self.raw.unlock_shared();
    }

    /// Whether some thread is currently blocked waiting for this lock.
    #[inline]
    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::Acquire) > 0
    }
}

impl fmt::Debug for TreeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeLock")
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}

pub struct TreeSharedGuard<'a> {
    lock: &'a TreeLock,
}

impl<'a> Drop for TreeSharedGuard<'a> {
    fn drop(&mut self) {
        unsafe { self.lock.raw.unlock_shared() }
    }
}

pub struct TreeExclusiveGuard<'a> {
    lock: &'a TreeLock,
}

impl<'a> Drop for TreeExclusiveGuard<'a> {
    fn drop(&mut self) {
        unsafe { self.lock.raw.unlock_exclusive() }
    }
}
