//! SMP-supported spinlock.
//!
//! On a single core, mutual exclusion only requires that the lock holder is
//! not preempted, which masking interrupts guarantees. On multiple cores
//! that is not sufficient: another core can enter the critical section even
//! while this one runs with interrupts masked. The lock therefore pairs the
//! local interrupt mask with an atomic flag that is set and tested with the
//! CPU's read-modify-write primitives; acquisition masks interrupts first,
//! then spins on the flag with exponential backoff.

use crate::interrupt::InterruptGuard;
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::{Backoff, CachePadded};

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data.
///
/// Each spinlock has a type parameter which represents the data that it is
/// protecting. The data can only be accessed through the guards returned
/// from [`lock`] and [`try_lock`], which guarantees that the data is only
/// ever accessed when the spinlock is held. Acquiring the lock also masks
/// interrupts on the local core, so a critical section can never be torn by
/// an interrupt handler taking the same lock.
///
/// The guard does **not** release the lock on drop; it must be released
/// explicitly with [`SpinLockGuard::unlock`], and dropping a live guard
/// panics. This keeps every unlock site visible in the source.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T: ?Sized> {
    locked: CachePadded<AtomicBool>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: CachePadded::new(AtomicBool::new(false)),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the spinlock, spinning until it is able to do so.
    ///
    /// Upon returning, the calling context is the only one with the lock
    /// held, and interrupts are masked on the local core until the returned
    /// guard is released with [`SpinLockGuard::unlock`].
    ///
    /// The behavior of re-locking a spinlock the caller already holds is a
    /// deadlock; the lock is not reentrant.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        let guard = loop {
            let guard = InterruptGuard::new();
            if !self.locked.fetch_or(true, Ordering::SeqCst) {
                break guard;
            }
            drop(guard);
            backoff.snooze();
        };

        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
            guard: Some(guard),
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock without spinning.
    ///
    /// # Errors
    /// Returns [`WouldBlock`] if the lock is already held elsewhere.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let guard = InterruptGuard::new();
        if !self.locked.fetch_or(true, Ordering::SeqCst) {
            Ok(SpinLockGuard {
                caller: core::panic::Location::caller(),
                lock: self,
                guard: Some(guard),
                _not_send: PhantomData,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a spinlock.
///
/// The lock must be explicitly released by the [`unlock`] method; dropping
/// the guard without it panics, naming the acquisition site.
///
/// The data protected by the spinlock can be accessed through this guard.
///
/// This structure is created by the [`lock`] and [`try_lock`] methods on
/// [`SpinLock`].
///
/// [`lock`]: SpinLock::lock
/// [`try_lock`]: SpinLock::try_lock
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
    guard: Option<InterruptGuard>,
    _not_send: PhantomData<*mut ()>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`], restoring the interrupt state
    /// saved when the lock was taken.
    pub fn unlock(mut self) {
        self.lock.locked.store(false, Ordering::SeqCst);
        self.guard.take();
        core::mem::forget(self);
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        panic!(
            "`.unlock()` must be explicitly called before dropping SpinLockGuard.
The lock is held at {:?}.",
            self.caller
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_roundtrip() {
        let _serial = crate::test_util::SERIAL.lock().unwrap();
        let lock = SpinLock::new(7usize);
        let mut guard = lock.lock();
        *guard += 1;
        guard.unlock();
        let guard = lock.lock();
        assert_eq!(*guard, 8);
        guard.unlock();
    }

    #[test]
    fn try_lock_contended() {
        let _serial = crate::test_util::SERIAL.lock().unwrap();
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_err());
        guard.unlock();
        let g = lock.try_lock().ok().unwrap();
        g.unlock();
    }
}
