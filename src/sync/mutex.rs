//! Mutex with recursion and priority inheritance.
//!
//! A sleeping lock: an owner reference, a recursive depth, and a
//! priority-ordered wait queue. While the lock is contended the owner runs
//! at least as urgently as its most urgent waiter, so a low-priority
//! holder cannot stall a high-priority one behind some middle-priority
//! thread; the donation is recomputed whenever the waiter set changes and
//! withdrawn when the lock is released.
//!
//! Release with waiters present transfers ownership directly to the head
//! waiter. The woken thread returns from `lock` already owning the lock;
//! there is no window in which a third thread can barge in and re-race it.
//!
//! Unlike the spinlock this is a plain lock, not a data container: the
//! recursive and hand-off semantics do not fit a scoped guard, and
//! `unlock` by a non-owner must be reportable rather than unrepresentable.

use super::spinlock::SpinLock;
use super::wait_queue::{self, QueuePolicy, WaitQueue, WaitResult};
use crate::thread::scheduler::{self, KernelState, kernel};
use crate::thread;
use crate::{KernelError, Timeout};

pub(crate) struct MutexInner {
    pub(crate) owner: Option<u64>,
    pub(crate) depth: u32,
}

/// Recursive, priority-inheriting mutex.
pub struct Mutex {
    pub(crate) inner: SpinLock<MutexInner>,
    pub(crate) wait_q: WaitQueue,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// Creates a new mutex in an unlocked state ready for use.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(MutexInner {
                owner: None,
                depth: 0,
            }),
            wait_q: WaitQueue::new(QueuePolicy::Priority),
        }
    }

    /// Acquire the lock, waiting up to `timeout`.
    ///
    /// Succeeds immediately when the lock is free or already held by the
    /// caller (each nested success needs its own [`unlock`]); with
    /// [`Timeout::NoWait`] a held lock fails with
    /// [`KernelError::WouldBlock`]. Otherwise the caller parks on the
    /// priority-ordered wait queue, donating its priority to the holder,
    /// until ownership is handed to it, the deadline passes, or the thread
    /// is torn down.
    ///
    /// Panics from interrupt context; a handler can never own a sleeping
    /// lock.
    ///
    /// [`unlock`]: Self::unlock
    pub fn lock(&self, timeout: Timeout) -> Result<(), KernelError> {
        assert!(
            !bedrock::interrupt::in_isr(),
            "mutex from interrupt context"
        );
        let me = thread::Current::tid();
        let mut inner = self.inner.lock();
        match inner.owner {
            None => {
                inner.owner = Some(me);
                inner.depth = 1;
                inner.unlock();
                Ok(())
            }
            Some(owner) if owner == me => {
                inner.depth += 1;
                inner.unlock();
                Ok(())
            }
            Some(owner) => {
                if let Timeout::NoWait = timeout {
                    inner.unlock();
                    return Err(KernelError::WouldBlock);
                }
                let mut ks = kernel().lock();
                // Record the donation target and raise it before parking,
                // atomically with the enqueue.
                wait_queue::set_pi_owner_locked(&mut ks, &self.wait_q, Some(owner));
                let my_prio = ks
                    .threads
                    .get(&me)
                    .expect("current record")
                    .eff_prio();
                scheduler::inherit_priority_locked(&mut ks, owner, my_prio);
                match self.wait_q.pend_locked(ks, inner, timeout) {
                    WaitResult::Signaled => Ok(()),
                    WaitResult::TimedOut => Err(KernelError::TimedOut),
                    WaitResult::Cancelled => Err(KernelError::Cancelled),
                }
            }
        }
    }

    /// Release one level of the lock.
    ///
    /// At depth zero the caller's donated priority is withdrawn and, if
    /// threads are waiting, ownership transfers directly to the most
    /// urgent one. Releasing a lock the caller does not hold fails with
    /// [`KernelError::NotOwner`].
    pub fn unlock(&self) -> Result<(), KernelError> {
        let Some(me) = thread::current_tid() else {
            return Err(KernelError::NotOwner);
        };
        let mut inner = self.inner.lock();
        if inner.owner != Some(me) {
            inner.unlock();
            return Err(KernelError::NotOwner);
        }
        inner.depth -= 1;
        if inner.depth > 0 {
            inner.unlock();
            return Ok(());
        }
        let mut ks = kernel().lock();
        self.release_locked(&mut ks, &mut inner, me);
        ks.unlock();
        inner.unlock();
        scheduler::preempt_point();
        Ok(())
    }

    /// The thread currently holding the lock, if any.
    pub fn holder(&self) -> Option<u64> {
        let inner = self.inner.lock();
        let owner = inner.owner;
        inner.unlock();
        owner
    }

    /// Hand the lock to the head waiter or free it; withdraws the
    /// caller's donation. Shared by [`unlock`](Self::unlock) and the
    /// condition-variable wait path, which must release atomically with
    /// its own enqueue.
    pub(crate) fn release_locked(
        &self,
        ks: &mut KernelState,
        inner: &mut MutexInner,
        me: u64,
    ) {
        scheduler::set_inherited_locked(ks, me, None);
        let qid = self.wait_q.id();
        match self.wait_q.wake_one_locked(ks, WaitResult::Signaled) {
            Some(next) => {
                inner.owner = Some(next);
                inner.depth = 1;
                if let Some(list) = ks.waits.get_mut(&qid) {
                    list.pi_owner = Some(next);
                }
                // The new owner inherits from whoever is still queued.
                wait_queue::refresh_donation_locked(ks, qid, next);
            }
            None => {
                inner.owner = None;
                inner.depth = 0;
                if let Some(list) = ks.waits.get_mut(&qid) {
                    list.pi_owner = None;
                }
            }
        }
    }
}
