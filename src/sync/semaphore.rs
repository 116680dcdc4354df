//! Counting semaphore.
//!
//! A bounded counter plus a wait queue. `take` consumes a unit or parks;
//! `give` hands a unit to the head waiter directly, or banks it in the
//! counter when nobody waits. The hand-off is deliberate: while a waiter
//! exists the counter is never touched, the woken thread returns from
//! `take` already owning the unit, and a `take` arriving between the
//! `give` and the wake cannot steal it. Two `give`s racing a single
//! waiter deliver exactly one unit to it and bank the other.
//!
//! `give` and `reset` never block and may be called from interrupt
//! handlers.

use super::spinlock::SpinLock;
use super::wait_queue::{QueuePolicy, WaitQueue, WaitResult};
use crate::thread::scheduler::{self, kernel};
use crate::{KernelError, Timeout};

struct SemInner {
    count: u32,
    limit: u32,
}

/// Counting semaphore.
pub struct Semaphore {
    inner: SpinLock<SemInner>,
    wait_q: WaitQueue,
}

impl Semaphore {
    /// Creates a semaphore with `initial` units, capped at `limit`, waking
    /// waiters in arrival order.
    pub const fn new(initial: u32, limit: u32) -> Self {
        assert!(initial <= limit, "initial count above the limit");
        Self {
            inner: SpinLock::new(SemInner {
                count: initial,
                limit,
            }),
            wait_q: WaitQueue::new(QueuePolicy::Fifo),
        }
    }

    /// Creates a semaphore that wakes the most urgent waiter first instead
    /// of the longest-waiting one.
    pub const fn new_ordered(initial: u32, limit: u32) -> Self {
        assert!(initial <= limit, "initial count above the limit");
        Self {
            inner: SpinLock::new(SemInner {
                count: initial,
                limit,
            }),
            wait_q: WaitQueue::new(QueuePolicy::Priority),
        }
    }

    /// Take a unit.
    ///
    /// Consumes a banked unit immediately when one is available. Otherwise
    /// [`Timeout::NoWait`] fails with [`KernelError::WouldBlock`], and any
    /// other timeout parks the caller until a `give` hands it a unit
    /// ([`Ok`]), the deadline passes ([`KernelError::TimedOut`]), or the
    /// thread is torn down ([`KernelError::Cancelled`]).
    pub fn take(&self, timeout: Timeout) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            inner.unlock();
            return Ok(());
        }
        if let Timeout::NoWait = timeout {
            inner.unlock();
            return Err(KernelError::WouldBlock);
        }
        match self.wait_q.pend(inner, timeout) {
            WaitResult::Signaled => Ok(()),
            WaitResult::TimedOut => Err(KernelError::TimedOut),
            WaitResult::Cancelled => Err(KernelError::Cancelled),
        }
    }

    /// Give a unit: wake exactly one waiter with it, or bank it,
    /// saturating at the limit.
    pub fn give(&self) {
        let mut inner = self.inner.lock();
        let mut ks = kernel().lock();
        let woken = self.wait_q.wake_one_locked(&mut ks, WaitResult::Signaled);
        if woken.is_none() && inner.count < inner.limit {
            inner.count += 1;
        }
        ks.unlock();
        inner.unlock();
        scheduler::preempt_point();
    }

    /// Zero the counter without waking anyone.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.count = 0;
        inner.unlock();
    }

    /// Currently banked units.
    pub fn count(&self) -> u32 {
        let inner = self.inner.lock();
        let count = inner.count;
        inner.unlock();
        count
    }
}
