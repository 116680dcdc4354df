//! Condition variable.
//!
//! A wait queue and nothing else: no counter, no owner. It is always used
//! together with a caller-supplied [`Mutex`]; waiting releases that mutex
//! and parks in one atomic step (a signal between the caller's predicate
//! check and its sleep cannot be lost), and the mutex is re-acquired
//! before `wait` returns no matter why the thread woke. Signalling wakes
//! in arrival order; a broadcast wakes everyone pending at that instant,
//! and each woken thread re-acquires the mutex on its own, so broadcast
//! implies no ordering among them.

use super::mutex::Mutex;
use super::wait_queue::{QueuePolicy, WaitQueue, WaitResult};
use crate::thread;
use crate::thread::scheduler::kernel;
use crate::{KernelError, Timeout};

/// Condition variable.
pub struct CondVar {
    wait_q: WaitQueue,
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl CondVar {
    /// Creates a new condition variable which is ready to be waited on and
    /// signaled.
    pub const fn new() -> Self {
        Self {
            wait_q: WaitQueue::new(QueuePolicy::Fifo),
        }
    }

    /// Atomically release `mutex` and park until a signal, a broadcast,
    /// the timeout, or teardown; then re-acquire `mutex` before returning.
    ///
    /// The caller must hold `mutex` exactly once; waiting with it held
    /// recursively (or not at all) is a programming defect and panics.
    /// Whatever the outcome, the caller leaves holding the mutex again.
    pub fn wait(&self, mutex: &Mutex, timeout: Timeout) -> Result<(), KernelError> {
        assert!(
            !bedrock::interrupt::in_isr(),
            "condition wait from interrupt context"
        );
        let me = thread::Current::tid();
        let mut inner = mutex.inner.lock();
        assert_eq!(
            inner.owner,
            Some(me),
            "waiting on a condition variable without holding the mutex"
        );
        assert_eq!(
            inner.depth, 1,
            "waiting on a condition variable with the mutex held recursively"
        );

        let mut ks = kernel().lock();
        mutex.release_locked(&mut ks, &mut inner, me);
        let result = self.wait_q.pend_locked(ks, inner, timeout);

        let reacquired = mutex.lock(Timeout::Forever);
        debug_assert!(reacquired.is_ok());
        match result {
            WaitResult::Signaled => Ok(()),
            WaitResult::TimedOut => Err(KernelError::TimedOut),
            WaitResult::Cancelled => Err(KernelError::Cancelled),
        }
    }

    /// Park until `predicate` turns false, re-checking it with the mutex
    /// held after every wake.
    pub fn wait_while(
        &self,
        mutex: &Mutex,
        mut predicate: impl FnMut() -> bool,
    ) -> Result<(), KernelError> {
        while predicate() {
            self.wait(mutex, Timeout::Forever)?;
        }
        Ok(())
    }

    /// Wake at most one waiter, in arrival order. Returns whether one was
    /// woken. Never blocks; safe from interrupt handlers.
    pub fn signal(&self) -> bool {
        self.wait_q.unpend_first().is_some()
    }

    /// Wake every waiter pending at the time of the call; returns how
    /// many. Threads that start waiting afterwards are not affected.
    /// Never blocks; safe from interrupt handlers.
    pub fn broadcast(&self) -> usize {
        self.wait_q.unpend_all()
    }
}
