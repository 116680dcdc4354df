//! Bounded message channel.
//!
//! A fixed-capacity queue of messages with a wait queue on each side:
//! senders park while the channel is full, receivers while it is empty.
//! Both directions take a timeout measured against the absolute deadline,
//! so a sender that loses a race for freed space after a wake does not
//! restart its wait from scratch. A failed send hands the message back to
//! the caller instead of dropping it.

use super::spinlock::SpinLock;
use super::wait_queue::{QueuePolicy, WaitQueue, WaitResult};
use crate::thread::scheduler::{self, kernel};
use crate::{KernelError, Timeout, timeout};
use alloc::collections::vec_deque::VecDeque;

struct ChanInner<T> {
    queue: VecDeque<T>,
    capacity: usize,
}

/// Bounded multi-producer multi-consumer channel.
pub struct Channel<T> {
    inner: SpinLock<ChanInner<T>>,
    senders: WaitQueue,
    receivers: WaitQueue,
}

impl<T> Channel<T> {
    /// Creates a channel holding at most `capacity` messages.
    pub const fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "zero-capacity channel");
        Self {
            inner: SpinLock::new(ChanInner {
                queue: VecDeque::new(),
                capacity,
            }),
            senders: WaitQueue::new(QueuePolicy::Fifo),
            receivers: WaitQueue::new(QueuePolicy::Fifo),
        }
    }

    /// Queue `item`, waiting up to `timeout` for space.
    ///
    /// On failure the message comes back with the reason:
    /// [`KernelError::WouldBlock`] for a full channel with
    /// [`Timeout::NoWait`], [`KernelError::TimedOut`], or
    /// [`KernelError::Cancelled`].
    pub fn send(&self, item: T, timeout: Timeout) -> Result<(), (T, KernelError)> {
        let deadline = match timeout {
            Timeout::Ticks(ticks) => Some(timeout::uptime_ticks().saturating_add(ticks)),
            _ => None,
        };
        loop {
            let mut inner = self.inner.lock();
            if inner.queue.len() < inner.capacity {
                inner.queue.push_back(item);
                let mut ks = kernel().lock();
                self.receivers
                    .wake_one_locked(&mut ks, WaitResult::Signaled);
                ks.unlock();
                inner.unlock();
                scheduler::preempt_point();
                return Ok(());
            }
            let wait = match remaining(timeout, deadline) {
                Some(wait) => wait,
                None => {
                    inner.unlock();
                    return Err((item, KernelError::TimedOut));
                }
            };
            if let Timeout::NoWait = wait {
                inner.unlock();
                return Err((item, KernelError::WouldBlock));
            }
            match self.senders.pend(inner, wait) {
                WaitResult::Signaled => continue,
                WaitResult::TimedOut => return Err((item, KernelError::TimedOut)),
                WaitResult::Cancelled => return Err((item, KernelError::Cancelled)),
            }
        }
    }

    /// Take the oldest message, waiting up to `timeout` for one.
    pub fn recv(&self, timeout: Timeout) -> Result<T, KernelError> {
        let deadline = match timeout {
            Timeout::Ticks(ticks) => Some(timeout::uptime_ticks().saturating_add(ticks)),
            _ => None,
        };
        loop {
            let mut inner = self.inner.lock();
            if let Some(item) = inner.queue.pop_front() {
                let mut ks = kernel().lock();
                self.senders.wake_one_locked(&mut ks, WaitResult::Signaled);
                ks.unlock();
                inner.unlock();
                scheduler::preempt_point();
                return Ok(item);
            }
            let wait = match remaining(timeout, deadline) {
                Some(wait) => wait,
                None => {
                    inner.unlock();
                    return Err(KernelError::TimedOut);
                }
            };
            if let Timeout::NoWait = wait {
                inner.unlock();
                return Err(KernelError::WouldBlock);
            }
            match self.receivers.pend(inner, wait) {
                WaitResult::Signaled => continue,
                WaitResult::TimedOut => return Err(KernelError::TimedOut),
                WaitResult::Cancelled => return Err(KernelError::Cancelled),
            }
        }
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        let len = inner.queue.len();
        inner.unlock();
        len
    }

    /// Whether no message is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued messages.
    pub fn capacity(&self) -> usize {
        let inner = self.inner.lock();
        let capacity = inner.capacity;
        inner.unlock();
        capacity
    }
}

/// Time still available under `timeout`, `None` once the deadline passed.
fn remaining(timeout: Timeout, deadline: Option<u64>) -> Option<Timeout> {
    match timeout {
        Timeout::Ticks(_) => {
            let deadline = deadline.expect("deadline computed at entry");
            let now = timeout::uptime_ticks();
            if deadline <= now {
                None
            } else {
                Some(Timeout::Ticks(deadline - now))
            }
        }
        other => Some(other),
    }
}
