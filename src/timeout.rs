//! Pending deadlines.
//!
//! One deadline-ordered list carries every timed wait in the system:
//! thread sleeps, timed pends, and standalone timers. [`announce`] is the
//! single entry point through which elapsed ticks reach the kernel; it
//! advances the tick count, expires due nodes, accounts the running
//! thread's time slice, and reprograms the hardware compare for the next
//! interesting moment (which is how the system stays tickless: no deadline
//! pending, no timer interrupt).

use crate::sync::wait_queue::{self, WaitResult};
use crate::thread::ThreadState;
use crate::thread::scheduler::{self, KernelState, kernel};
use alloc::collections::btree_map::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

/// Key of a pending timeout: deadline in ticks, then insertion sequence so
/// equal deadlines expire in registration order.
pub(crate) type TimeoutKey = (u64, u64);

/// The party a timeout node wakes.
pub(crate) enum TimeoutOwner {
    /// A thread in a timed wait; expiry readies it with
    /// [`WaitResult::TimedOut`].
    Thread(u64),
    /// A standalone timer, by timer id; expiry fires it.
    Timer(u64),
}

/// Deadline-ordered pending timeouts plus the kernel's tick counter.
pub(crate) struct TimeoutList {
    nodes: BTreeMap<TimeoutKey, TimeoutOwner>,
    next_seq: u64,
    ticks: u64,
}

impl TimeoutList {
    pub(crate) const fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            next_seq: 0,
            ticks: 0,
        }
    }

    /// Ticks announced since boot.
    pub(crate) fn now(&self) -> u64 {
        self.ticks
    }

    pub(crate) fn insert(&mut self, deadline: u64, owner: TimeoutOwner) -> TimeoutKey {
        let key = (deadline, self.next_seq);
        self.next_seq += 1;
        self.nodes.insert(key, owner);
        key
    }

    pub(crate) fn remove(&mut self, key: TimeoutKey) -> Option<TimeoutOwner> {
        self.nodes.remove(&key)
    }

    pub(crate) fn first_deadline(&self) -> Option<u64> {
        self.nodes.keys().next().map(|&(deadline, _)| deadline)
    }
}

/// Lock-free mirror of the announced tick count, for uptime queries.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks announced since boot.
pub fn uptime_ticks() -> u64 {
    TICKS.load(Ordering::SeqCst)
}

/// Register a wake-up for the calling thread `ticks` from now. The caller
/// has already moved the thread out of RUNNING.
pub(crate) fn add_thread_timeout_locked(ks: &mut KernelState, tid: u64, ticks: u64) {
    let deadline = ks.timeouts.now().saturating_add(ticks.max(1));
    let key = ks.timeouts.insert(deadline, TimeoutOwner::Thread(tid));
    ks.threads
        .get_mut(&tid)
        .expect("timeout for unknown thread")
        .timed_wait = Some(key);
}

/// Cancel the calling thread's pending wake-up, if any. Exactly one of the
/// wake path and the expiry path gets the node; both run under the
/// scheduler lock.
pub(crate) fn cancel_thread_timeout_locked(ks: &mut KernelState, tid: u64) {
    let Some(record) = ks.threads.get_mut(&tid) else {
        return;
    };
    if let Some(key) = record.timed_wait.take() {
        ks.timeouts.remove(key);
    }
}

/// Arm a timer node and return its key.
pub(crate) fn add_timer_timeout_locked(
    ks: &mut KernelState,
    timer_id: u64,
    ticks: u64,
) -> TimeoutKey {
    let deadline = ks.timeouts.now().saturating_add(ticks.max(1));
    ks.timeouts.insert(deadline, TimeoutOwner::Timer(timer_id))
}

/// Ticks from now until the next pending deadline; `None` when the list is
/// empty and the core may sleep indefinitely.
pub(crate) fn ticks_until_next_locked(ks: &KernelState) -> Option<u64> {
    ks.timeouts
        .first_deadline()
        .map(|deadline| deadline.saturating_sub(ks.timeouts.now()))
}

/// Reprogram the hardware compare for the earliest pending deadline or
/// slice boundary, or disarm it when nothing is pending.
pub(crate) fn program_next_locked(ks: &mut KernelState) {
    let next = ks.timeouts.first_deadline();
    let slice = scheduler::slice_deadline_locked(ks);
    let deadline = match (next, slice) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    match deadline {
        Some(deadline) => {
            let ticks = deadline.saturating_sub(ks.timeouts.now());
            crate::clock::set_timeout(ticks);
        }
        None => crate::clock::clear_timeout(),
    }
}

/// Announce `delta` elapsed ticks to the kernel.
///
/// This is the tick boundary entry point: the clock adapter calls it from
/// the compare-match interrupt with however many whole ticks passed (a
/// tick-full driver announces one at a time), due timeouts fire, the
/// running thread's slice is charged, and the next deadline is programmed.
/// Announcing zero ticks only reprograms.
pub fn announce(delta: u64) {
    let mut fired_timers: Vec<(u64, TimeoutKey)> = Vec::new();
    let mut ks = kernel().lock();
    ks.timeouts.ticks = ks.timeouts.ticks.saturating_add(delta);
    TICKS.store(ks.timeouts.ticks, Ordering::SeqCst);
    scheduler::slice_tick_locked(&mut ks, delta);

    let now = ks.timeouts.now();
    loop {
        let Some((&key, _)) = ks.timeouts.nodes.first_key_value() else {
            break;
        };
        if key.0 > now {
            break;
        }
        let owner = ks.timeouts.nodes.remove(&key).expect("expired node vanished");
        match owner {
            TimeoutOwner::Thread(tid) => expire_thread_locked(&mut ks, tid, key),
            TimeoutOwner::Timer(timer_id) => fired_timers.push((timer_id, key)),
        }
    }
    program_next_locked(&mut ks);
    ks.unlock();

    // Timer expiry leaves the scheduler lock first: firing a timer feeds
    // its semaphore, which takes the primitive's own lock.
    for (timer_id, key) in fired_timers {
        crate::timer::expire(timer_id, key);
    }
    scheduler::preempt_point();
}

fn expire_thread_locked(ks: &mut KernelState, tid: u64, key: TimeoutKey) {
    let Some(record) = ks.threads.get(&tid) else {
        return;
    };
    // A wake that won the race already took the node back; expire only a
    // wait still carrying this exact key.
    if record.timed_wait != Some(key) || record.state != ThreadState::Waiting {
        return;
    }
    wait_queue::cancel_wait_locked(ks, tid, WaitResult::TimedOut);
    scheduler::make_ready_locked(ks, tid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodes_expire_in_deadline_then_insertion_order() {
        let mut list = TimeoutList::new();
        let a = list.insert(10, TimeoutOwner::Thread(1));
        let b = list.insert(5, TimeoutOwner::Thread(2));
        let c = list.insert(10, TimeoutOwner::Thread(3));
        assert_eq!(list.first_deadline(), Some(5));
        assert!(list.remove(b).is_some());
        assert_eq!(list.first_deadline(), Some(10));
        assert!(a < c, "equal deadlines keep insertion order");
    }

    #[test]
    fn cancelled_nodes_are_gone() {
        let mut list = TimeoutList::new();
        let key = list.insert(3, TimeoutOwner::Timer(7));
        assert!(list.remove(key).is_some());
        assert!(list.remove(key).is_none());
        assert_eq!(list.first_deadline(), None);
    }
}
