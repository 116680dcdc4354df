//! Wait queues: ordered parking of blocked threads.
//!
//! Every blocking primitive in the kernel is a small amount of bookkeeping
//! plus one of these. A wait queue orders its waiters FIFO or by effective
//! priority, and pairs each timed wait with a node on the timeout list so
//! that whichever event fires first (a wake, the deadline, or teardown of
//! the thread) atomically cancels the other paths. A thread is a member of
//! at most one wait queue at a time.
//!
//! The waiter lists themselves live centrally in the scheduler's state,
//! keyed by queue id, so everything that mutates them runs under the one
//! scheduler spinlock and wake-vs-timeout races are linearized there.

use crate::thread::scheduler::{self, KernelState, kernel};
use crate::thread::{self, ThreadState};
use crate::{Timeout, timeout};
use alloc::collections::vec_deque::VecDeque;
use bedrock::spinlock::SpinLockGuard;
use core::sync::atomic::{AtomicU64, Ordering};

/// Why a blocked thread woke up.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum WaitResult {
    /// Another party signalled the queue.
    Signaled,
    /// The wait deadline expired first.
    TimedOut,
    /// The wait was torn down under the thread.
    Cancelled,
}

/// Ordering policy of a wait queue.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum QueuePolicy {
    /// Wake in arrival order.
    Fifo,
    /// Wake the most urgent waiter first; equal priorities keep arrival
    /// order.
    Priority,
}

/// Central list of one queue's waiters.
pub(crate) struct WaitList {
    pub(crate) waiters: VecDeque<u64>,
    pub(crate) policy: QueuePolicy,
    /// Thread currently receiving priority donations from this queue's
    /// waiters (a lock holder).
    pub(crate) pi_owner: Option<u64>,
}

impl WaitList {
    fn new(policy: QueuePolicy) -> Self {
        Self {
            waiters: VecDeque::new(),
            policy,
            pi_owner: None,
        }
    }
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// An ordered collection of blocked threads.
pub struct WaitQueue {
    id: AtomicU64,
    policy: QueuePolicy,
}

impl WaitQueue {
    /// Creates a new, empty wait queue with the given wake order.
    pub const fn new(policy: QueuePolicy) -> Self {
        Self {
            id: AtomicU64::new(0),
            policy,
        }
    }

    /// The queue's id, assigned on first use so construction stays const.
    pub(crate) fn id(&self) -> u64 {
        let id = self.id.load(Ordering::SeqCst);
        if id != 0 {
            return id;
        }
        let fresh = NEXT_QUEUE_ID.fetch_add(1, Ordering::SeqCst);
        match self
            .id
            .compare_exchange(0, fresh, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => fresh,
            Err(raced) => raced,
        }
    }

    /// Park the calling thread on this queue, releasing `guard` only after
    /// the thread is enqueued, so a wake between the caller's check and
    /// its sleep cannot be lost.
    ///
    /// Returns when another party wakes the thread
    /// ([`WaitResult::Signaled`]), the timeout expires
    /// ([`WaitResult::TimedOut`]), or the thread is torn down
    /// ([`WaitResult::Cancelled`]).
    ///
    /// Panics from interrupt context, with the scheduler locked, or with
    /// [`Timeout::NoWait`] (a caller that cannot wait must not pend).
    pub fn pend<T>(&self, guard: SpinLockGuard<'_, T>, timeout: Timeout) -> WaitResult {
        assert!(
            !bedrock::interrupt::in_isr(),
            "blocking from interrupt context"
        );
        assert!(
            !matches!(timeout, Timeout::NoWait),
            "pend with Timeout::NoWait"
        );
        let ks = kernel().lock();
        self.pend_locked(ks, guard, timeout)
    }

    /// [`pend`](Self::pend) for callers that already hold the scheduler
    /// lock to make additional state changes (priority donation, lock
    /// hand-off) atomic with the enqueue.
    pub(crate) fn pend_locked<T>(
        &self,
        mut ks: SpinLockGuard<'static, KernelState>,
        guard: SpinLockGuard<'_, T>,
        timeout: Timeout,
    ) -> WaitResult {
        assert!(
            !bedrock::interrupt::in_isr(),
            "blocking from interrupt context"
        );
        assert!(
            !matches!(timeout, Timeout::NoWait),
            "pend with Timeout::NoWait"
        );
        let tid = thread::current_tid().expect("pend from outside a kernel thread");

        assert_eq!(
            ks.threads.get(&tid).expect("current record").sched_locked,
            0,
            "blocking with the scheduler locked"
        );
        self.enqueue_locked(&mut ks, tid);
        let record = ks.threads.get_mut(&tid).expect("current record");
        record.state = ThreadState::Waiting;
        record.wake_result = WaitResult::Signaled;
        if let Timeout::Ticks(ticks) = timeout {
            timeout::add_thread_timeout_locked(&mut ks, tid, ticks);
        }
        guard.unlock();
        scheduler::reschedule(ks);

        let ks = kernel().lock();
        let result = ks
            .threads
            .get(&tid)
            .map(|r| r.wake_result)
            .unwrap_or(WaitResult::Cancelled);
        ks.unlock();
        result
    }

    /// Insert `tid` into the waiter list per the queue policy.
    pub(crate) fn enqueue_locked(&self, ks: &mut KernelState, tid: u64) {
        let qid = self.id();
        let prio = ks
            .threads
            .get(&tid)
            .expect("enqueue of unknown thread")
            .eff_prio();
        ks.waits
            .entry(qid)
            .or_insert_with(|| WaitList::new(self.policy));
        let pos = {
            let list = ks.waits.get(&qid).expect("wait list vanished");
            match self.policy {
                QueuePolicy::Fifo => list.waiters.len(),
                QueuePolicy::Priority => insertion_point(ks, list, prio),
            }
        };
        let list = ks.waits.get_mut(&qid).expect("wait list vanished");
        list.waiters.insert(pos, tid);
        let record = ks.threads.get_mut(&tid).expect("enqueue of unknown thread");
        record.waiting_on = Some(qid);
    }

    /// Wake the queue's head, if any, and return its thread id.
    pub(crate) fn wake_one_locked(&self, ks: &mut KernelState, result: WaitResult) -> Option<u64> {
        let qid = self.id();
        let list = ks.waits.get_mut(&qid)?;
        let tid = list.waiters.pop_front()?;
        cleanup_if_idle(ks, qid);
        finish_wake_locked(ks, tid, result);
        Some(tid)
    }

    /// Wake every thread pending at the time of the call; returns how many.
    pub(crate) fn wake_all_locked(&self, ks: &mut KernelState, result: WaitResult) -> usize {
        let mut woken = 0;
        while self.wake_one_locked(ks, result).is_some() {
            woken += 1;
        }
        woken
    }

    /// Remove and ready the queue's head (or none). Callable from any
    /// context; never blocks.
    pub fn unpend_first(&self) -> Option<u64> {
        let mut ks = kernel().lock();
        let woken = self.wake_one_locked(&mut ks, WaitResult::Signaled);
        ks.unlock();
        scheduler::preempt_point();
        woken
    }

    /// Drain the entire queue, readying every waiter; returns how many.
    /// Callable from any context; never blocks.
    pub fn unpend_all(&self) -> usize {
        let mut ks = kernel().lock();
        let woken = self.wake_all_locked(&mut ks, WaitResult::Signaled);
        ks.unlock();
        scheduler::preempt_point();
        woken
    }

    /// Number of threads currently pending.
    pub fn len(&self) -> usize {
        let ks = kernel().lock();
        let len = ks
            .waits
            .get(&self.id.load(Ordering::SeqCst))
            .map(|l| l.waiters.len())
            .unwrap_or(0);
        ks.unlock();
        len
    }

    /// Whether no thread is currently pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        let id = self.id.load(Ordering::SeqCst);
        if id == 0 {
            return;
        }
        let mut ks = kernel().lock();
        if let Some(list) = ks.waits.remove(&id) {
            assert!(
                list.waiters.is_empty(),
                "wait queue dropped with threads pending"
            );
        }
        ks.unlock();
    }
}

fn insertion_point(ks: &KernelState, list: &WaitList, prio: i8) -> usize {
    list.waiters
        .iter()
        .position(|other| {
            let other_prio = ks
                .threads
                .get(other)
                .map(|r| r.eff_prio())
                .unwrap_or(scheduler::IDLE_PRIO);
            prio < other_prio
        })
        .unwrap_or(list.waiters.len())
}

fn cleanup_if_idle(ks: &mut KernelState, qid: u64) {
    if let Some(list) = ks.waits.get(&qid)
        && list.waiters.is_empty()
        && list.pi_owner.is_none()
    {
        ks.waits.remove(&qid);
    }
}

/// Complete a wake decided under the scheduler lock: cancel the thread's
/// pending deadline, clear its membership, stamp the wake reason, and
/// ready it. The first path to run this wins; the others find the thread
/// already gone.
pub(crate) fn finish_wake_locked(ks: &mut KernelState, tid: u64, result: WaitResult) {
    timeout::cancel_thread_timeout_locked(ks, tid);
    let record = ks.threads.get_mut(&tid).expect("waking unknown thread");
    record.waiting_on = None;
    record.wake_result = result;
    scheduler::make_ready_locked(ks, tid);
}

/// Tear a waiting thread out of whatever it is pending on, without
/// readying it. Used by the timeout and abort paths.
pub(crate) fn cancel_wait_locked(ks: &mut KernelState, tid: u64, result: WaitResult) {
    let Some(record) = ks.threads.get_mut(&tid) else {
        return;
    };
    record.wake_result = result;
    let Some(qid) = record.waiting_on.take() else {
        timeout::cancel_thread_timeout_locked(ks, tid);
        return;
    };
    timeout::cancel_thread_timeout_locked(ks, tid);
    let mut donation_owner = None;
    if let Some(list) = ks.waits.get_mut(&qid) {
        if let Some(pos) = list.waiters.iter().position(|&t| t == tid) {
            list.waiters.remove(pos);
        }
        donation_owner = list.pi_owner;
    }
    if let Some(owner) = donation_owner {
        refresh_donation_locked(ks, qid, owner);
    }
    cleanup_if_idle(ks, qid);
}

/// Re-sort a waiter whose effective priority changed.
pub(crate) fn reposition_locked(ks: &mut KernelState, qid: u64, tid: u64) {
    let Some(list) = ks.waits.get_mut(&qid) else {
        return;
    };
    if list.policy != QueuePolicy::Priority {
        return;
    }
    let Some(pos) = list.waiters.iter().position(|&t| t == tid) else {
        return;
    };
    list.waiters.remove(pos);
    let prio = ks
        .threads
        .get(&tid)
        .expect("repositioning unknown thread")
        .eff_prio();
    let pos = {
        let list = ks.waits.get(&qid).expect("wait list vanished");
        insertion_point(ks, list, prio)
    };
    let list = ks.waits.get_mut(&qid).expect("wait list vanished");
    list.waiters.insert(pos, tid);
    let donation_owner = list.pi_owner;
    if let Some(owner) = donation_owner {
        refresh_donation_locked(ks, qid, owner);
    }
}

/// Record (or clear) the thread that inherits priority from this queue's
/// waiters, creating the central list if it does not exist yet.
pub(crate) fn set_pi_owner_locked(ks: &mut KernelState, queue: &WaitQueue, owner: Option<u64>) {
    let qid = queue.id();
    let list = ks
        .waits
        .entry(qid)
        .or_insert_with(|| WaitList::new(queue.policy));
    list.pi_owner = owner;
}

/// Recompute the priority `owner` inherits from the waiters of `qid`.
pub(crate) fn refresh_donation_locked(ks: &mut KernelState, qid: u64, owner: u64) {
    let donated = ks.waits.get(&qid).and_then(|list| {
        list.waiters
            .iter()
            .filter_map(|tid| ks.threads.get(tid).map(|r| r.eff_prio()))
            .min()
    });
    scheduler::set_inherited_locked(ks, owner, donated);
}
