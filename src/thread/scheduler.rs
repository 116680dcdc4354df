//! Thread scheduler.
//!
//! The scheduler owns all mutable scheduling state of the kernel: the
//! thread registry, the per-priority ready structure, the per-core slots,
//! the wait-list registry and the timeout list all live inside one
//! [`KernelState`] behind a single short-held spinlock. Nothing outside
//! this module hands out mutable access to that state; the sibling modules
//! operate on it through `*_locked` functions that take the state by
//! reference while the lock is held.
//!
//! Dispatch is priority-driven and preemptive: the running thread on each
//! core is the highest-priority ready thread, except while that thread
//! holds the scheduler lock, and threads in the cooperative band (negative
//! priority) are never preempted. Ties are broken in arrival order, or
//! rotated on the configured time slice.
//!
//! The lock is never held across a context switch; the dispatcher releases
//! it and asserts the interrupt-guard nesting is empty before handing the
//! core to the next thread.

use super::{Thread, ThreadOptions, ThreadState};
use crate::sync::spinlock::{SpinLock, SpinLockGuard};
use crate::sync::wait_queue::{WaitList, WaitResult};
use crate::timeout::{self, TimeoutKey, TimeoutList};
use crate::timer::TimerRecord;
use alloc::{
    collections::{btree_map::BTreeMap, vec_deque::VecDeque},
    sync::Arc,
};
use bedrock::interrupt::InterruptGuard;
use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;

/// Priority of the reserved per-core idle thread. Unreachable by ordinary
/// threads, which keeps the idle thread out of every comparison's way.
pub(crate) const IDLE_PRIO: i8 = i8::MAX;

/// Per-thread scheduling record, valid while the thread is registered.
pub(crate) struct ThreadRecord {
    pub(crate) th: Arc<Thread>,
    pub(crate) state: ThreadState,
    pub(crate) base_prio: i8,
    /// Priority donated by blocked waiters; `None` when nothing is
    /// inherited. The effective priority is the more urgent of this and
    /// the base.
    pub(crate) inherited_prio: Option<i8>,
    /// Wait queue this thread is parked on, if any. A thread is a member
    /// of at most one wait queue at a time.
    pub(crate) waiting_on: Option<u64>,
    /// Key of the pending wake-up deadline, if the current wait is timed.
    pub(crate) timed_wait: Option<TimeoutKey>,
    pub(crate) wake_result: WaitResult,
    /// Preemption-lock nesting depth.
    pub(crate) sched_locked: u32,
    pub(crate) options: ThreadOptions,
}

impl ThreadRecord {
    pub(crate) fn eff_prio(&self) -> i8 {
        match self.inherited_prio {
            Some(inherited) => inherited.min(self.base_prio),
            None => self.base_prio,
        }
    }
}

/// Per-core scheduling slot.
pub(crate) struct CpuSlot {
    pub(crate) current: Option<u64>,
    pub(crate) idle: Option<u64>,
    pub(crate) need_resched: bool,
    /// Set when the running thread exhausted its time slice; allows
    /// rotation behind an *equal*-priority peer, not only a better one.
    pub(crate) slice_expired: bool,
    pub(crate) slice_left: u32,
}

impl CpuSlot {
    const fn new() -> Self {
        Self {
            current: None,
            idle: None,
            need_resched: false,
            slice_expired: false,
            slice_left: 0,
        }
    }
}

/// Ready threads, grouped per priority, FIFO within a group.
pub(crate) struct ReadyQueue {
    queues: BTreeMap<i8, VecDeque<u64>>,
}

impl ReadyQueue {
    const fn new() -> Self {
        Self {
            queues: BTreeMap::new(),
        }
    }

    pub(crate) fn insert_back(&mut self, prio: i8, tid: u64) {
        self.queues.entry(prio).or_default().push_back(tid);
    }

    pub(crate) fn insert_front(&mut self, prio: i8, tid: u64) {
        self.queues.entry(prio).or_default().push_front(tid);
    }

    pub(crate) fn remove(&mut self, prio: i8, tid: u64) -> bool {
        let Some(queue) = self.queues.get_mut(&prio) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|&t| t == tid) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            self.queues.remove(&prio);
        }
        true
    }

    pub(crate) fn pop_best(&mut self) -> Option<u64> {
        let (&prio, queue) = self.queues.iter_mut().next()?;
        let tid = queue.pop_front().expect("empty ready bucket");
        if queue.is_empty() {
            self.queues.remove(&prio);
        }
        Some(tid)
    }

    pub(crate) fn best_prio(&self) -> Option<i8> {
        self.queues.keys().next().copied()
    }

    pub(crate) fn has_at(&self, prio: i8) -> bool {
        self.queues.contains_key(&prio)
    }
}

/// All mutable scheduling state, behind [`kernel`]'s spinlock.
pub(crate) struct KernelState {
    pub(crate) threads: BTreeMap<u64, ThreadRecord>,
    pub(crate) ready: ReadyQueue,
    pub(crate) cpus: [CachePadded<CpuSlot>; crate::MAX_CPU],
    /// Wait lists keyed by wait-queue id.
    pub(crate) waits: BTreeMap<u64, WaitList>,
    pub(crate) timeouts: TimeoutList,
    pub(crate) timers: BTreeMap<u64, TimerRecord>,
}

impl KernelState {
    const fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            ready: ReadyQueue::new(),
            cpus: [const { CachePadded::new(CpuSlot::new()) }; crate::MAX_CPU],
            waits: BTreeMap::new(),
            timeouts: TimeoutList::new(),
            timers: BTreeMap::new(),
        }
    }
}

static KERNEL: SpinLock<KernelState> = SpinLock::new(KernelState::new());

/// The kernel's scheduling state. Hold the lock briefly and never across a
/// context switch.
pub(crate) fn kernel() -> &'static SpinLock<KernelState> {
    &KERNEL
}

/// Dead threads whose records await reclamation by the idle thread.
static REAPER: SegQueue<u64> = SegQueue::new();

pub(crate) fn init(_config: &crate::KernelConfig) {}

/// Spawn and launch the reserved idle thread of every active core.
pub(crate) fn start_idle_threads(config: &crate::KernelConfig) {
    #[cfg(feature = "sim")]
    assert_eq!(
        config.cpus, 1,
        "the hosted machine models a single core; multi-core runs need a real port"
    );
    for cpu in 0..config.cpus {
        let th = super::spawn_raw(
            alloc::format!("idle-{cpu}"),
            IDLE_PRIO,
            ThreadOptions::ESSENTIAL,
            move || idle_loop(cpu),
        );
        let tid = th.tid;
        let ctx = th.ctx.clone();
        let mut ks = kernel().lock();
        let record = ks.threads.get_mut(&tid).expect("idle thread vanished");
        record.state = ThreadState::Running;
        ks.cpus[cpu].idle = Some(tid);
        ks.cpus[cpu].current = Some(tid);
        ks.unlock();
        crate::machine().port.jump(&ctx);
    }
}

/// Transition `tid` to READY, queue it, and flag any core now running
/// something less urgent.
pub(crate) fn make_ready_locked(ks: &mut KernelState, tid: u64) {
    let record = ks.threads.get_mut(&tid).expect("readying unknown thread");
    record.state = ThreadState::Ready;
    let prio = record.eff_prio();
    ks.ready.insert_back(prio, tid);
    flag_preemption_locked(ks, prio);
    // On real hardware the interrupt that woke this thread also wakes an
    // idling core; the hosted machine needs to hear about it explicitly.
    bedrock::wake_event();
}

/// Pick the next thread and hand the core over.
///
/// The caller must already have moved the current thread into its target
/// state (and requeued it if it stays runnable); this consumes the state
/// lock, releases it, and performs the switch. Returns when the calling
/// thread is next dispatched.
pub(crate) fn reschedule(mut ks: SpinLockGuard<'static, KernelState>) {
    let cpu = bedrock::cpu_id();
    let cur = ks.cpus[cpu].current.expect("dispatch without a current thread");
    let idle = ks.cpus[cpu].idle.expect("dispatch before idle thread exists");

    let next = ks.ready.pop_best().unwrap_or(idle);
    ks.cpus[cpu].current = Some(next);
    ks.cpus[cpu].need_resched = false;
    ks.cpus[cpu].slice_expired = false;
    ks.cpus[cpu].slice_left = crate::config().timeslice_ticks;

    if cur != next && cur == idle {
        // The idle thread is conceptually always runnable; park it aside.
        ks.threads.get_mut(&cur).expect("idle record").state = ThreadState::Ready;
    }
    ks.threads.get_mut(&next).expect("next record").state = ThreadState::Running;
    super::note_current(cpu, next);
    timeout::program_next_locked(&mut ks);

    let from = ks.threads.get(&cur).expect("current record").th.ctx.clone();
    let to = ks.threads.get(&next).expect("next record").th.ctx.clone();
    ks.unlock();

    if cur != next {
        assert!(
            !InterruptGuard::is_guarded(),
            "context switch while holding a spinlock"
        );
        crate::machine().port.switch(&from, &to);
        super::check_for_kill();
    }
}

/// Hand the core over and never come back; the exit path.
pub(crate) fn exit_reschedule(mut ks: SpinLockGuard<'static, KernelState>) {
    let cpu = bedrock::cpu_id();
    let idle = ks.cpus[cpu].idle.expect("exit before idle thread exists");
    let next = ks.ready.pop_best().unwrap_or(idle);
    ks.cpus[cpu].current = Some(next);
    ks.cpus[cpu].need_resched = false;
    ks.cpus[cpu].slice_expired = false;
    ks.cpus[cpu].slice_left = crate::config().timeslice_ticks;
    ks.threads.get_mut(&next).expect("next record").state = ThreadState::Running;
    super::note_current(cpu, next);
    timeout::program_next_locked(&mut ks);
    let to = ks.threads.get(&next).expect("next record").th.ctx.clone();
    ks.unlock();

    assert!(
        !InterruptGuard::is_guarded(),
        "context switch while holding a spinlock"
    );
    crate::machine().port.jump(&to);
}

/// Re-check the ready structure against the running thread and preempt if
/// a wake or slice expiry made someone else eligible.
///
/// A no-op from interrupt context (the check happens when the interrupted
/// thread next passes a scheduling point) and for cooperative or
/// scheduler-locked threads.
pub(crate) fn preempt_point() {
    if bedrock::interrupt::in_isr() {
        return;
    }
    if super::current_tid().is_none() {
        return;
    }
    let mut ks = kernel().lock();
    let cpu = bedrock::cpu_id();
    if !ks.cpus[cpu].need_resched {
        ks.unlock();
        return;
    }
    let cur = ks.cpus[cpu].current.expect("no current thread");
    if Some(cur) == ks.cpus[cpu].idle {
        // The idle loop re-evaluates on its own.
        ks.unlock();
        return;
    }
    let record = ks.threads.get(&cur).expect("current record");
    if record.sched_locked > 0 || record.eff_prio() < 0 {
        ks.unlock();
        return;
    }
    let cur_prio = record.eff_prio();
    let slice_expired = ks.cpus[cpu].slice_expired;
    let preempt = match ks.ready.best_prio() {
        Some(best) => best < cur_prio || (slice_expired && best == cur_prio),
        None => false,
    };
    if !preempt {
        ks.cpus[cpu].need_resched = false;
        ks.cpus[cpu].slice_expired = false;
        ks.unlock();
        return;
    }
    ks.threads.get_mut(&cur).expect("current record").state = ThreadState::Ready;
    if slice_expired {
        ks.ready.insert_back(cur_prio, cur);
    } else {
        // A preempted thread resumes ahead of its equal-priority peers.
        ks.ready.insert_front(cur_prio, cur);
    }
    reschedule(ks);
}

/// Move the calling thread behind its equal-priority peers and dispatch.
pub(crate) fn yield_now() {
    assert!(
        !bedrock::interrupt::in_isr(),
        "yield from interrupt context"
    );
    let Some(tid) = super::current_tid() else {
        return;
    };
    let mut ks = kernel().lock();
    let cpu = bedrock::cpu_id();
    assert_eq!(ks.cpus[cpu].current, Some(tid), "yield by a non-running thread");
    if Some(tid) == ks.cpus[cpu].idle {
        ks.unlock();
        return;
    }
    let record = ks.threads.get_mut(&tid).expect("current record");
    record.state = ThreadState::Ready;
    let prio = record.eff_prio();
    ks.ready.insert_back(prio, tid);
    reschedule(ks);
}

/// Recompute the queueing position of `tid` after a priority change.
///
/// `old_eff` is the effective priority before the change was applied to
/// the record.
pub(crate) fn requeue_after_priority_change_locked(ks: &mut KernelState, tid: u64, old_eff: i8) {
    let record = ks.threads.get(&tid).expect("priority change on unknown thread");
    let new_eff = record.eff_prio();
    if new_eff == old_eff {
        return;
    }
    match record.state {
        ThreadState::Ready => {
            if ks.ready.remove(old_eff, tid) {
                ks.ready.insert_back(new_eff, tid);
            }
            // A raised thread may now outrank a running one.
            if new_eff < old_eff {
                flag_preemption_locked(ks, new_eff);
            }
        }
        ThreadState::Running => {
            // A lowered running thread may no longer be the best choice.
            for cpu in 0..crate::config().cpus {
                if ks.cpus[cpu].current == Some(tid) {
                    if let Some(best) = ks.ready.best_prio()
                        && best < new_eff
                    {
                        ks.cpus[cpu].need_resched = true;
                    }
                }
            }
        }
        ThreadState::Waiting => {
            if let Some(qid) = record.waiting_on {
                crate::sync::wait_queue::reposition_locked(ks, qid, tid);
            }
        }
        ThreadState::Suspended | ThreadState::Dead => {}
    }
}

/// Raise the inherited priority of `tid` to at least `prio`. A donation
/// target that already exited is left alone.
pub(crate) fn inherit_priority_locked(ks: &mut KernelState, tid: u64, prio: i8) {
    let Some(record) = ks.threads.get_mut(&tid) else {
        return;
    };
    let old_eff = record.eff_prio();
    let inherited = match record.inherited_prio {
        Some(existing) => existing.min(prio),
        None => prio,
    };
    record.inherited_prio = Some(inherited);
    requeue_after_priority_change_locked(ks, tid, old_eff);
}

/// Replace the inherited priority of `tid` outright (donation recomputed
/// after a waiter left, or cleared on release).
pub(crate) fn set_inherited_locked(ks: &mut KernelState, tid: u64, inherited: Option<i8>) {
    let Some(record) = ks.threads.get_mut(&tid) else {
        return;
    };
    let old_eff = record.eff_prio();
    record.inherited_prio = inherited;
    requeue_after_priority_change_locked(ks, tid, old_eff);
}

fn flag_preemption_locked(ks: &mut KernelState, prio: i8) {
    let this_cpu = bedrock::cpu_id();
    let mut ipi_mask: u32 = 0;
    for cpu in 0..crate::config().cpus {
        let Some(cur) = ks.cpus[cpu].current else {
            continue;
        };
        let cur_prio = ks
            .threads
            .get(&cur)
            .map(|r| r.eff_prio())
            .unwrap_or(IDLE_PRIO);
        if prio < cur_prio {
            if cpu == this_cpu {
                ks.cpus[cpu].need_resched = true;
            } else {
                ipi_mask |= 1 << cpu;
            }
        }
    }
    if ipi_mask != 0 {
        crate::ipi::notify_cores(ipi_mask);
    }
}

/// Account `delta` announced ticks against the running thread's slice.
pub(crate) fn slice_tick_locked(ks: &mut KernelState, delta: u64) {
    let slice = crate::config().timeslice_ticks;
    if slice == 0 || delta == 0 {
        return;
    }
    let cpu = bedrock::cpu_id();
    let Some(cur) = ks.cpus[cpu].current else {
        return;
    };
    if Some(cur) == ks.cpus[cpu].idle {
        return;
    }
    let record = ks.threads.get(&cur).expect("current record");
    let prio = record.eff_prio();
    if prio < 0 {
        // Cooperative threads are never sliced.
        return;
    }
    if !ks.ready.has_at(prio) {
        // Nobody to rotate with; the slice restarts.
        ks.cpus[cpu].slice_left = slice;
        return;
    }
    let left = ks.cpus[cpu].slice_left;
    let left = left.saturating_sub(delta.min(u64::from(u32::MAX)) as u32);
    if left == 0 {
        ks.cpus[cpu].slice_expired = true;
        ks.cpus[cpu].need_resched = true;
        ks.cpus[cpu].slice_left = slice;
    } else {
        ks.cpus[cpu].slice_left = left;
    }
}

/// The tick deadline at which the running thread's slice expires, if
/// slicing is active on this core.
pub(crate) fn slice_deadline_locked(ks: &KernelState) -> Option<u64> {
    let slice = crate::config().timeslice_ticks;
    if slice == 0 {
        return None;
    }
    let cpu = bedrock::cpu_id();
    let cur = ks.cpus[cpu].current?;
    if Some(cur) == ks.cpus[cpu].idle {
        return None;
    }
    let record = ks.threads.get(&cur)?;
    let prio = record.eff_prio();
    if prio < 0 || !ks.ready.has_at(prio) {
        return None;
    }
    Some(ks.timeouts.now().wrapping_add(u64::from(ks.cpus[cpu].slice_left.max(1))))
}

/// Queue a dead thread's record for reclamation.
pub(crate) fn reap_later(tid: u64) {
    REAPER.push(tid);
}

fn reap() {
    while let Some(tid) = REAPER.pop() {
        let mut ks = kernel().lock();
        let record = ks.threads.remove(&tid);
        ks.unlock();
        // The record may carry the last handle to the thread, whose
        // teardown takes the scheduler lock itself.
        drop(record);
        log::trace!("reaped thread {tid}");
    }
}

/// The reserved per-core idle loop: reclaim dead threads, dispatch anyone
/// ready, otherwise pick an idle state and sleep until a wake event.
fn idle_loop(cpu: usize) -> ! {
    log::debug!("idle thread up on core {cpu}");
    loop {
        reap();
        let ks = kernel().lock();
        if ks.ready.best_prio().is_some() {
            reschedule(ks);
            continue;
        }
        let until = timeout::ticks_until_next_locked(&ks);
        ks.unlock();
        crate::power::idle(cpu, until);
    }
}

#[cfg(test)]
mod tests {
    use super::ReadyQueue;

    #[test]
    fn ready_queue_orders_by_priority_then_arrival() {
        let mut rq = ReadyQueue::new();
        rq.insert_back(10, 1);
        rq.insert_back(5, 2);
        rq.insert_back(10, 3);
        rq.insert_back(5, 4);
        assert_eq!(rq.best_prio(), Some(5));
        assert_eq!(rq.pop_best(), Some(2));
        assert_eq!(rq.pop_best(), Some(4));
        assert_eq!(rq.pop_best(), Some(1));
        assert_eq!(rq.pop_best(), Some(3));
        assert_eq!(rq.pop_best(), None);
    }

    #[test]
    fn ready_queue_front_insert_and_remove() {
        let mut rq = ReadyQueue::new();
        rq.insert_back(0, 1);
        rq.insert_front(0, 2);
        assert!(rq.has_at(0));
        assert!(rq.remove(0, 1));
        assert!(!rq.remove(0, 1));
        assert_eq!(rq.pop_best(), Some(2));
        assert!(!rq.has_at(0));
    }

    #[test]
    fn cooperative_band_sorts_ahead() {
        let mut rq = ReadyQueue::new();
        rq.insert_back(0, 1);
        rq.insert_back(-3, 2);
        assert_eq!(rq.best_prio(), Some(-3));
        assert_eq!(rq.pop_best(), Some(2));
    }
}
