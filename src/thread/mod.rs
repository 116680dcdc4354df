//! Thread abstraction.
//!
//! A kernel thread owns an execution context (supplied by the machine's
//! execution port), a fixed priority, and a small scheduling record kept by
//! the [`scheduler`]. Threads are created through [`ThreadBuilder`], run
//! until their entry function returns or they are torn down through
//! [`abort`], and their records are reclaimed afterwards by the idle
//! thread; the kernel never reclaims a running thread's own stack.
//!
//! Priorities are numeric, lower is more urgent. The negative band is
//! cooperative: threads there are never preempted, only suspended at their
//! own blocking or yielding calls. Everything at priority zero and above is
//! preemptible, and optionally time-sliced against equal-priority peers.
pub mod scheduler;

use crate::sync::spinlock::SpinLock;
use crate::sync::wait_queue::{QueuePolicy, WaitQueue, WaitResult};
use crate::{KernelError, Timeout, timeout};
use alloc::{boxed::Box, string::String, sync::Arc};
use bedrock::driver::PortContext;
use core::sync::atomic::{AtomicU64, Ordering};
use scheduler::{ThreadRecord, kernel};

/// Exit-status bit: the thread has exited and the low 32 bits carry its
/// exit code.
const EXITED: u64 = 1 << 63;
/// Exit-status bit: teardown was requested; the thread exits at its next
/// scheduling point.
const KILLED: u64 = 1 << 62;

/// A possible state of a thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Runnable and queued, waiting for a core.
    Ready,
    /// Executing on a core right now.
    Running,
    /// Parked by [`suspend`] until [`resume`].
    Suspended,
    /// Parked on a wait queue or a sleep deadline.
    Waiting,
    /// Exited; the record lingers until reclaimed.
    Dead,
}

bitflags::bitflags! {
    /// Creation options for a thread.
    pub struct ThreadOptions: u32 {
        /// The system cannot survive without this thread; aborting it
        /// panics the kernel instead.
        const ESSENTIAL = 1 << 0;
        /// Start in the SUSPENDED state; the thread first runs after
        /// [`resume`].
        const START_SUSPENDED = 1 << 1;
    }
}

/// A kernel thread.
///
/// This is the shared, mostly-immutable part; scheduling state lives in
/// the scheduler's registry and dies with it. Handles to this survive
/// reclamation, which is what lets [`JoinHandle::join`] read the exit
/// status of a long-gone thread.
pub struct Thread {
    /// Thread id, unique for the lifetime of the system.
    pub tid: u64,
    /// Thread name, for logs.
    pub name: String,
    pub(crate) ctx: Arc<PortContext>,
    /// Mixture of exit state (bits 63 and 62) and exit code (low 32 bits).
    pub(crate) exit_status: AtomicU64,
    /// Serializes the exited-check against parking in [`JoinHandle::join`].
    pub(crate) join_lock: SpinLock<()>,
    pub(crate) exit_wq: WaitQueue,
}

#[cfg(feature = "sim")]
std::thread_local! {
    static CURRENT: core::cell::Cell<Option<u64>> = const { core::cell::Cell::new(None) };
}

#[cfg(not(feature = "sim"))]
static CURRENT_PER_CPU: [AtomicU64; crate::MAX_CPU] =
    [const { AtomicU64::new(0) }; crate::MAX_CPU];

/// Thread id of the calling kernel thread, `None` outside of one.
pub(crate) fn current_tid() -> Option<u64> {
    #[cfg(feature = "sim")]
    {
        CURRENT.with(|c| c.get())
    }
    #[cfg(not(feature = "sim"))]
    {
        match CURRENT_PER_CPU[bedrock::cpu_id()].load(Ordering::SeqCst) {
            0 => None,
            tid => Some(tid),
        }
    }
}

/// Record who runs on `cpu`; kept for ports without host thread-locals.
pub(crate) fn note_current(cpu: usize, tid: u64) {
    #[cfg(feature = "sim")]
    let _ = (cpu, tid);
    #[cfg(not(feature = "sim"))]
    CURRENT_PER_CPU[cpu].store(tid, Ordering::SeqCst);
}

/// The running thread, as a shared handle.
///
/// Panics outside a kernel thread.
pub fn current() -> Arc<Thread> {
    let tid = current_tid().expect("not a kernel thread");
    let ks = kernel().lock();
    let th = ks.threads.get(&tid).expect("current thread unregistered").th.clone();
    ks.unlock();
    th
}

/// Exit request propagated through the hosted unwinder.
#[cfg(feature = "sim")]
struct ExitRequest(i32);

fn do_exit(code: i32) -> ! {
    #[cfg(feature = "sim")]
    {
        std::panic::panic_any(ExitRequest(code));
    }
    #[cfg(not(feature = "sim"))]
    {
        finish_current(code);
        unreachable!("a finished thread was dispatched again");
    }
}

/// Exit the calling thread if teardown was requested while it was off the
/// core. Runs at every resume from a context switch.
pub(crate) fn check_for_kill() {
    let Some(tid) = current_tid() else {
        return;
    };
    let ks = kernel().lock();
    let status = match ks.threads.get(&tid) {
        Some(record) => record.th.exit_status.load(Ordering::SeqCst),
        None => 0,
    };
    ks.unlock();
    if status & KILLED != 0 && status & EXITED == 0 {
        do_exit(status as i32);
    }
}

/// Publish the exit status, wake joiners, and leave the core for good.
fn finish_current(code: i32) {
    let tid = current_tid().expect("exit outside a kernel thread");
    let th = current();

    let guard = th.join_lock.lock();
    th.exit_status
        .fetch_or(EXITED | u64::from(code as u32), Ordering::SeqCst);
    let mut ks = kernel().lock();
    th.exit_wq.wake_all_locked(&mut ks, WaitResult::Signaled);
    ks.threads.get_mut(&tid).expect("exiting unregistered thread").state = ThreadState::Dead;
    ks.unlock();
    guard.unlock();

    log::trace!("thread {} ({}) exited with {code}", th.tid, th.name);
    scheduler::reap_later(tid);
    let ks = kernel().lock();
    scheduler::exit_reschedule(ks);
}

fn thread_entry<F: FnOnce() + Send + 'static>(tid: u64, thread_fn: F) {
    #[cfg(feature = "sim")]
    CURRENT.with(|c| c.set(Some(tid)));
    #[cfg(not(feature = "sim"))]
    let _ = tid;

    #[cfg(feature = "sim")]
    {
        // Teardown requested before the first run must still travel the
        // ordinary exit path below, so the check sits inside the unwind
        // boundary.
        let code = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            check_for_kill();
            thread_fn()
        })) {
            Ok(()) => 0,
            Err(payload) => match payload.downcast::<ExitRequest>() {
                Ok(request) => request.0,
                Err(_) => {
                    // The panic hook already reported the payload.
                    101
                }
            },
        };
        finish_current(code);
    }
    #[cfg(not(feature = "sim"))]
    {
        check_for_kill();
        thread_fn();
        finish_current(0);
    }
}

/// Create a thread record and context without queueing it; shared by the
/// builder and the idle-thread bring-up.
pub(crate) fn spawn_raw<F: FnOnce() + Send + 'static>(
    name: String,
    prio: i8,
    options: ThreadOptions,
    thread_fn: F,
) -> Arc<Thread> {
    static TID: AtomicU64 = AtomicU64::new(1);
    let tid = TID.fetch_add(1, Ordering::SeqCst);

    let ctx = Arc::new(
        crate::machine()
            .port
            .create(&name, Box::new(move || thread_entry(tid, thread_fn))),
    );
    let th = Arc::new(Thread {
        tid,
        name,
        ctx,
        exit_status: AtomicU64::new(0),
        join_lock: SpinLock::new(()),
        exit_wq: WaitQueue::new(QueuePolicy::Fifo),
    });

    let mut ks = kernel().lock();
    ks.threads.insert(
        tid,
        ThreadRecord {
            th: th.clone(),
            state: ThreadState::Suspended,
            base_prio: prio,
            inherited_prio: None,
            waiting_on: None,
            timed_wait: None,
            wake_result: WaitResult::Signaled,
            sched_locked: 0,
            options,
        },
    );
    ks.unlock();
    th
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    name: String,
    prio: i8,
    options: ThreadOptions,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        Self {
            name: String::from(name),
            prio: 0,
            options: ThreadOptions::empty(),
        }
    }

    /// Set the thread's priority. Lower is more urgent; negative is the
    /// cooperative band.
    pub fn priority(mut self, prio: i8) -> Self {
        assert!(prio != scheduler::IDLE_PRIO, "priority reserved for the idle thread");
        self.prio = prio;
        self
    }

    /// Set creation options.
    pub fn options(mut self, options: ThreadOptions) -> Self {
        self.options = options;
        self
    }

    /// Spawn the thread.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> JoinHandle {
        let th = spawn_raw(self.name, self.prio, self.options, thread_fn);
        let handle = JoinHandle { th: th.clone() };
        if !self.options.contains(ThreadOptions::START_SUSPENDED) {
            let mut ks = kernel().lock();
            scheduler::make_ready_locked(&mut ks, th.tid);
            ks.unlock();
            scheduler::preempt_point();
        }
        log::trace!("spawned thread {} ({})", handle.th.tid, handle.th.name);
        handle
    }
}

/// A handle to join a thread.
pub struct JoinHandle {
    th: Arc<Thread>,
}

impl JoinHandle {
    /// Thread id of the underlying thread.
    pub fn tid(&self) -> u64 {
        self.th.tid
    }

    /// Wait for the thread to exit and return its exit code.
    ///
    /// From a kernel thread this parks on the target's exit queue; from a
    /// foreign host context (the hosted machine's test harness) it polls.
    pub fn join(self) -> i32 {
        loop {
            let status = self.th.exit_status.load(Ordering::SeqCst);
            if status & EXITED != 0 {
                return status as i32;
            }
            if current_tid().is_some() {
                assert!(
                    !bedrock::interrupt::in_isr(),
                    "join from interrupt context"
                );
                let guard = self.th.join_lock.lock();
                if self.th.exit_status.load(Ordering::SeqCst) & EXITED != 0 {
                    guard.unlock();
                    continue;
                }
                self.th.exit_wq.pend(guard, Timeout::Forever);
            } else {
                #[cfg(feature = "sim")]
                std::thread::sleep(std::time::Duration::from_millis(1));
                #[cfg(not(feature = "sim"))]
                unreachable!("join from outside any execution context");
            }
        }
    }
}

/// The opaque surface of the running thread.
pub struct Current {
    _p: (),
}

impl Current {
    /// Get the current thread's id.
    pub fn tid() -> u64 {
        current_tid().expect("not a kernel thread")
    }

    /// Move the calling thread behind its equal-priority peers.
    pub fn yield_now() {
        scheduler::yield_now();
    }

    /// Park the calling thread for `ticks` announced ticks.
    pub fn sleep(ticks: u64) {
        assert!(
            !bedrock::interrupt::in_isr(),
            "sleep from interrupt context"
        );
        let tid = Self::tid();
        if ticks == 0 {
            scheduler::yield_now();
            return;
        }
        let mut ks = kernel().lock();
        let record = ks.threads.get_mut(&tid).expect("current record");
        assert_eq!(record.sched_locked, 0, "sleep with the scheduler locked");
        record.state = ThreadState::Waiting;
        record.wake_result = WaitResult::TimedOut;
        timeout::add_thread_timeout_locked(&mut ks, tid, ticks);
        scheduler::reschedule(ks);
    }

    /// Exit the current thread with `exit_code`.
    pub fn exit(exit_code: i32) -> ! {
        assert!(
            !bedrock::interrupt::in_isr(),
            "exit from interrupt context"
        );
        let _ = Self::tid();
        do_exit(exit_code);
    }

    /// Block preemption of the calling thread until the returned guard is
    /// dropped. Nests. Blocking while holding it panics.
    pub fn lock_scheduler() -> SchedulerLockGuard {
        let tid = Self::tid();
        let mut ks = kernel().lock();
        ks.threads.get_mut(&tid).expect("current record").sched_locked += 1;
        ks.unlock();
        SchedulerLockGuard {
            tid,
            _not_send: core::marker::PhantomData,
        }
    }
}

/// RAII guard of a scheduler-lock nesting level.
pub struct SchedulerLockGuard {
    tid: u64,
    _not_send: core::marker::PhantomData<*mut ()>,
}

impl Drop for SchedulerLockGuard {
    fn drop(&mut self) {
        let mut ks = kernel().lock();
        let record = ks.threads.get_mut(&self.tid).expect("current record");
        assert!(record.sched_locked > 0, "unbalanced scheduler unlock");
        record.sched_locked -= 1;
        let rearmed = record.sched_locked == 0;
        ks.unlock();
        if rearmed {
            scheduler::preempt_point();
        }
    }
}

/// Get the scheduling state of thread `tid`.
pub fn get_state(tid: u64) -> Result<ThreadState, KernelError> {
    let ks = kernel().lock();
    let state = ks.threads.get(&tid).map(|r| r.state);
    ks.unlock();
    state.ok_or(KernelError::NoSuchThread)
}

/// Get the effective (possibly inherited) priority of thread `tid`.
pub fn effective_priority(tid: u64) -> Result<i8, KernelError> {
    let ks = kernel().lock();
    let prio = ks.threads.get(&tid).map(|r| r.eff_prio());
    ks.unlock();
    prio.ok_or(KernelError::NoSuchThread)
}

/// Change the base priority of thread `tid` and reschedule if that makes a
/// different thread the best choice.
pub fn set_priority(tid: u64, prio: i8) -> Result<(), KernelError> {
    assert!(prio != scheduler::IDLE_PRIO, "priority reserved for the idle thread");
    let mut ks = kernel().lock();
    let Some(record) = ks.threads.get_mut(&tid) else {
        ks.unlock();
        return Err(KernelError::NoSuchThread);
    };
    let old_eff = record.eff_prio();
    record.base_prio = prio;
    scheduler::requeue_after_priority_change_locked(&mut ks, tid, old_eff);
    ks.unlock();
    scheduler::preempt_point();
    Ok(())
}

/// Suspend thread `tid`.
///
/// The calling thread may suspend itself and parks immediately. A waiting
/// or remotely-running thread cannot be suspended and the call fails with
/// [`KernelError::Busy`]; suspending an already-suspended thread is a
/// no-op.
pub fn suspend(tid: u64) -> Result<(), KernelError> {
    assert!(
        !bedrock::interrupt::in_isr(),
        "suspend from interrupt context"
    );
    let mut ks = kernel().lock();
    let Some(record) = ks.threads.get_mut(&tid) else {
        ks.unlock();
        return Err(KernelError::NoSuchThread);
    };
    match record.state {
        ThreadState::Suspended => {
            ks.unlock();
            Ok(())
        }
        ThreadState::Ready => {
            let prio = record.eff_prio();
            record.state = ThreadState::Suspended;
            ks.ready.remove(prio, tid);
            ks.unlock();
            Ok(())
        }
        ThreadState::Running if current_tid() == Some(tid) => {
            assert_eq!(record.sched_locked, 0, "suspend with the scheduler locked");
            record.state = ThreadState::Suspended;
            scheduler::reschedule(ks);
            Ok(())
        }
        ThreadState::Running | ThreadState::Waiting => {
            ks.unlock();
            Err(KernelError::Busy)
        }
        ThreadState::Dead => {
            ks.unlock();
            Err(KernelError::NoSuchThread)
        }
    }
}

/// Resume a suspended thread.
pub fn resume(tid: u64) -> Result<(), KernelError> {
    let mut ks = kernel().lock();
    let Some(record) = ks.threads.get(&tid) else {
        ks.unlock();
        return Err(KernelError::NoSuchThread);
    };
    if record.state != ThreadState::Suspended {
        ks.unlock();
        return Err(KernelError::Busy);
    }
    scheduler::make_ready_locked(&mut ks, tid);
    ks.unlock();
    scheduler::preempt_point();
    Ok(())
}

/// Tear down thread `tid`.
///
/// The teardown itself is scheduled work: the victim is pulled out of any
/// wait (its blocking call returns [`KernelError::Cancelled`] if it gets
/// to return at all), marked, and exits through the ordinary exit path the
/// next time it is dispatched. Its record is then reclaimed by the idle
/// thread. Aborting an [`ThreadOptions::ESSENTIAL`] thread panics; a
/// self-abort never returns.
pub fn abort(tid: u64) -> Result<(), KernelError> {
    let mut ks = kernel().lock();
    let (state, essential, th) = {
        let Some(record) = ks.threads.get(&tid) else {
            ks.unlock();
            return Err(KernelError::NoSuchThread);
        };
        (
            record.state,
            record.options.contains(ThreadOptions::ESSENTIAL),
            record.th.clone(),
        )
    };
    if essential {
        panic!("aborting essential thread {} ({})", tid, th.name);
    }
    if state == ThreadState::Dead {
        ks.unlock();
        return Ok(());
    }
    th.exit_status
        .fetch_or(KILLED | u64::from((-1i32) as u32), Ordering::SeqCst);

    match state {
        ThreadState::Waiting => {
            crate::sync::wait_queue::cancel_wait_locked(&mut ks, tid, WaitResult::Cancelled);
            scheduler::make_ready_locked(&mut ks, tid);
            ks.unlock();
        }
        ThreadState::Suspended => {
            scheduler::make_ready_locked(&mut ks, tid);
            ks.unlock();
        }
        ThreadState::Running => {
            let mut remote = None;
            for cpu in 0..crate::config().cpus {
                if ks.cpus[cpu].current == Some(tid) && cpu != bedrock::cpu_id() {
                    remote = Some(cpu);
                }
            }
            ks.unlock();
            if let Some(cpu) = remote {
                // Poke the other core so the victim passes a scheduling
                // point promptly.
                crate::ipi::notify_cores(1 << cpu);
            } else if current_tid() == Some(tid) {
                do_exit(-1);
            }
        }
        ThreadState::Ready | ThreadState::Dead => {
            ks.unlock();
        }
    }
    log::debug!("abort requested for thread {tid}");
    scheduler::preempt_point();
    Ok(())
}
