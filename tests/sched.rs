//! Scheduling behavior on the hosted machine.

mod common;

use common::{kthread, run};
use kestrel::sync::{Semaphore, SpinLock};
use kestrel::thread::{self, Current, ThreadBuilder, ThreadOptions, ThreadState};
use kestrel::{KernelError, Timeout};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[test]
fn join_returns_the_exit_code() {
    common::boot();
    let fine = kthread("returns", 5, || {});
    assert_eq!(fine.join(), 0);

    let coded = ThreadBuilder::new("exits")
        .priority(5)
        .spawn(|| Current::exit(42));
    assert_eq!(coded.join(), 42);
}

#[test]
fn dispatch_follows_priority() {
    run("prio-order", || {
        let order = Arc::new(SpinLock::new(Vec::new()));
        let workers: Vec<_> = [3i8, 1, 2]
            .into_iter()
            .map(|prio| {
                let order = order.clone();
                ThreadBuilder::new(format!("w{prio}"))
                    .priority(prio)
                    .options(ThreadOptions::START_SUSPENDED)
                    .spawn(move || {
                        let mut guard = order.lock();
                        guard.push(prio);
                        guard.unlock();
                    })
            })
            .collect();
        for worker in &workers {
            thread::resume(worker.tid()).unwrap();
        }
        // All three outrank nothing until this thread blocks; then they
        // run most-urgent first.
        for worker in workers {
            assert_eq!(worker.join(), 0);
        }
        let guard = order.lock();
        assert_eq!(&*guard, &[1, 2, 3]);
        guard.unlock();
    });
}

#[test]
fn wake_preempts_less_urgent_running_thread() {
    run("preempt", || {
        let sem = Arc::new(Semaphore::new(0, 1));
        let observed = Arc::new(AtomicBool::new(false));

        let urgent = {
            let (sem, observed) = (sem.clone(), observed.clone());
            kthread("urgent", -1, move || {
                sem.take(Timeout::Forever).unwrap();
                observed.store(true, Ordering::SeqCst);
            })
        };
        // Let it park.
        Current::sleep(10);
        assert!(!observed.load(Ordering::SeqCst));

        // The give readies a more urgent thread; it runs before give's
        // caller proceeds.
        sem.give();
        assert!(observed.load(Ordering::SeqCst));
        assert_eq!(urgent.join(), 0);
    });
}

#[test]
fn scheduler_lock_defers_preemption() {
    run("sched-lock", || {
        let ran = Arc::new(AtomicBool::new(false));
        let guard = Current::lock_scheduler();
        let urgent = {
            let ran = ran.clone();
            kthread("locked-out", -1, move || {
                ran.store(true, Ordering::SeqCst);
            })
        };
        // More urgent and ready, but preemption is locked.
        assert!(!ran.load(Ordering::SeqCst));
        drop(guard);
        // The deferred reschedule fires as the lock is released.
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(urgent.join(), 0);
    });
}

#[test]
fn yield_rotates_equal_priorities() {
    run("yield", || {
        let counter = Arc::new(AtomicUsize::new(0));
        let partner = {
            let counter = counter.clone();
            kthread("partner", 0, move || {
                for _ in 0..10 {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Current::yield_now();
                }
            })
        };
        // Same priority: the partner only runs when this thread yields or
        // blocks.
        let mut seen = counter.load(Ordering::SeqCst);
        for _ in 0..20 {
            Current::yield_now();
            let now = counter.load(Ordering::SeqCst);
            assert!(now >= seen);
            seen = now;
            if now == 10 {
                break;
            }
        }
        assert_eq!(partner.join(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    });
}

#[test]
fn sleep_lasts_at_least_the_requested_ticks() {
    run("sleep", || {
        for ticks in [1u64, 7, 30] {
            let before = kestrel::timeout::uptime_ticks();
            Current::sleep(ticks);
            let elapsed = kestrel::timeout::uptime_ticks() - before;
            assert!(
                elapsed >= ticks,
                "slept {elapsed} ticks, wanted at least {ticks}"
            );
        }
    });
}

#[test]
fn suspend_and_resume() {
    run("suspend", || {
        let ran = Arc::new(AtomicBool::new(false));
        let worker = {
            let ran = ran.clone();
            ThreadBuilder::new("dormant")
                .priority(10)
                .options(ThreadOptions::START_SUSPENDED)
                .spawn(move || {
                    ran.store(true, Ordering::SeqCst);
                })
        };
        Current::sleep(10);
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(thread::get_state(worker.tid()), Ok(ThreadState::Suspended));

        let tid = worker.tid();
        thread::resume(tid).unwrap();
        assert_eq!(worker.join(), 0);
        assert!(ran.load(Ordering::SeqCst));
        // Resuming a finished thread is rejected; whether as Busy or as
        // NoSuchThread depends on whether the record was reclaimed yet.
        assert!(thread::resume(tid).is_err());
    });
}

#[test]
fn blocked_threads_park_instead_of_spinning() {
    run("parking", || {
        let sem = Arc::new(Semaphore::new(0, 1));
        let blockee = {
            let sem = sem.clone();
            kthread("blockee", 10, move || {
                sem.take(Timeout::Forever).unwrap();
            })
        };
        Current::sleep(10);
        assert_eq!(
            thread::get_state(blockee.tid()),
            Ok(ThreadState::Waiting),
            "a blocked thread should be parked on the wait queue"
        );
        sem.give();
        assert_eq!(blockee.join(), 0);
    });
}

#[test]
fn abort_cancels_a_pending_wait() {
    run("abort", || {
        let sem = Arc::new(Semaphore::new(0, 1));
        let entered = Arc::new(AtomicBool::new(false));
        let returned = Arc::new(AtomicBool::new(false));

        let victim = {
            let (sem, entered, returned) = (sem.clone(), entered.clone(), returned.clone());
            kthread("victim", 10, move || {
                entered.store(true, Ordering::SeqCst);
                let _ = sem.take(Timeout::Forever);
                // Teardown beats the return from the blocking call.
                returned.store(true, Ordering::SeqCst);
            })
        };
        Current::sleep(10);
        assert!(entered.load(Ordering::SeqCst));

        thread::abort(victim.tid()).unwrap();
        assert_eq!(victim.join(), -1);
        assert!(!returned.load(Ordering::SeqCst));
        // The wait queue was left clean: a give now banks the unit.
        sem.give();
        assert_eq!(sem.count(), 1);
    });
}

#[test]
fn set_priority_reorders_ready_threads() {
    run("set-prio", || {
        let order = Arc::new(SpinLock::new(Vec::new()));
        let record = |tag: i8| {
            let order = order.clone();
            move || {
                let mut guard = order.lock();
                guard.push(tag);
                guard.unlock();
            }
        };
        let slow = ThreadBuilder::new("starts-low")
            .priority(20)
            .options(ThreadOptions::START_SUSPENDED)
            .spawn(record(1));
        let fast = ThreadBuilder::new("starts-high")
            .priority(10)
            .options(ThreadOptions::START_SUSPENDED)
            .spawn(record(2));
        thread::resume(slow.tid()).unwrap();
        thread::resume(fast.tid()).unwrap();

        // Swap their order while both sit in the ready queue.
        thread::set_priority(slow.tid(), 5).unwrap();
        assert_eq!(thread::effective_priority(slow.tid()), Ok(5));

        slow.join();
        fast.join();
        let guard = order.lock();
        assert_eq!(&*guard, &[1, 2]);
        guard.unlock();

        assert_eq!(
            thread::set_priority(9_999_999, 5),
            Err(KernelError::NoSuchThread)
        );
    });
}
