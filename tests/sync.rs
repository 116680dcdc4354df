//! Blocking-primitive behavior on the hosted machine.

mod common;

use common::{kthread, run};
use kestrel::sync::{Channel, CondVar, Mutex, Semaphore, SpinLock};
use kestrel::thread::{self, Current};
use kestrel::{KernelError, Timeout};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[test]
fn semaphore_counts_and_would_block() {
    run("sem-count", || {
        let sem = Semaphore::new(2, 4);
        assert_eq!(sem.take(Timeout::NoWait), Ok(()));
        assert_eq!(sem.take(Timeout::NoWait), Ok(()));
        assert_eq!(sem.take(Timeout::NoWait), Err(KernelError::WouldBlock));

        // Successful non-blocking takes never exceed gives plus the
        // initial count.
        for _ in 0..8 {
            sem.give();
        }
        let mut taken = 0;
        while sem.take(Timeout::NoWait).is_ok() {
            taken += 1;
        }
        // Two initial units were consumed above; eight gives saturate at
        // the limit of four.
        assert_eq!(taken, 4);

        sem.give();
        sem.reset();
        assert_eq!(sem.take(Timeout::NoWait), Err(KernelError::WouldBlock));
        assert_eq!(sem.count(), 0);
    });
}

#[test]
fn semaphore_take_times_out() {
    run("sem-timeout", || {
        let sem = Semaphore::new(0, 1);
        let before = kestrel::timeout::uptime_ticks();
        assert_eq!(sem.take(Timeout::Ticks(30)), Err(KernelError::TimedOut));
        let elapsed = kestrel::timeout::uptime_ticks() - before;
        assert!(elapsed >= 30, "woke after {elapsed} ticks");
    });
}

#[test]
fn semaphore_give_hands_off_to_one_waiter() {
    run("sem-handoff", || {
        let sem = Arc::new(Semaphore::new(0, 10));
        let woken = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..3)
            .map(|i| {
                let sem = sem.clone();
                let woken = woken.clone();
                kthread(&format!("waiter-{i}"), 10, move || {
                    sem.take(Timeout::Forever).unwrap();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        // Let all three park.
        Current::sleep(20);
        assert_eq!(woken.load(Ordering::SeqCst), 0);

        // One give wakes exactly one waiter, and the unit is handed over
        // rather than banked.
        sem.give();
        Current::sleep(20);
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(sem.count(), 0);

        sem.give();
        sem.give();
        for worker in workers {
            assert_eq!(worker.join(), 0);
        }
        assert_eq!(woken.load(Ordering::SeqCst), 3);
        assert_eq!(sem.count(), 0);
    });
}

#[test]
fn semaphore_wake_order_fifo_vs_priority() {
    run("sem-order", || {
        for (ordered, expected) in [(false, [10i8, 5]), (true, [5i8, 10])] {
            let sem = Arc::new(if ordered {
                Semaphore::new_ordered(0, 10)
            } else {
                Semaphore::new(0, 10)
            });
            let order = Arc::new(SpinLock::new(Vec::new()));

            // The priority-10 waiter arrives first, the priority-5 waiter
            // second.
            let first = {
                let (sem, order) = (sem.clone(), order.clone());
                kthread("arrives-first", 10, move || {
                    sem.take(Timeout::Forever).unwrap();
                    let mut guard = order.lock();
                    guard.push(10i8);
                    guard.unlock();
                })
            };
            Current::sleep(10);
            let second = {
                let (sem, order) = (sem.clone(), order.clone());
                kthread("arrives-second", 5, move || {
                    sem.take(Timeout::Forever).unwrap();
                    let mut guard = order.lock();
                    guard.push(5i8);
                    guard.unlock();
                })
            };
            Current::sleep(10);

            sem.give();
            Current::sleep(10);
            sem.give();
            first.join();
            second.join();

            let guard = order.lock();
            assert_eq!(&*guard, &expected, "ordered = {ordered}");
            guard.unlock();
        }
    });
}

#[test]
fn mutex_is_reentrant() {
    run("mutex-reentrant", || {
        let mutex = Arc::new(Mutex::new());
        let acquired = Arc::new(AtomicBool::new(false));

        const DEPTH: usize = 4;
        for _ in 0..DEPTH {
            mutex.lock(Timeout::Forever).unwrap();
        }

        let contender = {
            let (mutex, acquired) = (mutex.clone(), acquired.clone());
            kthread("contender", 10, move || {
                mutex.lock(Timeout::Forever).unwrap();
                acquired.store(true, Ordering::SeqCst);
                mutex.unlock().unwrap();
            })
        };

        // N nested locks need exactly N unlocks before anyone else gets
        // in.
        for _ in 0..DEPTH - 1 {
            mutex.unlock().unwrap();
            Current::sleep(5);
            assert!(!acquired.load(Ordering::SeqCst));
        }
        mutex.unlock().unwrap();
        assert_eq!(contender.join(), 0);
        assert!(acquired.load(Ordering::SeqCst));
    });
}

#[test]
fn mutex_rejects_foreign_unlock() {
    run("mutex-foreign-unlock", || {
        let mutex = Arc::new(Mutex::new());
        assert_eq!(mutex.unlock(), Err(KernelError::NotOwner));

        mutex.lock(Timeout::Forever).unwrap();
        let intruder = {
            let mutex = mutex.clone();
            kthread("intruder", 10, move || {
                assert_eq!(mutex.unlock(), Err(KernelError::NotOwner));
                assert_eq!(
                    mutex.lock(Timeout::NoWait),
                    Err(KernelError::WouldBlock)
                );
            })
        };
        assert_eq!(intruder.join(), 0);
        mutex.unlock().unwrap();
    });
}

#[test]
fn mutex_lock_times_out() {
    run("mutex-timeout", || {
        let mutex = Arc::new(Mutex::new());
        mutex.lock(Timeout::Forever).unwrap();
        let waiter = {
            let mutex = mutex.clone();
            kthread("lock-waiter", 10, move || {
                assert_eq!(
                    mutex.lock(Timeout::Ticks(20)),
                    Err(KernelError::TimedOut)
                );
            })
        };
        assert_eq!(waiter.join(), 0);
        mutex.unlock().unwrap();
    });
}

#[test]
fn mutex_priority_inheritance() {
    run("mutex-pi", || {
        let mutex = Arc::new(Mutex::new());
        let locked = Arc::new(Semaphore::new(0, 1));
        let release = Arc::new(Semaphore::new(0, 1));
        let restored = Arc::new(AtomicBool::new(false));

        let low = {
            let (mutex, locked, release, restored) = (
                mutex.clone(),
                locked.clone(),
                release.clone(),
                restored.clone(),
            );
            kthread("low", 20, move || {
                mutex.lock(Timeout::Forever).unwrap();
                locked.give();
                release.take(Timeout::Forever).unwrap();
                mutex.unlock().unwrap();
                // Donation is withdrawn the moment the lock is released.
                restored.store(
                    thread::effective_priority(Current::tid()) == Ok(20),
                    Ordering::SeqCst,
                );
            })
        };
        locked.take(Timeout::Forever).unwrap();
        let low_tid = low.tid();
        assert_eq!(thread::effective_priority(low_tid), Ok(20));

        let high = {
            let mutex = mutex.clone();
            kthread("high", 5, move || {
                mutex.lock(Timeout::Forever).unwrap();
                mutex.unlock().unwrap();
            })
        };
        // Let the high-priority thread park on the mutex.
        Current::sleep(10);
        assert_eq!(thread::get_state(high.tid()), Ok(kestrel::thread::ThreadState::Waiting));
        assert_eq!(
            thread::effective_priority(low_tid),
            Ok(5),
            "the holder runs at its most urgent waiter's priority"
        );

        release.give();
        assert_eq!(low.join(), 0);
        assert_eq!(high.join(), 0);
        assert!(restored.load(Ordering::SeqCst), "priority was not restored");
    });
}

#[test]
fn condvar_signal_wakes_at_most_one() {
    run("cv-signal", || {
        let mutex = Arc::new(Mutex::new());
        let cv = Arc::new(CondVar::new());
        let woken = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..3)
            .map(|i| {
                let (mutex, cv, woken) = (mutex.clone(), cv.clone(), woken.clone());
                kthread(&format!("cv-waiter-{i}"), 10, move || {
                    mutex.lock(Timeout::Forever).unwrap();
                    cv.wait(&mutex, Timeout::Forever).unwrap();
                    // The caller always leaves holding the mutex.
                    assert_eq!(mutex.holder(), Some(Current::tid()));
                    mutex.unlock().unwrap();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        Current::sleep(20);
        assert_eq!(woken.load(Ordering::SeqCst), 0);

        assert!(cv.signal());
        Current::sleep(20);
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        // Broadcast drains everyone pending at the instant of the call.
        assert_eq!(cv.broadcast(), 2);
        for waiter in waiters {
            assert_eq!(waiter.join(), 0);
        }
        assert_eq!(woken.load(Ordering::SeqCst), 3);
        // Nobody left; signalling is not buffered.
        assert!(!cv.signal());
    });
}

#[test]
fn condvar_timed_wait_reacquires_the_mutex() {
    run("cv-timeout", || {
        let mutex = Arc::new(Mutex::new());
        let cv = Arc::new(CondVar::new());

        mutex.lock(Timeout::Forever).unwrap();
        let before = kestrel::timeout::uptime_ticks();
        assert_eq!(
            cv.wait(&mutex, Timeout::Ticks(25)),
            Err(KernelError::TimedOut)
        );
        let elapsed = kestrel::timeout::uptime_ticks() - before;
        assert!(elapsed >= 25, "woke after {elapsed} ticks");
        // Timed out, yet the mutex is held again on the way out.
        assert_eq!(mutex.holder(), Some(Current::tid()));
        mutex.unlock().unwrap();
    });
}

#[test]
fn channel_passes_messages_in_order() {
    run("chan-order", || {
        let chan = Arc::new(Channel::new(2));
        let producer = {
            let chan = chan.clone();
            kthread("producer", 10, move || {
                for i in 0..16u32 {
                    chan.send(i, Timeout::Forever).map_err(|(_, e)| e).unwrap();
                }
            })
        };
        let mut received = Vec::new();
        for _ in 0..16 {
            received.push(chan.recv(Timeout::Forever).unwrap());
        }
        assert_eq!(producer.join(), 0);
        assert_eq!(received, (0..16u32).collect::<Vec<_>>());
        assert!(chan.is_empty());
    });
}

#[test]
fn channel_timeouts_and_capacity() {
    run("chan-timeout", || {
        let chan: Channel<u32> = Channel::new(2);
        assert_eq!(chan.capacity(), 2);
        assert_eq!(chan.recv(Timeout::NoWait), Err(KernelError::WouldBlock));
        assert_eq!(chan.recv(Timeout::Ticks(10)), Err(KernelError::TimedOut));

        chan.send(1, Timeout::Forever).map_err(|(_, e)| e).unwrap();
        chan.send(2, Timeout::Forever).map_err(|(_, e)| e).unwrap();
        // Full: a refused message comes back to the caller.
        match chan.send(3, Timeout::NoWait) {
            Err((item, KernelError::WouldBlock)) => assert_eq!(item, 3),
            other => panic!("unexpected send outcome: {:?}", other.map_err(|(_, e)| e)),
        }
        match chan.send(3, Timeout::Ticks(10)) {
            Err((item, KernelError::TimedOut)) => assert_eq!(item, 3),
            other => panic!("unexpected send outcome: {:?}", other.map_err(|(_, e)| e)),
        }
        assert_eq!(chan.recv(Timeout::Forever), Ok(1));
        assert_eq!(chan.recv(Timeout::Forever), Ok(2));
    });
}
