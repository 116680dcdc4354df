//! Standalone timers.
//!
//! A timer is a deadline (optionally recurring) carried by the same
//! timeout list as every thread wake-up, plus an expiry counter a thread
//! can consume or block on. Expiry runs outside the scheduler lock and
//! feeds the timer's semaphore, so the interrupt path never nests a
//! primitive lock inside the scheduler's.

use crate::sync::Semaphore;
use crate::thread::scheduler::kernel;
use crate::timeout::{self, TimeoutKey};
use crate::{KernelError, Timeout};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct TimerShared {
    expiries: Semaphore,
}

/// Kernel-side state of one timer, kept in the scheduler's registry.
pub(crate) struct TimerRecord {
    pub(crate) shared: Arc<TimerShared>,
    pub(crate) period: Option<u64>,
    pub(crate) armed: Option<TimeoutKey>,
}

/// A standalone one-shot or periodic timer.
pub struct Timer {
    id: u64,
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Creates a stopped timer.
    pub fn new() -> Self {
        static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::SeqCst),
            shared: Arc::new(TimerShared {
                expiries: Semaphore::new(0, u32::MAX),
            }),
        }
    }

    /// Arm the timer to expire `duration` ticks from now, then every
    /// `period` ticks if given. Re-arming a running timer replaces its
    /// deadline; pending unconsumed expiries stay consumable.
    pub fn start(&self, duration: u64, period: Option<u64>) {
        if let Some(period) = period {
            assert!(period > 0, "zero-period timer");
        }
        let mut ks = kernel().lock();
        let stale = match ks.timers.get_mut(&self.id) {
            Some(record) => {
                record.period = period;
                record.armed.take()
            }
            None => {
                ks.timers.insert(
                    self.id,
                    TimerRecord {
                        shared: self.shared.clone(),
                        period,
                        armed: None,
                    },
                );
                None
            }
        };
        if let Some(key) = stale {
            ks.timeouts.remove(key);
        }
        let key = timeout::add_timer_timeout_locked(&mut ks, self.id, duration);
        ks.timers.get_mut(&self.id).expect("timer record").armed = Some(key);
        timeout::program_next_locked(&mut ks);
        ks.unlock();
    }

    /// Disarm the timer. Expiries that already fired stay consumable; an
    /// expiry in flight at the instant of the call is suppressed.
    pub fn stop(&self) {
        let mut ks = kernel().lock();
        let stale = ks
            .timers
            .get_mut(&self.id)
            .and_then(|record| record.armed.take());
        if let Some(key) = stale {
            ks.timeouts.remove(key);
            timeout::program_next_locked(&mut ks);
        }
        ks.unlock();
    }

    /// Expiries that have fired and not been consumed yet.
    pub fn status(&self) -> u32 {
        self.shared.expiries.count()
    }

    /// Consume one expiry, waiting up to `timeout` for it.
    pub fn status_sync(&self, timeout: Timeout) -> Result<(), KernelError> {
        self.shared.expiries.take(timeout)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let mut ks = kernel().lock();
        if let Some(record) = ks.timers.remove(&self.id) {
            if let Some(key) = record.armed {
                ks.timeouts.remove(key);
                timeout::program_next_locked(&mut ks);
            }
        }
        ks.unlock();
    }
}

/// Deliver one expiry of `timer_id`, called by the announce path after it
/// released the scheduler lock. `key` identifies the deadline that fired;
/// a timer stopped or re-armed in the meantime is left alone.
pub(crate) fn expire(timer_id: u64, key: TimeoutKey) {
    let mut ks = kernel().lock();
    let Some(record) = ks.timers.get_mut(&timer_id) else {
        ks.unlock();
        return;
    };
    if record.armed != Some(key) {
        ks.unlock();
        return;
    }
    record.armed = None;
    let period = record.period;
    let shared = record.shared.clone();
    if let Some(period) = period {
        let next = timeout::add_timer_timeout_locked(&mut ks, timer_id, period);
        ks.timers.get_mut(&timer_id).expect("timer record").armed = Some(next);
    }
    timeout::program_next_locked(&mut ks);
    ks.unlock();
    shared.expiries.give();
}
