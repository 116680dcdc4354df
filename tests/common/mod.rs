//! Shared bring-up for the integration tests.
//!
//! Kernel threads must never block on host-side primitives (a parked
//! kernel thread holds no core, but a host mutex would stall whoever runs
//! on it), so tests communicate through atomics and the kernel's own
//! primitives only. The harness threads themselves stay foreign: they only
//! spawn kernel threads and poll-join them.
#![allow(dead_code)]

use kestrel::power::PowerState;
use kestrel::thread::{JoinHandle, ThreadBuilder};
use std::sync::Once;

/// Idle states used by every test process: a shallow doze and a deep stop.
pub static POWER_STATES: [PowerState; 2] = [
    PowerState {
        state: 1,
        substate: 0,
        min_residency: 5,
        exit_latency: 1,
    },
    PowerState {
        state: 3,
        substate: 0,
        min_residency: 50,
        exit_latency: 5,
    },
];

/// Bring the kernel up once per test process: 1000 ticks/s on the hosted
/// 1 MHz counter, 10-tick time slices.
pub fn boot() {
    static BOOT: Once = Once::new();
    BOOT.call_once(|| {
        kestrel::boot(bedrock::sim::machine(), |config| {
            config
                .set_tick_rate(1_000)
                .set_timeslice(10)
                .set_power_states(&POWER_STATES)
        });
    });
}

/// Spawn a kernel thread at `prio` running `f`.
pub fn kthread(name: &str, prio: i8, f: impl FnOnce() + Send + 'static) -> JoinHandle {
    ThreadBuilder::new(name).priority(prio).spawn(f)
}

/// Run `f` as a kernel thread and propagate its failure.
pub fn run(name: &str, f: impl FnOnce() + Send + 'static) {
    boot();
    let code = kthread(name, 0, f).join();
    assert_eq!(code, 0, "kernel thread {name} failed with exit code {code}");
}
