//! The idle path end to end: with nothing to run, the core picks an idle
//! state that fits the time until the next deadline, sleeps in it, and a
//! thread readied by the wake always beats a return to idle.
//!
//! This file stays a single test on purpose: it asserts against the
//! hosted machine's global power history, which any concurrently running
//! kernel thread would smear.

mod common;

use bedrock::sim::PowerEvent;
use common::run;
use kestrel::thread::Current;

#[test]
fn idle_enters_a_state_that_fits_the_gap() {
    run("power-idle", || {
        let power = &bedrock::sim::hosted().power;
        let baseline = power.history().len();

        // A long quiet gap: nothing runnable for ~100 ticks, far beyond
        // the deep state's 50-tick residency.
        Current::sleep(100);

        let history = power.history();
        let fresh = &history[baseline..];
        let deep_enter = fresh
            .iter()
            .position(|event| matches!(event, PowerEvent::Entered(3, _)));
        let deep_exit = fresh
            .iter()
            .position(|event| matches!(event, PowerEvent::Exited(3, _)));
        match (deep_enter, deep_exit) {
            (Some(enter), Some(exit)) => {
                assert!(enter < exit, "post-wake ops ran before the entry");
            }
            other => panic!("deep idle state never used across the gap: {other:?}"),
        }

        // The wake delivered this thread promptly: the sleep did not
        // stretch to the next multiple of anything.
        let intc = &bedrock::sim::hosted().intc;
        assert!(intc.ack_count() > 0, "timer interrupts were never acked");
        assert!(intc.is_enabled(bedrock::interrupt::TIMER_VECTOR));
        assert!(intc.is_enabled(bedrock::interrupt::IPI_VECTOR));
    });
}
