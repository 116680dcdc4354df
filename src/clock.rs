//! The tickless clock adapter.
//!
//! Translates the machine's free-running cycle counter into logical ticks.
//! `last_count` always sits on the cycle boundary of the last announced
//! tick, so every conversion is a wrapping subtraction from there; counter
//! wrap-around needs no special casing. The compare register is programmed
//! only for the next interesting deadline, never periodically, and is
//! owned exclusively by this module.

use crate::sync::spinlock::SpinLock;
use bedrock::interrupt::{self, IsrContext, TIMER_VECTOR};

/// Never program a compare this close to "now"; a nearer deadline would
/// risk the counter passing the compare before the write lands.
const MIN_DELAY_CYCLES: u32 = 16;

struct ClockState {
    last_count: u32,
    cycles_per_tick: u32,
}

static CLOCK: SpinLock<ClockState> = SpinLock::new(ClockState {
    last_count: 0,
    cycles_per_tick: 0,
});

/// Whole ticks between `last` and `now`, and the new boundary after
/// consuming them. Wrapping arithmetic; `now` may have wrapped past zero.
fn tick_delta(last: u32, now: u32, cycles_per_tick: u32) -> (u64, u32) {
    let ticks = now.wrapping_sub(last) / cycles_per_tick;
    (
        u64::from(ticks),
        last.wrapping_add(ticks.wrapping_mul(cycles_per_tick)),
    )
}

pub(crate) fn init(config: &crate::KernelConfig) {
    let freq = crate::machine().timer.freq_hz();
    let cycles_per_tick = freq / config.ticks_per_sec;
    assert!(
        cycles_per_tick > 0,
        "tick rate {} above the counter frequency {freq}",
        config.ticks_per_sec
    );
    let mut clock = CLOCK.lock();
    clock.cycles_per_tick = cycles_per_tick;
    clock.last_count = crate::machine().timer.cycle_get();
    clock.unlock();

    interrupt::register(TIMER_VECTOR, compare_isr);
    crate::machine().intc.enable(TIMER_VECTOR);
    log::debug!("clock: {cycles_per_tick} cycles per tick");
}

/// The compare-match handler: convert elapsed cycles into whole ticks and
/// announce them. A spurious or early interrupt announces zero ticks,
/// which merely reprograms the compare.
fn compare_isr(_isr: &IsrContext) {
    crate::machine().intc.ack(TIMER_VECTOR);
    let delta = advance();
    crate::timeout::announce(delta);
}

/// Consume whole elapsed ticks: advance the boundary and return how many
/// passed. Repeated calls never double-count a cycle.
fn advance() -> u64 {
    let mut clock = CLOCK.lock();
    let now = crate::machine().timer.cycle_get();
    let (ticks, boundary) = tick_delta(clock.last_count, now, clock.cycles_per_tick);
    clock.last_count = boundary;
    clock.unlock();
    ticks
}

/// Ticks elapsed since the last announced boundary, without consuming
/// them. Zero immediately after an announce.
pub fn elapsed() -> u64 {
    let clock = CLOCK.lock();
    let now = crate::machine().timer.cycle_get();
    let (ticks, _) = tick_delta(clock.last_count, now, clock.cycles_per_tick);
    clock.unlock();
    ticks
}

/// Raw cycle counter value.
pub fn cycle_get() -> u32 {
    crate::machine().timer.cycle_get()
}

/// Program the compare register to fire `ticks` ticks after the last
/// announced boundary.
///
/// The deadline lands on a whole tick boundary (requests round up), is
/// clamped to half the counter period so wrapping comparisons stay
/// unambiguous, and never lands closer than the minimum delay floor.
pub(crate) fn set_timeout(ticks: u64) {
    let clock = CLOCK.lock();
    let cycles_per_tick = clock.cycles_per_tick;
    assert!(cycles_per_tick > 0, "clock used before init");
    let horizon = u64::from(u32::MAX / 2 / cycles_per_tick);
    let ticks = ticks.clamp(1, horizon) as u32;
    let mut target = clock
        .last_count
        .wrapping_add(ticks.wrapping_mul(cycles_per_tick));

    let now = crate::machine().timer.cycle_get();
    let lead = target.wrapping_sub(now);
    if lead < MIN_DELAY_CYCLES || lead > u32::MAX / 2 {
        target = now.wrapping_add(MIN_DELAY_CYCLES);
    }
    crate::machine().timer.set_compare(target);
    clock.unlock();
}

/// Disarm the compare register; nothing is due.
pub(crate) fn clear_timeout() {
    crate::machine().timer.clear_compare();
}

#[cfg(test)]
mod tests {
    use super::tick_delta;

    #[test]
    fn whole_ticks_only() {
        let (ticks, boundary) = tick_delta(1_000, 3_999, 1_000);
        assert_eq!(ticks, 2);
        assert_eq!(boundary, 3_000);
        // The remainder is still there for the next reading.
        let (ticks, boundary) = tick_delta(boundary, 4_000, 1_000);
        assert_eq!(ticks, 1);
        assert_eq!(boundary, 4_000);
    }

    #[test]
    fn immediate_reread_is_zero() {
        let (ticks, boundary) = tick_delta(5_000, 7_400, 1_000);
        assert_eq!(ticks, 2);
        let (ticks, _) = tick_delta(boundary, 7_400, 1_000);
        assert_eq!(ticks, 0);
    }

    #[test]
    fn counter_wrap_is_plain_subtraction() {
        let last = u32::MAX - 1_500;
        let now = 2_499u32; // 4000 cycles later, past the wrap
        let (ticks, boundary) = tick_delta(last, now, 1_000);
        assert_eq!(ticks, 4);
        assert_eq!(boundary, last.wrapping_add(4_000));
        let (rest, _) = tick_delta(boundary, now, 1_000);
        assert_eq!(rest, 0);
    }
}
