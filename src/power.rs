//! CPU idle-state selection.
//!
//! Each core carries an ordered table of idle states, built once at boot
//! and never mutated. Selection is by residency: the deepest state whose
//! minimum residency fits inside the time until the next scheduled event.
//! A state whose exit costs more than it can ever save
//! (`min_residency < exit_latency`) is a configuration defect and is
//! rejected during init, not discovered at runtime.

use crate::sync::spinlock::SpinLock;
use arrayvec::ArrayVec;
use bedrock::interrupt::InterruptGuard;

/// Maximum idle states per core.
pub const MAX_POWER_STATES: usize = 8;

/// One CPU idle state.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct PowerState {
    /// Platform state id, passed through to the machine.
    pub state: u8,
    /// Platform substate id.
    pub substate: u8,
    /// Shortest idle period, in ticks, for which entering is worthwhile.
    pub min_residency: u32,
    /// Ticks it costs to leave the state again.
    pub exit_latency: u32,
}

type Table = ArrayVec<PowerState, MAX_POWER_STATES>;

static TABLES: SpinLock<[Table; crate::MAX_CPU]> =
    SpinLock::new([const { ArrayVec::new_const() }; crate::MAX_CPU]);

pub(crate) fn init(config: &crate::KernelConfig) {
    let mut previous = 0u32;
    for state in config.power_states {
        assert!(
            state.min_residency >= state.exit_latency,
            "power state {}.{}: min_residency {} below exit_latency {}",
            state.state,
            state.substate,
            state.min_residency,
            state.exit_latency
        );
        assert!(
            state.min_residency >= previous,
            "power states must be ordered shallowest first"
        );
        previous = state.min_residency;
    }
    let mut tables = TABLES.lock();
    for cpu in 0..config.cpus {
        tables[cpu].clear();
        tables[cpu]
            .try_extend_from_slice(config.power_states)
            .expect("too many power states");
    }
    tables.unlock();
    log::debug!(
        "power: {} idle state(s) per core",
        config.power_states.len()
    );
}

/// The deepest idle state of `core` whose minimum residency fits within
/// `ticks_until_next_event`, or `None` when no state qualifies and the
/// core should halt shallowly. `None` for the deadline means nothing is
/// scheduled at all.
pub fn next_state(core: usize, ticks_until_next_event: Option<u64>) -> Option<PowerState> {
    let tables = TABLES.lock();
    let picked = tables[core]
        .iter()
        .rev()
        .find(|state| match ticks_until_next_event {
            None => true,
            Some(ticks) => u64::from(state.min_residency) <= ticks,
        })
        .copied();
    tables.unlock();
    picked
}

/// The idle path: pick a state and sleep in it until a wake event.
///
/// Interrupts are masked across entry so a wake cannot slip between
/// selection and entry; the platform's post-wake cleanup runs before they
/// are re-enabled, and any interrupt pended during the sleep is delivered
/// at the unmask. Readiness is re-evaluated by the idle loop afterwards,
/// so a thread woken by the wake event always beats a return to idle.
pub(crate) fn idle(core: usize, ticks_until_next_event: Option<u64>) {
    match next_state(core, ticks_until_next_event) {
        Some(state) => {
            let guard = InterruptGuard::new();
            let machine = crate::machine();
            log::trace!("core {core}: entering state {}.{}", state.state, state.substate);
            machine.power.enter_state(state.state, state.substate);
            machine.power.exit_post_ops(state.state, state.substate);
            drop(guard);
        }
        None => crate::machine().power.idle(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> &'static [PowerState] {
        &[
            PowerState {
                state: 1,
                substate: 0,
                min_residency: 2,
                exit_latency: 1,
            },
            PowerState {
                state: 2,
                substate: 0,
                min_residency: 10,
                exit_latency: 4,
            },
            PowerState {
                state: 3,
                substate: 1,
                min_residency: 100,
                exit_latency: 20,
            },
        ]
    }

    fn install() {
        let mut tables = TABLES.lock();
        tables[0].clear();
        tables[0].try_extend_from_slice(table()).unwrap();
        tables.unlock();
    }

    #[test]
    fn selection_by_residency() {
        install();
        assert_eq!(next_state(0, Some(1)), None);
        assert_eq!(next_state(0, Some(2)).unwrap().state, 1);
        assert_eq!(next_state(0, Some(9)).unwrap().state, 1);
        assert_eq!(next_state(0, Some(10)).unwrap().state, 2);
        assert_eq!(next_state(0, Some(99)).unwrap().state, 2);
        assert_eq!(next_state(0, Some(100)).unwrap().state, 3);
    }

    #[test]
    fn no_deadline_means_deepest() {
        install();
        assert_eq!(next_state(0, None).unwrap().state, 3);
    }

    #[test]
    fn selection_never_overshoots_the_deadline() {
        install();
        for ticks in 0..200u64 {
            if let Some(state) = next_state(0, Some(ticks)) {
                assert!(u64::from(state.min_residency) <= ticks);
            }
        }
    }
}
