//! A hosted machine.
//!
//! Implements the whole [`driver`] surface on top of `std`, so the kernel
//! can boot and run inside an ordinary process: kernel threads ride on OS
//! threads that are parked behind per-context [`Gate`]s and released only
//! when the scheduler dispatches them, the system counter is derived from a
//! monotonic host clock at one cycle per microsecond, and the compare-match
//! interrupt is raised by a dedicated timer thread through the ordinary
//! [`interrupt::dispatch`] path (so masking and pending semantics are the
//! same ones a real controller would give).
//!
//! [`driver`]: crate::driver

use crate::driver::{
    ExecutionPort, InterruptController, IpiSender, Machine, PortContext, PowerControl, SystemTimer,
};
use crate::interrupt::{self, TIMER_VECTOR};
use alloc::boxed::Box;
use alloc::sync::Arc;
use std::{
    collections::BTreeSet,
    sync::{Condvar, Mutex, Once, OnceLock},
    thread,
    time::{Duration, Instant},
};

/// A binary latch a parked context blocks on until dispatched.
pub(crate) struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn open(&self) {
        let mut open = self.open.lock().unwrap();
        *open = true;
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
        *open = false;
    }
}

struct WakeEvents {
    pending: Mutex<u64>,
    cv: Condvar,
}

static WAKE: WakeEvents = WakeEvents {
    pending: Mutex::new(0),
    cv: Condvar::new(),
};

/// Record a wake event and release anything blocked in
/// [`PowerControl::enter_state`] / [`PowerControl::idle`].
pub(crate) fn raise_wake_event() {
    let mut pending = WAKE.pending.lock().unwrap();
    *pending += 1;
    WAKE.cv.notify_all();
}

fn wait_wake_event() {
    let mut pending = WAKE.pending.lock().unwrap();
    while *pending == 0 {
        pending = WAKE.cv.wait(pending).unwrap();
    }
    *pending = 0;
}

/// The hosted system counter: one cycle per microsecond of host time.
pub struct SimTimer {
    epoch: Instant,
    compare: Mutex<Option<u32>>,
    cv: Condvar,
}

impl SimTimer {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            compare: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn run(&self) {
        let mut compare = self.compare.lock().unwrap();
        loop {
            let Some(at) = *compare else {
                compare = self.cv.wait(compare).unwrap();
                continue;
            };
            let until = at.wrapping_sub(self.cycle_get());
            // A "deadline" more than half the counter period away is one
            // that already passed and wrapped.
            if until == 0 || until > u32::MAX / 2 {
                *compare = None;
                drop(compare);
                interrupt::dispatch(TIMER_VECTOR);
                compare = self.compare.lock().unwrap();
            } else {
                let (guard, _) = self
                    .cv
                    .wait_timeout(compare, Duration::from_micros(u64::from(until)))
                    .unwrap();
                compare = guard;
            }
        }
    }
}

impl SystemTimer for SimTimer {
    fn freq_hz(&self) -> u32 {
        1_000_000
    }

    fn cycle_get(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }

    fn set_compare(&self, at: u32) {
        let mut compare = self.compare.lock().unwrap();
        *compare = Some(at);
        self.cv.notify_all();
    }

    fn clear_compare(&self) {
        let mut compare = self.compare.lock().unwrap();
        *compare = None;
        self.cv.notify_all();
    }
}

/// Hosted interrupt controller: bookkeeping only, since delivery goes
/// through [`interrupt::dispatch`] anyway.
pub struct SimIntc {
    enabled: Mutex<BTreeSet<u32>>,
    acks: Mutex<u64>,
}

impl SimIntc {
    fn new() -> Self {
        Self {
            enabled: Mutex::new(BTreeSet::new()),
            acks: Mutex::new(0),
        }
    }

    /// Number of acknowledgements seen, for tests.
    pub fn ack_count(&self) -> u64 {
        *self.acks.lock().unwrap()
    }

    /// Whether `vec` is unmasked at the controller, for tests.
    pub fn is_enabled(&self, vec: u32) -> bool {
        self.enabled.lock().unwrap().contains(&vec)
    }
}

impl InterruptController for SimIntc {
    fn enable(&self, vec: u32) {
        self.enabled.lock().unwrap().insert(vec);
    }

    fn disable(&self, vec: u32) {
        self.enabled.lock().unwrap().remove(&vec);
    }

    fn ack(&self, _vec: u32) {
        *self.acks.lock().unwrap() += 1;
    }
}

/// One observed power transition.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PowerEvent {
    /// `enter_state(state, substate)` was called.
    Entered(u8, u8),
    /// `exit_post_ops(state, substate)` was called.
    Exited(u8, u8),
}

/// Hosted power control: "sleeping" blocks on the wake-event latch.
pub struct SimPower {
    history: Mutex<Vec<PowerEvent>>,
}

impl SimPower {
    fn new() -> Self {
        Self {
            history: Mutex::new(Vec::new()),
        }
    }

    /// Every transition observed so far, for tests.
    pub fn history(&self) -> Vec<PowerEvent> {
        self.history.lock().unwrap().clone()
    }
}

impl PowerControl for SimPower {
    fn enter_state(&self, state: u8, substate: u8) {
        self.history
            .lock()
            .unwrap()
            .push(PowerEvent::Entered(state, substate));
        wait_wake_event();
    }

    fn exit_post_ops(&self, state: u8, substate: u8) {
        self.history
            .lock()
            .unwrap()
            .push(PowerEvent::Exited(state, substate));
    }

    fn idle(&self) {
        wait_wake_event();
    }
}

/// Hosted IPI sender: delivery is immediate and in-line.
pub struct SimIpi {
    sent: Mutex<Vec<usize>>,
}

impl SimIpi {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Cores signalled so far, in order, for tests.
    pub fn sent(&self) -> Vec<usize> {
        self.sent.lock().unwrap().clone()
    }
}

impl IpiSender for SimIpi {
    fn send(&self, core: usize) {
        self.sent.lock().unwrap().push(core);
        interrupt::dispatch(interrupt::IPI_VECTOR);
    }
}

/// Hosted execution port: one OS thread per context, gated.
pub struct SimPort;

impl ExecutionPort for SimPort {
    fn create(&self, name: &str, entry: Box<dyn FnOnce() + Send>) -> PortContext {
        let gate = Arc::new(Gate::new());
        let parked = gate.clone();
        thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                parked.wait();
                entry();
            })
            .expect("failed to back a kernel thread with a host thread");
        PortContext { gate }
    }

    fn switch(&self, from: &PortContext, to: &PortContext) {
        to.gate.open();
        from.gate.wait();
    }

    fn jump(&self, to: &PortContext) {
        to.gate.open();
    }
}

struct SimLogger;

impl log::Log for SimLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:>5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static SIM_LOGGER: SimLogger = SimLogger;

/// The full hosted machine, with its concrete parts exposed so tests can
/// poke at the bookkeeping the trait objects hide.
pub struct HostedMachine {
    /// System counter.
    pub timer: SimTimer,
    /// Interrupt controller.
    pub intc: SimIntc,
    /// Power control.
    pub power: SimPower,
    /// IPI sender.
    pub ipi: SimIpi,
    /// Execution port.
    pub port: SimPort,
}

static HOSTED: OnceLock<HostedMachine> = OnceLock::new();
static TIMER_THREAD: Once = Once::new();

/// The process-wide hosted machine, created on first use.
pub fn hosted() -> &'static HostedMachine {
    let machine = HOSTED.get_or_init(|| {
        let _ = log::set_logger(&SIM_LOGGER);
        log::set_max_level(log::LevelFilter::Info);
        HostedMachine {
            timer: SimTimer::new(),
            intc: SimIntc::new(),
            power: SimPower::new(),
            ipi: SimIpi::new(),
            port: SimPort,
        }
    });
    TIMER_THREAD.call_once(|| {
        thread::Builder::new()
            .name("sim-timer".into())
            .spawn(move || machine.timer.run())
            .expect("failed to start the hosted timer");
    });
    machine
}

/// The hosted machine as a [`Machine`] table for [`kestrel`]'s boot path.
///
/// [`kestrel`]: ../../kestrel/index.html
pub fn machine() -> Machine {
    let hosted = hosted();
    Machine {
        timer: &hosted.timer,
        intc: &hosted.intc,
        power: &hosted.power,
        ipi: &hosted.ipi,
        port: &hosted.port,
    }
}
