//! # Kestrel: a real-time kernel core.
//!
//! Kestrel is the scheduling and synchronization heart of a small real-time
//! operating system: a preemptive, priority-driven thread model, the wait
//! queue abstraction every blocking primitive is built on, a tickless clock
//! that turns a free-running hardware counter into logical ticks and
//! deadlines, and the power-state selection the idle path consults when
//! there is nothing to run.
//!
//! Everything that touches hardware lives behind the driver seams of the
//! [`bedrock`] crate: a platform implements the system timer, interrupt
//! controller, power control, IPI sender and execution port once, gathers
//! them into a [`Machine`], and hands that to [`boot`]. The kernel keeps
//! the hardware timer registers to itself (only the clock adapter programs
//! them) and consumes the interrupt controller only from the clock and IPI
//! modules; nothing application-visible reaches the machine directly.
//!
//! ## Layering
//!
//! Leaf to root:
//!
//! 1. [`sync::SpinLock`]: interrupt masking plus an atomic flag.
//! 2. [`sync::WaitQueue`]: ordered parking of blocked threads.
//! 3. [`timeout`]: deadline-ordered pending timeouts.
//! 4. [`thread::scheduler`]: the per-core ready structure and dispatch.
//! 5. [`sync::Semaphore`], [`sync::Mutex`], [`sync::CondVar`],
//!    [`sync::Channel`]: blocking primitives over wait queues.
//! 6. [`clock`]: the tickless adapter over the hardware counter.
//! 7. [`power`]: idle-state selection and the enter/exit dance.
//! 8. [`ipi`]: cross-core reschedule kicks.
//!
//! ## Contexts
//!
//! Code runs either in a kernel thread or in an interrupt handler.
//! Handlers receive a [`bedrock::interrupt::IsrContext`] token and may only
//! wake: `give`, `unpend_first`, `unpend_all`, `announce`. Every operation
//! that can block panics when entered from interrupt context; that is a
//! programming defect, not a recoverable condition. Timing outcomes
//! ([`KernelError::TimedOut`]) and unavailable resources
//! ([`KernelError::WouldBlock`]) are ordinary return values.
//!
//! [`Machine`]: bedrock::driver::Machine

#![cfg_attr(not(feature = "std"), no_std)]
#![allow(static_mut_refs)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod clock;
pub mod ipi;
pub mod power;
pub mod sync;
pub mod thread;
pub mod timeout;
pub mod timer;

pub use bedrock::MAX_CPU;
use bedrock::driver::Machine;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use power::PowerState;

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// during a kernel operation, with the discriminant carrying the
/// errno-style code the value converts to. Only *recoverable* conditions
/// appear here; misuse of the API (blocking from interrupt context,
/// unbalanced guard drops, releasing a spinlock guard without `unlock`)
/// is a programming defect and panics instead of returning.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum KernelError {
    /// Operation is not permitted, such as releasing a lock the caller
    /// does not hold. (EPERM)
    NotOwner = -1,
    /// No thread with the given id exists. (ESRCH)
    NoSuchThread = -3,
    /// The resource is unavailable and the caller asked not to wait.
    /// (EAGAIN)
    WouldBlock = -11,
    /// The target is in a state that does not admit the operation right
    /// now. (EBUSY)
    Busy = -16,
    /// Invalid argument. (EINVAL)
    InvalidArgument = -22,
    /// The waiting period elapsed before the event arrived. (ETIMEDOUT)
    TimedOut = -110,
    /// The wait was torn down under the caller, typically by
    /// [`thread::abort`]. (ECANCELED)
    Cancelled = -125,
}

impl KernelError {
    /// The errno-style code of this error.
    pub fn code(self) -> i32 {
        self.into()
    }
}

/// How long a blocking operation is willing to wait.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Timeout {
    /// Do not wait: fail with [`KernelError::WouldBlock`] if the resource
    /// is unavailable.
    NoWait,
    /// Wait up to this many ticks, then fail with
    /// [`KernelError::TimedOut`].
    Ticks(u64),
    /// Wait until the event arrives.
    Forever,
}

/// Boot-time kernel configuration.
///
/// Built once, consumed by [`boot`], and never mutated afterwards.
#[derive(Clone, Copy)]
pub struct KernelConfig {
    /// Logical ticks per second the clock adapter announces.
    pub ticks_per_sec: u32,
    /// Ticks a thread may run before rotating behind an equal-priority
    /// peer; `0` disables time slicing.
    pub timeslice_ticks: u32,
    /// Number of cores the scheduler serves, at most [`MAX_CPU`].
    pub cpus: usize,
    /// Idle states available to every core, ordered shallowest first.
    pub power_states: &'static [PowerState],
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ticks_per_sec: 1_000,
            timeslice_ticks: 0,
            cpus: 1,
            power_states: &[],
        }
    }
}

static mut MACHINE: Option<Machine> = None;
static mut CONFIG: KernelConfig = KernelConfig {
    ticks_per_sec: 1_000,
    timeslice_ticks: 0,
    cpus: 1,
    power_states: &[],
};

/// The machine this kernel was booted on. Panics before [`boot`].
pub(crate) fn machine() -> Machine {
    unsafe { MACHINE.expect("kernel not booted") }
}

/// The configuration the kernel was booted with.
pub(crate) fn config() -> KernelConfig {
    unsafe { CONFIG }
}

/// A builder for system configuration settings.
///
/// Passed through the `configure` hook of [`boot`] so the platform can
/// adjust system-wide parameters before the first thread runs. Cannot be
/// constructed elsewhere.
pub struct SystemConfigurationBuilder {
    config: KernelConfig,
}

impl SystemConfigurationBuilder {
    /// Sets the logical tick rate.
    pub fn set_tick_rate(mut self, ticks_per_sec: u32) -> Self {
        assert!(ticks_per_sec > 0, "tick rate must be nonzero");
        self.config.ticks_per_sec = ticks_per_sec;
        self
    }

    /// Sets the round-robin time slice, in ticks. `0` disables slicing.
    pub fn set_timeslice(mut self, ticks: u32) -> Self {
        self.config.timeslice_ticks = ticks;
        self
    }

    /// Sets the idle-state table shared by all cores, ordered shallowest
    /// first.
    pub fn set_power_states(mut self, states: &'static [PowerState]) -> Self {
        self.config.power_states = states;
        self
    }

    /// Sets the number of active cores.
    pub fn set_cpus(mut self, cpus: usize) -> Self {
        assert!(cpus >= 1 && cpus <= MAX_CPU, "unsupported core count");
        self.config.cpus = cpus;
        self
    }

    fn finish(self) -> KernelConfig {
        self.config
    }
}

/// Bring the kernel up on `machine`.
///
/// Stores the machine table, validates and installs the power-state
/// configuration, wires the clock and IPI interrupt handlers, and starts
/// the per-core idle threads. The caller's context does not become a
/// kernel thread; it creates them through [`thread::ThreadBuilder`]
/// afterwards.
///
/// Booting twice panics.
pub fn boot(
    machine: Machine,
    configure: impl FnOnce(SystemConfigurationBuilder) -> SystemConfigurationBuilder,
) {
    unsafe {
        assert!(MACHINE.is_none(), "kernel booted twice");
        MACHINE = Some(machine);
    }
    let config = configure(SystemConfigurationBuilder {
        config: KernelConfig::default(),
    })
    .finish();
    unsafe {
        CONFIG = config;
    }

    log::info!(
        "kestrel: booting, {} tick/s, {} core(s), timeslice {} tick(s)",
        config.ticks_per_sec,
        config.cpus,
        config.timeslice_ticks
    );

    power::init(&config);
    thread::scheduler::init(&config);
    clock::init(&config);
    ipi::init();
    thread::scheduler::start_idle_threads(&config);

    log::info!("kestrel: up");
}
