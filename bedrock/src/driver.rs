//! Driver seams for the machine's external collaborators.
//!
//! The portable kernel never touches hardware directly; it reaches the
//! platform through the small traits below, implemented once per target and
//! gathered into a [`Machine`] handed to the kernel at boot. This is a
//! static table, selected at link time: there is no registration protocol
//! and no teardown.

use alloc::boxed::Box;

/// The free-running system counter and its compare-match interrupt.
///
/// The counter is a wrapping `u32`; consumers must difference readings with
/// wrapping subtraction and never special-case the wrap. The compare
/// interrupt is wired to [`crate::interrupt::TIMER_VECTOR`]. These
/// registers are owned exclusively by the kernel's clock adapter.
pub trait SystemTimer: Send + Sync {
    /// Counter cycles per second.
    fn freq_hz(&self) -> u32;
    /// Current counter value.
    fn cycle_get(&self) -> u32;
    /// Program the compare register: fire the timer interrupt when the
    /// counter reaches `at` (absolute, wrapping).
    fn set_compare(&self, at: u32);
    /// Disarm the compare register; no timer interrupt until the next
    /// [`set_compare`](Self::set_compare).
    fn clear_compare(&self);
}

/// Per-vector interrupt controller operations.
///
/// Consumed only by the clock adapter and the IPI module; application
/// visible primitives never reach it.
pub trait InterruptController: Send + Sync {
    /// Unmask `vec` at the controller.
    fn enable(&self, vec: u32);
    /// Mask `vec` at the controller.
    fn disable(&self, vec: u32);
    /// Acknowledge completion of `vec`.
    fn ack(&self, vec: u32);
}

/// Platform low-power entry.
pub trait PowerControl: Send + Sync {
    /// Enter the given power state. Does not return until a wake event
    /// arrives. Called with interrupts masked.
    fn enter_state(&self, state: u8, substate: u8);
    /// Platform cleanup run immediately after wake, before interrupts are
    /// re-enabled.
    fn exit_post_ops(&self, state: u8, substate: u8);
    /// Shallow idle for when no table state qualifies: halt until the next
    /// wake event without any save/restore cost.
    fn idle(&self);
}

/// Cross-core signal sender.
pub trait IpiSender: Send + Sync {
    /// Deliver the reschedule IPI ([`crate::interrupt::IPI_VECTOR`]) to
    /// `core`.
    fn send(&self, core: usize);
}

/// Execution contexts and transfers between them.
///
/// A real port saves callee-saved registers and swaps stacks here; the
/// hosted machine parks and releases OS threads behind per-context gates.
/// The kernel guarantees it holds no spinlock across [`switch`], and that a
/// context passed to [`jump`] is never resumed.
///
/// [`switch`]: Self::switch
/// [`jump`]: Self::jump
pub trait ExecutionPort: Send + Sync {
    /// Create a fresh context that will run `entry` once first dispatched.
    fn create(&self, name: &str, entry: Box<dyn FnOnce() + Send>) -> PortContext;
    /// Transfer the CPU from `from` to `to`; returns when `from` is next
    /// dispatched.
    fn switch(&self, from: &PortContext, to: &PortContext);
    /// Dispatch `to` and abandon the calling context forever.
    fn jump(&self, to: &PortContext);
}

/// Saved execution state for one thread, owned by its control block.
#[cfg(feature = "sim")]
pub struct PortContext {
    pub(crate) gate: alloc::sync::Arc<crate::sim::Gate>,
}

/// Saved execution state for one thread, owned by its control block.
///
/// Without the hosted machine this is a bare stack-pointer cell for the
/// port's context-switch primitive to fill.
#[cfg(not(feature = "sim"))]
pub struct PortContext {
    /// Saved stack pointer, private to the port.
    pub sp: core::sync::atomic::AtomicUsize,
}

/// The platform, as one static table of collaborators.
#[derive(Clone, Copy)]
pub struct Machine {
    /// System counter / compare-match timer.
    pub timer: &'static dyn SystemTimer,
    /// Interrupt controller.
    pub intc: &'static dyn InterruptController,
    /// Low-power state entry.
    pub power: &'static dyn PowerControl,
    /// Cross-core signal sender.
    pub ipi: &'static dyn IpiSender,
    /// Context-transfer port.
    pub port: &'static dyn ExecutionPort,
}
