//! The bedrock the kernel stands on: everything that faces the machine.
//!
//! This crate holds the pieces of the kernel that are about the *machine*
//! rather than about scheduling policy: the raw spinlock, the logical
//! interrupt mask and vector dispatch, and the driver seams (system timer,
//! interrupt controller, power control, IPI sender, execution port) through
//! which the portable kernel reaches the platform.
//!
//! A real target implements the [`driver`] traits once per platform and
//! hands the kernel a [`driver::Machine`] at boot. The `sim` feature
//! provides a hosted implementation of the whole machine, which is what
//! the test suite runs against: kernel threads ride on OS threads behind
//! the scheduler's gates, and the system timer is a host timer thread.
#![cfg_attr(not(feature = "std"), no_std)]
#![allow(static_mut_refs)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod driver;
pub mod interrupt;
#[cfg(feature = "sim")]
pub mod sim;
pub mod spinlock;

/// Maximum number of CPU the kernel can support.
pub const MAX_CPU: usize = 4;

static mut CPU_ID_FN: fn() -> usize = || 0;

/// Identifier of the calling core.
///
/// Defaults to core 0 until a resolver is installed; the hosted machine
/// never installs one, a real SMP port does so in early boot.
#[inline]
pub fn cpu_id() -> usize {
    unsafe { CPU_ID_FN() }
}

/// Install the per-core identifier resolver.
///
/// # Safety
/// Must be called once, before any secondary core starts running kernel
/// code.
pub unsafe fn set_cpu_id_resolver(f: fn() -> usize) {
    unsafe {
        CPU_ID_FN = f;
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    // The logical interrupt mask is per-core and every host test thread
    // reports as core 0, so tests that assert on it must not overlap.
    pub static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
}

/// Signal the platform that a scheduling-relevant event occurred.
///
/// On real hardware this is implicit: wake events arrive as interrupts and
/// pop an idle core out of its low-power state. The hosted machine has no
/// hardware to do that, so the kernel calls this after readying a thread
/// from interrupt or foreign context; it releases a core blocked in
/// [`driver::PowerControl::enter_state`].
pub fn wake_event() {
    #[cfg(feature = "sim")]
    sim::raise_wake_event();
}
