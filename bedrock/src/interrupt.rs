//! Interrupt management.
//!
//! The kernel's view of interrupts is deliberately small: a per-core
//! logical mask with nested save/restore ([`InterruptGuard`]), a dispatch
//! table of vector handlers, and a per-core ISR depth that lets the rest of
//! the kernel ask "am I in interrupt context?". Handlers receive an
//! [`IsrContext`] token; the blocking half of the kernel API is simply not
//! reachable from one.
//!
//! Interrupts that fire while the local core is masked (or while another
//! handler runs) are queued and delivered when the mask is lifted, the same
//! way a hardware interrupt controller holds a pended line.

use crate::spinlock::SpinLock;
use alloc::{collections::btree_set::BTreeSet, sync::Arc};
use core::{
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering},
};

/// Vector the system timer's compare-match interrupt is wired to.
pub const TIMER_VECTOR: u32 = 32;
/// Vector the cross-core reschedule interrupt is wired to.
pub const IPI_VECTOR: u32 = 127;

const VECTOR_BASE: u32 = 32;
const NUM_VECTORS: usize = 224;

struct CoreState {
    masked: AtomicBool,
    initial_state: AtomicBool,
    cnt: AtomicIsize,
    isr_depth: AtomicUsize,
    delivering: AtomicBool,
}

impl CoreState {
    const fn new() -> Self {
        Self {
            masked: AtomicBool::new(false),
            initial_state: AtomicBool::new(true),
            cnt: AtomicIsize::new(0),
            isr_depth: AtomicUsize::new(0),
            delivering: AtomicBool::new(false),
        }
    }

    fn save_nested_interrupt_state(&self, state: InterruptState) {
        if self.cnt.fetch_add(1, Ordering::SeqCst) == 0 {
            self.initial_state
                .store(state == InterruptState::On, Ordering::SeqCst);
        }
    }

    fn load_nested_interrupt_state(&self) {
        let prev = self.cnt.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "Mismatched InterruptGuard drop calls: {prev}");

        if prev == 1 && self.initial_state.load(Ordering::SeqCst) {
            unsafe { InterruptState::enable() };
        }
    }
}

static PER_CORE_STATE: [CoreState; crate::MAX_CPU] = [const { CoreState::new() }; crate::MAX_CPU];

static mut MASK_HOOKS: Option<(fn(), fn())> = None;

/// Install the platform's low-level mask primitives (disable, enable).
///
/// The logical per-core mask works without them; a real port installs the
/// actual `cpsid`/`cli`-style pair here in early boot. The hosted machine
/// installs none.
///
/// # Safety
/// Must be called before any interrupt can be taken.
pub unsafe fn set_mask_hooks(disable: fn(), enable: fn()) {
    unsafe {
        MASK_HOOKS = Some((disable, enable));
    }
}

/// Enumeration representing the interrupt state of the local core.
#[derive(PartialEq, Eq, Debug)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Reads the current interrupt state of the calling core.
    pub fn current() -> Self {
        if PER_CORE_STATE[crate::cpu_id()]
            .masked
            .load(Ordering::SeqCst)
        {
            Self::Off
        } else {
            Self::On
        }
    }

    /// Unmask interrupts on the calling core and deliver anything pended
    /// while they were masked.
    ///
    /// # Safety
    /// The caller must not be inside a critical section that relies on the
    /// mask.
    pub unsafe fn enable() {
        PER_CORE_STATE[crate::cpu_id()]
            .masked
            .store(false, Ordering::SeqCst);
        if let Some((_, enable)) = unsafe { MASK_HOOKS } {
            enable();
        }
        deliver_pending();
    }

    /// Mask interrupts on the calling core.
    ///
    /// # Safety
    /// Must be balanced with [`InterruptState::enable`]; prefer
    /// [`InterruptGuard`].
    pub unsafe fn disable() {
        if let Some((disable, _)) = unsafe { MASK_HOOKS } {
            disable();
        }
        PER_CORE_STATE[crate::cpu_id()]
            .masked
            .store(true, Ordering::SeqCst);
    }
}

/// An RAII-based guard for managing interrupt disabling.
///
/// When an `InterruptGuard` is created, interrupts are disabled on the
/// local core. When it is dropped, the interrupt state is restored to what
/// it was before the guard was created.
///
/// **Important:** guards **must be dropped in reverse order of their
/// creation**. Due to Rust's ownership and scoping rules, this invariant is
/// naturally upheld unless `drop()` is explicitly called prematurely or a
/// guard is stored in a struct field.
pub struct InterruptGuard {
    core_id: usize,
    _not_send: PhantomData<*mut ()>,
}

impl InterruptGuard {
    /// Creates a new `InterruptGuard`, disabling interrupts on the calling
    /// core.
    pub fn new() -> Self {
        let state = InterruptState::current();
        unsafe { InterruptState::disable() };
        core::sync::atomic::fence(Ordering::SeqCst);

        let core_id = crate::cpu_id();
        PER_CORE_STATE[core_id].save_nested_interrupt_state(state);

        Self {
            core_id,
            _not_send: PhantomData,
        }
    }

    /// Whether the calling core currently holds at least one guard.
    pub fn is_guarded() -> bool {
        PER_CORE_STATE[crate::cpu_id()].cnt.load(Ordering::SeqCst) > 0
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        assert_eq!(
            self.core_id,
            crate::cpu_id(),
            "InterruptGuard dropped on a different core"
        );
        PER_CORE_STATE[self.core_id].load_nested_interrupt_state();
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

/// Witness of interrupt-handler context.
///
/// A handler registered with [`register`] receives a reference to one of
/// these; it cannot be constructed elsewhere. APIs that may block take no
/// such token and panic when entered with one live, so the split between
/// "may pend" and "may only wake" is visible in every handler's signature.
pub struct IsrContext {
    vec: u32,
    _not_send: PhantomData<*mut ()>,
}

impl IsrContext {
    /// The vector being serviced.
    pub fn vector(&self) -> u32 {
        self.vec
    }
}

type Handler = Option<Arc<dyn Fn(&IsrContext) + Send + Sync>>;
#[allow(clippy::declare_interior_mutable_const)]
const INIT: SpinLock<Handler> = SpinLock::new(None);
static HANDLERS: [SpinLock<Handler>; NUM_VECTORS] = [INIT; NUM_VECTORS];
static PENDING: SpinLock<BTreeSet<u32>> = SpinLock::new(BTreeSet::new());

/// Register the interrupt handler for vector `vec`.
pub fn register(vec: u32, handler: impl Fn(&IsrContext) + Send + Sync + 'static) {
    let mut guard = HANDLERS
        .get((vec - VECTOR_BASE) as usize)
        .expect("Invalid vector")
        .lock();
    *guard = Some(Arc::new(handler));
    guard.unlock();
}

/// Whether the calling core is executing an interrupt handler.
pub fn in_isr() -> bool {
    PER_CORE_STATE[crate::cpu_id()]
        .isr_depth
        .load(Ordering::SeqCst)
        > 0
}

/// Deliver interrupt vector `vec`.
///
/// This is the entry point drivers call when their interrupt fires. If the
/// local core is masked or already servicing a handler, the vector is
/// pended and delivered when the mask lifts, as a hardware controller would
/// hold the line.
pub fn dispatch(vec: u32) {
    crate::wake_event();

    let core = &PER_CORE_STATE[crate::cpu_id()];
    if core.masked.load(Ordering::SeqCst) || core.isr_depth.load(Ordering::SeqCst) > 0 {
        let mut pending = PENDING.lock();
        pending.insert(vec);
        pending.unlock();
        return;
    }
    dispatch_now(vec);
}

fn dispatch_now(vec: u32) {
    let core = &PER_CORE_STATE[crate::cpu_id()];
    core.isr_depth.fetch_add(1, Ordering::SeqCst);

    let guard = HANDLERS
        .get((vec - VECTOR_BASE) as usize)
        .expect("Invalid vector")
        .lock();
    let handler = guard.clone();
    guard.unlock();

    match &handler {
        Some(handler) => handler(&IsrContext {
            vec,
            _not_send: PhantomData,
        }),
        _ => panic!("Unknown interrupt #{vec}"),
    }

    core.isr_depth.fetch_sub(1, Ordering::SeqCst);
    deliver_pending();
}

fn deliver_pending() {
    let core = &PER_CORE_STATE[crate::cpu_id()];
    if core.delivering.swap(true, Ordering::SeqCst) {
        return;
    }
    loop {
        if core.masked.load(Ordering::SeqCst) || core.isr_depth.load(Ordering::SeqCst) > 0 {
            break;
        }
        let mut pending = PENDING.lock();
        let vec = pending.pop_first();
        pending.unlock();
        match vec {
            Some(vec) => dispatch_now(vec),
            None => break,
        }
    }
    core.delivering.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    // A single test: the mask state is per-core, and every host test thread
    // reports as core 0.
    #[test]
    fn guard_nesting_and_pended_dispatch() {
        use core::sync::atomic::AtomicUsize;
        let _serial = crate::test_util::SERIAL.lock().unwrap();
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        register(200, |isr| {
            assert_eq!(isr.vector(), 200);
            FIRED.fetch_add(1, Ordering::SeqCst);
        });

        let outer = InterruptGuard::new();
        assert_eq!(InterruptState::current(), InterruptState::Off);
        {
            let _inner = InterruptGuard::new();
            assert_eq!(InterruptState::current(), InterruptState::Off);
        }
        assert_eq!(InterruptState::current(), InterruptState::Off);

        dispatch(200);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        drop(outer);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(InterruptState::current(), InterruptState::On);
    }
}
