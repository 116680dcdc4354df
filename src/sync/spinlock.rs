//! SMP-supported spinlock.
//!
//! Implementing a unicore spinlock only requires preventing preemption of
//! the lock holder, which masking interrupts provides. On a
//! multiprocessor that is not sufficient: threads on other cores can reach
//! the shared resource even while this core runs masked, so the lock
//! additionally spins on an atomic flag set and tested with the CPU's
//! atomic read-modify-write operations.
//!
//! The implementation lives in [`bedrock::spinlock`]; this module is the
//! kernel's public face of it.

pub use bedrock::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
