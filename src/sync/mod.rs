//! Synchronization primitives.
//!
//! The spinlock is the only busy-waiting primitive; everything else parks
//! the calling thread on a [`WaitQueue`] and costs no CPU while blocked.
//! Wake operations (`give`, `unlock`, `signal`, `broadcast`, `unpend_*`)
//! never block and are safe from interrupt handlers; blocking operations
//! panic there.

pub mod channel;
pub mod condvar;
pub mod mutex;
pub mod semaphore;
pub mod spinlock;
pub mod wait_queue;

pub use channel::Channel;
pub use condvar::CondVar;
pub use mutex::Mutex;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
pub use wait_queue::{QueuePolicy, WaitQueue, WaitResult};
