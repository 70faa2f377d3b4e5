//! Synchronization primitives
//!
//! Mutex, counting semaphore and message queue. All three share one
//! blocking discipline: register on the primitive's wait queue inside a
//! critical section, block outside it, then re-check the predicate on
//! wake-up. Waiters are released highest priority first, FIFO among
//! equals, on every backend.

pub mod mutex;
pub mod queue;
pub mod sem;
