//! Port layer - backend-specific implementations
//!
//! Exactly one backend is compiled in, selected by cargo feature. Every
//! backend exports the same surface, which the shared primitives are written
//! against:
//!
//! - `WaitList` / `WaitToken` / `wait_current`: priority-ordered waiter
//!   queues and the block-the-caller half of the Mesa re-check protocol
//! - `tick_now` / `tick`: the tick source and the tick work (delay expiry,
//!   pend timeouts, timer dispatch)
//! - task operations backing [`crate::task`]
//!
//! Wake order is the same everywhere: highest priority first, FIFO among
//! equal priorities.

#[cfg(feature = "hosted")]
mod hosted;
#[cfg(feature = "hosted")]
pub(crate) use hosted::*;
#[cfg(feature = "hosted")]
pub use hosted::tick_now;

#[cfg(feature = "preempt")]
mod preempt;
#[cfg(feature = "preempt")]
pub(crate) use preempt::*;
#[cfg(feature = "preempt")]
pub use preempt::tick_now;

#[cfg(feature = "baremetal")]
mod baremetal;
#[cfg(feature = "baremetal")]
pub(crate) use baremetal::*;
#[cfg(feature = "baremetal")]
pub use baremetal::tick_now;
