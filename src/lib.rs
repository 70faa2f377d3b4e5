//! Portable OS abstraction layer (OSAL)
//!
//! One API for tasks, mutexes, semaphores, queues, software timers and a
//! thread-safe heap, backed by three interchangeable execution models:
//! - `preempt`: priority-based preemptive scheduler for ARM Cortex-M
//! - `baremetal`: single-context cooperative loop
//! - `hosted`: host OS threads, for off-target development and testing
//!
//! The backend is chosen at build time through a cargo feature; the public
//! surface and its observable semantics are identical across all three.

#![cfg_attr(not(feature = "hosted"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

// ============ Backend selection ============

#[cfg(not(any(feature = "hosted", feature = "preempt", feature = "baremetal")))]
compile_error!("select a backend feature: `hosted`, `preempt` or `baremetal`");

#[cfg(any(
    all(feature = "hosted", feature = "preempt"),
    all(feature = "hosted", feature = "baremetal"),
    all(feature = "preempt", feature = "baremetal"),
))]
compile_error!("backend features `hosted`, `preempt` and `baremetal` are mutually exclusive");

// ============ Critical Section ============

#[cfg(all(target_arch = "arm", any(feature = "preempt", feature = "baremetal")))]
mod cs_impl {
    use cortex_m::interrupt;
    use cortex_m::register::primask;
    use critical_section::{set_impl, Impl, RawRestoreState};

    struct SingleCoreCriticalSection;
    set_impl!(SingleCoreCriticalSection);

    unsafe impl Impl for SingleCoreCriticalSection {
        unsafe fn acquire() -> RawRestoreState {
            let was_active = primask::read().is_active();
            interrupt::disable();
            was_active
        }

        unsafe fn release(was_active: RawRestoreState) {
            if was_active {
                unsafe { interrupt::enable() }
            }
        }
    }
}

// ============ Modules ============

pub mod log;
mod lang_items;

pub mod config;
pub mod critical;
pub mod error;
pub mod kernel;
pub mod mem;
pub mod port;
pub mod sync;
pub mod task;
pub mod timer;
pub mod types;

// ============ Re-exports ============

pub use config::*;
pub use error::{OsError, OsResult};
pub use kernel::{is_running, os_init, os_start, os_tick, tick_now};
pub use mem::MemStats;
pub use sync::mutex::Mutex;
pub use sync::queue::Queue;
pub use sync::sem::Semaphore;
pub use task::Task;
pub use timer::{Timer, TimerMode};
pub use types::{OsPrio, OsTick, NO_WAIT, WAIT_FOREVER};
