//! Kernel lifecycle and global state
//!
//! Init-once bring-up, the running flag, and the tick entry point the
//! application's timer interrupt calls on the embedded backends.

#[cfg(not(feature = "hosted"))]
use portable_atomic::AtomicU8;
use portable_atomic::{AtomicBool, Ordering};

use crate::error::{OsError, OsResult};
use crate::mem;
use crate::port;
use crate::types::OsTick;

/// Atomic kernel flags
pub(crate) struct KernelFlags {
    initialized: AtomicBool,
    running: AtomicBool,
}

impl KernelFlags {
    const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn set_initialized(&self, val: bool) {
        self.initialized.store(val, Ordering::SeqCst);
    }

    #[inline(always)]
    pub(crate) fn set_running(&self, val: bool) {
        self.running.store(val, Ordering::SeqCst);
    }
}

/// Global kernel state instance
pub(crate) static KERNEL: KernelFlags = KernelFlags::new();

/// Initialize the OSAL
///
/// Brings up the heap and the backend. Must be called exactly once before
/// any resource is created.
///
/// # Returns
/// * `Ok(())` - initialization successful
/// * `Err(OsError::AlreadyInit)` - called a second time
pub fn os_init() -> OsResult<()> {
    if KERNEL.is_initialized() {
        return Err(OsError::AlreadyInit);
    }

    mem::init()?;
    port::init()?;

    KERNEL.set_initialized(true);
    crate::info!("osal initialized");
    Ok(())
}

/// Hand control to the backend dispatch
///
/// On `preempt` this starts the highest priority ready task and never
/// returns; on `baremetal` it enters the registered main task; on `hosted`
/// it marks the kernel running and returns.
///
/// # Returns
/// * `Err(OsError::NotInit)` - `os_init` was not called
/// * `Err(OsError::Busy)` - already running
pub fn os_start() -> OsResult<()> {
    if !KERNEL.is_initialized() {
        return Err(OsError::NotInit);
    }
    if KERNEL.is_running() {
        return Err(OsError::Busy);
    }

    KERNEL.set_running(true);
    port::start()
}

/// Whether `os_start` has been called
#[inline]
pub fn is_running() -> bool {
    KERNEL.is_running()
}

/// System tick entry point
///
/// The application's tick interrupt calls this on the embedded backends.
/// Drives delay expiry, pend timeouts and timer dispatch. A no-op on the
/// hosted backend, which carries its own tick source.
pub fn os_tick() {
    if !KERNEL.is_running() {
        return;
    }
    port::tick();
}

/// Current tick count
#[inline]
pub fn tick_now() -> OsTick {
    port::tick_now()
}

#[cfg(not(feature = "hosted"))]
static ISR_NESTING: AtomicU8 = AtomicU8::new(0);

/// Mark entry into an interrupt handler
///
/// Interrupt handlers that call OSAL operations bracket themselves with
/// `os_isr_enter`/`os_isr_exit` on targets where interrupt context cannot
/// be read from a CPU register.
#[cfg(not(feature = "hosted"))]
pub fn os_isr_enter() {
    ISR_NESTING.fetch_add(1, Ordering::AcqRel);
}

/// Mark exit from an interrupt handler
///
/// Leaving the outermost handler runs a scheduling pass, so a task made
/// ready from interrupt context is dispatched without waiting for the
/// next tick.
#[cfg(not(feature = "hosted"))]
pub fn os_isr_exit() {
    if let Ok(prev) =
        ISR_NESTING.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
    {
        if prev == 1 {
            port::reschedule();
        }
    }
}

#[cfg(not(feature = "hosted"))]
#[inline]
pub(crate) fn isr_nesting() -> u8 {
    ISR_NESTING.load(Ordering::Acquire)
}
